pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

// Re-export commonly used items
pub use config::ApiConfig;
pub use error::RequestError;
pub use models::filters::{FilterKey, FilterOptions, FilterSet};
pub use services::api_service::{ApiService, ChartData};
pub use services::filter_service::{FilterService, Subscription};
pub use services::DataLayer;
