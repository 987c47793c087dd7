pub mod api_service;
pub mod filter_service;

use crate::api::client::Transport;
use crate::config::ApiConfig;
use crate::models::filters::FilterOptions;
use api_service::ApiService;
use filter_service::FilterService;
use std::sync::Arc;

/// Owns the request service and the shared filter state for one dashboard
/// session. UI code borrows `api` and `filters` from here.
pub struct DataLayer {
    pub api: ApiService,
    pub filters: Arc<FilterService>,
}

impl DataLayer {
    pub fn new(config: ApiConfig) -> Self {
        let filters = Arc::new(FilterService::new());
        Self {
            api: ApiService::new(config, Arc::clone(&filters)),
            filters,
        }
    }

    pub fn from_env() -> Self {
        Self::new(ApiConfig::from_env())
    }

    pub fn with_transport(config: ApiConfig, transport: Arc<dyn Transport>) -> Self {
        let filters = Arc::new(FilterService::new());
        Self {
            api: ApiService::with_transport(config, transport, Arc::clone(&filters)),
            filters,
        }
    }

    pub async fn load_filter_options(&self) -> FilterOptions {
        self.filters.load_filter_options(&self.api).await
    }
}
