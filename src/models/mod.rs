pub mod cache;
pub mod filters;
