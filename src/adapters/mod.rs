pub mod admin_api;
pub mod health_checker;
pub mod http_client;
pub mod http_handler;
pub mod listeners;
pub mod reinitializer;

/// Re-export commonly used types from adapters
pub use admin_api::AdminApi;
pub use health_checker::HealthChecker;
pub use http_client::HttpClientAdapter;
pub use http_handler::{ConnectionAddrs, HttpHandler};
pub use listeners::ListenerSet;
pub use reinitializer::Reinitializer;
