pub mod basic_auth;
pub mod config_providers;
pub mod discovery;
pub mod health_checker;
pub mod http_client;
pub mod http_handler;
pub mod middleware;
pub mod websocket;

/// Re-export commonly used types from adapters
pub use basic_auth::BasicAuthenticator;
pub use config_providers::{FileConfigProvider, HttpConfigProvider};
pub use discovery::StaticDiscovery;
pub use health_checker::HealthChecker;
pub use http_client::HttpClientAdapter;
pub use http_handler::HttpHandler;
pub use middleware::{RequestId, X_REQUEST_ID};
