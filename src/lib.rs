pub mod config;
pub mod error;
pub mod hierarchy;
pub mod models;
pub mod openapi;
pub mod repo;
pub mod routes;
pub mod service;
pub mod tx;
pub mod validate;
pub mod votes;

// Re-export commonly used items for tests / external users
pub use config::AppConfig;
pub use error::ForumError;
pub use routes::{config, AppState};
pub use service::ForumService;
