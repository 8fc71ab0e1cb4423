// Core modules
pub mod error;
pub mod exchange;
pub mod execution;
pub mod health;
pub mod ledger;
pub mod models;
pub mod notify;
pub mod queue;
pub mod vault;

// Re-export commonly used types
pub use error::ExecError;
pub use models::*;

// Error handling for infrastructure plumbing (connections, setup)
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
