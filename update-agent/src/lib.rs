//! Update Agent Library
//!
//! Keeps a remote data-hub device's service stack and configuration in
//! sync with a versioned update source, with snapshot-based rollback.

pub mod api;
pub mod backup;
pub mod config;
pub mod daemon;
pub mod engine;
pub mod executor;
pub mod manifest;
pub mod report;
pub mod repository;
pub mod utils;
pub mod verify;
pub mod version_store;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::{Result, UpdateError};
