//! # Configuration Management
//!
//! Runtime settings for the connection manager and observability, plus the
//! plugin catalog that maps plugin names to executables.

pub mod catalog;
pub mod settings;

pub use catalog::{PluginCatalog, PluginEntry};
pub use settings::{Config, ManagerConfig, ObservabilityConfig, MIN_SESSION_ID_LENGTH};
