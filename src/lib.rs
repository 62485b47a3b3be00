//! # dbplugin
//!
//! Host and plugin sides of an out-of-process database plugin system.
//!
//! Database backends run as separate plugin executables speaking gRPC. The
//! host launches a plugin, verifies its handshake, negotiates a protocol
//! version and then hands callers *sessions*. When the plugin supports
//! multiplexing (protocol version 6), every session for that plugin shares a
//! single subprocess and a single channel; each call carries the session id
//! in the `multiplex_id` metadata header so the plugin can route it to the
//! right backend instance. Older plugins (version 5) get one process per
//! session.
//!
//! ## Architecture
//!
//! ```text
//! ConnectionManager ─ acquire ─▶ Negotiator ─ spawn ─▶ PluginRunner (subprocess)
//!        │                                                  │ handshake on stdout
//!        ▼                                                  ▼
//! DatabasePluginClient ─ gRPC + multiplex_id ─▶ PluginServer ─▶ DatabaseDispatcher ─▶ Database
//! ```
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use dbplugin::config::{ManagerConfig, PluginCatalog};
//! use dbplugin::database::{Database, InitializeRequest};
//! use dbplugin::{ConnectionManager, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let catalog = PluginCatalog::load("plugins.toml")?;
//!     let manager = ConnectionManager::from_catalog(catalog, ManagerConfig::default());
//!
//!     let session = manager.acquire_session("memdb").await?;
//!     session.initialize(InitializeRequest::default()).await?;
//!     manager.release_session(&session).await
//! }
//! ```

pub mod config;
pub mod database;
pub mod errors;
pub mod grpc;
pub mod manager;
pub mod observability;
pub mod plugin;
pub mod proto;

// Re-export commonly used types and traits
pub use config::Config;
pub use database::Database;
pub use errors::{Error, Result};
pub use manager::{ConnectionManager, DatabasePluginClient};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_available() {
        assert!(!VERSION.is_empty());
        assert_eq!(APP_NAME, "dbplugin");
    }
}
