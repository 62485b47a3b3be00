//! The database capability a plugin exposes.
//!
//! A plugin subprocess implements [`Database`] once per logical backend
//! instance. On the host side the same trait is implemented by the session
//! handle, which forwards every call over the (possibly shared) transport.
//!
//! # Example Implementation
//!
//! ```rust,ignore
//! use dbplugin::database::*;
//! use async_trait::async_trait;
//!
//! struct Noop;
//!
//! #[async_trait]
//! impl Database for Noop {
//!     async fn initialize(&self, req: InitializeRequest) -> Result<InitializeResponse> {
//!         Ok(InitializeResponse { config: req.config })
//!     }
//!     // ...
//! }
//! ```

pub mod memory;
pub mod middleware;
pub mod secret;
pub mod types;

use std::sync::Arc;

use async_trait::async_trait;

pub use crate::errors::Result;
pub use memory::InMemoryDatabase;
pub use middleware::InstrumentedDatabase;
pub use secret::Password;
pub use types::*;

/// Operations every database backend provides.
#[async_trait]
pub trait Database: Send + Sync {
    /// Configure the backend and optionally verify connectivity.
    async fn initialize(&self, req: InitializeRequest) -> Result<InitializeResponse>;

    /// Create a user and return the generated username.
    async fn new_user(&self, req: NewUserRequest) -> Result<NewUserResponse>;

    /// Change a user's password and/or expiration.
    async fn update_user(&self, req: UpdateUserRequest) -> Result<UpdateUserResponse>;

    async fn delete_user(&self, req: DeleteUserRequest) -> Result<DeleteUserResponse>;

    /// Short backend identifier, e.g. `"postgres"`.
    async fn type_name(&self) -> Result<String>;

    /// Release connections held by this instance.
    async fn close(&self) -> Result<()>;
}

/// Builds a fresh backend instance; used by the multiplexed dispatcher once
/// per session.
pub type Factory = Arc<dyn Fn() -> Result<Box<dyn Database>> + Send + Sync>;

#[async_trait]
impl<T: Database + ?Sized> Database for Box<T> {
    async fn initialize(&self, req: InitializeRequest) -> Result<InitializeResponse> {
        (**self).initialize(req).await
    }

    async fn new_user(&self, req: NewUserRequest) -> Result<NewUserResponse> {
        (**self).new_user(req).await
    }

    async fn update_user(&self, req: UpdateUserRequest) -> Result<UpdateUserResponse> {
        (**self).update_user(req).await
    }

    async fn delete_user(&self, req: DeleteUserRequest) -> Result<DeleteUserResponse> {
        (**self).delete_user(req).await
    }

    async fn type_name(&self) -> Result<String> {
        (**self).type_name().await
    }

    async fn close(&self) -> Result<()> {
        (**self).close().await
    }
}
