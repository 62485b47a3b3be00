//! The handle a caller holds for one logical backend session.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::{debug, Instrument};

use super::ManagerInner;
use crate::database::types::*;
use crate::database::Database;
use crate::errors::{Error, Result};
use crate::grpc::GrpcDatabaseClient;
use crate::observability::MetricsRecorder;
use crate::plugin::negotiator::{transition, AcquireState};
use crate::plugin::ProcessHandle;

pub(crate) enum Owner {
    /// Registered process; teardown goes through the manager.
    Shared(Weak<ManagerInner>),
    /// Unregistered process owned by this session alone.
    Dedicated(Arc<dyn ProcessHandle>),
}

/// A session bound to one backend instance inside a plugin process.
///
/// All [`Database`] calls are forwarded to `backend`. `close` shuts the
/// backend instance down and then releases the session: the process is
/// killed right away for dedicated sessions, or once its last session is
/// gone for shared ones. Dropping a handle without closing it keeps its
/// slot in the registry.
pub struct DatabasePluginClient {
    id: String,
    name: String,
    generation: u64,
    multiplexing: bool,
    protocol_version: u32,
    backend: GrpcDatabaseClient,
    owner: Owner,
    released: AtomicBool,
}

impl DatabasePluginClient {
    pub(crate) fn shared(
        id: String,
        name: &str,
        generation: u64,
        protocol_version: u32,
        backend: GrpcDatabaseClient,
        manager: Weak<ManagerInner>,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            generation,
            multiplexing: true,
            protocol_version,
            backend,
            owner: Owner::Shared(manager),
            released: AtomicBool::new(false),
        }
    }

    pub(crate) fn dedicated(
        id: String,
        name: &str,
        protocol_version: u32,
        backend: GrpcDatabaseClient,
        process: Arc<dyn ProcessHandle>,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            generation: 0,
            multiplexing: false,
            protocol_version,
            backend,
            owner: Owner::Dedicated(process),
            released: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn plugin_name(&self) -> &str {
        &self.name
    }

    /// Registry generation of the owning process; `0` for dedicated sessions.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_multiplexed(&self) -> bool {
        self.multiplexing
    }

    pub fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Tag attached to outgoing calls, if any.
    pub fn session_tag(&self) -> Option<&str> {
        self.backend.session_id()
    }

    async fn teardown(&self) -> Result<()> {
        match &self.owner {
            Owner::Dedicated(process) => {
                process.kill().await?;
                MetricsRecorder::new().record_kill(&self.name);
                transition(&self.name, AcquireState::Killed);
                Ok(())
            }
            Owner::Shared(manager) => match manager.upgrade() {
                Some(inner) => inner.release(&self.name, self.generation, &self.id).await,
                None => Ok(()),
            },
        }
    }
}

impl fmt::Debug for DatabasePluginClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabasePluginClient")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("generation", &self.generation)
            .field("multiplexing", &self.multiplexing)
            .field("protocol_version", &self.protocol_version)
            .field("released", &self.is_released())
            .finish()
    }
}

#[async_trait]
impl Database for DatabasePluginClient {
    async fn initialize(&self, req: InitializeRequest) -> Result<InitializeResponse> {
        self.backend.initialize(req).await
    }

    async fn new_user(&self, req: NewUserRequest) -> Result<NewUserResponse> {
        self.backend.new_user(req).await
    }

    async fn update_user(&self, req: UpdateUserRequest) -> Result<UpdateUserResponse> {
        self.backend.update_user(req).await
    }

    async fn delete_user(&self, req: DeleteUserRequest) -> Result<DeleteUserResponse> {
        self.backend.delete_user(req).await
    }

    async fn type_name(&self) -> Result<String> {
        self.backend.type_name().await
    }

    /// Idempotent: only the first call reaches the plugin.
    async fn close(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            debug!(plugin = %self.name, session_id = %self.id, "session already released");
            return Ok(());
        }

        let span = crate::plugin_span!("release", self.name, session_id = %self.id);
        async {
            let backend = self.backend.close().await;
            let teardown = self.teardown().await;
            Error::combine_close(backend, teardown)
        }
        .instrument(span)
        .await
    }
}
