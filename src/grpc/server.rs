//! Plugin-side dispatch of incoming `Database` calls.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

use crate::database::{Database, Factory, NewUserRequest, UpdateUserRequest};
use crate::errors::Error;
use crate::observability::MetricsRecorder;
use crate::plugin::handshake::MULTIPLEX_METADATA_KEY;
use crate::proto::pb;
use crate::proto::pb::plugin_multiplexing_server::PluginMultiplexing;

type SharedDatabase = Arc<dyn Database>;

enum Mode {
    /// One backend for every call; session tags are ignored.
    Single(SharedDatabase),
    /// One backend per session tag, built on first use.
    Multiplexed { factory: Factory, instances: RwLock<HashMap<String, SharedDatabase>> },
}

/// Routes each incoming call to the backend instance that owns it.
pub struct DatabaseDispatcher {
    mode: Mode,
    metrics: MetricsRecorder,
}

impl DatabaseDispatcher {
    pub fn single<D: Database + 'static>(db: D) -> Self {
        Self { mode: Mode::Single(Arc::new(db)), metrics: MetricsRecorder::new() }
    }

    pub fn multiplexed(factory: Factory) -> Self {
        Self {
            mode: Mode::Multiplexed { factory, instances: RwLock::new(HashMap::new()) },
            metrics: MetricsRecorder::new(),
        }
    }

    pub fn is_multiplexed(&self) -> bool {
        matches!(self.mode, Mode::Multiplexed { .. })
    }

    /// Number of live backend instances.
    pub async fn instance_count(&self) -> usize {
        match &self.mode {
            Mode::Single(_) => 1,
            Mode::Multiplexed { instances, .. } => instances.read().await.len(),
        }
    }

    /// Session tags that currently own an instance.
    pub async fn session_ids(&self) -> Vec<String> {
        match &self.mode {
            Mode::Single(_) => Vec::new(),
            Mode::Multiplexed { instances, .. } => {
                let mut ids: Vec<String> = instances.read().await.keys().cloned().collect();
                ids.sort();
                ids
            }
        }
    }

    fn session_tag<T>(request: &Request<T>) -> Result<String, Status> {
        request
            .metadata()
            .get(MULTIPLEX_METADATA_KEY)
            .and_then(|value| value.to_str().ok())
            .filter(|tag| !tag.is_empty())
            .map(str::to_owned)
            .ok_or_else(|| Error::missing_session_tag().into())
    }

    async fn instance_for<T>(&self, request: &Request<T>) -> Result<SharedDatabase, Status> {
        let (factory, instances) = match &self.mode {
            Mode::Single(db) => return Ok(Arc::clone(db)),
            Mode::Multiplexed { factory, instances } => (factory, instances),
        };

        let tag = Self::session_tag(request)?;
        if let Some(db) = instances.read().await.get(&tag) {
            return Ok(Arc::clone(db));
        }

        let mut guard = instances.write().await;
        // Another call for the same tag may have won the race for the write lock.
        if let Some(db) = guard.get(&tag) {
            return Ok(Arc::clone(db));
        }

        let db: SharedDatabase = Arc::from(factory()?);
        guard.insert(tag.clone(), Arc::clone(&db));
        self.metrics.set_dispatch_instances(guard.len());
        debug!(multiplex_id = %tag, instances = guard.len(), "created backend instance");
        Ok(db)
    }
}

#[tonic::async_trait]
impl pb::database_server::Database for DatabaseDispatcher {
    async fn initialize(
        &self,
        request: Request<pb::InitializeRequest>,
    ) -> Result<Response<pb::InitializeResponse>, Status> {
        let db = self.instance_for(&request).await?;
        let resp = db.initialize(request.into_inner().into()).await?;
        Ok(Response::new(resp.into()))
    }

    async fn new_user(
        &self,
        request: Request<pb::NewUserRequest>,
    ) -> Result<Response<pb::NewUserResponse>, Status> {
        let db = self.instance_for(&request).await?;
        let req = NewUserRequest::try_from(request.into_inner())?;
        let resp = db.new_user(req).await?;
        Ok(Response::new(resp.into()))
    }

    async fn update_user(
        &self,
        request: Request<pb::UpdateUserRequest>,
    ) -> Result<Response<pb::UpdateUserResponse>, Status> {
        let db = self.instance_for(&request).await?;
        let req = UpdateUserRequest::try_from(request.into_inner())?;
        let resp = db.update_user(req).await?;
        Ok(Response::new(resp.into()))
    }

    async fn delete_user(
        &self,
        request: Request<pb::DeleteUserRequest>,
    ) -> Result<Response<pb::DeleteUserResponse>, Status> {
        let db = self.instance_for(&request).await?;
        let resp = db.delete_user(request.into_inner().into()).await?;
        Ok(Response::new(resp.into()))
    }

    async fn get_type(
        &self,
        request: Request<pb::Empty>,
    ) -> Result<Response<pb::TypeResponse>, Status> {
        let db = self.instance_for(&request).await?;
        let type_name = db.type_name().await?;
        Ok(Response::new(pb::TypeResponse { type_name }))
    }

    async fn close(&self, request: Request<pb::Empty>) -> Result<Response<pb::Empty>, Status> {
        let db = match &self.mode {
            Mode::Single(db) => Some(Arc::clone(db)),
            Mode::Multiplexed { instances, .. } => {
                let tag = Self::session_tag(&request)?;
                let mut guard = instances.write().await;
                let removed = guard.remove(&tag);
                self.metrics.set_dispatch_instances(guard.len());
                if removed.is_some() {
                    info!(multiplex_id = %tag, remaining = guard.len(), "closing backend instance");
                }
                removed
            }
        };

        // Closing a session that never made a call is a no-op.
        if let Some(db) = db {
            db.close().await?;
        }
        Ok(Response::new(pb::Empty {}))
    }
}

/// Answers the host's "do you multiplex?" question.
#[derive(Debug, Clone, Copy)]
pub struct MultiplexingSupportService {
    supported: bool,
}

impl MultiplexingSupportService {
    pub fn new(supported: bool) -> Self {
        Self { supported }
    }
}

#[tonic::async_trait]
impl PluginMultiplexing for MultiplexingSupportService {
    async fn multiplexing_support(
        &self,
        _request: Request<pb::MultiplexingSupportRequest>,
    ) -> Result<Response<pb::MultiplexingSupportResponse>, Status> {
        Ok(Response::new(pb::MultiplexingSupportResponse { supported: self.supported }))
    }
}
