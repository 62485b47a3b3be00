//! Host-side gRPC client for the `Database` service.

use async_trait::async_trait;
use tonic::service::interceptor::InterceptedService;
use tonic::transport::Channel;

use super::router::SessionTagger;
use crate::database::types::*;
use crate::database::Database;
use crate::errors::{Error, Result};
use crate::proto::pb;
use crate::proto::pb::database_client::DatabaseClient;

type TaggedClient = DatabaseClient<InterceptedService<Channel, SessionTagger>>;

/// [`Database`] over a (possibly shared) channel.
///
/// Cloning is cheap; clones share the channel and the session tag.
#[derive(Debug, Clone)]
pub struct GrpcDatabaseClient {
    inner: TaggedClient,
    tagger: SessionTagger,
}

impl GrpcDatabaseClient {
    pub fn new(channel: Channel, tagger: SessionTagger) -> Self {
        Self { inner: DatabaseClient::with_interceptor(channel, tagger.clone()), tagger }
    }

    /// Session tag attached to every call, if any.
    pub fn session_id(&self) -> Option<&str> {
        self.tagger.session_id()
    }

    fn client(&self) -> TaggedClient {
        self.inner.clone()
    }
}

#[async_trait]
impl Database for GrpcDatabaseClient {
    async fn initialize(&self, req: InitializeRequest) -> Result<InitializeResponse> {
        let resp = self.client().initialize(pb::InitializeRequest::from(req)).await?;
        Ok(resp.into_inner().into())
    }

    async fn new_user(&self, req: NewUserRequest) -> Result<NewUserResponse> {
        req.validate()?;
        let resp = self.client().new_user(pb::NewUserRequest::from(req)).await?;
        Ok(resp.into_inner().into())
    }

    async fn update_user(&self, req: UpdateUserRequest) -> Result<UpdateUserResponse> {
        req.validate()?;
        self.client().update_user(pb::UpdateUserRequest::from(req)).await?;
        Ok(UpdateUserResponse {})
    }

    async fn delete_user(&self, req: DeleteUserRequest) -> Result<DeleteUserResponse> {
        req.validate()?;
        self.client().delete_user(pb::DeleteUserRequest::from(req)).await?;
        Ok(DeleteUserResponse {})
    }

    async fn type_name(&self) -> Result<String> {
        let resp = self.client().get_type(pb::Empty {}).await?;
        Ok(resp.into_inner().type_name)
    }

    async fn close(&self) -> Result<()> {
        self.client().close(pb::Empty {}).await.map_err(Error::from)?;
        Ok(())
    }
}
