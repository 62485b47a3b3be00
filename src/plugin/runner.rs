//! Boundary between the connection manager and whatever launches plugins.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tonic::transport::Channel;

use super::handshake::{HandshakeConfig, SUPPORTED_VERSIONS};
use crate::errors::Result;

/// What the host offers a plugin at launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub handshake: HandshakeConfig,
    /// Offered plugin-set versions; the plugin picks the highest it knows.
    pub protocol_versions: Vec<u32>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self { handshake: HandshakeConfig::default(), protocol_versions: SUPPORTED_VERSIONS.to_vec() }
    }
}

/// A launched plugin whose handshake has completed.
pub struct SpawnedPlugin {
    pub channel: Channel,
    pub protocol_version: u32,
    pub process: Arc<dyn ProcessHandle>,
}

impl fmt::Debug for SpawnedPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnedPlugin")
            .field("protocol_version", &self.protocol_version)
            .field("pid", &self.process.pid())
            .finish_non_exhaustive()
    }
}

/// Lifecycle control over a running plugin.
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// Terminate the plugin. Calling it on an already dead process succeeds.
    async fn kill(&self) -> Result<()>;

    fn is_alive(&self) -> bool;

    fn pid(&self) -> Option<u32>;
}

/// Launches plugins by name and completes the handshake.
#[async_trait]
pub trait PluginRunner: Send + Sync {
    async fn spawn(&self, name: &str, config: &RunConfig) -> Result<SpawnedPlugin>;
}
