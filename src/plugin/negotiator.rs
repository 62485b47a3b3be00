//! Protocol negotiation for a freshly spawned plugin.
//!
//! One attempt walks `not_started → spawning → handshake_verified →
//! version_negotiated → capability_dispensed`. The connection manager then
//! finishes it as `registered` or `dedicated`, and eventually `killed`.
//! A failed attempt never touches the registry, and a process it spawned is
//! killed before the error is returned.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tracing::{debug, warn};

use super::handshake::{LEGACY_VERSION, MULTIPLEX_VERSION};
use super::runner::{PluginRunner, ProcessHandle, RunConfig, SpawnedPlugin};
use crate::errors::{Error, Result, SpawnCancellation};
use crate::grpc::{GrpcDatabaseClient, SessionTagger};
use crate::observability::MetricsRecorder;
use crate::proto::pb;
use crate::proto::pb::plugin_multiplexing_client::PluginMultiplexingClient;

/// Where an acquisition attempt currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireState {
    NotStarted,
    Spawning,
    HandshakeVerified,
    VersionNegotiated,
    CapabilityDispensed,
    Registered,
    Dedicated,
    Killed,
}

impl AcquireState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Spawning => "spawning",
            Self::HandshakeVerified => "handshake_verified",
            Self::VersionNegotiated => "version_negotiated",
            Self::CapabilityDispensed => "capability_dispensed",
            Self::Registered => "registered",
            Self::Dedicated => "dedicated",
            Self::Killed => "killed",
        }
    }
}

impl fmt::Display for AcquireState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) fn transition(plugin: &str, state: AcquireState) {
    debug!(plugin = %plugin, state = %state, "plugin state transition");
}

/// What the plugin handed out after the handshake.
#[derive(Debug, Clone)]
pub enum Capability {
    /// Version 5: one client bound to the whole process.
    Legacy(GrpcDatabaseClient),
    /// Version 6: a channel sessions can share, plus the plugin's own
    /// answer on whether it actually multiplexes.
    Multiplexed { channel: Channel, supported: bool },
}

impl Capability {
    /// Only self-reported multiplexers are shared between sessions.
    pub fn is_shareable(&self) -> bool {
        matches!(self, Self::Multiplexed { supported: true, .. })
    }
}

/// A completed negotiation.
pub struct Negotiated {
    pub capability: Capability,
    pub process: Arc<dyn ProcessHandle>,
    pub protocol_version: u32,
}

impl fmt::Debug for Negotiated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Negotiated")
            .field("capability", &self.capability)
            .field("protocol_version", &self.protocol_version)
            .field("pid", &self.process.pid())
            .finish()
    }
}

/// Spawns plugins and classifies what they offer.
#[derive(Clone)]
pub struct Negotiator {
    runner: Arc<dyn PluginRunner>,
    run_config: RunConfig,
    spawn_timeout: Duration,
    metrics: MetricsRecorder,
}

impl Negotiator {
    pub fn new(runner: Arc<dyn PluginRunner>, run_config: RunConfig, spawn_timeout: Duration) -> Self {
        Self { runner, run_config, spawn_timeout, metrics: MetricsRecorder::new() }
    }

    pub fn spawn_timeout(&self) -> Duration {
        self.spawn_timeout
    }

    /// Spawn `name`, finish the handshake and dispense its capability.
    ///
    /// Bounded by the spawn timeout and by `cancel`. Abandoning the attempt
    /// drops the half-started process, which kills it.
    pub async fn negotiate(&self, name: &str, cancel: &CancellationToken) -> Result<Negotiated> {
        transition(name, AcquireState::NotStarted);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::spawn_cancelled(SpawnCancellation::Cancelled)),
            outcome = tokio::time::timeout(self.spawn_timeout, self.attempt(name)) => {
                outcome.unwrap_or_else(|_| {
                    Err(Error::spawn_cancelled(SpawnCancellation::DeadlineExceeded(
                        self.spawn_timeout,
                    )))
                })
            }
        };

        let outcome = match &result {
            Ok(_) => "success",
            Err(e) if e.cancellation().is_some() => "cancelled",
            Err(_) => "error",
        };
        self.metrics.record_spawn(name, outcome);
        result
    }

    async fn attempt(&self, name: &str) -> Result<Negotiated> {
        transition(name, AcquireState::Spawning);
        let spawned = self.runner.spawn(name, &self.run_config).await?;
        transition(name, AcquireState::HandshakeVerified);

        match Self::dispense(name, &spawned).await {
            Ok(capability) => {
                transition(name, AcquireState::CapabilityDispensed);
                Ok(Negotiated {
                    capability,
                    process: spawned.process,
                    protocol_version: spawned.protocol_version,
                })
            }
            Err(e) => {
                if let Err(kill_err) = spawned.process.kill().await {
                    warn!(plugin = %name, error = %kill_err, "failed to kill plugin after failed dispense");
                }
                transition(name, AcquireState::Killed);
                Err(e)
            }
        }
    }

    async fn dispense(name: &str, spawned: &SpawnedPlugin) -> Result<Capability> {
        match spawned.protocol_version {
            LEGACY_VERSION => {
                transition(name, AcquireState::VersionNegotiated);
                Ok(Capability::Legacy(GrpcDatabaseClient::new(
                    spawned.channel.clone(),
                    SessionTagger::untagged(),
                )))
            }
            MULTIPLEX_VERSION => {
                transition(name, AcquireState::VersionNegotiated);
                let supported = multiplexing_supported(spawned.channel.clone()).await?;
                Ok(Capability::Multiplexed { channel: spawned.channel.clone(), supported })
            }
            other => Err(Error::unsupported_client_type(format!(
                "plugin '{}' negotiated protocol version {} which has no client",
                name, other
            ))),
        }
    }
}

/// Ask the plugin whether it multiplexes. Plugins that predate the
/// question answer `Unimplemented`, which means no.
pub async fn multiplexing_supported(channel: Channel) -> Result<bool> {
    let mut client = PluginMultiplexingClient::new(channel);
    match client.multiplexing_support(pb::MultiplexingSupportRequest {}).await {
        Ok(resp) => Ok(resp.into_inner().supported),
        Err(status) if status.code() == tonic::Code::Unimplemented => Ok(false),
        Err(status) => Err(status.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(AcquireState::HandshakeVerified.to_string(), "handshake_verified");
        assert_eq!(AcquireState::Killed.as_str(), "killed");
    }

    #[tokio::test]
    async fn test_only_supported_multiplexers_are_shareable() {
        let channel = Channel::from_static("http://127.0.0.1:1").connect_lazy();
        assert!(Capability::Multiplexed { channel: channel.clone(), supported: true }.is_shareable());
        assert!(!Capability::Multiplexed { channel: channel.clone(), supported: false }.is_shareable());
        let legacy = GrpcDatabaseClient::new(channel, SessionTagger::untagged());
        assert!(!Capability::Legacy(legacy).is_shareable());
    }
}
