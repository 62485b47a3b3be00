//! # Connection Manager
//!
//! Hands out database sessions for plugins by name, sharing one plugin
//! process between sessions whenever the plugin supports multiplexing.
//!
//! Per plugin name the registry holds at most one live process, its shared
//! channel and the ids of its active sessions. A process is killed exactly
//! when its last session is released. Plugins that cannot multiplex never
//! enter the registry: each of their sessions owns a dedicated process.
//!
//! The registry lock only covers bookkeeping. Spawning, RPCs and kills
//! happen outside it; concurrent spawns for one name are serialized by a
//! per-name gate instead, so unrelated plugins never wait on each other.
//!
//! ```rust,ignore
//! let manager = ConnectionManager::from_catalog(catalog, ManagerConfig::default());
//! let session = manager.acquire_session("postgres").await?;
//! session.initialize(InitializeRequest { config, verify_connection: true }).await?;
//! manager.release_session(&session).await?;
//! ```

pub mod session;
pub mod session_id;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tracing::{info, warn, Instrument};

pub use session::DatabasePluginClient;
pub use session_id::{random_base62, unique_session_id};

use crate::config::{ManagerConfig, PluginCatalog};
use crate::database::Database;
use crate::errors::{Error, Result, SpawnCancellation};
use crate::grpc::{GrpcDatabaseClient, SessionTagger};
use crate::observability::MetricsRecorder;
use crate::plugin::negotiator::{transition, AcquireState, Capability, Negotiated, Negotiator};
use crate::plugin::{PluginRunner, ProcessHandle, RunConfig, SubprocessRunner};

/// A registered, shareable plugin process.
struct PluginProcess {
    generation: u64,
    process: Arc<dyn ProcessHandle>,
    channel: Channel,
    protocol_version: u32,
    sessions: HashSet<String>,
}

#[derive(Default)]
struct Registry {
    processes: HashMap<String, PluginProcess>,
    spawn_gates: HashMap<String, Arc<Mutex<()>>>,
}

pub(crate) struct ManagerInner {
    negotiator: Negotiator,
    config: ManagerConfig,
    registry: Mutex<Registry>,
    generations: AtomicU64,
    metrics: MetricsRecorder,
}

impl ManagerInner {
    /// Drop `id` from the process registered under (`name`, `generation`)
    /// and kill the process if that was its last session.
    pub(crate) async fn release(&self, name: &str, generation: u64, id: &str) -> Result<()> {
        let to_kill = {
            let mut registry = self.registry.lock().await;
            let Some(entry) = registry.processes.get_mut(name) else {
                return Ok(());
            };
            if entry.generation != generation || !entry.sessions.remove(id) {
                return Ok(());
            }

            self.metrics.set_active_sessions(name, entry.sessions.len());
            if entry.sessions.is_empty() {
                registry.processes.remove(name).map(|entry| entry.process)
            } else {
                None
            }
        };

        if let Some(process) = to_kill {
            process.kill().await?;
            self.metrics.record_kill(name);
            transition(name, AcquireState::Killed);
            info!(plugin = %name, generation, "last session released, plugin killed");
        }
        Ok(())
    }
}

/// Registry of plugin processes and the sessions multiplexed over them.
///
/// Cloning is cheap; clones share the registry.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(runner: Arc<dyn PluginRunner>, config: ManagerConfig) -> Self {
        Self::with_run_config(runner, RunConfig::default(), config)
    }

    pub fn with_run_config(
        runner: Arc<dyn PluginRunner>,
        run_config: RunConfig,
        config: ManagerConfig,
    ) -> Self {
        let negotiator = Negotiator::new(runner, run_config, config.spawn_timeout());
        Self {
            inner: Arc::new(ManagerInner {
                negotiator,
                config,
                registry: Mutex::new(Registry::default()),
                generations: AtomicU64::new(0),
                metrics: MetricsRecorder::new(),
            }),
        }
    }

    /// Manager that launches catalog entries as subprocesses.
    pub fn from_catalog(catalog: PluginCatalog, config: ManagerConfig) -> Self {
        let runner = Arc::new(SubprocessRunner::new(catalog, &config));
        Self::new(runner, config)
    }

    /// Acquire a session for plugin `name`.
    pub async fn acquire_session(&self, name: &str) -> Result<DatabasePluginClient> {
        self.acquire_session_with_cancel(name, &CancellationToken::new()).await
    }

    /// Like [`acquire_session`](Self::acquire_session), abandoning any spawn
    /// in progress when `cancel` fires.
    pub async fn acquire_session_with_cancel(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<DatabasePluginClient> {
        let span = crate::plugin_span!("acquire", name);
        self.acquire(name, cancel).instrument(span).await
    }

    /// Acquire `count` sessions for `name`. If one acquire fails, the
    /// sessions already opened are released before the error is returned.
    pub async fn acquire_sessions(&self, name: &str, count: usize) -> Result<Vec<DatabasePluginClient>> {
        let mut opened = Vec::with_capacity(count);
        for _ in 0..count {
            match self.acquire_session(name).await {
                Ok(session) => opened.push(session),
                Err(e) => {
                    self.release_all(&opened).await;
                    return Err(e);
                }
            }
        }
        Ok(opened)
    }

    /// Release every session in `sessions`, logging failures instead of
    /// stopping at the first one.
    pub async fn release_all(&self, sessions: &[DatabasePluginClient]) {
        for session in sessions {
            if let Err(e) = session.close().await {
                warn!(plugin = %session.plugin_name(), session_id = %session.id(), error = %e, "failed to release session");
            }
        }
    }

    /// Close `session`. Same as calling `close` on it.
    pub async fn release_session(&self, session: &DatabasePluginClient) -> Result<()> {
        session.close().await
    }

    /// Active session count of the registered process for `name`.
    pub async fn active_sessions(&self, name: &str) -> Option<usize> {
        let registry = self.inner.registry.lock().await;
        registry.processes.get(name).map(|entry| entry.sessions.len())
    }

    /// Number of registered (shared) plugin processes.
    pub async fn process_count(&self) -> usize {
        self.inner.registry.lock().await.processes.len()
    }

    pub async fn is_registered(&self, name: &str) -> bool {
        self.inner.registry.lock().await.processes.contains_key(name)
    }

    async fn acquire(&self, name: &str, cancel: &CancellationToken) -> Result<DatabasePluginClient> {
        if let Some(session) = self.try_reuse(name).await? {
            return Ok(session);
        }

        let gate = {
            let mut registry = self.inner.registry.lock().await;
            Arc::clone(registry.spawn_gates.entry(name.to_string()).or_default())
        };
        let _spawning = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(Error::spawn_cancelled(SpawnCancellation::Cancelled));
            }
            guard = gate.lock_owned() => guard,
        };

        // Whoever held the gate before us may have registered a process.
        if let Some(session) = self.try_reuse(name).await? {
            return Ok(session);
        }

        let negotiated = self.inner.negotiator.negotiate(name, cancel).await?;
        self.finish(name, negotiated).await
    }

    /// Mint a session on the registered process for `name`, if there is one.
    async fn try_reuse(&self, name: &str) -> Result<Option<DatabasePluginClient>> {
        let mut registry = self.inner.registry.lock().await;
        let Some(entry) = registry.processes.get_mut(name) else {
            return Ok(None);
        };

        if !entry.process.is_alive() {
            let dead = registry.processes.remove(name);
            drop(registry);

            if let Some(dead) = dead {
                warn!(
                    plugin = %name,
                    generation = dead.generation,
                    orphaned_sessions = dead.sessions.len(),
                    "registered plugin process is gone, evicting"
                );
                if let Err(e) = dead.process.kill().await {
                    warn!(plugin = %name, error = %e, "failed to reap dead plugin");
                }
                self.inner.metrics.set_active_sessions(name, 0);
            }
            return Err(Error::routing(format!(
                "plugin '{}' process exited; its entry was evicted, retry to spawn a new one",
                name
            )));
        }

        let id = unique_session_id(
            self.inner.config.session_id_length,
            self.inner.config.max_id_attempts,
            |candidate| entry.sessions.contains(candidate),
        )?;
        let backend = GrpcDatabaseClient::new(entry.channel.clone(), SessionTagger::new(&id)?);
        entry.sessions.insert(id.clone());

        self.inner.metrics.set_active_sessions(name, entry.sessions.len());
        self.inner.metrics.record_session_acquired(name, "shared");
        tracing::debug!(plugin = %name, session_id = %id, active = entry.sessions.len(), "reusing plugin process");

        Ok(Some(DatabasePluginClient::shared(
            id,
            name,
            entry.generation,
            entry.protocol_version,
            backend,
            Arc::downgrade(&self.inner),
        )))
    }

    /// Turn a fresh negotiation into a session, registering the process
    /// when it can be shared.
    async fn finish(&self, name: &str, negotiated: Negotiated) -> Result<DatabasePluginClient> {
        let Negotiated { capability, process, protocol_version } = negotiated;
        let config = &self.inner.config;

        let id = match unique_session_id(config.session_id_length, config.max_id_attempts, |_| false) {
            Ok(id) => id,
            Err(e) => {
                if let Err(kill_err) = process.kill().await {
                    warn!(plugin = %name, error = %kill_err, "failed to kill plugin after id failure");
                }
                return Err(e);
            }
        };

        match capability {
            Capability::Multiplexed { channel, supported: true } => {
                let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed) + 1;
                let backend = GrpcDatabaseClient::new(channel.clone(), SessionTagger::new(&id)?);

                {
                    let mut registry = self.inner.registry.lock().await;
                    registry.processes.insert(
                        name.to_string(),
                        PluginProcess {
                            generation,
                            process,
                            channel,
                            protocol_version,
                            sessions: HashSet::from([id.clone()]),
                        },
                    );
                }

                transition(name, AcquireState::Registered);
                self.inner.metrics.set_active_sessions(name, 1);
                self.inner.metrics.record_session_acquired(name, "shared");
                info!(plugin = %name, generation, version = protocol_version, "registered multiplexed plugin");

                Ok(DatabasePluginClient::shared(
                    id,
                    name,
                    generation,
                    protocol_version,
                    backend,
                    Arc::downgrade(&self.inner),
                ))
            }
            Capability::Multiplexed { channel, supported: false } => {
                // Still tagged: a version 6 server may require the tag even
                // when it declines to share its process.
                let backend = GrpcDatabaseClient::new(channel, SessionTagger::new(&id)?);
                Ok(self.dedicated(name, id, protocol_version, backend, process))
            }
            Capability::Legacy(backend) => {
                Ok(self.dedicated(name, id, protocol_version, backend, process))
            }
        }
    }

    fn dedicated(
        &self,
        name: &str,
        id: String,
        protocol_version: u32,
        backend: GrpcDatabaseClient,
        process: Arc<dyn ProcessHandle>,
    ) -> DatabasePluginClient {
        transition(name, AcquireState::Dedicated);
        self.inner.metrics.record_session_acquired(name, "dedicated");
        info!(plugin = %name, version = protocol_version, "plugin does not multiplex, using dedicated process");
        DatabasePluginClient::dedicated(id, name, protocol_version, backend, process)
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("spawn_timeout", &self.inner.negotiator.spawn_timeout())
            .finish_non_exhaustive()
    }
}
