//! Common test utilities for all integration tests.
//!
//! Provides an in-process [`PluginRunner`]: instead of launching an
//! executable it starts a tonic `PluginServer` on a loopback port, so the
//! connection manager talks real gRPC without any subprocess.

#![allow(dead_code)]
#![allow(clippy::duplicate_mod)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tonic::transport::Endpoint;

use dbplugin::config::ManagerConfig;
use dbplugin::database::{Database, Factory, InMemoryDatabase};
use dbplugin::errors::{Error, Result};
use dbplugin::grpc::DatabaseDispatcher;
use dbplugin::plugin::{
    PluginRunner, PluginServer, ProcessHandle, RunConfig, SpawnedPlugin, LEGACY_VERSION,
    MULTIPLEX_VERSION,
};
use dbplugin::ConnectionManager;

/// How the fake plugin answers the version and multiplexing questions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginMode {
    /// Version 5, one backend per process.
    Legacy,
    /// Version 6 and reports multiplexing support.
    Multiplexed,
    /// Version 6 but reports no multiplexing support.
    MultiplexUnsupported,
}

/// A fake plugin process: "killing" it shuts its server down.
pub struct FakeProcess {
    pid: u32,
    alive: AtomicBool,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    kills: Arc<AtomicUsize>,
}

impl FakeProcess {
    /// Simulate the plugin exiting on its own.
    pub fn crash(&self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(tx) = self.shutdown.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }
}

#[async_trait]
impl ProcessHandle for FakeProcess {
    async fn kill(&self) -> Result<()> {
        if self.alive.swap(false, Ordering::SeqCst) {
            self.kills.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(tx) = self.shutdown.lock().unwrap().take() {
            let _ = tx.send(());
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }
}

pub struct InProcessRunner {
    mode: PluginMode,
    spawn_delay: Option<Duration>,
    spawns: AtomicUsize,
    kills: Arc<AtomicUsize>,
    processes: Mutex<Vec<Arc<FakeProcess>>>,
    dispatchers: Mutex<Vec<Arc<DatabaseDispatcher>>>,
}

impl InProcessRunner {
    pub fn new(mode: PluginMode) -> Self {
        Self {
            mode,
            spawn_delay: None,
            spawns: AtomicUsize::new(0),
            kills: Arc::new(AtomicUsize::new(0)),
            processes: Mutex::new(Vec::new()),
            dispatchers: Mutex::new(Vec::new()),
        }
    }

    /// Delay every spawn by `delay` before the server comes up.
    pub fn with_spawn_delay(mut self, delay: Duration) -> Self {
        self.spawn_delay = Some(delay);
        self
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    pub fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    /// Most recently spawned process.
    pub fn last_process(&self) -> Arc<FakeProcess> {
        Arc::clone(self.processes.lock().unwrap().last().expect("nothing spawned yet"))
    }

    /// Dispatcher of the most recently spawned process.
    pub fn last_dispatcher(&self) -> Arc<DatabaseDispatcher> {
        Arc::clone(self.dispatchers.lock().unwrap().last().expect("nothing spawned yet"))
    }

    fn build_server(&self) -> PluginServer {
        match self.mode {
            PluginMode::Legacy => PluginServer::new(DatabaseDispatcher::single(InMemoryDatabase::new())),
            PluginMode::Multiplexed => PluginServer::new(DatabaseDispatcher::multiplexed(memdb_factory())),
            PluginMode::MultiplexUnsupported => {
                PluginServer::new(DatabaseDispatcher::single(InMemoryDatabase::new()))
                    .with_multiplexing_report(Some(false))
            }
        }
    }
}

#[async_trait]
impl PluginRunner for InProcessRunner {
    async fn spawn(&self, _name: &str, config: &RunConfig) -> Result<SpawnedPlugin> {
        let pid = self.spawns.fetch_add(1, Ordering::SeqCst) as u32 + 1;
        if let Some(delay) = self.spawn_delay {
            tokio::time::sleep(delay).await;
        }

        let protocol_version = match self.mode {
            PluginMode::Legacy => LEGACY_VERSION,
            _ => MULTIPLEX_VERSION,
        };
        if !config.protocol_versions.contains(&protocol_version) {
            return Err(Error::handshake(format!("host did not offer version {}", protocol_version)));
        }

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (tx, rx) = oneshot::channel::<()>();

        let server = self.build_server();
        self.dispatchers.lock().unwrap().push(server.dispatcher());
        tokio::spawn(async move {
            let _ = server
                .serve_with_listener(listener, async {
                    let _ = rx.await;
                })
                .await;
        });

        let channel = Endpoint::from_shared(format!("http://{}", addr))
            .map_err(|e| Error::spawn(e.to_string()))?
            .connect()
            .await
            .map_err(|e| Error::spawn_with_source("connect to in-process plugin", e))?;

        let process = Arc::new(FakeProcess {
            pid,
            alive: AtomicBool::new(true),
            shutdown: Mutex::new(Some(tx)),
            kills: Arc::clone(&self.kills),
        });
        self.processes.lock().unwrap().push(Arc::clone(&process));

        Ok(SpawnedPlugin { channel, protocol_version, process })
    }
}

pub fn memdb_factory() -> Factory {
    Arc::new(|| {
        let db: Box<dyn Database> = Box::new(InMemoryDatabase::new());
        Ok(db)
    })
}

pub fn manager_with(runner: &Arc<InProcessRunner>, config: ManagerConfig) -> ConnectionManager {
    let runner: Arc<dyn PluginRunner> = Arc::clone(runner) as Arc<dyn PluginRunner>;
    ConnectionManager::new(runner, config)
}

pub fn manager(mode: PluginMode) -> (ConnectionManager, Arc<InProcessRunner>) {
    let runner = Arc::new(InProcessRunner::new(mode));
    (manager_with(&runner, ManagerConfig::default()), runner)
}
