//! Session acquisition, sharing and teardown against in-process plugins.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as TimeDelta, Utc};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use common::{manager, manager_with, InProcessRunner, PluginMode};
use dbplugin::config::ManagerConfig;
use dbplugin::database::{
    ConfigMap, Database, DeleteUserRequest, InitializeRequest, NewUserRequest, Password,
    Statements, UsernameMetadata,
};
use dbplugin::errors::{Error, Result, SpawnCancellation};
use dbplugin::plugin::{PluginRunner, RunConfig, SpawnedPlugin};

fn memdb_config() -> ConfigMap {
    json!({ "connection_url": "memdb://localhost" })
        .as_object()
        .cloned()
        .unwrap()
}

fn new_user_request(display: &str, password: &str) -> NewUserRequest {
    NewUserRequest {
        username_config: UsernameMetadata { display_name: display.into(), role_name: "readonly".into() },
        password: Password::new(password),
        expiration: Utc::now() + TimeDelta::hours(1),
        statements: Statements::new(["CREATE ROLE"]),
        rollback_statements: Statements::default(),
    }
}

#[tokio::test]
async fn shared_process_lives_until_last_session_is_released() {
    let (manager, runner) = manager(PluginMode::Multiplexed);

    let first = manager.acquire_session("postgres").await.unwrap();
    assert_eq!(manager.active_sessions("postgres").await, Some(1));

    let second = manager.acquire_session("postgres").await.unwrap();
    assert_eq!(manager.active_sessions("postgres").await, Some(2));
    assert_eq!(runner.spawn_count(), 1);
    assert_ne!(first.id(), second.id());
    assert!(first.is_multiplexed() && second.is_multiplexed());
    assert_eq!(first.generation(), second.generation());

    manager.release_session(&first).await.unwrap();
    assert_eq!(manager.active_sessions("postgres").await, Some(1));
    assert_eq!(runner.kill_count(), 0);

    manager.release_session(&second).await.unwrap();
    assert_eq!(manager.active_sessions("postgres").await, None);
    assert!(!manager.is_registered("postgres").await);
    assert_eq!(runner.kill_count(), 1);

    // A fresh acquire starts a new process under a new generation.
    let third = manager.acquire_session("postgres").await.unwrap();
    assert_eq!(runner.spawn_count(), 2);
    assert!(third.generation() > first.generation());
    manager.release_session(&third).await.unwrap();
}

#[tokio::test]
async fn racing_acquires_spawn_a_single_process() {
    let (manager, runner) = manager(PluginMode::Multiplexed);

    let tasks = (0..8).map(|_| {
        let manager = manager.clone();
        tokio::spawn(async move { manager.acquire_session("postgres").await })
    });
    let sessions: Vec<_> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    assert_eq!(runner.spawn_count(), 1);
    assert_eq!(manager.active_sessions("postgres").await, Some(8));

    let mut ids: Vec<&str> = sessions.iter().map(|s| s.id()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 8);

    for session in &sessions {
        session.close().await.unwrap();
    }
    assert_eq!(runner.kill_count(), 1);
    assert_eq!(manager.process_count().await, 0);
}

#[tokio::test]
async fn different_plugins_get_different_processes() {
    let (manager, runner) = manager(PluginMode::Multiplexed);

    let pg = manager.acquire_session("postgres").await.unwrap();
    let my = manager.acquire_session("mysql").await.unwrap();
    assert_eq!(runner.spawn_count(), 2);
    assert_eq!(manager.process_count().await, 2);

    pg.close().await.unwrap();
    assert!(manager.is_registered("mysql").await);
    my.close().await.unwrap();
}

#[tokio::test]
async fn double_release_is_a_no_op() {
    let (manager, runner) = manager(PluginMode::Multiplexed);

    let first = manager.acquire_session("postgres").await.unwrap();
    let second = manager.acquire_session("postgres").await.unwrap();

    manager.release_session(&first).await.unwrap();
    manager.release_session(&first).await.unwrap();
    assert!(first.is_released());
    assert_eq!(manager.active_sessions("postgres").await, Some(1));
    assert_eq!(runner.kill_count(), 0);

    manager.release_session(&second).await.unwrap();
    assert_eq!(runner.kill_count(), 1);
}

#[tokio::test]
async fn sessions_are_isolated_backend_instances() {
    let (manager, runner) = manager(PluginMode::Multiplexed);

    let a = manager.acquire_session("postgres").await.unwrap();
    let b = manager.acquire_session("postgres").await.unwrap();
    for session in [&a, &b] {
        session
            .initialize(InitializeRequest { config: memdb_config(), verify_connection: true })
            .await
            .unwrap();
    }

    let created = a.new_user(new_user_request("app", "hunter2")).await.unwrap();
    assert!(created.username.starts_with("v-app-readonly-"));

    // b has its own backend and has never seen the user.
    let deleted = b
        .delete_user(DeleteUserRequest { username: created.username.clone(), statements: Statements::default() })
        .await;
    assert!(deleted.is_ok(), "delete of an unknown user is idempotent");

    let dispatcher = runner.last_dispatcher();
    assert_eq!(dispatcher.instance_count().await, 2);

    a.close().await.unwrap();
    assert_eq!(dispatcher.session_ids().await, vec![b.id().to_string()]);

    b.close().await.unwrap();
}

#[tokio::test]
async fn round_trip_leaves_dispatch_table_empty() {
    let (manager, runner) = manager(PluginMode::Multiplexed);

    let session = manager.acquire_session("postgres").await.unwrap();
    session
        .initialize(InitializeRequest { config: memdb_config(), verify_connection: true })
        .await
        .unwrap();
    assert_eq!(session.type_name().await.unwrap(), "memdb");

    let dispatcher = runner.last_dispatcher();
    assert_eq!(dispatcher.session_ids().await, vec![session.id().to_string()]);

    // Keep the process alive so the dispatch table can be inspected.
    let keeper = manager.acquire_session("postgres").await.unwrap();
    session.close().await.unwrap();
    assert!(dispatcher.session_ids().await.iter().all(|id| id != session.id()));

    keeper.close().await.unwrap();
    assert_eq!(dispatcher.instance_count().await, 0);
}

#[tokio::test]
async fn backend_errors_cross_the_wire_with_their_kind() {
    let (manager, _runner) = manager(PluginMode::Multiplexed);
    let session = manager.acquire_session("postgres").await.unwrap();

    let err = session.new_user(new_user_request("app", "pw")).await.unwrap_err();
    match err {
        Error::Backend { code, message } => {
            assert_eq!(code, tonic::Code::FailedPrecondition);
            assert!(message.contains("not been initialized"));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let err = session
        .initialize(InitializeRequest { config: ConfigMap::new(), verify_connection: true })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest { .. }));

    session.close().await.unwrap();
}

#[tokio::test]
async fn legacy_plugins_get_a_dedicated_process_per_session() {
    let (manager, runner) = manager(PluginMode::Legacy);

    let a = manager.acquire_session("mongo").await.unwrap();
    let b = manager.acquire_session("mongo").await.unwrap();
    assert_eq!(runner.spawn_count(), 2);
    assert_eq!(manager.process_count().await, 0);
    assert!(!a.is_multiplexed());
    assert_eq!(a.protocol_version(), 5);
    assert_eq!(a.generation(), 0);
    assert_eq!(a.session_tag(), None);

    a.initialize(InitializeRequest { config: memdb_config(), verify_connection: false })
        .await
        .unwrap();

    a.close().await.unwrap();
    assert_eq!(runner.kill_count(), 1);
    b.close().await.unwrap();
    assert_eq!(runner.kill_count(), 2);
}

#[tokio::test]
async fn unsupported_multiplexing_is_dedicated_but_tagged() {
    let (manager, runner) = manager(PluginMode::MultiplexUnsupported);

    let a = manager.acquire_session("redis").await.unwrap();
    let b = manager.acquire_session("redis").await.unwrap();
    assert_eq!(runner.spawn_count(), 2);
    assert!(!manager.is_registered("redis").await);
    assert!(!a.is_multiplexed());
    assert_eq!(a.protocol_version(), 6);
    assert_eq!(a.session_tag(), Some(a.id()));

    assert_eq!(a.type_name().await.unwrap(), "memdb");

    a.close().await.unwrap();
    b.close().await.unwrap();
    assert_eq!(runner.kill_count(), 2);
}

#[tokio::test]
async fn spawn_deadline_leaves_registry_untouched() {
    let runner = Arc::new(InProcessRunner::new(PluginMode::Multiplexed).with_spawn_delay(Duration::from_secs(5)));
    let config = ManagerConfig { spawn_timeout_seconds: 1, ..Default::default() };
    let manager = manager_with(&runner, config);

    let err = manager.acquire_session("postgres").await.unwrap_err();
    assert_eq!(
        err.cancellation(),
        Some(&SpawnCancellation::DeadlineExceeded(Duration::from_secs(1)))
    );
    assert!(err.is_retryable());
    assert_eq!(manager.process_count().await, 0);
}

#[tokio::test]
async fn cancelled_acquire_returns_promptly() {
    let runner = Arc::new(InProcessRunner::new(PluginMode::Multiplexed).with_spawn_delay(Duration::from_secs(5)));
    let manager = manager_with(&runner, ManagerConfig::default());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let err = manager.acquire_session_with_cancel("postgres", &cancel).await.unwrap_err();
    assert_eq!(err.cancellation(), Some(&SpawnCancellation::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!manager.is_registered("postgres").await);
}

#[tokio::test]
async fn dead_process_is_evicted_and_respawned_on_retry() {
    let (manager, runner) = manager(PluginMode::Multiplexed);

    let orphan = manager.acquire_session("postgres").await.unwrap();
    runner.last_process().crash();

    let err = manager.acquire_session("postgres").await.unwrap_err();
    assert!(matches!(err, Error::Routing { .. }));
    assert!(!manager.is_registered("postgres").await);

    let fresh = manager.acquire_session("postgres").await.unwrap();
    assert_eq!(runner.spawn_count(), 2);
    assert_ne!(fresh.generation(), orphan.generation());

    // Releasing the orphan must not disturb the new process.
    let _ = orphan.close().await;
    assert_eq!(manager.active_sessions("postgres").await, Some(1));

    fresh.close().await.unwrap();
    assert!(!manager.is_registered("postgres").await);
}

/// Completes the handshake but claims a protocol version no client exists for.
struct VersionSkewRunner(Arc<InProcessRunner>);

#[async_trait::async_trait]
impl PluginRunner for VersionSkewRunner {
    async fn spawn(&self, name: &str, config: &RunConfig) -> Result<SpawnedPlugin> {
        let mut spawned = self.0.spawn(name, config).await?;
        spawned.protocol_version = 7;
        Ok(spawned)
    }
}

#[tokio::test]
async fn unknown_protocol_version_kills_the_plugin_and_registers_nothing() {
    let inner = Arc::new(InProcessRunner::new(PluginMode::Multiplexed));
    let runner: Arc<dyn PluginRunner> = Arc::new(VersionSkewRunner(Arc::clone(&inner)));
    let manager = dbplugin::ConnectionManager::new(runner, ManagerConfig::default());

    let err = manager.acquire_session("postgres").await.unwrap_err();
    assert!(matches!(err, Error::UnsupportedClientType { .. }), "unexpected error: {err:?}");
    assert_eq!(inner.spawn_count(), 1);
    assert_eq!(inner.kill_count(), 1);
    assert_eq!(manager.process_count().await, 0);
    assert!(!manager.is_registered("postgres").await);
}

/// Lets `limit` spawns through, then fails every later one.
struct LimitedRunner {
    inner: Arc<InProcessRunner>,
    limit: usize,
}

#[async_trait::async_trait]
impl PluginRunner for LimitedRunner {
    async fn spawn(&self, name: &str, config: &RunConfig) -> Result<SpawnedPlugin> {
        if self.inner.spawn_count() >= self.limit {
            return Err(Error::spawn("plugin binary went missing"));
        }
        self.inner.spawn(name, config).await
    }
}

#[tokio::test]
async fn failed_batch_acquire_releases_what_it_opened() {
    let inner = Arc::new(InProcessRunner::new(PluginMode::Legacy));
    let runner: Arc<dyn PluginRunner> = Arc::new(LimitedRunner { inner: Arc::clone(&inner), limit: 2 });
    let manager = dbplugin::ConnectionManager::new(runner, ManagerConfig::default());

    let err = manager.acquire_sessions("mongo", 3).await.unwrap_err();
    assert!(matches!(err, Error::Spawn { .. }));
    assert_eq!(inner.spawn_count(), 2);
    // Both dedicated processes opened before the failure were torn down.
    assert_eq!(inner.kill_count(), 2);
}

#[tokio::test]
async fn batch_acquire_shares_one_process() {
    let (manager, runner) = manager(PluginMode::Multiplexed);

    let sessions = manager.acquire_sessions("postgres", 3).await.unwrap();
    assert_eq!(sessions.len(), 3);
    assert_eq!(runner.spawn_count(), 1);
    assert_eq!(manager.active_sessions("postgres").await, Some(3));

    manager.release_all(&sessions).await;
    assert_eq!(runner.kill_count(), 1);
    assert!(!manager.is_registered("postgres").await);
}
