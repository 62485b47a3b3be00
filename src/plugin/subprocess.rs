//! Launches catalog plugins as local subprocesses.
//!
//! The child gets the magic cookie and the offered versions in its
//! environment, prints its handshake line on stdout, and is then reached
//! over loopback gRPC. Its stderr is forwarded to `tracing`.

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tonic::transport::Endpoint;
use tracing::{debug, info, warn};

use super::handshake::{render_versions, HandshakeLine, PROTOCOL_VERSIONS_ENV};
use super::runner::{PluginRunner, ProcessHandle, RunConfig, SpawnedPlugin};
use crate::config::{ManagerConfig, PluginCatalog};
use crate::errors::{Error, Result};

/// How long to wait for stderr after a plugin exits without a handshake.
const EXIT_DIAGNOSTICS_TIMEOUT: Duration = Duration::from_secs(1);

/// [`PluginRunner`] backed by `tokio::process`.
#[derive(Debug, Clone)]
pub struct SubprocessRunner {
    catalog: Arc<PluginCatalog>,
    handshake_timeout: Duration,
    connect_timeout: Duration,
}

impl SubprocessRunner {
    pub fn new(catalog: PluginCatalog, config: &ManagerConfig) -> Self {
        Self {
            catalog: Arc::new(catalog),
            handshake_timeout: config.handshake_timeout(),
            connect_timeout: config.connect_timeout(),
        }
    }

    pub fn catalog(&self) -> &PluginCatalog {
        &self.catalog
    }
}

#[async_trait]
impl PluginRunner for SubprocessRunner {
    async fn spawn(&self, name: &str, config: &RunConfig) -> Result<SpawnedPlugin> {
        let entry = self
            .catalog
            .get(name)
            .ok_or_else(|| Error::spawn(format!("plugin '{}' is not in the catalog", name)))?;

        if let Some(expected) = &entry.sha256 {
            verify_checksum(&entry.command, expected).await?;
        }

        let mut child = Command::new(&entry.command)
            .args(&entry.args)
            .envs(&entry.env)
            .env(&config.handshake.magic_cookie_key, &config.handshake.magic_cookie_value)
            .env(PROTOCOL_VERSIONS_ENV, render_versions(&config.protocol_versions))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::spawn_with_source(
                    format!("failed to start plugin '{}' ({})", name, entry.command.display()),
                    e,
                )
            })?;

        let pid = child.id();
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(Error::spawn(format!("plugin '{}' has no stdio pipes", name)));
        };

        let mut stdout = BufReader::new(stdout).lines();
        let first_line =
            match tokio::time::timeout(self.handshake_timeout, stdout.next_line()).await {
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => {
                    let diagnostics = collect_output(stderr).await;
                    return Err(Error::handshake(format!(
                        "plugin '{}' exited before completing the handshake (wrong magic cookie \
                         or not a plugin binary?): {}",
                        name,
                        diagnostics.trim()
                    )));
                }
                Ok(Err(e)) => {
                    return Err(Error::spawn_with_source(
                        format!("failed to read handshake from plugin '{}'", name),
                        e,
                    ))
                }
                Err(_) => {
                    return Err(Error::handshake(format!(
                        "plugin '{}' did not print a handshake line within {:?}",
                        name, self.handshake_timeout
                    )))
                }
            };

        let line = HandshakeLine::parse(&first_line)?;
        if !config.protocol_versions.contains(&line.app_version) {
            return Err(Error::handshake(format!(
                "plugin '{}' selected protocol version {} which was not offered ({})",
                name,
                line.app_version,
                render_versions(&config.protocol_versions)
            )));
        }

        forward_lines(name, "stderr", BufReader::new(stderr).lines());
        forward_lines(name, "stdout", stdout);

        let channel = Endpoint::from_shared(line.endpoint_uri())
            .map_err(|e| Error::spawn_with_source(format!("bad plugin address {}", line.addr), e))?
            .connect_timeout(self.connect_timeout)
            .connect()
            .await
            .map_err(|e| {
                Error::spawn_with_source(
                    format!("failed to connect to plugin '{}' at {}", name, line.addr),
                    e,
                )
            })?;

        info!(plugin = %name, pid = ?pid, version = line.app_version, addr = %line.addr, "plugin started");

        Ok(SpawnedPlugin {
            channel,
            protocol_version: line.app_version,
            process: Arc::new(ChildProcess::new(name, child)),
        })
    }
}

/// Compare the SHA-256 of `path` with `expected` (hex, any case).
pub async fn verify_checksum(path: &Path, expected: &str) -> Result<()> {
    let bytes = tokio::fs::read(path).await.map_err(|e| {
        Error::spawn_with_source(format!("failed to read plugin binary {}", path.display()), e)
    })?;
    let actual = hex::encode(Sha256::digest(&bytes));

    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(Error::spawn(format!(
            "checksum mismatch for {}: expected {}, found {}",
            path.display(),
            expected,
            actual
        )))
    }
}

async fn collect_output<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut output = String::new();
    let _ = tokio::time::timeout(EXIT_DIAGNOSTICS_TIMEOUT, reader.read_to_string(&mut output)).await;
    output
}

fn forward_lines<R>(plugin: &str, stream: &'static str, mut lines: tokio::io::Lines<BufReader<R>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let plugin = plugin.to_string();
    tokio::spawn(async move {
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(plugin = %plugin, stream, "{}", line);
        }
    });
}

/// A plugin subprocess started by [`SubprocessRunner`].
#[derive(Debug)]
pub struct ChildProcess {
    name: String,
    pid: Option<u32>,
    child: Mutex<Option<Child>>,
}

impl ChildProcess {
    fn new(name: &str, child: Child) -> Self {
        Self { name: name.to_string(), pid: child.id(), child: Mutex::new(Some(child)) }
    }
}

#[async_trait]
impl ProcessHandle for ChildProcess {
    async fn kill(&self) -> Result<()> {
        let child = match self.child.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(mut child) = child else {
            return Ok(());
        };

        if let Ok(Some(status)) = child.try_wait() {
            debug!(plugin = %self.name, %status, "plugin already exited");
            return Ok(());
        }

        child.kill().await.map_err(|e| {
            warn!(plugin = %self.name, error = %e, "failed to kill plugin");
            Error::spawn_with_source(format!("failed to kill plugin '{}'", self.name), e)
        })?;
        debug!(plugin = %self.name, pid = ?self.pid, "plugin killed");
        Ok(())
    }

    fn is_alive(&self) -> bool {
        match self.child.lock() {
            Ok(mut guard) => guard.as_mut().is_some_and(|child| matches!(child.try_wait(), Ok(None))),
            Err(_) => false,
        }
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}
