//! Plugin-side entry points.
//!
//! A plugin binary calls [`serve`] or [`serve_multiplex`] from `main`. Both
//! check the magic cookie, pick a protocol version from what the host
//! offered, bind a loopback listener, print the handshake line and then
//! serve until the host kills the process or a shutdown signal arrives.

use std::future::Future;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::{info, warn};

use super::handshake::{
    negotiate_version, parse_versions, HandshakeConfig, HandshakeLine, LEGACY_VERSION,
    MULTIPLEX_VERSION, PROTOCOL_VERSIONS_ENV, SUPPORTED_VERSIONS,
};
use crate::database::{Database, Factory};
use crate::errors::{Error, Result};
use crate::grpc::{DatabaseDispatcher, MultiplexingSupportService};
use crate::observability::grpc_trace_layer;
use crate::proto::pb::database_server::DatabaseServer;
use crate::proto::pb::plugin_multiplexing_server::PluginMultiplexingServer;

/// Printed to stderr when someone runs a plugin binary by hand.
pub const NOT_A_PLUGIN_NOTICE: &str = "This binary is a plugin. These are not meant to be \
executed directly. Please execute the program that consumes these plugins, which will load \
any plugins automatically.";

/// Environment-derived settings for a plugin process.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub handshake: HandshakeConfig,
    pub bind_addr: SocketAddr,
    /// Versions offered by the host; `None` means the host predates version
    /// negotiation and only speaks the legacy set.
    pub offered_versions: Option<Vec<u32>>,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            handshake: HandshakeConfig::default(),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            offered_versions: None,
        }
    }
}

impl ServeOptions {
    pub fn from_env() -> Self {
        Self {
            offered_versions: std::env::var(PROTOCOL_VERSIONS_ENV).ok().map(|v| parse_versions(&v)),
            ..Default::default()
        }
    }

    fn offered(&self) -> Vec<u32> {
        self.offered_versions.clone().unwrap_or_else(|| vec![LEGACY_VERSION])
    }

    fn verify_cookie(&self) -> Result<()> {
        self.handshake.verify(|key| std::env::var(key).ok()).inspect_err(|_| {
            eprintln!("{}", NOT_A_PLUGIN_NOTICE);
        })
    }
}

/// A `tonic` server exposing one dispatcher.
pub struct PluginServer {
    dispatcher: Arc<DatabaseDispatcher>,
    multiplexing_report: Option<bool>,
}

impl PluginServer {
    /// Multiplexed dispatchers advertise support; single ones expose no
    /// `PluginMultiplexing` service at all.
    pub fn new(dispatcher: DatabaseDispatcher) -> Self {
        let multiplexing_report = dispatcher.is_multiplexed().then_some(true);
        Self { dispatcher: Arc::new(dispatcher), multiplexing_report }
    }

    /// Override what the `PluginMultiplexing` service reports, or hide it.
    pub fn with_multiplexing_report(mut self, report: Option<bool>) -> Self {
        self.multiplexing_report = report;
        self
    }

    pub fn dispatcher(&self) -> Arc<DatabaseDispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    pub async fn serve_with_listener<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let multiplexing =
            self.multiplexing_report.map(|supported| {
                PluginMultiplexingServer::new(MultiplexingSupportService::new(supported))
            });

        Server::builder()
            .layer(grpc_trace_layer())
            .add_service(DatabaseServer::from_arc(self.dispatcher))
            .add_optional_service(multiplexing)
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
            .await
            .map_err(|e| Error::transport(format!("plugin server failed: {}", e)))
    }

    /// Bind, announce the handshake line on stdout and serve.
    pub async fn run<F>(self, version: u32, options: &ServeOptions, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind(options.bind_addr).await.map_err(|e| {
            Error::transport(format!("failed to bind {}: {}", options.bind_addr, e))
        })?;
        let addr = listener.local_addr()?;

        announce(&HandshakeLine::new(version, addr))?;
        info!(%addr, version, multiplexed = self.dispatcher.is_multiplexed(), "plugin serving");

        self.serve_with_listener(listener, shutdown).await
    }
}

fn announce(line: &HandshakeLine) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", line)?;
    stdout.flush()?;
    Ok(())
}

/// Serve a single backend instance. Offers only the legacy version.
pub async fn serve<D: Database + 'static>(db: D, options: &ServeOptions) -> Result<()> {
    options.verify_cookie()?;
    let version = select_version(options, &[LEGACY_VERSION])?;

    PluginServer::new(DatabaseDispatcher::single(db))
        .run(version, options, shutdown_signal())
        .await
}

/// Serve one backend instance per session when the host speaks the
/// multiplexing version, or a single instance for legacy hosts.
pub async fn serve_multiplex(factory: Factory, options: &ServeOptions) -> Result<()> {
    options.verify_cookie()?;
    let version = select_version(options, &SUPPORTED_VERSIONS)?;

    let dispatcher = if version == MULTIPLEX_VERSION {
        DatabaseDispatcher::multiplexed(factory)
    } else {
        DatabaseDispatcher::single(factory()?)
    };

    PluginServer::new(dispatcher).run(version, options, shutdown_signal()).await
}

fn select_version(options: &ServeOptions, supported: &[u32]) -> Result<u32> {
    let offered = options.offered();
    negotiate_version(&offered, supported).ok_or_else(|| {
        Error::handshake(format!(
            "no common protocol version: host offered {:?}, plugin supports {:?}",
            offered, supported
        ))
    })
}

/// Resolves on ctrl-c, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
