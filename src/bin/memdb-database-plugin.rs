use std::sync::Arc;

use clap::Parser;

use dbplugin::config::ObservabilityConfig;
use dbplugin::database::{Database, Factory, InMemoryDatabase, InstrumentedDatabase};
use dbplugin::observability::{init_logging, LogTarget};
use dbplugin::plugin::{serve, serve_multiplex, ServeOptions};

/// In-memory database plugin. Launched by the host, never by hand.
#[derive(Parser)]
#[command(name = "memdb-database-plugin")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Serve a single backend instance over the legacy protocol
    #[arg(long)]
    no_multiplex: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // stdout carries the handshake line; logs go to stderr where the host
    // picks them up.
    let observability = ObservabilityConfig {
        log_level: std::env::var("DBPLUGIN_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        ..Default::default()
    };
    init_logging(&observability, LogTarget::Stderr);

    let options = ServeOptions::from_env();
    if args.no_multiplex {
        serve(InstrumentedDatabase::new(InMemoryDatabase::new()), &options).await?;
    } else {
        let factory: Factory = Arc::new(|| {
            let db: Box<dyn Database> = Box::new(InstrumentedDatabase::new(InMemoryDatabase::new()));
            Ok(db)
        });
        serve_multiplex(factory, &options).await?;
    }
    Ok(())
}
