use std::path::PathBuf;

use anyhow::{anyhow, bail, Context};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::Value;
use tracing::info;

use dbplugin::config::{Config, PluginCatalog};
use dbplugin::database::{
    ConfigMap, Database, InitializeRequest, NewUserRequest, Password, Statements, UsernameMetadata,
};
use dbplugin::observability::{init_observability, log_config_info, LogTarget};
use dbplugin::{ConnectionManager, APP_NAME, VERSION};

#[derive(Parser)]
#[command(name = "dbplugin")]
#[command(about = "Launch database plugins and drive them through multiplexed sessions")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Plugin catalog (TOML); overrides DBPLUGIN_CATALOG
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List plugins in the catalog
    List,

    /// Launch a plugin, open sessions on it and report what it negotiated
    Check {
        plugin: String,

        /// Number of concurrent sessions to open
        #[arg(long, default_value_t = 1)]
        sessions: usize,
    },

    /// Create a database user through a plugin
    NewUser {
        plugin: String,

        #[arg(long)]
        display_name: String,

        #[arg(long)]
        role_name: String,

        /// Lifetime of the credential
        #[arg(long, default_value_t = 3600)]
        ttl_seconds: i64,

        /// Backend configuration entries, `key=value`
        #[arg(long = "config", value_parser = parse_key_value)]
        config: Vec<(String, String)>,
    },
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))
}

fn random_password() -> Password {
    let raw: String = rand::thread_rng().sample_iter(&Alphanumeric).take(24).map(char::from).collect();
    Password::new(raw)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (optional - won't fail if missing)
    if let Err(e) = dotenvy::dotenv() {
        if !e.to_string().contains("not found") {
            eprintln!("Warning: Error loading .env file: {}", e);
        }
    }

    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if let Some(path) = cli.catalog {
        config.catalog_path = Some(path);
    }
    config.validate()?;

    init_observability(&config.observability, LogTarget::Stderr)?;
    info!(app_name = APP_NAME, version = VERSION, "Starting dbplugin host");
    log_config_info(&config);

    let catalog_path = config
        .catalog_path
        .clone()
        .ok_or_else(|| anyhow!("no plugin catalog: pass --catalog or set DBPLUGIN_CATALOG"))?;
    let catalog = PluginCatalog::load(&catalog_path)
        .with_context(|| format!("loading catalog {}", catalog_path.display()))?;

    match cli.command {
        Commands::List => {
            for name in catalog.names() {
                println!("{}", name);
            }
            Ok(())
        }
        Commands::Check { plugin, sessions } => check(catalog, config, &plugin, sessions).await,
        Commands::NewUser { plugin, display_name, role_name, ttl_seconds, config: entries } => {
            let manager = ConnectionManager::from_catalog(catalog, config.manager);
            let session = manager.acquire_session(&plugin).await?;

            let backend_config: ConfigMap =
                entries.into_iter().map(|(k, v)| (k, Value::String(v))).collect();
            let password = random_password();

            let result = async {
                session.initialize(InitializeRequest { config: backend_config, verify_connection: true }).await?;
                session
                    .new_user(NewUserRequest {
                        username_config: UsernameMetadata { display_name, role_name },
                        password: password.clone(),
                        expiration: Utc::now() + Duration::seconds(ttl_seconds),
                        statements: Statements::default(),
                        rollback_statements: Statements::default(),
                    })
                    .await
            }
            .await;

            let closed = manager.release_session(&session).await;
            let response = result?;
            closed?;

            let output = serde_json::json!({
                "username": response.username,
                "password": password.expose(),
                "ttl_seconds": ttl_seconds,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
    }
}

async fn check(
    catalog: PluginCatalog,
    config: Config,
    plugin: &str,
    sessions: usize,
) -> anyhow::Result<()> {
    if sessions == 0 {
        bail!("--sessions must be at least 1");
    }

    let manager = ConnectionManager::from_catalog(catalog, config.manager);
    let opened = manager.acquire_sessions(plugin, sessions).await?;

    let first = &opened[0];
    let type_name = first.type_name().await;
    if let Ok(type_name) = &type_name {
        println!("plugin:            {}", plugin);
        println!("type:              {}", type_name);
        println!("protocol version:  {}", first.protocol_version());
        println!("multiplexed:       {}", first.is_multiplexed());
        println!("sessions opened:   {}", opened.len());
        println!("shared processes:  {}", manager.process_count().await);
    }

    manager.release_all(&opened).await;
    type_name?;
    Ok(())
}
