//! `flowdesk` CLI entry-point.
//!
//! Available sub-commands:
//! - `serve`    start the API server.
//! - `migrate`  run pending database migrations.
//! - `validate` check a flow JSON file and print its topological order.
//! - `preview`  resolve a flow JSON file against an input without persisting.

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use engine::{FlowDraft, FlowService, MemoryStore, PgStore, Sinks, Store, TaskExecutor};
use notify::memory::MemorySink;
use notify::postgres::PgSink;
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;

#[derive(Parser)]
#[command(name = "flowdesk", about = "Flow and human-review task engine", version)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true, default_value = "flowdesk.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the REST API server.
    Serve {
        #[arg(long, env = "FLOWDESK_BIND")]
        bind: Option<String>,
        #[arg(long, env = "DATABASE_URL")]
        database_url: Option<String>,
        /// Keep everything in process memory instead of Postgres.
        #[arg(long)]
        memory: bool,
    },
    /// Run pending database migrations.
    Migrate {
        #[arg(long, env = "DATABASE_URL")]
        database_url: Option<String>,
    },
    /// Validate a flow definition JSON file.
    Validate {
        /// Path to the flow JSON file.
        path: PathBuf,
    },
    /// Show which nodes a trigger would skip and which human steps it would create.
    Preview {
        /// Path to the flow JSON file.
        path: PathBuf,
        /// Trigger input as a JSON object.
        #[arg(long, default_value = "{}")]
        input: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = AppConfig::load(&cli.config)?;

    match cli.command {
        Command::Serve { bind, database_url, memory } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(url) = database_url {
                config.database.url = url;
            }
            serve(config, memory).await?;
        }
        Command::Migrate { database_url } => {
            if let Some(url) = database_url {
                config.database.url = url;
            }
            let pool = db::pool::create_pool(&config.database.url, 2).await?;
            db::pool::run_migrations(&pool).await?;
            info!("migrations applied");
        }
        Command::Validate { path } => {
            let draft = read_flow(&path)?;
            match engine::validate_graph(&draft.graph) {
                Ok(order) => println!("✅ Flow '{}' is valid. Topological order: {order:?}", draft.name),
                Err(e) => {
                    eprintln!("❌ Validation failed: {e}");
                    std::process::exit(1);
                }
            }
        }
        Command::Preview { path, input } => {
            let draft = read_flow(&path)?;
            let input: Value = serde_json::from_str(&input).context("--input is not valid JSON")?;
            let preview = engine::planner::preview(&draft.graph, &input, config.engine.skip_propagation)?;
            println!("{}", serde_json::to_string_pretty(&preview)?);
        }
    }

    Ok(())
}

fn read_flow(path: &Path) -> Result<FlowDraft> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read file {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("{} is not a flow definition", path.display()))
}

async fn serve(config: AppConfig, memory: bool) -> Result<()> {
    let timeout = config.engine.sink_timeout();
    let store: Arc<dyn Store>;
    let sinks: Sinks;
    if memory {
        info!("using in-memory store");
        let sink = Arc::new(MemorySink::new());
        store = Arc::new(MemoryStore::new());
        sinks = Sinks::new(sink.clone(), sink, timeout);
    } else {
        let pool = db::pool::create_pool(&config.database.url, config.database.max_connections).await?;
        let sink = Arc::new(PgSink::new(pool.clone()));
        store = Arc::new(PgStore::new(pool));
        sinks = Sinks::new(sink.clone(), sink, timeout);
    }

    let state = api::AppState::new(
        FlowService::new(store.clone(), sinks.clone()),
        TaskExecutor::new(store, sinks, config.engine),
    );
    api::serve(&config.server.bind, state).await?;
    Ok(())
}
