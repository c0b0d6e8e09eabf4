//! Gantry Controller
//!
//! Compiles a workflow declaration into an execution graph, claims the
//! workflow instance in PostgreSQL, and drives it to completion by polling
//! state, launching detached workers, and enforcing admission throttles.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gantry_controller::{
    config::{AppConfig, DatabaseConfig, ThrottleConfig},
    db::{create_pool, schema},
    declare::{load_macros, DeclLoader},
    graph::Compiler,
    run::{Controller, ControllerOptions, RunMode},
};

#[derive(Parser)]
#[command(name = "gantry-controller")]
#[command(version, about = "Gantry workflow controller", long_about = None)]
struct Cli {
    /// Root declaration file of the workflow to run
    #[arg(value_name = "DECLARATION")]
    declaration: PathBuf,

    /// Set top-level parameters (format: name=value), can be repeated
    #[arg(short = 'p', long = "param", value_name = "NAME=VALUE")]
    params: Vec<String>,

    /// Undo the named DONE step and everything below it instead of
    /// running forward
    #[arg(long, value_name = "STEP")]
    undo: Option<String>,

    /// Tell workers to simulate their steps instead of executing them
    #[arg(long)]
    test: bool,

    /// Run a single reconciliation cycle and exit
    #[arg(long)]
    once: bool,

    /// Take over a workflow last controlled from another host
    #[arg(long)]
    host_override: bool,

    /// Throttle limits YAML (overrides GANTRY_THROTTLE_FILE)
    #[arg(long, value_name = "FILE")]
    throttle_file: Option<PathBuf>,
}

/// Initialize tracing/logging.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("GANTRY_LOG")
                .unwrap_or_else(|_| "info,gantry_controller=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Parse repeated name=value pairs.
fn parse_params(pairs: &[String]) -> anyhow::Result<HashMap<String, String>> {
    let mut params = HashMap::new();
    for pair in pairs {
        let (name, value) = pair
            .split_once('=')
            .with_context(|| format!("malformed --param '{}': expected NAME=VALUE", pair))?;
        params.insert(name.to_string(), value.to_string());
    }
    Ok(params)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    dotenvy::dotenv().ok();

    init_tracing();

    let cli = Cli::parse();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Gantry controller"
    );

    let app_config = AppConfig::from_env().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load app config, using defaults");
        AppConfig::default()
    });

    let db_config = DatabaseConfig::from_env().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load database config, using defaults");
        DatabaseConfig::default()
    });

    let params = parse_params(&cli.params)?;

    // Compile the declaration tree rooted at the given file.
    let dir = match cli.declaration.parent() {
        Some(p) if p != Path::new("") => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let root_file = cli
        .declaration
        .file_name()
        .with_context(|| format!("declaration path '{}' has no file name", cli.declaration.display()))?
        .to_string_lossy()
        .into_owned();

    let macros = match &app_config.macros_file {
        Some(path) => load_macros(path)?,
        None => HashMap::new(),
    };
    let loader = DeclLoader::new(dir);
    let graph = Compiler::new(&loader, macros)?.compile(&root_file, &params)?;
    tracing::info!(
        workflow = %graph.name,
        version = %graph.version,
        steps = graph.len(),
        "Declaration compiled"
    );

    let throttle_path = cli
        .throttle_file
        .clone()
        .or_else(|| app_config.throttle_file.clone().map(PathBuf::from));
    let throttle = match throttle_path {
        Some(path) => ThrottleConfig::from_file(&path)?,
        None => {
            tracing::info!("No throttle file configured; using default limits");
            ThrottleConfig::default()
        }
    };

    let pool = create_pool(&db_config).await?;
    schema::init_schema(&pool).await?;

    let options = ControllerOptions {
        mode: if cli.test { RunMode::Test } else { RunMode::Run },
        once: cli.once,
        host_override: cli.host_override,
        undo_root: cli.undo.clone(),
    };

    let mut controller = Controller::start(pool, app_config, throttle, graph, options).await?;
    controller.run(shutdown_signal()).await?;

    tracing::info!("Controller shutdown complete");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
