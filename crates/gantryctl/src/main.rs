//! Gantry Command Line Tool
//!
//! Operator controls for Gantry workflow instances: initialize the schema,
//! inspect workflow and step state, retry failed steps, hold or breakpoint
//! steps, arm undo passes, and ask a running controller to exit.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;

use gantry_controller::config::{AppConfig, DatabaseConfig};
use gantry_controller::db::{self, create_pool, queries, schema, DbPool};
use gantry_controller::run::KILL_MARKER;

#[derive(Parser)]
#[command(name = "gantryctl")]
#[command(version, about = "Gantry operator CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the database schema
    Db {
        #[command(subcommand)]
        command: DbCommands,
    },

    /// Show a workflow instance and its step state counts
    Status {
        /// Workflow name
        workflow: String,
    },

    /// List the step rows of a workflow
    Steps {
        /// Workflow name
        workflow: String,

        /// Only show steps currently in this state
        #[arg(long, value_name = "STATE")]
        state: Option<String>,

        /// Emit the rows as JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show the persisted parameters of one step
    Params {
        /// Workflow name
        workflow: String,

        /// Full step name
        step: String,
    },

    /// Put a FAILED step back to READY for another attempt
    Retry {
        /// Workflow name
        workflow: String,

        /// Full step name
        step: String,
    },

    /// Hold a step back from launching, or release the hold
    Offline {
        /// Workflow name
        workflow: String,

        /// Full step name
        step: String,

        /// Release the hold instead of setting it
        #[arg(long)]
        clear: bool,
    },

    /// Pause the workflow once a step completes, or clear the breakpoint
    StopAfter {
        /// Workflow name
        workflow: String,

        /// Full step name
        step: String,

        /// Clear the breakpoint instead of setting it
        #[arg(long)]
        clear: bool,
    },

    /// Record an undo pass rooted at a DONE step
    Undo {
        /// Workflow name
        workflow: String,

        /// Full step name of the undo root
        step: String,
    },

    /// Ask the running controller of a workflow to exit cleanly
    Kill {
        /// Workflow name
        workflow: String,
    },
}

#[derive(Subcommand)]
enum DbCommands {
    /// Create the gantry schema and tables if they do not exist
    Init,

    /// Drop the gantry schema with all its data and recreate it
    Reset {
        /// Skip the confirmation guard
        #[arg(long)]
        yes: bool,
    },

    /// Check that the database is reachable
    Ping,
}

async fn connect() -> Result<DbPool> {
    let db_config = DatabaseConfig::from_env()?;
    Ok(create_pool(&db_config).await?)
}

async fn workflow_id(pool: &DbPool, workflow: &str) -> Result<i64> {
    let row = queries::workflow::get_workflow_by_name(pool, workflow)
        .await?
        .with_context(|| format!("workflow '{}' not found", workflow))?;
    Ok(row.id)
}

async fn ensure_step(pool: &DbPool, workflow_id: i64, workflow: &str, step: &str) -> Result<()> {
    queries::step::get_step_by_name(pool, workflow_id, step)
        .await?
        .with_context(|| format!("step '{}' not found in workflow '{}'", step, workflow))?;
    Ok(())
}

fn fmt_time(t: Option<chrono::DateTime<chrono::Utc>>) -> String {
    t.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Db { command } => match command {
            DbCommands::Init => {
                let pool = connect().await?;
                schema::init_schema(&pool).await?;
                println!("Schema ready");
            }
            DbCommands::Reset { yes } => {
                if !yes {
                    bail!("refusing to drop the gantry schema without --yes");
                }
                let pool = connect().await?;
                schema::drop_schema(&pool).await?;
                schema::init_schema(&pool).await?;
                println!("Schema dropped and recreated");
            }
            DbCommands::Ping => {
                let pool = connect().await?;
                if db::health_check(&pool).await {
                    println!("Database reachable");
                } else {
                    bail!("database did not answer");
                }
            }
        },

        Commands::Status { workflow } => {
            let pool = connect().await?;
            let row = queries::workflow::get_workflow_by_name(&pool, &workflow)
                .await?
                .with_context(|| format!("workflow '{}' not found", workflow))?;

            println!("Workflow:  {} (version {})", row.name, row.version);
            println!("State:     {}", row.state);
            match row.claimed_by() {
                Some((host, pid)) => println!("Claim:     {} pid {}", host, pid),
                None => println!("Claim:     unclaimed"),
            }
            if let Some(root) = &row.undo_step {
                println!("Undo:      active, rooted at '{}'", root);
            }
            println!("Updated:   {}", row.updated_at.format("%Y-%m-%d %H:%M:%S"));

            let steps = queries::step::fetch_steps(&pool, row.id).await?;
            let mut by_state: BTreeMap<&str, usize> = BTreeMap::new();
            for s in &steps {
                *by_state.entry(s.state.as_str()).or_insert(0) += 1;
            }
            println!();
            println!("{:<10} {:>6}", "STATE", "STEPS");
            for (state, count) in &by_state {
                println!("{:<10} {:>6}", state, count);
            }

            if row.undo_step.is_some() {
                let mut by_undo: BTreeMap<&str, usize> = BTreeMap::new();
                for s in &steps {
                    if let Some(u) = &s.undo_state {
                        *by_undo.entry(u.as_str()).or_insert(0) += 1;
                    }
                }
                println!();
                println!("{:<10} {:>6}", "UNDO", "STEPS");
                for (state, count) in &by_undo {
                    println!("{:<10} {:>6}", state, count);
                }
            }
        }

        Commands::Steps {
            workflow,
            state,
            json,
        } => {
            let pool = connect().await?;
            let id = workflow_id(&pool, &workflow).await?;
            let mut rows = queries::step::fetch_steps(&pool, id).await?;
            if let Some(filter) = &state {
                rows.retain(|row| row.state.eq_ignore_ascii_case(filter));
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
                return Ok(());
            }

            println!(
                "{:<40} {:<8} {:<8} {:<5} {:<5} {:<8} {:<19}",
                "NAME", "STATE", "UNDO", "HOLD", "STOP", "PID", "STARTED"
            );
            for row in rows {
                println!(
                    "{:<40} {:<8} {:<8} {:<5} {:<5} {:<8} {:<19}",
                    row.name,
                    row.state,
                    row.undo_state.as_deref().unwrap_or("-"),
                    if row.offline { "yes" } else { "-" },
                    if row.stop_after { "yes" } else { "-" },
                    row.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
                    fmt_time(row.started_at),
                );
            }
        }

        Commands::Params { workflow, step } => {
            let pool = connect().await?;
            let id = workflow_id(&pool, &workflow).await?;
            let row = queries::step::get_step_by_name(&pool, id, &step)
                .await?
                .with_context(|| format!("step '{}' not found in workflow '{}'", step, workflow))?;

            let params = queries::step::get_params_for_step(&pool, row.id).await?;
            if params.is_empty() {
                println!("(no parameters)");
            }
            for p in params {
                println!("{}={}", p.name, p.value);
            }
        }

        Commands::Retry { workflow, step } => {
            let pool = connect().await?;
            let id = workflow_id(&pool, &workflow).await?;
            if queries::step::retry_step(&pool, id, &step).await? {
                println!("Step '{}' reset to READY", step);
            } else {
                bail!("step '{}' is not FAILED (or does not exist)", step);
            }
        }

        Commands::Offline {
            workflow,
            step,
            clear,
        } => {
            let pool = connect().await?;
            let id = workflow_id(&pool, &workflow).await?;
            ensure_step(&pool, id, &workflow, &step).await?;
            let value = !clear;
            if queries::step::set_offline(&pool, id, &step, value).await? {
                println!(
                    "Step '{}' {}",
                    step,
                    if value { "held offline" } else { "released" }
                );
            } else {
                println!(
                    "Step '{}' was already {}",
                    step,
                    if value { "offline" } else { "online" }
                );
            }
        }

        Commands::StopAfter {
            workflow,
            step,
            clear,
        } => {
            let pool = connect().await?;
            let id = workflow_id(&pool, &workflow).await?;
            ensure_step(&pool, id, &workflow, &step).await?;
            let value = !clear;
            if queries::step::set_stop_after(&pool, id, &step, value).await? {
                println!(
                    "Breakpoint after '{}' {}",
                    step,
                    if value { "set" } else { "cleared" }
                );
            } else {
                println!(
                    "Breakpoint after '{}' was already {}",
                    step,
                    if value { "set" } else { "clear" }
                );
            }
        }

        Commands::Undo { workflow, step } => {
            let pool = connect().await?;
            let id = workflow_id(&pool, &workflow).await?;
            let row = queries::step::get_step_by_name(&pool, id, &step)
                .await?
                .with_context(|| format!("step '{}' not found in workflow '{}'", step, workflow))?;
            if row.state != "DONE" {
                bail!(
                    "step '{}' is {}, not DONE; only completed work can be undone",
                    step,
                    row.state
                );
            }
            queries::workflow::set_undo_step(&pool, id, Some(&step)).await?;
            println!(
                "Undo pass rooted at '{}' recorded; it runs on the next controller start",
                step
            );
        }

        Commands::Kill { workflow } => {
            let app_config = AppConfig::from_env()?;
            let home = app_config.workflow_home(&workflow);
            if !home.exists() {
                bail!(
                    "workflow home '{}' does not exist; is GANTRY_HOME set correctly?",
                    home.display()
                );
            }
            std::fs::write(home.join(KILL_MARKER), "")?;
            println!("Kill marker placed; the controller exits after its current cycle");
        }
    }

    Ok(())
}
