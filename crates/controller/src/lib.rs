//! Gantry Controller Library
//!
//! This crate provides the Gantry workflow controller, handling:
//!
//! - **Graph Compilation**: Expand declaration trees into flat execution graphs
//! - **State Synchronization**: Reconcile compiled graphs against persisted rows
//! - **Admission Control**: Throttle launches by load and fail tags
//! - **Worker Launching**: Start detached workers and track their liveness
//! - **Undo Passes**: Unwind completed work through inverted scope graphs
//!
//! ## Architecture
//!
//! All workflow state lives in PostgreSQL. The controller polls it, makes
//! every write conditional on what it last observed, and treats a lost race
//! as a no-op to re-read next cycle. Workers run as detached processes and
//! report back through the same tables, so controller and workers never talk
//! directly.
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading from environment variables
//! - [`db`]: Database connectivity, schema, models, and queries
//! - [`declare`]: Declaration file loading and validation
//! - [`error`]: Custom error types
//! - [`graph`]: Execution graph, compiler, ordering, undo derivation
//! - [`run`]: The controller loop, admission throttles, worker launching
//! - [`sync`]: Structural diffing and snapshot loading
//! - [`template`]: Predicate evaluation for conditional steps
//!
//! ## Example
//!
//! ```ignore
//! use std::collections::HashMap;
//!
//! use gantry_controller::{
//!     config::{AppConfig, DatabaseConfig, ThrottleConfig},
//!     db::create_pool,
//!     declare::DeclLoader,
//!     graph::Compiler,
//!     run::{Controller, ControllerOptions},
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let app_config = AppConfig::from_env()?;
//!     let db_config = DatabaseConfig::from_env()?;
//!     let pool = create_pool(&db_config).await?;
//!
//!     let loader = DeclLoader::new("decls");
//!     let graph = Compiler::new(&loader, HashMap::new())?
//!         .compile("etl-nightly.yaml", &HashMap::new())?;
//!
//!     let mut controller = Controller::start(
//!         pool,
//!         app_config,
//!         ThrottleConfig::default(),
//!         graph,
//!         ControllerOptions::default(),
//!     )
//!     .await?;
//!     controller.run(std::future::pending()).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod db;
pub mod declare;
pub mod error;
pub mod graph;
pub mod run;
pub mod sync;
pub mod template;

pub use error::{AppError, AppResult};
