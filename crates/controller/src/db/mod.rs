//! Database module for the Gantry controller.
//!
//! This module provides database connectivity, models, and queries
//! for PostgreSQL using SQLx. The persisted store is the single source
//! of truth for workflow and step state; everything in memory is a
//! snapshot of it.

pub mod models;
pub mod pool;
pub mod queries;
pub mod schema;

pub use pool::{create_pool, health_check, DbPool};
