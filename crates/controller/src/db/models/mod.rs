//! Database models for the Gantry controller.
//!
//! This module contains SQLx-compatible model definitions
//! for all persisted-store tables.

pub mod step;
pub mod workflow;

pub use step::*;
pub use workflow::*;
