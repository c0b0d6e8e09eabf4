//! Database queries for the Gantry controller.
//!
//! This module contains database query functions organized by domain.
//! Mutations are conditional: each WHERE clause re-checks the value the
//! caller last observed, so a lost race is a silent no-op rather than an
//! overwrite.

pub mod step;
pub mod workflow;
