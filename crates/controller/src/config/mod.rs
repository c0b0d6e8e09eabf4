//! Configuration module for the Gantry controller.
//!
//! This module provides configuration loading from environment variables
//! using the `envy` crate for type-safe environment variable parsing, plus
//! the YAML-backed throttle limit configuration.

mod app;
mod database;
mod throttle;

pub use app::AppConfig;
pub use database::DatabaseConfig;
pub use throttle::ThrottleConfig;
