//! Application configuration for the Gantry controller.

use serde::Deserialize;

/// Controller configuration loaded from environment variables.
///
/// Environment variables are prefixed with `GANTRY_`:
/// - `GANTRY_HOME`: Base directory for workflow home directories (default: "./gantry")
/// - `GANTRY_POLL_INTERVAL`: Seconds between reconciliation cycles (default: 10)
/// - `GANTRY_WORKER_COMMAND`: Worker program launched for each step (default: "gantry-worker")
/// - `GANTRY_THROTTLE_FILE`: Path to the throttle limits YAML (optional)
/// - `GANTRY_MACROS_FILE`: Path to the shared macro properties YAML (optional)
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Base directory under which each workflow instance gets a home directory
    #[serde(default = "default_home")]
    pub home: String,

    /// Seconds between reconciliation cycles
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,

    /// Worker program invoked for each launched step
    #[serde(default = "default_worker_command")]
    pub worker_command: String,

    /// Path to the throttle limits YAML file
    #[serde(default)]
    pub throttle_file: Option<String>,

    /// Path to the shared macro properties YAML file
    #[serde(default)]
    pub macros_file: Option<String>,
}

fn default_home() -> String {
    "./gantry".to_string()
}

fn default_poll_interval() -> u64 {
    10
}

fn default_worker_command() -> String {
    "gantry-worker".to_string()
}

impl AppConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables are prefixed with `GANTRY_`.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("GANTRY_").from_env::<AppConfig>()
    }

    /// Home directory of one workflow instance.
    pub fn workflow_home(&self, workflow_name: &str) -> std::path::PathBuf {
        std::path::Path::new(&self.home).join(workflow_name)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            home: default_home(),
            poll_interval: default_poll_interval(),
            worker_command: default_worker_command(),
            throttle_file: None,
            macros_file: None,
        }
    }
}
