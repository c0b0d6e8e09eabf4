//! Workflow instance model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Represents one workflow instance row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowRow {
    /// Internal row id
    pub id: i64,
    /// Workflow name (unique)
    pub name: String,
    /// Declared graph version
    pub version: String,
    /// Workflow state (RUNNING or DONE)
    pub state: String,
    /// Host the controller last ran on
    pub host: Option<String>,
    /// Controller process id on that host
    pub pid: Option<i32>,
    /// Root step of the active undo scope, if an undo was requested
    pub undo_step: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRow {
    /// The recorded controller claim, when both host and pid are set.
    pub fn claimed_by(&self) -> Option<(&str, i32)> {
        match (self.host.as_deref(), self.pid) {
            (Some(host), Some(pid)) => Some((host, pid)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> WorkflowRow {
        WorkflowRow {
            id: 1,
            name: "etl-nightly".to_string(),
            version: "1".to_string(),
            state: "RUNNING".to_string(),
            host: None,
            pid: None,
            undo_step: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_unclaimed_row() {
        assert!(row().claimed_by().is_none());
    }

    #[test]
    fn test_claimed_row() {
        let mut r = row();
        r.host = Some("etl-host-1".to_string());
        r.pid = Some(4242);
        assert_eq!(r.claimed_by(), Some(("etl-host-1", 4242)));
    }
}
