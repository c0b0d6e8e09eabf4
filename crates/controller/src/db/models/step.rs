//! Step and step-parameter row models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::graph::StepState;

/// Represents one persisted step row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StepRow {
    /// Internal row id
    pub id: i64,
    /// Owning workflow instance
    pub workflow_id: i64,
    /// Full hierarchical step name
    pub name: String,
    /// Step class reference; NULL for structural call/return steps
    pub invoker: Option<String>,
    /// Forward execution state
    pub state: String,
    /// Undo execution state; NULL outside an undo scope
    pub undo_state: Option<String>,
    /// Whether the controller has observed the current forward state
    pub handled: bool,
    /// Whether the controller has observed the current undo state
    pub undo_handled: bool,
    /// Operator hold: step may be queued but never launched
    pub offline: bool,
    /// Operator breakpoint: children are not promoted past this step
    pub stop_after: bool,
    /// Step finished via its skip predicate rather than real work
    pub skipped: bool,
    /// Worker process id recorded at launch
    pub pid: Option<i32>,
    /// Sorted parent names, comma joined
    pub depends: String,
    /// Digest of the sorted parent names
    pub depends_digest: String,
    /// Digest of the parameter set
    pub params_digest: String,
    /// Depth-first display/processing order
    pub dfs_order: i32,
    /// When the worker started
    pub started_at: Option<DateTime<Utc>>,
    /// When the worker finished
    pub ended_at: Option<DateTime<Utc>>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl StepRow {
    /// Forward state decoded to the state enum.
    pub fn step_state(&self) -> StepState {
        StepState::from(self.state.as_str())
    }

    /// Undo state decoded to the state enum, if set.
    pub fn undo_step_state(&self) -> Option<StepState> {
        self.undo_state.as_deref().map(StepState::from)
    }
}

/// Represents one persisted (step, parameter) pair.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StepParamRow {
    /// Internal row id
    pub id: i64,
    /// Owning step row
    pub step_id: i64,
    /// Parameter name
    pub name: String,
    /// Parameter value
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_decoding() {
        let row = StepRow {
            id: 1,
            workflow_id: 1,
            name: "extract".to_string(),
            invoker: Some("extractor".to_string()),
            state: "ON_DECK".to_string(),
            undo_state: Some("READY".to_string()),
            handled: true,
            undo_handled: false,
            offline: false,
            stop_after: false,
            skipped: false,
            pid: None,
            depends: String::new(),
            depends_digest: String::new(),
            params_digest: String::new(),
            dfs_order: 0,
            started_at: None,
            ended_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        assert_eq!(row.step_state(), StepState::OnDeck);
        assert_eq!(row.undo_step_state(), Some(StepState::Ready));
    }
}
