//! Step records and the persistent state machine.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Arena index of a step within its graph.
pub type StepId = usize;

/// Persistent step states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepState {
    /// Parents not all done yet.
    Ready,
    /// Parents done, awaiting a free execution slot.
    OnDeck,
    /// Worker is executing.
    Running,
    /// Finished successfully.
    Done,
    /// Needs operator attention.
    Failed,
}

impl StepState {
    /// Persisted text form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::OnDeck => "ON_DECK",
            Self::Running => "RUNNING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<&str> for StepState {
    fn from(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "READY" => Self::Ready,
            "ON_DECK" | "ONDECK" => Self::OnDeck,
            "RUNNING" => Self::Running,
            "DONE" => Self::Done,
            // Unknown text parks the step for operator attention instead of
            // re-running work.
            _ => Self::Failed,
        }
    }
}

/// Workflow instance states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    Running,
    Done,
}

impl WorkflowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Done => "DONE",
        }
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<&str> for WorkflowState {
    fn from(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "DONE" => Self::Done,
            _ => Self::Running,
        }
    }
}

/// Runtime columns last observed in a persisted snapshot.
///
/// Kept separately from the current values so the controller can detect
/// state/flag changes between cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observed {
    pub state: StepState,
    pub undo_state: Option<StepState>,
    pub offline: bool,
    pub stop_after: bool,
}

/// One node of the execution graph.
///
/// Structural fields are fixed once compilation finishes; runtime fields are
/// refreshed from the persisted store every reconciliation cycle.
#[derive(Debug, Clone)]
pub struct Step {
    /// Arena index.
    pub id: StepId,

    /// Dot-separated ancestry of call-site names ("" at the root level).
    pub path: String,

    /// Base name within the declaring level.
    pub base: String,

    /// Full name: path-qualified base, unique across the graph.
    pub name: String,

    /// Parent edges (arena indices).
    pub parents: Vec<StepId>,

    /// Child edges (arena indices).
    pub children: Vec<StepId>,

    /// Resolved parameters, sorted by name.
    pub params: BTreeMap<String, String>,

    /// Invoker: worker program class. None for structural steps.
    pub invoker: Option<String>,

    /// Load tags for admission throttling.
    pub load_tags: Vec<String>,

    /// Fail tags for admission throttling.
    pub fail_tags: Vec<String>,

    /// Sub-graph call bracket flags.
    pub is_call: bool,
    pub is_return: bool,

    /// Step lives inside the designated global sub-graph.
    pub is_global: bool,

    /// For call steps: the synthesized return step.
    pub return_id: Option<StepId>,

    /// Export name for external dependencies.
    pub export: Option<String>,

    /// Compile-time exclusion mark; excluded steps are pruned before the
    /// graph is finalized.
    pub excluded: bool,

    /// Skip marker path handed to the worker.
    pub skip_if: Option<String>,

    /// Sorted parent full names, fixed at finalize.
    pub depends: Vec<String>,

    /// Depth-first preorder index, assigned at finalize.
    pub dfs_order: i32,

    // Runtime snapshot fields, refreshed from the persisted store.
    pub db_id: Option<i64>,
    pub state: StepState,
    pub undo_state: Option<StepState>,
    pub handled: bool,
    pub undo_handled: bool,
    pub offline: bool,
    pub stop_after: bool,
    pub skipped: bool,
    pub pid: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,

    /// Values from the previous snapshot, for change detection.
    pub observed: Option<Observed>,
}

impl Step {
    /// Create a fresh step with no edges and READY runtime state.
    pub fn new(id: StepId, path: &str, base: &str) -> Self {
        let name = full_name(path, base);
        Self {
            id,
            path: path.to_string(),
            base: base.to_string(),
            name,
            parents: Vec::new(),
            children: Vec::new(),
            params: BTreeMap::new(),
            invoker: None,
            load_tags: Vec::new(),
            fail_tags: Vec::new(),
            is_call: false,
            is_return: false,
            is_global: false,
            return_id: None,
            export: None,
            excluded: false,
            skip_if: None,
            depends: Vec::new(),
            dfs_order: -1,
            db_id: None,
            state: StepState::Ready,
            undo_state: None,
            handled: false,
            undo_handled: false,
            offline: false,
            stop_after: false,
            skipped: false,
            pid: None,
            started_at: None,
            ended_at: None,
            observed: None,
        }
    }

    /// Structural steps have no invoker and are fast-pathed to DONE.
    pub fn is_structural(&self) -> bool {
        self.invoker.is_none()
    }

    /// The state driving scheduling decisions: undo variant while an undo is
    /// active, normal variant otherwise. A row outside the undo scope has a
    /// NULL undo state and never blocks the undo pass.
    pub fn operative_state(&self, undo_active: bool) -> StepState {
        if undo_active {
            self.undo_state.unwrap_or(StepState::Done)
        } else {
            self.state
        }
    }

    /// Handled flag for the operative side.
    pub fn operative_handled(&self, undo_active: bool) -> bool {
        if undo_active {
            self.undo_handled
        } else {
            self.handled
        }
    }

    /// Digest over the resolved parameter map.
    pub fn params_digest(&self) -> String {
        let mut hasher = Sha256::new();
        for (k, v) in &self.params {
            hasher.update(k.as_bytes());
            hasher.update(b"=");
            hasher.update(v.as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }

    /// Digest over the sorted parent full-name set.
    pub fn depends_digest(&self) -> String {
        let mut hasher = Sha256::new();
        for name in &self.depends {
            hasher.update(name.as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }

    /// Persisted text form of the parent set.
    pub fn depends_text(&self) -> String {
        self.depends.join(",")
    }
}

/// Join a path and a base name into a full step name.
pub fn full_name(path: &str, base: &str) -> String {
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}.{}", path, base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrip() {
        for state in [
            StepState::Ready,
            StepState::OnDeck,
            StepState::Running,
            StepState::Done,
            StepState::Failed,
        ] {
            assert_eq!(StepState::from(state.as_str()), state);
        }
    }

    #[test]
    fn test_unknown_state_parks_failed() {
        assert_eq!(StepState::from("GARBAGE"), StepState::Failed);
    }

    #[test]
    fn test_full_name() {
        assert_eq!(full_name("", "extract"), "extract");
        assert_eq!(full_name("ingest", "extract"), "ingest.extract");
        assert_eq!(full_name("a.b", "c"), "a.b.c");
    }

    #[test]
    fn test_params_digest_stable() {
        let mut a = Step::new(0, "", "x");
        a.params.insert("beta".into(), "2".into());
        a.params.insert("alpha".into(), "1".into());

        let mut b = Step::new(1, "", "x");
        b.params.insert("alpha".into(), "1".into());
        b.params.insert("beta".into(), "2".into());

        assert_eq!(a.params_digest(), b.params_digest());
    }

    #[test]
    fn test_params_digest_changes_with_value() {
        let mut a = Step::new(0, "", "x");
        a.params.insert("alpha".into(), "1".into());
        let d1 = a.params_digest();
        a.params.insert("alpha".into(), "2".into());
        assert_ne!(d1, a.params_digest());
    }

    #[test]
    fn test_operative_state() {
        let mut step = Step::new(0, "", "x");
        step.state = StepState::Running;
        assert_eq!(step.operative_state(false), StepState::Running);
        assert_eq!(step.operative_state(true), StepState::Done);

        step.undo_state = Some(StepState::Ready);
        assert_eq!(step.operative_state(true), StepState::Ready);
    }

    #[test]
    fn test_structural() {
        let mut step = Step::new(0, "", "x");
        assert!(step.is_structural());
        step.invoker = Some("extractor".into());
        assert!(!step.is_structural());
    }
}
