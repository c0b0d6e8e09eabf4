//! Structural diff between a compiled graph and its persisted rows.
//!
//! The diff is pure: it reads the graph and the already-fetched rows and
//! produces findings without touching the store. Every mismatch is a diff
//! worth logging; a diff against a step that has committed to running
//! (RUNNING, FAILED, or DONE) is additionally illegal and must abort
//! initialization.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use crate::db::models::StepRow;
use crate::graph::{Graph, StepState};

/// One kind of difference between declaration and store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffKind {
    /// Step class changed.
    InvokerChanged { old: String, new: String },
    /// Sorted parent set changed.
    ParentsChanged { old: String, new: String },
    /// Parameter present in memory but not recorded.
    ParamAdded { name: String, value: String },
    /// Recorded parameter no longer declared.
    ParamRemoved { name: String, value: String },
    /// Recorded parameter value differs from the declaration.
    ParamChanged { name: String, old: String, new: String },
    /// Persisted step no longer exists in the compiled graph.
    StepRemoved,
    /// Compiled step has no persisted row yet.
    StepAdded,
    /// Depth-first order shifted; benign, columns are refreshed in place.
    OrderChanged { old: i32, new: i32 },
}

impl fmt::Display for DiffKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiffKind::InvokerChanged { old, new } => {
                write!(f, "invoker changed: '{}' -> '{}'", old, new)
            }
            DiffKind::ParentsChanged { old, new } => {
                write!(f, "parents changed: '{}' -> '{}'", old, new)
            }
            DiffKind::ParamAdded { name, value } => {
                write!(f, "parameter '{}' added with value '{}'", name, value)
            }
            DiffKind::ParamRemoved { name, value } => {
                write!(f, "parameter '{}' removed (was '{}')", name, value)
            }
            DiffKind::ParamChanged { name, old, new } => {
                write!(f, "parameter '{}' changed: '{}' -> '{}'", name, old, new)
            }
            DiffKind::StepRemoved => write!(f, "step removed from declaration"),
            DiffKind::StepAdded => write!(f, "step added by declaration"),
            DiffKind::OrderChanged { old, new } => {
                write!(f, "depth-first order changed: {} -> {}", old, new)
            }
        }
    }
}

/// One finding against one step.
#[derive(Debug, Clone)]
pub struct StepDiff {
    /// Full step name.
    pub name: String,
    /// Persisted state at diff time (READY for steps not yet persisted).
    pub state: StepState,
    /// What changed.
    pub kind: DiffKind,
    /// Whether this change aborts initialization.
    pub illegal: bool,
}

impl fmt::Display for StepDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = if self.illegal { "ILLEGAL" } else { "diff" };
        write!(f, "{} step '{}' [{}]: {}", tag, self.name, self.state, self.kind)
    }
}

/// Outcome of one graph-versus-store comparison.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub diffs: Vec<StepDiff>,
}

impl SyncReport {
    fn push(&mut self, name: &str, state: StepState, kind: DiffKind, illegal: bool) {
        self.diffs.push(StepDiff {
            name: name.to_string(),
            state,
            kind,
            illegal,
        });
    }

    /// No differences at all.
    pub fn is_clean(&self) -> bool {
        self.diffs.is_empty()
    }

    /// At least one finding aborts initialization.
    pub fn has_illegal(&self) -> bool {
        self.diffs.iter().any(|d| d.illegal)
    }

    /// The illegal findings.
    pub fn illegal(&self) -> Vec<&StepDiff> {
        self.diffs.iter().filter(|d| d.illegal).collect()
    }

    /// Whether the graph shape itself changed, superseding not-yet-started
    /// rows. Pure order shifts are handled by column refresh instead.
    pub fn structural_change(&self) -> bool {
        self.diffs
            .iter()
            .any(|d| !matches!(d.kind, DiffKind::OrderChanged { .. }))
    }
}

/// Compare the compiled graph against the persisted step rows.
///
/// `params` holds the recorded parameter rows keyed by step row id.
pub fn diff_rows(
    graph: &Graph,
    rows: &[StepRow],
    params: &HashMap<i64, BTreeMap<String, String>>,
) -> SyncReport {
    let mut report = SyncReport::default();
    let mut persisted: HashSet<&str> = HashSet::new();
    static EMPTY: BTreeMap<String, String> = BTreeMap::new();

    for row in rows {
        persisted.insert(row.name.as_str());
        let state = row.step_state();
        let committed = matches!(
            state,
            StepState::Running | StepState::Failed | StepState::Done
        );

        let step = match graph.step_by_name(&row.name) {
            Some(step) => step,
            None => {
                report.push(&row.name, state, DiffKind::StepRemoved, committed);
                continue;
            }
        };

        if row.invoker.as_deref() != step.invoker.as_deref() {
            report.push(
                &row.name,
                state,
                DiffKind::InvokerChanged {
                    old: row.invoker.clone().unwrap_or_default(),
                    new: step.invoker.clone().unwrap_or_default(),
                },
                committed,
            );
        }

        if row.depends_digest != step.depends_digest() {
            report.push(
                &row.name,
                state,
                DiffKind::ParentsChanged {
                    old: row.depends.clone(),
                    new: step.depends_text(),
                },
                committed,
            );
        }

        if row.params_digest != step.params_digest() {
            let recorded = params.get(&row.id).unwrap_or(&EMPTY);
            for (name, value) in recorded {
                match step.params.get(name) {
                    None => report.push(
                        &row.name,
                        state,
                        DiffKind::ParamRemoved {
                            name: name.clone(),
                            value: value.clone(),
                        },
                        committed,
                    ),
                    Some(current) if current != value => report.push(
                        &row.name,
                        state,
                        DiffKind::ParamChanged {
                            name: name.clone(),
                            old: value.clone(),
                            new: current.clone(),
                        },
                        committed,
                    ),
                    Some(_) => {}
                }
            }
            for (name, value) in &step.params {
                if !recorded.contains_key(name) {
                    report.push(
                        &row.name,
                        state,
                        DiffKind::ParamAdded {
                            name: name.clone(),
                            value: value.clone(),
                        },
                        false,
                    );
                }
            }
        }

        if row.dfs_order != step.dfs_order {
            report.push(
                &row.name,
                state,
                DiffKind::OrderChanged {
                    old: row.dfs_order,
                    new: step.dfs_order,
                },
                false,
            );
        }
    }

    for step in graph.steps() {
        if !persisted.contains(step.name.as_str()) {
            report.push(&step.name, StepState::Ready, DiffKind::StepAdded, false);
        }
    }

    report
}
