//! The controller loop: claim, observe, promote, admit, launch.
//!
//! One controller process owns one workflow instance at a time. Every cycle
//! it re-reads the persisted step rows, logs and acknowledges transitions
//! written by workers and operators, fails steps whose worker process
//! vanished, promotes READY steps whose parents are done, launches admitted
//! ON_DECK steps, and exits once every operative step is DONE. All store
//! writes are conditional, so a lost race is a silent no-op re-read next
//! cycle.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{AppConfig, ThrottleConfig};
use crate::db::{queries, DbPool};
use crate::error::{AppError, AppResult};
use crate::graph::undo::derive_undo_graph;
use crate::graph::{Graph, Observed, Step, StepId, StepState, WorkflowState};
use crate::run::admission::{admit, failed_counts, parents_satisfied, running_counts};
use crate::run::launcher::{
    build_invocation, clear_kill_marker, kill_marker_present, process_alive, spawn_detached,
    LaunchTracker, RunMode,
};
use crate::sync::{load_snapshot, reconcile};

/// What one reconciliation cycle concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleOutcome {
    /// Work remains; sleep and go again.
    Continue,
    /// Every operative step is DONE.
    WorkflowDone,
    /// Every step in the undo scope has been undone.
    UndoComplete,
}

/// Start-time options for one controller run.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// How launched workers are told to run.
    pub mode: RunMode,
    /// Run a single cycle and exit.
    pub once: bool,
    /// Take the claim even if the workflow was last controlled from
    /// another host.
    pub host_override: bool,
    /// Run an undo pass rooted at this step instead of forward work.
    pub undo_root: Option<String>,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            mode: RunMode::Run,
            once: false,
            host_override: false,
            undo_root: None,
        }
    }
}

/// A claimed, reconciled workflow instance being driven to completion.
pub struct Controller {
    pool: DbPool,
    config: AppConfig,
    throttle: ThrottleConfig,
    options: ControllerOptions,
    graph: Graph,
    /// Inverted scope graph while an undo pass is active.
    undo: Option<Graph>,
    undo_root: Option<String>,
    workflow_id: i64,
    home: PathBuf,
    tracker: LaunchTracker,
}

impl Controller {
    /// Claim the workflow for this process, reconcile the compiled graph
    /// against the store, and arm an undo pass if one is requested or was
    /// left unfinished.
    pub async fn start(
        pool: DbPool,
        config: AppConfig,
        throttle: ThrottleConfig,
        mut graph: Graph,
        options: ControllerOptions,
    ) -> AppResult<Self> {
        let host = hostname::get()?.to_string_lossy().into_owned();
        let pid = std::process::id() as i32;

        let existing = queries::workflow::get_workflow_by_name(&pool, &graph.name).await?;
        let (workflow_id, recorded_undo) = match existing {
            Some(row) => {
                if let Some(other_host) = row.host.as_deref() {
                    if other_host != host && !options.host_override {
                        return Err(AppError::Controller(format!(
                            "workflow '{}' was last controlled from host '{}'; \
                             start with --host-override once that controller is confirmed dead",
                            graph.name, other_host
                        )));
                    }
                    if other_host == host {
                        if let Some(other_pid) = row.pid {
                            if other_pid != pid && process_alive(other_pid) {
                                return Err(AppError::Controller(format!(
                                    "workflow '{}' is already controlled by pid {} on this host",
                                    graph.name, other_pid
                                )));
                            }
                        }
                    }
                }
                if !queries::workflow::claim_workflow(&pool, row.id, &host, pid, row.pid).await? {
                    return Err(AppError::Controller(format!(
                        "lost the controller claim for workflow '{}' to a concurrent start",
                        graph.name
                    )));
                }
                tracing::info!(workflow = %graph.name, id = row.id, "Workflow claimed");
                (row.id, row.undo_step.clone())
            }
            None => {
                let id = queries::workflow::insert_workflow(
                    &pool,
                    &graph.name,
                    &graph.version,
                    &host,
                    pid,
                )
                .await?;
                tracing::info!(workflow = %graph.name, id, "Workflow registered");
                (id, None)
            }
        };

        let home = config.workflow_home(&graph.name);
        std::fs::create_dir_all(&home)?;
        if kill_marker_present(&home) {
            tracing::warn!(home = %home.display(), "Removing stale kill marker");
            clear_kill_marker(&home)?;
        }

        reconcile(&pool, workflow_id, &mut graph, &home).await?;

        // A CLI-requested undo wins; otherwise resume one the store still
        // records from an interrupted run.
        let undo_root = options.undo_root.clone().or(recorded_undo);
        let undo = match &undo_root {
            Some(root) => {
                let rows = queries::step::fetch_steps(&pool, workflow_id).await?;
                load_snapshot(&mut graph, &rows)?;

                let scope = derive_undo_graph(&graph, root)?;
                let names: Vec<String> = scope.steps().map(|s| s.name.clone()).collect();
                let marked = queries::step::mark_undo_ready(&pool, workflow_id, &names).await?;
                queries::workflow::set_undo_step(&pool, workflow_id, Some(root)).await?;
                tracing::info!(root = %root, scope = names.len(), marked, "Undo pass armed");
                Some(scope)
            }
            None => None,
        };

        Ok(Self {
            pool,
            config,
            throttle,
            options,
            graph,
            undo,
            undo_root,
            workflow_id,
            home,
            tracker: LaunchTracker::new(),
        })
    }

    /// Drive the workflow until it finishes, the shutdown future resolves,
    /// the kill marker appears, or (with `once`) a single cycle has run.
    /// The claim is released on every exit path.
    pub async fn run<S>(&mut self, shutdown: S) -> AppResult<()>
    where
        S: Future<Output = ()>,
    {
        let outcome = self.drive(shutdown).await;
        if let Err(err) = queries::workflow::release_workflow(&self.pool, self.workflow_id).await {
            tracing::error!(error = %err, "Failed to release the workflow claim");
        }
        outcome
    }

    async fn drive<S>(&mut self, shutdown: S) -> AppResult<()>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            match self.cycle().await? {
                CycleOutcome::Continue => {}
                CycleOutcome::WorkflowDone => {
                    queries::workflow::set_workflow_state(
                        &self.pool,
                        self.workflow_id,
                        WorkflowState::Done.as_str(),
                    )
                    .await?;
                    tracing::info!(workflow = %self.graph.name, "Workflow complete");
                    return Ok(());
                }
                CycleOutcome::UndoComplete => {
                    let names: Vec<String> = match &self.undo {
                        Some(scope) => scope.steps().map(|s| s.name.clone()).collect(),
                        None => Vec::new(),
                    };
                    let reset =
                        queries::step::reset_undone_steps(&self.pool, self.workflow_id, &names)
                            .await?;
                    queries::workflow::set_undo_step(&self.pool, self.workflow_id, None).await?;
                    tracing::info!(
                        root = self.undo_root.as_deref().unwrap_or_default(),
                        reset,
                        "Undo complete; scope reset to READY"
                    );
                    return Ok(());
                }
            }

            if self.options.once {
                tracing::info!("Single cycle requested; exiting");
                return Ok(());
            }
            if kill_marker_present(&self.home) {
                clear_kill_marker(&self.home)?;
                tracing::warn!("Kill marker found; exiting");
                return Ok(());
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(self.config.poll_interval)) => {}
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested; exiting");
                    return Ok(());
                }
            }
        }
    }

    /// One reconciliation cycle against a fresh snapshot.
    async fn cycle(&mut self) -> AppResult<CycleOutcome> {
        let Self {
            pool,
            config,
            throttle,
            options,
            graph,
            undo,
            workflow_id,
            tracker,
            ..
        } = self;
        let workflow_id = *workflow_id;
        let undo_active = undo.is_some();
        let g: &mut Graph = match undo.as_mut() {
            Some(scope) => scope,
            None => graph,
        };

        let rows = queries::step::fetch_steps(pool, workflow_id).await?;
        load_snapshot(g, &rows)?;

        // Acknowledge transitions written by workers and operators since the
        // last cycle. The handled mark is guarded on everything observed, so
        // a concurrent write leaves the row unhandled for the next cycle.
        for id in 0..g.len() {
            let (db_id, name, current, op, was_handled, skipped) = {
                let s = g.step(id);
                let db_id = match s.db_id {
                    Some(v) => v,
                    None => continue,
                };
                let current = Observed {
                    state: s.state,
                    undo_state: s.undo_state,
                    offline: s.offline,
                    stop_after: s.stop_after,
                };
                (
                    db_id,
                    s.name.clone(),
                    current,
                    s.operative_state(undo_active),
                    s.operative_handled(undo_active),
                    s.skipped,
                )
            };

            if !was_handled {
                let from = g
                    .step(id)
                    .observed
                    .map(|prev| operative_of(prev, undo_active).to_string())
                    .unwrap_or_else(|| "-".to_string());
                if op == StepState::Failed {
                    tracing::error!(
                        step = %name,
                        from = %from,
                        "Step FAILED; inspect its errlog in the workflow home"
                    );
                } else {
                    tracing::info!(
                        step = %name,
                        from = %from,
                        to = %op,
                        offline = current.offline,
                        stop_after = current.stop_after,
                        skipped,
                        "Step change observed"
                    );
                }
                if !queries::step::mark_handled(
                    pool,
                    db_id,
                    op.as_str(),
                    current.offline,
                    current.stop_after,
                    undo_active,
                )
                .await?
                {
                    tracing::debug!(step = %name, "Handled mark skipped; row moved again");
                }
            }

            if op != StepState::OnDeck {
                tracker.settle(&name);
            }
            g.step_mut(id).observed = Some(current);
        }

        // Fail steps whose recorded worker process is gone. Only probed once
        // the RUNNING transition has been acknowledged, and the write is
        // guarded on the snapshot pid, so a step that finished in between is
        // left alone.
        for id in 0..g.len() {
            let (db_id, name, pid) = {
                let s = g.step(id);
                if s.operative_state(undo_active) != StepState::Running
                    || !s.operative_handled(undo_active)
                {
                    continue;
                }
                let db_id = match s.db_id {
                    Some(v) => v,
                    None => continue,
                };
                (db_id, s.name.clone(), s.pid)
            };
            if pid.map(process_alive).unwrap_or(false) {
                continue;
            }
            if queries::step::mark_failed_if_running(pool, db_id, pid, undo_active).await? {
                tracing::error!(
                    step = %name,
                    pid = ?pid,
                    "Worker process vanished; step marked FAILED"
                );
                note_transition(g.step_mut(id), StepState::Failed, undo_active);
            }
        }

        // Promote READY steps whose parents are all done. Structural steps
        // have no worker and complete on the spot.
        let order = order_by_dfs(g);
        for &id in &order {
            let (db_id, name, structural) = {
                let s = g.step(id);
                if s.operative_state(undo_active) != StepState::Ready {
                    continue;
                }
                if s.offline {
                    tracing::debug!(step = %s.name, "Offline hold");
                    continue;
                }
                let db_id = match s.db_id {
                    Some(v) => v,
                    None => continue,
                };
                (db_id, s.name.clone(), s.is_structural())
            };
            if !parents_satisfied(g, id, undo_active) {
                continue;
            }
            if !queries::step::mark_on_deck(pool, db_id, undo_active).await? {
                continue;
            }
            note_transition(g.step_mut(id), StepState::OnDeck, undo_active);
            tracing::info!(step = %name, "On deck");

            if structural && queries::step::mark_structural_done(pool, db_id, undo_active).await? {
                note_transition(g.step_mut(id), StepState::Done, undo_active);
                tracing::info!(step = %name, "Structural step complete");
            }
        }

        // Launch admitted ON_DECK steps. Counts start from the snapshot and
        // are bumped per launch so one pass cannot overshoot a limit.
        let mut running = running_counts(g, undo_active);
        let failed = failed_counts(g, undo_active);
        for &id in &order {
            let s = g.step(id);
            if s.operative_state(undo_active) != StepState::OnDeck || s.is_structural() {
                continue;
            }
            if s.offline || tracker.in_flight(&s.name) {
                continue;
            }
            if let Err(held) = admit(s, throttle, &running, &failed) {
                tracing::debug!(step = %s.name, reason = %held, "Launch held");
                continue;
            }
            let db_id = match s.db_id {
                Some(v) => v,
                None => continue,
            };
            let invocation =
                build_invocation(config, &g.name, workflow_id, s, db_id, options.mode, undo_active);
            match spawn_detached(&invocation) {
                Ok(child) => {
                    tracing::info!(
                        step = %s.name,
                        shim = ?child.id(),
                        errlog = %invocation.errlog.display(),
                        "Worker launched"
                    );
                    tracker.launch(&s.name, child);
                    running.record(s);
                }
                Err(err) => {
                    tracing::error!(step = %s.name, error = %err, "Worker launch failed");
                }
            }
        }

        tracker.reap();

        if all_finished(g, undo_active) {
            return Ok(if undo_active {
                CycleOutcome::UndoComplete
            } else {
                CycleOutcome::WorkflowDone
            });
        }
        Ok(CycleOutcome::Continue)
    }
}

/// The operative side of an observed snapshot.
fn operative_of(observed: Observed, undo: bool) -> StepState {
    if undo {
        observed.undo_state.unwrap_or(StepState::Done)
    } else {
        observed.state
    }
}

/// Record a controller-initiated transition in memory so later phases of
/// the same cycle see it. Matches what the conditional write persisted.
fn note_transition(step: &mut Step, state: StepState, undo: bool) {
    if undo {
        step.undo_state = Some(state);
        step.undo_handled = true;
    } else {
        step.state = state;
        step.handled = true;
    }
}

/// Step ids in depth-first order, the order work is considered each cycle.
fn order_by_dfs(graph: &Graph) -> Vec<StepId> {
    let mut order: Vec<StepId> = (0..graph.len()).collect();
    order.sort_by_key(|&id| graph.step(id).dfs_order);
    order
}

/// Whether every operative step is DONE.
fn all_finished(graph: &Graph, undo: bool) -> bool {
    graph.steps().all(|s| s.operative_state(undo) == StepState::Done)
}
