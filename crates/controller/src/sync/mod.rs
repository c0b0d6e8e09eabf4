//! Persistence synchronizer.
//!
//! Reconciles the compiled in-memory graph against the authoritative
//! persisted rows: first materialization, structural diffing with the
//! illegal-change rules, superseded-row cleanup, and the per-cycle
//! snapshot load.

pub mod diff;
pub mod report;

pub use diff::{diff_rows, DiffKind, StepDiff, SyncReport};
pub use report::write_report;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::db::models::{StepParamRow, StepRow};
use crate::db::{queries, DbPool};
use crate::error::{AppError, AppResult};
use crate::graph::{Graph, StepState};

/// Group fetched parameter rows by step row id.
pub fn group_params(rows: &[StepParamRow]) -> HashMap<i64, BTreeMap<String, String>> {
    let mut map: HashMap<i64, BTreeMap<String, String>> = HashMap::new();
    for row in rows {
        map.entry(row.step_id)
            .or_default()
            .insert(row.name.clone(), row.value.clone());
    }
    map
}

/// Insert every compiled step on first materialization. All steps start
/// READY; structural steps are advanced by the controller on first
/// encounter.
pub async fn materialize(pool: &DbPool, workflow_id: i64, graph: &mut Graph) -> AppResult<()> {
    for id in 0..graph.len() {
        insert_graph_step(pool, workflow_id, graph, id).await?;
    }

    tracing::info!(steps = graph.len(), "Workflow materialized");
    Ok(())
}

async fn insert_graph_step(
    pool: &DbPool,
    workflow_id: i64,
    graph: &mut Graph,
    id: usize,
) -> AppResult<()> {
    let (name, invoker, depends, depends_digest, params_digest, order, params) = {
        let step = graph.step(id);
        (
            step.name.clone(),
            step.invoker.clone(),
            step.depends_text(),
            step.depends_digest(),
            step.params_digest(),
            step.dfs_order,
            step.params.clone(),
        )
    };

    let row_id = queries::step::insert_step(
        pool,
        workflow_id,
        &name,
        invoker.as_deref(),
        StepState::Ready.as_str(),
        &depends,
        &depends_digest,
        &params_digest,
        order,
    )
    .await?;

    for (param, value) in &params {
        queries::step::insert_step_param(pool, row_id, param, value).await?;
    }

    graph.step_mut(id).db_id = Some(row_id);
    Ok(())
}

/// Reconcile the compiled graph against the persisted rows.
///
/// On first run this materializes the graph. Afterwards it diffs the two,
/// writes a durable report when anything differs, aborts on illegal
/// changes, deletes not-yet-started rows superseded by the new shape, and
/// inserts rows for new steps.
pub async fn reconcile(
    pool: &DbPool,
    workflow_id: i64,
    graph: &mut Graph,
    home: &Path,
) -> AppResult<SyncReport> {
    let rows = queries::step::fetch_steps(pool, workflow_id).await?;
    if rows.is_empty() {
        materialize(pool, workflow_id, graph).await?;
        return Ok(SyncReport::default());
    }

    let param_rows = queries::step::fetch_step_params(pool, workflow_id).await?;
    let params = group_params(&param_rows);
    let report = diff::diff_rows(graph, &rows, &params);

    if !report.is_clean() {
        let path = report::write_report(home, &graph.name, &report)?;
        for finding in &report.diffs {
            if finding.illegal {
                tracing::error!("{}", finding);
            } else {
                tracing::warn!("{}", finding);
            }
        }
        if report.has_illegal() {
            return Err(AppError::Sync(format!(
                "{} illegal declaration change(s); details in {}",
                report.illegal().len(),
                path.display()
            )));
        }
        tracing::warn!(report = %path.display(), "Declaration drift tolerated");
    }

    let mut by_name: HashMap<String, StepRow> =
        rows.into_iter().map(|r| (r.name.clone(), r)).collect();

    if report.structural_change() {
        // Not-yet-started rows are superseded by the new shape and yield
        // their place. A READY row with run records means a worker ran
        // without updating state; deleting it would hide that, so abort
        // with instructions instead.
        let stale: Vec<(i64, String, String)> = by_name
            .values()
            .filter(|row| {
                matches!(row.step_state(), StepState::Ready | StepState::OnDeck)
            })
            .map(|row| (row.id, row.name.clone(), row.state.clone()))
            .collect();

        for (row_id, name, state) in stale {
            let runs = queries::step::count_step_runs(pool, row_id).await?;
            if runs > 0 {
                return Err(AppError::Sync(format!(
                    "step '{}' is {} but has {} run record(s); inspect the worker \
                     logs and clear gantry.step_run for it before syncing a changed \
                     declaration",
                    name, state, runs
                )));
            }
            queries::step::delete_step_if_unstarted(pool, row_id).await?;
            by_name.remove(&name);
        }

        for id in 0..graph.len() {
            if !by_name.contains_key(&graph.step(id).name) {
                insert_graph_step(pool, workflow_id, graph, id).await?;
            }
        }
    }

    // Surviving rows keep their identity; order columns are refreshed in
    // place when new siblings shifted them.
    for id in 0..graph.len() {
        let (name, depends, depends_digest, order) = {
            let step = graph.step(id);
            (
                step.name.clone(),
                step.depends_text(),
                step.depends_digest(),
                step.dfs_order,
            )
        };
        if let Some(row) = by_name.get(&name) {
            graph.step_mut(id).db_id = Some(row.id);
            if row.depends != depends
                || row.depends_digest != depends_digest
                || row.dfs_order != order
            {
                queries::step::update_step_order(pool, row.id, &depends, &depends_digest, order)
                    .await?;
            }
        }
    }

    Ok(report)
}

/// Copy the persisted runtime columns onto the in-memory steps. The
/// previous cycle's values stay in each step's `observed` slot until the
/// controller has logged the change.
pub fn load_snapshot(graph: &mut Graph, rows: &[StepRow]) -> AppResult<()> {
    let by_name: HashMap<&str, &StepRow> = rows.iter().map(|r| (r.name.as_str(), r)).collect();

    for id in 0..graph.len() {
        let step = graph.step_mut(id);
        let row = by_name.get(step.name.as_str()).ok_or_else(|| {
            AppError::Sync(format!("step '{}' has no persisted row", step.name))
        })?;

        step.db_id = Some(row.id);
        step.state = row.step_state();
        step.undo_state = row.undo_step_state();
        step.handled = row.handled;
        step.undo_handled = row.undo_handled;
        step.offline = row.offline;
        step.stop_after = row.stop_after;
        step.skipped = row.skipped;
        step.pid = row.pid;
        step.started_at = row.started_at;
        step.ended_at = row.ended_at;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn param_row(step_id: i64, name: &str, value: &str) -> StepParamRow {
        StepParamRow {
            id: 0,
            step_id,
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn test_group_params() {
        let rows = vec![
            param_row(1, "src", "s3://in"),
            param_row(1, "dst", "s3://out"),
            param_row(2, "depth", "3"),
        ];

        let grouped = group_params(&rows);
        assert_eq!(grouped[&1].len(), 2);
        assert_eq!(grouped[&2]["depth"], "3");
    }

    #[test]
    fn test_load_snapshot_copies_runtime_columns() {
        let mut g = Graph::new("wf", "1");
        let id = g.add("", "extract").unwrap();
        g.step_mut(id).invoker = Some("extractor".to_string());
        g.finalize().unwrap();

        let rows = vec![StepRow {
            id: 7,
            workflow_id: 1,
            name: "extract".to_string(),
            invoker: Some("extractor".to_string()),
            state: "RUNNING".to_string(),
            undo_state: None,
            handled: true,
            undo_handled: false,
            offline: true,
            stop_after: false,
            skipped: false,
            pid: Some(12345),
            depends: String::new(),
            depends_digest: String::new(),
            params_digest: String::new(),
            dfs_order: 0,
            started_at: Some(Utc::now()),
            ended_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }];

        load_snapshot(&mut g, &rows).unwrap();

        let step = g.step_by_name("extract").unwrap();
        assert_eq!(step.db_id, Some(7));
        assert_eq!(step.state, StepState::Running);
        assert!(step.handled);
        assert!(step.offline);
        assert_eq!(step.pid, Some(12345));
    }

    #[test]
    fn test_load_snapshot_missing_row_is_error() {
        let mut g = Graph::new("wf", "1");
        g.add("", "extract").unwrap();
        g.finalize().unwrap();

        let err = load_snapshot(&mut g, &[]).unwrap_err().to_string();
        assert!(err.contains("no persisted row"));
    }
}
