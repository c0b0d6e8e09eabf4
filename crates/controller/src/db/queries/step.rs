//! Step row queries.

use crate::db::models::{StepParamRow, StepRow};
use crate::db::DbPool;
use crate::error::AppResult;

/// Fetch every step row of a workflow, ordered by depth-first order.
pub async fn fetch_steps(pool: &DbPool, workflow_id: i64) -> AppResult<Vec<StepRow>> {
    let rows = sqlx::query_as::<_, StepRow>(
        r#"
        SELECT id, workflow_id, name, invoker, state, undo_state,
               handled, undo_handled, offline, stop_after, skipped, pid,
               depends, depends_digest, params_digest, dfs_order,
               started_at, ended_at, created_at, updated_at
        FROM gantry.step
        WHERE workflow_id = $1
        ORDER BY dfs_order, id
        "#,
    )
    .bind(workflow_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Fetch one step row by full name.
pub async fn get_step_by_name(
    pool: &DbPool,
    workflow_id: i64,
    name: &str,
) -> AppResult<Option<StepRow>> {
    let row = sqlx::query_as::<_, StepRow>(
        r#"
        SELECT id, workflow_id, name, invoker, state, undo_state,
               handled, undo_handled, offline, stop_after, skipped, pid,
               depends, depends_digest, params_digest, dfs_order,
               started_at, ended_at, created_at, updated_at
        FROM gantry.step
        WHERE workflow_id = $1 AND name = $2
        "#,
    )
    .bind(workflow_id)
    .bind(name)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// Fetch the parameter rows of every step of a workflow.
pub async fn fetch_step_params(pool: &DbPool, workflow_id: i64) -> AppResult<Vec<StepParamRow>> {
    let rows = sqlx::query_as::<_, StepParamRow>(
        r#"
        SELECT p.id, p.step_id, p.name, p.value
        FROM gantry.step_param p
        JOIN gantry.step s ON s.id = p.step_id
        WHERE s.workflow_id = $1
        ORDER BY p.step_id, p.name
        "#,
    )
    .bind(workflow_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Fetch the parameter rows of one step.
pub async fn get_params_for_step(pool: &DbPool, step_id: i64) -> AppResult<Vec<StepParamRow>> {
    let rows = sqlx::query_as::<_, StepParamRow>(
        r#"
        SELECT id, step_id, name, value
        FROM gantry.step_param
        WHERE step_id = $1
        ORDER BY name
        "#,
    )
    .bind(step_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Insert one step row and return its id.
#[allow(clippy::too_many_arguments)]
pub async fn insert_step(
    pool: &DbPool,
    workflow_id: i64,
    name: &str,
    invoker: Option<&str>,
    state: &str,
    depends: &str,
    depends_digest: &str,
    params_digest: &str,
    dfs_order: i32,
) -> AppResult<i64> {
    let row: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO gantry.step (
            workflow_id, name, invoker, state,
            depends, depends_digest, params_digest, dfs_order
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING id
        "#,
    )
    .bind(workflow_id)
    .bind(name)
    .bind(invoker)
    .bind(state)
    .bind(depends)
    .bind(depends_digest)
    .bind(params_digest)
    .bind(dfs_order)
    .fetch_one(pool)
    .await?;

    Ok(row.0)
}

/// Insert one (step, parameter) row.
pub async fn insert_step_param(
    pool: &DbPool,
    step_id: i64,
    name: &str,
    value: &str,
) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO gantry.step_param (step_id, name, value)
        VALUES ($1, $2, $3)
        "#,
    )
    .bind(step_id)
    .bind(name)
    .bind(value)
    .execute(pool)
    .await?;

    Ok(())
}

/// Refresh the ordering columns of a row after a tolerated structural
/// drift (new siblings shifting depth-first order, re-linked parents).
pub async fn update_step_order(
    pool: &DbPool,
    id: i64,
    depends: &str,
    depends_digest: &str,
    dfs_order: i32,
) -> AppResult<()> {
    sqlx::query(
        r#"
        UPDATE gantry.step
        SET depends = $2, depends_digest = $3, dfs_order = $4, updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(depends)
    .bind(depends_digest)
    .bind(dfs_order)
    .execute(pool)
    .await?;

    Ok(())
}

/// Count worker run records pointing at a step.
pub async fn count_step_runs(pool: &DbPool, step_id: i64) -> AppResult<i64> {
    let row: (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*)
        FROM gantry.step_run
        WHERE step_id = $1
        "#,
    )
    .bind(step_id)
    .fetch_one(pool)
    .await?;

    Ok(row.0)
}

/// Delete a step row that never started (parameters cascade).
pub async fn delete_step_if_unstarted(pool: &DbPool, id: i64) -> AppResult<bool> {
    let result = sqlx::query(
        r#"
        DELETE FROM gantry.step
        WHERE id = $1 AND state IN ('READY', 'ON_DECK')
        "#,
    )
    .bind(id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Promote a step whose parents are all done onto the deck. Guarded on the
/// step still being READY.
pub async fn mark_on_deck(pool: &DbPool, id: i64, undo: bool) -> AppResult<bool> {
    let result = if undo {
        sqlx::query(
            r#"
            UPDATE gantry.step
            SET undo_state = 'ON_DECK', undo_handled = true, updated_at = now()
            WHERE id = $1 AND undo_state = 'READY'
            "#,
        )
        .bind(id)
        .execute(pool)
        .await?
    } else {
        sqlx::query(
            r#"
            UPDATE gantry.step
            SET state = 'ON_DECK', handled = true, updated_at = now()
            WHERE id = $1 AND state = 'READY'
            "#,
        )
        .bind(id)
        .execute(pool)
        .await?
    };

    Ok(result.rows_affected() > 0)
}

/// Advance a structural step straight to DONE. Guarded on ON_DECK.
pub async fn mark_structural_done(pool: &DbPool, id: i64, undo: bool) -> AppResult<bool> {
    let result = if undo {
        sqlx::query(
            r#"
            UPDATE gantry.step
            SET undo_state = 'DONE', undo_handled = true, updated_at = now()
            WHERE id = $1 AND undo_state = 'ON_DECK'
            "#,
        )
        .bind(id)
        .execute(pool)
        .await?
    } else {
        sqlx::query(
            r#"
            UPDATE gantry.step
            SET state = 'DONE', handled = true,
                started_at = COALESCE(started_at, now()), ended_at = now(),
                updated_at = now()
            WHERE id = $1 AND state = 'ON_DECK'
            "#,
        )
        .bind(id)
        .execute(pool)
        .await?
    };

    Ok(result.rows_affected() > 0)
}

/// Fail a step whose recorded worker process vanished. Guarded on the row
/// still being RUNNING under the pid whose liveness was checked, so a step
/// that finished between snapshot and write is left alone.
pub async fn mark_failed_if_running(
    pool: &DbPool,
    id: i64,
    pid: Option<i32>,
    undo: bool,
) -> AppResult<bool> {
    let result = if undo {
        sqlx::query(
            r#"
            UPDATE gantry.step
            SET undo_state = 'FAILED', undo_handled = true, updated_at = now()
            WHERE id = $1 AND undo_state = 'RUNNING' AND pid IS NOT DISTINCT FROM $2
            "#,
        )
        .bind(id)
        .bind(pid)
        .execute(pool)
        .await?
    } else {
        sqlx::query(
            r#"
            UPDATE gantry.step
            SET state = 'FAILED', handled = true, ended_at = now(), updated_at = now()
            WHERE id = $1 AND state = 'RUNNING' AND pid IS NOT DISTINCT FROM $2
            "#,
        )
        .bind(id)
        .bind(pid)
        .execute(pool)
        .await?
    };

    Ok(result.rows_affected() > 0)
}

/// Mark the currently observed state/flags as handled. Guarded on every
/// observed value so a concurrent change skips the mark and is re-read
/// next cycle.
pub async fn mark_handled(
    pool: &DbPool,
    id: i64,
    state: &str,
    offline: bool,
    stop_after: bool,
    undo: bool,
) -> AppResult<bool> {
    let result = if undo {
        sqlx::query(
            r#"
            UPDATE gantry.step
            SET undo_handled = true, updated_at = now()
            WHERE id = $1 AND undo_state = $2 AND offline = $3 AND stop_after = $4
            "#,
        )
        .bind(id)
        .bind(state)
        .bind(offline)
        .bind(stop_after)
        .execute(pool)
        .await?
    } else {
        sqlx::query(
            r#"
            UPDATE gantry.step
            SET handled = true, updated_at = now()
            WHERE id = $1 AND state = $2 AND offline = $3 AND stop_after = $4
            "#,
        )
        .bind(id)
        .bind(state)
        .bind(offline)
        .bind(stop_after)
        .execute(pool)
        .await?
    };

    Ok(result.rows_affected() > 0)
}

/// Mark the named steps eligible for undo execution. Only rows with no
/// undo state yet are touched, so re-entering undo mode is idempotent.
pub async fn mark_undo_ready(
    pool: &DbPool,
    workflow_id: i64,
    names: &[String],
) -> AppResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE gantry.step
        SET undo_state = 'READY', undo_handled = false, updated_at = now()
        WHERE workflow_id = $1 AND name = ANY($2) AND undo_state IS NULL
        "#,
    )
    .bind(workflow_id)
    .bind(names)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Reset fully undone steps to forward READY and clear their undo columns
/// so a later forward run redoes the work.
pub async fn reset_undone_steps(
    pool: &DbPool,
    workflow_id: i64,
    names: &[String],
) -> AppResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE gantry.step
        SET state = 'READY', handled = false,
            undo_state = NULL, undo_handled = false,
            skipped = false, pid = NULL,
            started_at = NULL, ended_at = NULL, updated_at = now()
        WHERE workflow_id = $1 AND name = ANY($2) AND undo_state = 'DONE'
        "#,
    )
    .bind(workflow_id)
    .bind(names)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Put a FAILED step back to READY for another attempt.
pub async fn retry_step(pool: &DbPool, workflow_id: i64, name: &str) -> AppResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE gantry.step
        SET state = 'READY', handled = false, pid = NULL,
            started_at = NULL, ended_at = NULL, updated_at = now()
        WHERE workflow_id = $1 AND name = $2 AND state = 'FAILED'
        "#,
    )
    .bind(workflow_id)
    .bind(name)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Set or clear the offline hold on a step.
pub async fn set_offline(
    pool: &DbPool,
    workflow_id: i64,
    name: &str,
    value: bool,
) -> AppResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE gantry.step
        SET offline = $3, handled = false, updated_at = now()
        WHERE workflow_id = $1 AND name = $2 AND offline <> $3
        "#,
    )
    .bind(workflow_id)
    .bind(name)
    .bind(value)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Set or clear the stop-after breakpoint on a step.
pub async fn set_stop_after(
    pool: &DbPool,
    workflow_id: i64,
    name: &str,
    value: bool,
) -> AppResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE gantry.step
        SET stop_after = $3, handled = false, updated_at = now()
        WHERE workflow_id = $1 AND name = $2 AND stop_after <> $3
        "#,
    )
    .bind(workflow_id)
    .bind(name)
    .bind(value)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}
