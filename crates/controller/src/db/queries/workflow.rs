//! Workflow instance queries.

use crate::db::models::WorkflowRow;
use crate::db::DbPool;
use crate::error::AppResult;

/// Get a workflow row by name.
pub async fn get_workflow_by_name(pool: &DbPool, name: &str) -> AppResult<Option<WorkflowRow>> {
    let row = sqlx::query_as::<_, WorkflowRow>(
        r#"
        SELECT id, name, version, state, host, pid, undo_step, created_at, updated_at
        FROM gantry.workflow
        WHERE name = $1
        "#,
    )
    .bind(name)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// Insert a new workflow instance in RUNNING state and return its id.
pub async fn insert_workflow(
    pool: &DbPool,
    name: &str,
    version: &str,
    host: &str,
    pid: i32,
) -> AppResult<i64> {
    let row: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO gantry.workflow (name, version, state, host, pid)
        VALUES ($1, $2, 'RUNNING', $3, $4)
        RETURNING id
        "#,
    )
    .bind(name)
    .bind(version)
    .bind(host)
    .bind(pid)
    .fetch_one(pool)
    .await?;

    Ok(row.0)
}

/// Claim the workflow for this controller process. The claim is guarded on
/// the previously observed pid so two racing controllers cannot both win.
pub async fn claim_workflow(
    pool: &DbPool,
    id: i64,
    host: &str,
    pid: i32,
    prev_pid: Option<i32>,
) -> AppResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE gantry.workflow
        SET host = $2, pid = $3, state = 'RUNNING', updated_at = now()
        WHERE id = $1 AND pid IS NOT DISTINCT FROM $4
        "#,
    )
    .bind(id)
    .bind(host)
    .bind(pid)
    .bind(prev_pid)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Drop this controller's claim without touching the workflow state.
pub async fn release_workflow(pool: &DbPool, id: i64) -> AppResult<()> {
    sqlx::query(
        r#"
        UPDATE gantry.workflow
        SET pid = NULL, updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Set the workflow state.
pub async fn set_workflow_state(pool: &DbPool, id: i64, state: &str) -> AppResult<()> {
    sqlx::query(
        r#"
        UPDATE gantry.workflow
        SET state = $2, updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(state)
    .execute(pool)
    .await?;

    Ok(())
}

/// Record or clear the active undo root.
pub async fn set_undo_step(pool: &DbPool, id: i64, undo_step: Option<&str>) -> AppResult<()> {
    sqlx::query(
        r#"
        UPDATE gantry.workflow
        SET undo_step = $2, updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(undo_step)
    .execute(pool)
    .await?;

    Ok(())
}
