//! Embedded schema for the persisted store.

use crate::db::DbPool;
use crate::error::AppResult;

/// Schema bootstrap statements. Every statement is guarded with
/// IF NOT EXISTS so the batch can run on each start.
const SCHEMA_SQL: &str = r#"
CREATE SCHEMA IF NOT EXISTS gantry;

-- One row per workflow instance
CREATE TABLE IF NOT EXISTS gantry.workflow (
    id          BIGSERIAL PRIMARY KEY,
    name        TEXT NOT NULL UNIQUE,
    version     TEXT NOT NULL DEFAULT '1',
    state       TEXT NOT NULL DEFAULT 'RUNNING',
    host        TEXT,
    pid         INTEGER,
    undo_step   TEXT,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT now()
);

-- One row per step of a workflow instance
CREATE TABLE IF NOT EXISTS gantry.step (
    id              BIGSERIAL PRIMARY KEY,
    workflow_id     BIGINT NOT NULL REFERENCES gantry.workflow(id) ON DELETE CASCADE,
    name            TEXT NOT NULL,
    invoker         TEXT,
    state           TEXT NOT NULL DEFAULT 'READY',
    undo_state      TEXT,
    handled         BOOLEAN NOT NULL DEFAULT FALSE,
    undo_handled    BOOLEAN NOT NULL DEFAULT FALSE,
    offline         BOOLEAN NOT NULL DEFAULT FALSE,
    stop_after      BOOLEAN NOT NULL DEFAULT FALSE,
    skipped         BOOLEAN NOT NULL DEFAULT FALSE,
    pid             INTEGER,
    depends         TEXT NOT NULL DEFAULT '',
    depends_digest  TEXT NOT NULL DEFAULT '',
    params_digest   TEXT NOT NULL DEFAULT '',
    dfs_order       INTEGER NOT NULL DEFAULT 0,
    started_at      TIMESTAMPTZ,
    ended_at        TIMESTAMPTZ,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (workflow_id, name)
);

CREATE INDEX IF NOT EXISTS idx_step_workflow_state ON gantry.step (workflow_id, state);

-- One row per (step, parameter) pair
CREATE TABLE IF NOT EXISTS gantry.step_param (
    id       BIGSERIAL PRIMARY KEY,
    step_id  BIGINT NOT NULL REFERENCES gantry.step(id) ON DELETE CASCADE,
    name     TEXT NOT NULL,
    value    TEXT NOT NULL DEFAULT '',
    UNIQUE (step_id, name)
);

-- Worker-written run records; one row per launched attempt. The
-- controller never writes these, it only reads them as evidence that
-- a step has executed.
CREATE TABLE IF NOT EXISTS gantry.step_run (
    id          BIGSERIAL PRIMARY KEY,
    step_id     BIGINT NOT NULL REFERENCES gantry.step(id) ON DELETE CASCADE,
    host        TEXT,
    pid         INTEGER,
    undo        BOOLEAN NOT NULL DEFAULT FALSE,
    started_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
    ended_at    TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS idx_step_run_step ON gantry.step_run (step_id);
"#;

/// Apply the embedded schema.
pub async fn init_schema(pool: &DbPool) -> AppResult<()> {
    sqlx::raw_sql(SCHEMA_SQL).execute(pool).await?;
    tracing::info!("Database schema initialized");
    Ok(())
}

/// Drop the whole schema and every row in it.
pub async fn drop_schema(pool: &DbPool) -> AppResult<()> {
    sqlx::raw_sql("DROP SCHEMA IF EXISTS gantry CASCADE")
        .execute(pool)
        .await?;
    tracing::warn!("Database schema dropped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_covers_all_tables() {
        for table in ["workflow", "step", "step_param", "step_run"] {
            let ddl = format!("CREATE TABLE IF NOT EXISTS gantry.{}", table);
            assert!(SCHEMA_SQL.contains(&ddl), "missing table {}", table);
        }
    }

    #[test]
    fn test_schema_is_idempotent_ddl() {
        for stmt in SCHEMA_SQL.split(';') {
            if stmt.contains("CREATE") {
                assert!(stmt.contains("IF NOT EXISTS"), "not idempotent: {}", stmt);
            }
        }
    }
}
