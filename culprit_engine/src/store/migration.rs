//! SQL migration for the culprit-finding tables.

use diesel_async::{AsyncPgConnection, SimpleAsyncConnection};

pub const MIGRATION_SQL: &str = r#"
-- ================================================================
-- Culprit-finding tables
-- ================================================================

CREATE TABLE IF NOT EXISTS culprit_analyses (
    project         VARCHAR(255) NOT NULL,
    builder         VARCHAR(255) NOT NULL,
    build_number    BIGINT NOT NULL,
    kind            VARCHAR(16) NOT NULL,
    status          VARCHAR(32) NOT NULL DEFAULT 'pending',
    body            JSONB NOT NULL,
    create_date     TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    write_date      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (project, builder, build_number, kind)
);

CREATE INDEX IF NOT EXISTS idx_culprit_analyses_status ON culprit_analyses (status);

CREATE TABLE IF NOT EXISTS culprit_failure_groups (
    id              UUID PRIMARY KEY,
    project         VARCHAR(255) NOT NULL,
    kind            VARCHAR(16) NOT NULL,
    signature       JSONB NOT NULL,
    body            JSONB NOT NULL,
    create_date     TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    write_date      TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_culprit_failure_groups_lookup
    ON culprit_failure_groups (project, kind);

-- One row per (build, kind): the primary key is the at-most-one-in-flight guard.
CREATE TABLE IF NOT EXISTS culprit_try_jobs (
    project         VARCHAR(255) NOT NULL,
    builder         VARCHAR(255) NOT NULL,
    build_number    BIGINT NOT NULL,
    kind            VARCHAR(16) NOT NULL,
    attempt         INTEGER NOT NULL DEFAULT 1,
    status          VARCHAR(32) NOT NULL DEFAULT 'pending',
    error           TEXT,
    body            JSONB NOT NULL,
    create_date     TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    write_date      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (project, builder, build_number, kind)
);

CREATE INDEX IF NOT EXISTS idx_culprit_try_jobs_status ON culprit_try_jobs (status);

CREATE TABLE IF NOT EXISTS culprit_try_job_ids (
    try_job_id      VARCHAR(64) PRIMARY KEY,
    project         VARCHAR(255) NOT NULL,
    builder         VARCHAR(255) NOT NULL,
    build_number    BIGINT NOT NULL,
    kind            VARCHAR(16) NOT NULL,
    FOREIGN KEY (project, builder, build_number, kind)
        REFERENCES culprit_try_jobs (project, builder, build_number, kind) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS culprit_flake_aggregates (
    flake_key       VARCHAR(512) PRIMARY KEY,
    score           BIGINT NOT NULL DEFAULT 0,
    body            JSONB NOT NULL,
    write_date      TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_culprit_flake_aggregates_score
    ON culprit_flake_aggregates (score DESC);
"#;

/// Create the culprit-finding tables if they do not exist.
pub async fn run_migration(conn: &mut AsyncPgConnection) -> anyhow::Result<()> {
    conn.batch_execute(MIGRATION_SQL)
        .await
        .map_err(|e| anyhow::anyhow!("culprit migration failed: {e}"))?;
    Ok(())
}
