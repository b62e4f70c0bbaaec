//! Postgres-backed store on diesel-async with a deadpool connection pool.
//!
//! The try-job claim relies on the `culprit_try_jobs` primary key:
//! `INSERT … ON CONFLICT DO NOTHING` creates, and reviving a terminal row is
//! an `UPDATE` guarded on the attempt and status that were read.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use diesel::upsert::excluded;
use diesel_async::pooled_connection::deadpool::{Object, Pool};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use super::schema::{
    culprit_analyses, culprit_failure_groups, culprit_flake_aggregates, culprit_try_job_ids,
    culprit_try_jobs,
};
use super::AnalysisStore;
use crate::error::StoreError;
use crate::models::analysis::{Analysis, AnalysisKey};
use crate::models::failure::FailureKind;
use crate::models::flake::FlakeAggregate;
use crate::models::group::{FailureGroup, FailureSignature};
use crate::models::try_job::{TryJob, TryJobClaim, TryJobKey, TryJobStatus};

pub type PgPool = Pool<AsyncPgConnection>;

/// Attempts at the optimistic revive before giving up on a contended row.
const MAX_CLAIM_ATTEMPTS: usize = 5;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn connect(database_url: &str, max_connections: usize) -> Result<Self, StoreError> {
        let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
        let pool = Pool::builder(manager)
            .max_size(max_connections)
            .build()
            .map_err(|e| StoreError::Backend(format!("diesel pool: {e}")))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the culprit tables on a pooled connection.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| anyhow::anyhow!("diesel pool: {e}"))?;
        super::migration::run_migration(&mut conn).await
    }

    async fn conn(&self) -> Result<Object<AsyncPgConnection>, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Backend(format!("diesel pool: {e}")))
    }
}

fn backend(e: diesel::result::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn encode<T: Serialize>(entity: &'static str, value: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Corrupt {
        entity,
        reason: e.to_string(),
    })
}

fn decode<T: DeserializeOwned>(entity: &'static str, body: serde_json::Value) -> Result<T, StoreError> {
    serde_json::from_value(body).map_err(|e| StoreError::Corrupt {
        entity,
        reason: e.to_string(),
    })
}

// ── Rows ──

#[derive(Debug, Queryable)]
struct AnalysisRow {
    #[allow(dead_code)]
    project: String,
    #[allow(dead_code)]
    builder: String,
    #[allow(dead_code)]
    build_number: i64,
    #[allow(dead_code)]
    kind: String,
    #[allow(dead_code)]
    status: String,
    body: serde_json::Value,
    #[allow(dead_code)]
    create_date: DateTime<Utc>,
    #[allow(dead_code)]
    write_date: DateTime<Utc>,
}

#[derive(Insertable)]
#[diesel(table_name = culprit_analyses)]
struct NewAnalysisRow<'a> {
    project: &'a str,
    builder: &'a str,
    build_number: i64,
    kind: &'a str,
    status: &'a str,
    body: serde_json::Value,
    create_date: DateTime<Utc>,
    write_date: DateTime<Utc>,
}

#[derive(Insertable)]
#[diesel(table_name = culprit_failure_groups)]
struct NewGroupRow<'a> {
    id: Uuid,
    project: &'a str,
    kind: &'a str,
    signature: serde_json::Value,
    body: serde_json::Value,
    create_date: DateTime<Utc>,
    write_date: DateTime<Utc>,
}

#[derive(Debug, Queryable)]
struct TryJobRow {
    #[allow(dead_code)]
    project: String,
    #[allow(dead_code)]
    builder: String,
    #[allow(dead_code)]
    build_number: i64,
    #[allow(dead_code)]
    kind: String,
    attempt: i32,
    status: String,
    error: Option<String>,
    body: serde_json::Value,
    #[allow(dead_code)]
    create_date: DateTime<Utc>,
    #[allow(dead_code)]
    write_date: DateTime<Utc>,
}

impl TryJobRow {
    /// Columns win over the body: they are what the compare-and-create
    /// guards on.
    fn into_try_job(self) -> Result<TryJob, StoreError> {
        let mut job: TryJob = decode("try job", self.body)?;
        job.attempt = u32::try_from(self.attempt).unwrap_or(1);
        job.status = TryJobStatus::parse(&self.status).ok_or_else(|| StoreError::Corrupt {
            entity: "try job",
            reason: format!("unknown status {}", self.status),
        })?;
        job.error = self.error;
        Ok(job)
    }
}

#[derive(Insertable)]
#[diesel(table_name = culprit_try_jobs)]
struct NewTryJobRow<'a> {
    project: &'a str,
    builder: &'a str,
    build_number: i64,
    kind: &'a str,
    attempt: i32,
    status: &'a str,
    error: Option<&'a str>,
    body: serde_json::Value,
    create_date: DateTime<Utc>,
    write_date: DateTime<Utc>,
}

impl<'a> NewTryJobRow<'a> {
    fn from_job(job: &'a TryJob, now: DateTime<Utc>) -> Result<Self, StoreError> {
        Ok(Self {
            project: &job.key.build.project,
            builder: &job.key.build.builder,
            build_number: job.key.build.build_number,
            kind: job.key.kind.as_str(),
            attempt: attempt_column(job.attempt),
            status: job.status.as_str(),
            error: job.error.as_deref(),
            body: encode("try job", job)?,
            create_date: job.created_at,
            write_date: now,
        })
    }
}

fn attempt_column(attempt: u32) -> i32 {
    i32::try_from(attempt).unwrap_or(i32::MAX)
}

#[derive(Insertable)]
#[diesel(table_name = culprit_try_job_ids)]
struct NewTryJobIdRow<'a> {
    try_job_id: &'a str,
    project: &'a str,
    builder: &'a str,
    build_number: i64,
    kind: &'a str,
}

#[derive(Insertable)]
#[diesel(table_name = culprit_flake_aggregates)]
struct NewFlakeRow<'a> {
    flake_key: &'a str,
    score: i64,
    body: serde_json::Value,
    write_date: DateTime<Utc>,
}

// ── Queries ──

async fn load_try_job(
    conn: &mut AsyncPgConnection,
    key: &TryJobKey,
) -> Result<Option<TryJob>, StoreError> {
    let row = culprit_try_jobs::table
        .filter(culprit_try_jobs::project.eq(&key.build.project))
        .filter(culprit_try_jobs::builder.eq(&key.build.builder))
        .filter(culprit_try_jobs::build_number.eq(key.build.build_number))
        .filter(culprit_try_jobs::kind.eq(key.kind.as_str()))
        .first::<TryJobRow>(conn)
        .await
        .optional()
        .map_err(backend)?;
    row.map(TryJobRow::into_try_job).transpose()
}

/// One round of the revive-or-create. `None` means a concurrent writer
/// changed the row between the read and the guarded update.
async fn try_claim(
    conn: &mut AsyncPgConnection,
    key: &TryJobKey,
    now: DateTime<Utc>,
    stale_after: Duration,
) -> Result<Option<TryJobClaim>, StoreError> {
    let fresh = TryJob::new(key.clone(), now);
    let inserted = diesel::insert_into(culprit_try_jobs::table)
        .values(&NewTryJobRow::from_job(&fresh, now)?)
        .on_conflict_do_nothing()
        .execute(conn)
        .await
        .map_err(backend)?;
    if inserted == 1 {
        return Ok(Some(TryJobClaim::Created(fresh)));
    }

    let Some(mut job) = load_try_job(conn, key).await? else {
        return Ok(None);
    };
    if !job.status.is_terminal() && !job.is_stale_claim(now, stale_after) {
        return Ok(Some(TryJobClaim::InFlight(job)));
    }

    let seen_attempt = attempt_column(job.attempt);
    let seen_status = job.status.as_str();
    job.revive(now);
    let updated = diesel::update(
        culprit_try_jobs::table
            .filter(culprit_try_jobs::project.eq(&key.build.project))
            .filter(culprit_try_jobs::builder.eq(&key.build.builder))
            .filter(culprit_try_jobs::build_number.eq(key.build.build_number))
            .filter(culprit_try_jobs::kind.eq(key.kind.as_str()))
            .filter(culprit_try_jobs::attempt.eq(seen_attempt))
            .filter(culprit_try_jobs::status.eq(seen_status)),
    )
    .set((
        culprit_try_jobs::attempt.eq(attempt_column(job.attempt)),
        culprit_try_jobs::status.eq(job.status.as_str()),
        culprit_try_jobs::error.eq(None::<String>),
        culprit_try_jobs::body.eq(encode("try job", &job)?),
        culprit_try_jobs::write_date.eq(now),
    ))
    .execute(conn)
    .await
    .map_err(backend)?;

    Ok((updated == 1).then_some(TryJobClaim::Revived(job)))
}

#[async_trait]
impl AnalysisStore for PgStore {
    async fn get_analysis(&self, key: &AnalysisKey) -> Result<Option<Analysis>, StoreError> {
        let mut conn = self.conn().await?;
        let row = culprit_analyses::table
            .find((
                key.build.project.as_str(),
                key.build.builder.as_str(),
                key.build.build_number,
                key.kind.as_str(),
            ))
            .first::<AnalysisRow>(&mut conn)
            .await
            .optional()
            .map_err(backend)?;
        row.map(|r| decode("analysis", r.body)).transpose()
    }

    async fn create_analysis(&self, analysis: &Analysis) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let now = Utc::now();
        let row = NewAnalysisRow {
            project: &analysis.key.build.project,
            builder: &analysis.key.build.builder,
            build_number: analysis.key.build.build_number,
            kind: analysis.key.kind.as_str(),
            status: analysis.status.as_str(),
            body: encode("analysis", analysis)?,
            create_date: now,
            write_date: now,
        };
        let inserted = diesel::insert_into(culprit_analyses::table)
            .values(&row)
            .on_conflict_do_nothing()
            .execute(&mut conn)
            .await
            .map_err(backend)?;
        if inserted == 0 {
            return Err(StoreError::AlreadyExists {
                entity: "analysis",
                key: analysis.key.to_string(),
            });
        }
        Ok(())
    }

    async fn update_analysis(&self, analysis: &Analysis) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let updated = diesel::update(culprit_analyses::table.find((
            analysis.key.build.project.as_str(),
            analysis.key.build.builder.as_str(),
            analysis.key.build.build_number,
            analysis.key.kind.as_str(),
        )))
        .set((
            culprit_analyses::status.eq(analysis.status.as_str()),
            culprit_analyses::body.eq(encode("analysis", analysis)?),
            culprit_analyses::write_date.eq(Utc::now()),
        ))
        .execute(&mut conn)
        .await
        .map_err(backend)?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                entity: "analysis",
                key: analysis.key.to_string(),
            });
        }
        Ok(())
    }

    async fn find_failure_groups(
        &self,
        project: &str,
        kind: FailureKind,
        signature: &FailureSignature,
    ) -> Result<Vec<FailureGroup>, StoreError> {
        let mut conn = self.conn().await?;
        let bodies = culprit_failure_groups::table
            .filter(culprit_failure_groups::project.eq(project))
            .filter(culprit_failure_groups::kind.eq(kind.as_str()))
            .filter(culprit_failure_groups::signature.eq(encode("failure group", signature)?))
            .order(culprit_failure_groups::create_date.asc())
            .select(culprit_failure_groups::body)
            .load::<serde_json::Value>(&mut conn)
            .await
            .map_err(backend)?;
        bodies
            .into_iter()
            .map(|body| decode("failure group", body))
            .collect()
    }

    async fn create_failure_group(&self, group: &FailureGroup) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let row = NewGroupRow {
            id: group.id,
            project: &group.project,
            kind: group.kind.as_str(),
            signature: encode("failure group", &group.output_nodes)?,
            body: encode("failure group", group)?,
            create_date: group.created_at,
            write_date: Utc::now(),
        };
        let inserted = diesel::insert_into(culprit_failure_groups::table)
            .values(&row)
            .on_conflict_do_nothing()
            .execute(&mut conn)
            .await
            .map_err(backend)?;
        if inserted == 0 {
            return Err(StoreError::AlreadyExists {
                entity: "failure group",
                key: group.id.to_string(),
            });
        }
        Ok(())
    }

    async fn update_failure_group(&self, group: &FailureGroup) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let updated = diesel::update(culprit_failure_groups::table.find(group.id))
            .set((
                culprit_failure_groups::body.eq(encode("failure group", group)?),
                culprit_failure_groups::write_date.eq(Utc::now()),
            ))
            .execute(&mut conn)
            .await
            .map_err(backend)?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                entity: "failure group",
                key: group.id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_try_job(&self, key: &TryJobKey) -> Result<Option<TryJob>, StoreError> {
        let mut conn = self.conn().await?;
        load_try_job(&mut conn, key).await
    }

    async fn find_try_job_by_id(&self, try_job_id: &str) -> Result<Option<TryJob>, StoreError> {
        let mut conn = self.conn().await?;
        let owner = culprit_try_job_ids::table
            .find(try_job_id)
            .select((
                culprit_try_job_ids::project,
                culprit_try_job_ids::builder,
                culprit_try_job_ids::build_number,
                culprit_try_job_ids::kind,
            ))
            .first::<(String, String, i64, String)>(&mut conn)
            .await
            .optional()
            .map_err(backend)?;
        let Some((project, builder, build_number, kind)) = owner else {
            return Ok(None);
        };
        let kind = FailureKind::parse(&kind).ok_or_else(|| StoreError::Corrupt {
            entity: "try job id",
            reason: format!("unknown kind {kind}"),
        })?;
        let key = TryJobKey::new(
            crate::models::build::BuildKey::new(project, builder, build_number),
            kind,
        );
        load_try_job(&mut conn, &key).await
    }

    async fn claim_try_job(
        &self,
        key: &TryJobKey,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<TryJobClaim, StoreError> {
        let mut conn = self.conn().await?;
        for _ in 0..MAX_CLAIM_ATTEMPTS {
            if let Some(claim) = try_claim(&mut conn, key, now, stale_after).await? {
                return Ok(claim);
            }
            tracing::debug!(try_job = %key, "Try-job row changed during claim, retrying");
        }
        Err(StoreError::Backend(format!(
            "try job {key} stayed contended after {MAX_CLAIM_ATTEMPTS} claim attempts"
        )))
    }

    async fn update_try_job(&self, job: &TryJob) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let now = Utc::now();
        let row = NewTryJobRow::from_job(job, now)?;
        let updated = diesel::update(
            culprit_try_jobs::table
                .filter(culprit_try_jobs::project.eq(row.project))
                .filter(culprit_try_jobs::builder.eq(row.builder))
                .filter(culprit_try_jobs::build_number.eq(row.build_number))
                .filter(culprit_try_jobs::kind.eq(row.kind)),
        )
        .set((
            culprit_try_jobs::attempt.eq(row.attempt),
            culprit_try_jobs::status.eq(row.status),
            culprit_try_jobs::error.eq(row.error),
            culprit_try_jobs::body.eq(row.body.clone()),
            culprit_try_jobs::write_date.eq(now),
        ))
        .execute(&mut conn)
        .await
        .map_err(backend)?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                entity: "try job",
                key: job.key.to_string(),
            });
        }

        let ids: Vec<NewTryJobIdRow<'_>> = job
            .try_job_ids
            .iter()
            .map(|id| NewTryJobIdRow {
                try_job_id: id,
                project: row.project,
                builder: row.builder,
                build_number: row.build_number,
                kind: row.kind,
            })
            .collect();
        if !ids.is_empty() {
            diesel::insert_into(culprit_try_job_ids::table)
                .values(&ids)
                .on_conflict_do_nothing()
                .execute(&mut conn)
                .await
                .map_err(backend)?;
        }
        Ok(())
    }

    async fn get_flake_aggregate(
        &self,
        flake_key: &str,
    ) -> Result<Option<FlakeAggregate>, StoreError> {
        let mut conn = self.conn().await?;
        let body = culprit_flake_aggregates::table
            .find(flake_key)
            .select(culprit_flake_aggregates::body)
            .first::<serde_json::Value>(&mut conn)
            .await
            .optional()
            .map_err(backend)?;
        body.map(|b| decode("flake aggregate", b)).transpose()
    }

    async fn put_flake_aggregate(
        &self,
        flake_key: &str,
        aggregate: &FlakeAggregate,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let row = NewFlakeRow {
            flake_key,
            score: aggregate.score,
            body: encode("flake aggregate", aggregate)?,
            write_date: Utc::now(),
        };
        diesel::insert_into(culprit_flake_aggregates::table)
            .values(&row)
            .on_conflict(culprit_flake_aggregates::flake_key)
            .do_update()
            .set((
                culprit_flake_aggregates::score.eq(excluded(culprit_flake_aggregates::score)),
                culprit_flake_aggregates::body.eq(excluded(culprit_flake_aggregates::body)),
                culprit_flake_aggregates::write_date
                    .eq(excluded(culprit_flake_aggregates::write_date)),
            ))
            .execute(&mut conn)
            .await
            .map_err(backend)?;
        Ok(())
    }
}
