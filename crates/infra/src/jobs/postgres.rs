//! Postgres-backed job store.
//!
//! Implements the claim protocol with `SELECT ... FOR UPDATE SKIP LOCKED`: concurrent
//! claimers skip rows another transaction already holds, so batches are disjoint and
//! nobody blocks. Every outcome write carries `status = 'PROCESSING' AND locked_by = $n`
//! in its `WHERE` clause; zero affected rows means the claim was lost.
//!
//! ## Error Mapping
//!
//! | SQLx Error | JobStoreError |
//! |------------|---------------|
//! | Database (unique violation `23505`) | `Conflict` |
//! | Database (other) | `Storage` |
//! | PoolClosed / RowNotFound / Other | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{postgres::PgRow, FromRow, PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use playreport_core::{JobId, SessionId};

use super::store::{JobStats, JobStore, JobStoreError};
use super::types::{
    truncate_error, ClaimedJob, EnqueueOutcome, Job, JobStatus, Report, ReportStatus, MAX_ERROR_LEN,
};

const JOB_COLUMNS: &str = "job_id, session_id, status, run_at, attempts, max_attempts, \
                           locked_at, locked_by, last_error, created_at, updated_at";

/// Postgres-backed job store.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn begin(&self, operation: &str) -> Result<Transaction<'_, Postgres>, JobStoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(operation, e))
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self), fields(session_id = %session_id), err)]
    async fn enqueue(
        &self,
        session_id: SessionId,
        max_attempts: u32,
    ) -> Result<EnqueueOutcome, JobStoreError> {
        let mut tx = self.begin("enqueue").await?;

        sqlx::query(
            r#"
            INSERT INTO ai_reports (session_id, status)
            VALUES ($1, 'PENDING')
            ON CONFLICT (session_id) DO NOTHING
            "#,
        )
        .bind(session_id.as_uuid())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;

        // DONE/PROCESSING rows fail the WHERE and come back empty.
        let upserted = sqlx::query(
            r#"
            INSERT INTO report_jobs (job_id, session_id, status, run_at, attempts, max_attempts)
            VALUES ($1, $2, 'QUEUED', now(), 0, $3)
            ON CONFLICT (session_id) DO UPDATE SET
                status = 'QUEUED',
                run_at = now(),
                attempts = CASE WHEN report_jobs.status = 'FAILED' THEN 0 ELSE report_jobs.attempts END,
                last_error = CASE WHEN report_jobs.status = 'FAILED' THEN NULL ELSE report_jobs.last_error END,
                locked_at = NULL,
                locked_by = NULL,
                updated_at = now()
            WHERE report_jobs.status IN ('QUEUED', 'FAILED')
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(JobId::new().as_uuid())
        .bind(session_id.as_uuid())
        .bind(attempts_to_db(max_attempts))
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;

        let outcome = match upserted {
            Some(row) => {
                let inserted: bool = row
                    .try_get("inserted")
                    .map_err(|e| map_sqlx_error("enqueue", e))?;
                if inserted {
                    EnqueueOutcome::Created
                } else {
                    sqlx::query(
                        r#"
                        UPDATE ai_reports
                        SET status = 'PENDING', failure_reason = NULL, updated_at = now()
                        WHERE session_id = $1 AND status = 'FAILED'
                        "#,
                    )
                    .bind(session_id.as_uuid())
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx_error("enqueue", e))?;
                    EnqueueOutcome::Requeued
                }
            }
            None => {
                let status: String =
                    sqlx::query_scalar("SELECT status FROM report_jobs WHERE session_id = $1")
                        .bind(session_id.as_uuid())
                        .fetch_one(&mut *tx)
                        .await
                        .map_err(|e| map_sqlx_error("enqueue", e))?;
                EnqueueOutcome::Unchanged(parse_job_status(&status)?)
            }
        };

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;

        Ok(outcome)
    }

    #[instrument(skip(self), fields(claimed), err)]
    async fn claim(&self, limit: usize, locked_by: &str) -> Result<Vec<ClaimedJob>, JobStoreError> {
        let mut tx = self.begin("claim").await?;

        let rows = sqlx::query(
            r#"
            SELECT job_id, session_id, attempts, max_attempts, created_at
            FROM report_jobs
            WHERE status = 'QUEUED' AND run_at <= now()
            ORDER BY created_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim", e))?;

        if rows.is_empty() {
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit", e))?;
            return Ok(Vec::new());
        }

        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            candidates.push(CandidateRow::from_row(row).map_err(|e| map_sqlx_error("claim", e))?);
        }
        let job_ids: Vec<Uuid> = candidates.iter().map(|c| c.job_id).collect();

        // now() is fixed for the transaction, so every row in the batch shares this stamp.
        let locked_at: DateTime<Utc> = sqlx::query_scalar("SELECT now()")
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("claim", e))?;

        sqlx::query(
            r#"
            UPDATE report_jobs
            SET status = 'PROCESSING', locked_at = $1, locked_by = $2, updated_at = now()
            WHERE job_id = ANY($3)
            "#,
        )
        .bind(locked_at)
        .bind(locked_by)
        .bind(&job_ids)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;

        tracing::Span::current().record("claimed", candidates.len());

        // Already ordered by created_at from the SELECT.
        Ok(candidates
            .into_iter()
            .map(|c| ClaimedJob {
                job_id: JobId::from_uuid(c.job_id),
                session_id: SessionId::from_uuid(c.session_id),
                attempts: attempts_from_db(c.attempts),
                max_attempts: attempts_from_db(c.max_attempts),
                locked_by: locked_by.to_string(),
                locked_at,
            })
            .collect())
    }

    #[instrument(skip(self, jobs), fields(count = jobs.len()), err)]
    async fn release(&self, jobs: &[ClaimedJob]) -> Result<u64, JobStoreError> {
        if jobs.is_empty() {
            return Ok(0);
        }

        let job_ids: Vec<Uuid> = jobs.iter().map(|j| *j.job_id.as_uuid()).collect();
        let claimants: Vec<String> = jobs.iter().map(|j| j.locked_by.clone()).collect();

        let result = sqlx::query(
            r#"
            UPDATE report_jobs AS j
            SET status = 'QUEUED', locked_at = NULL, locked_by = NULL, updated_at = now()
            FROM UNNEST($1::uuid[], $2::text[]) AS c(job_id, locked_by)
            WHERE j.job_id = c.job_id
              AND j.locked_by = c.locked_by
              AND j.status = 'PROCESSING'
            "#,
        )
        .bind(&job_ids)
        .bind(&claimants)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(session_id = %session_id), err)]
    async fn report_status(
        &self,
        session_id: SessionId,
    ) -> Result<Option<ReportStatus>, JobStoreError> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM ai_reports WHERE session_id = $1")
                .bind(session_id.as_uuid())
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("report_status", e))?;

        status.as_deref().map(parse_report_status).transpose()
    }

    #[instrument(
        skip(self, job, content),
        fields(job_id = %job.job_id, session_id = %job.session_id, with_content = content.is_some()),
        err
    )]
    async fn complete(
        &self,
        job: &ClaimedJob,
        content: Option<JsonValue>,
    ) -> Result<(), JobStoreError> {
        let mut tx = self.begin("complete").await?;

        if let Some(content) = content {
            let result = sqlx::query(
                r#"
                UPDATE ai_reports
                SET status = 'READY', content_json = $1, updated_at = now()
                WHERE session_id = $2 AND status = 'PENDING'
                "#,
            )
            .bind(content)
            .bind(job.session_id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("complete", e))?;

            if result.rows_affected() == 0 {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(JobStoreError::Conflict(format!(
                    "report for session {} is not PENDING",
                    job.session_id
                )));
            }
        }

        let result = sqlx::query(
            r#"
            UPDATE report_jobs
            SET status = 'DONE', updated_at = now()
            WHERE job_id = $1 AND status = 'PROCESSING' AND locked_by = $2
            "#,
        )
        .bind(job.job_id.as_uuid())
        .bind(&job.locked_by)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("complete", e))?;

        if result.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(JobStoreError::not_held(job));
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }

    #[instrument(
        skip(self, job, error),
        fields(job_id = %job.job_id, session_id = %job.session_id),
        err
    )]
    async fn requeue(
        &self,
        job: &ClaimedJob,
        attempts: u32,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE report_jobs
            SET status = 'QUEUED',
                attempts = $1,
                run_at = $2,
                last_error = $3,
                locked_at = NULL,
                locked_by = NULL,
                updated_at = now()
            WHERE job_id = $4 AND status = 'PROCESSING' AND locked_by = $5
            "#,
        )
        .bind(attempts_to_db(attempts))
        .bind(run_at)
        .bind(truncate_error(error, MAX_ERROR_LEN))
        .bind(job.job_id.as_uuid())
        .bind(&job.locked_by)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::not_held(job));
        }
        Ok(())
    }

    #[instrument(
        skip(self, job, reason),
        fields(job_id = %job.job_id, session_id = %job.session_id),
        err
    )]
    async fn fail(&self, job: &ClaimedJob, attempts: u32, reason: &str) -> Result<(), JobStoreError> {
        let reason = truncate_error(reason, MAX_ERROR_LEN);
        let mut tx = self.begin("fail").await?;

        let result = sqlx::query(
            r#"
            UPDATE report_jobs
            SET status = 'FAILED', attempts = $1, last_error = $2, updated_at = now()
            WHERE job_id = $3 AND status = 'PROCESSING' AND locked_by = $4
            "#,
        )
        .bind(attempts_to_db(attempts))
        .bind(&reason)
        .bind(job.job_id.as_uuid())
        .bind(&job.locked_by)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("fail", e))?;

        if result.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(JobStoreError::not_held(job));
        }

        // A report that already left PENDING keeps its state.
        sqlx::query(
            r#"
            UPDATE ai_reports
            SET status = 'FAILED', failure_reason = $1, updated_at = now()
            WHERE session_id = $2 AND status = 'PENDING'
            "#,
        )
        .bind(&reason)
        .bind(job.session_id.as_uuid())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("fail", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn job(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM report_jobs WHERE job_id = $1");
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("job", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), fields(session_id = %session_id), err)]
    async fn job_for_session(&self, session_id: SessionId) -> Result<Option<Job>, JobStoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM report_jobs WHERE session_id = $1");
        let row = sqlx::query(&sql)
            .bind(session_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("job_for_session", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), fields(session_id = %session_id), err)]
    async fn report(&self, session_id: SessionId) -> Result<Option<Report>, JobStoreError> {
        let row = sqlx::query(
            r#"
            SELECT session_id, status, content_json, failure_reason, created_at, updated_at
            FROM ai_reports
            WHERE session_id = $1
            "#,
        )
        .bind(session_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("report", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let row = ReportRow::from_row(&row).map_err(|e| map_sqlx_error("report", e))?;
        Ok(Some(Report {
            session_id: SessionId::from_uuid(row.session_id),
            status: parse_report_status(&row.status)?,
            content_json: row.content_json,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }))
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM report_jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", e))?;
            let count: i64 = row.try_get("count").map_err(|e| map_sqlx_error("stats", e))?;
            let count = u64::try_from(count).unwrap_or(0);
            match parse_job_status(&status)? {
                JobStatus::Queued => stats.queued = count,
                JobStatus::Processing => stats.processing = count,
                JobStatus::Done => stats.done = count,
                JobStatus::Failed => stats.failed = count,
            }
        }
        Ok(stats)
    }

    #[instrument(skip(self), fields(older_than = %older_than), err)]
    async fn stale_processing(&self, older_than: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM report_jobs \
             WHERE status = 'PROCESSING' AND locked_at < $1 \
             ORDER BY locked_at ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(older_than)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stale_processing", e))?;

        rows.iter().map(job_from_row).collect()
    }
}

/// Map SQLx errors to `JobStoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => JobStoreError::Conflict(msg),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::RowNotFound => {
            JobStoreError::Storage(format!("unexpected row not found in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn parse_job_status(raw: &str) -> Result<JobStatus, JobStoreError> {
    raw.parse()
        .map_err(|e: playreport_core::DomainError| JobStoreError::Storage(e.to_string()))
}

fn parse_report_status(raw: &str) -> Result<ReportStatus, JobStoreError> {
    raw.parse()
        .map_err(|e: playreport_core::DomainError| JobStoreError::Storage(e.to_string()))
}

fn attempts_to_db(attempts: u32) -> i32 {
    i32::try_from(attempts).unwrap_or(i32::MAX)
}

fn attempts_from_db(attempts: i32) -> u32 {
    u32::try_from(attempts).unwrap_or(0)
}

// SQLx row types

#[derive(Debug)]
struct CandidateRow {
    job_id: Uuid,
    session_id: Uuid,
    attempts: i32,
    max_attempts: i32,
}

impl<'r> FromRow<'r, PgRow> for CandidateRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(CandidateRow {
            job_id: row.try_get("job_id")?,
            session_id: row.try_get("session_id")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
        })
    }
}

#[derive(Debug)]
struct JobRow {
    job_id: Uuid,
    session_id: Uuid,
    status: String,
    run_at: DateTime<Utc>,
    attempts: i32,
    max_attempts: i32,
    locked_at: Option<DateTime<Utc>>,
    locked_by: Option<String>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            job_id: row.try_get("job_id")?,
            session_id: row.try_get("session_id")?,
            status: row.try_get("status")?,
            run_at: row.try_get("run_at")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            locked_at: row.try_get("locked_at")?,
            locked_by: row.try_get("locked_by")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            job_id: JobId::from_uuid(row.job_id),
            session_id: SessionId::from_uuid(row.session_id),
            status: parse_job_status(&row.status)?,
            run_at: row.run_at,
            attempts: attempts_from_db(row.attempts),
            max_attempts: attempts_from_db(row.max_attempts),
            locked_at: row.locked_at,
            locked_by: row.locked_by,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, JobStoreError> {
    JobRow::from_row(row)
        .map_err(|e| JobStoreError::Storage(format!("failed to deserialize job row: {}", e)))?
        .try_into()
}

#[derive(Debug)]
struct ReportRow {
    session_id: Uuid,
    status: String,
    content_json: Option<JsonValue>,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for ReportRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(ReportRow {
            session_id: row.try_get("session_id")?,
            status: row.try_get("status")?,
            content_json: row.try_get("content_json")?,
            failure_reason: row.try_get("failure_reason")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}
