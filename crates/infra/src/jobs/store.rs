//! Job storage: the `JobStore` contract and the in-memory implementation.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use playreport_core::{JobId, SessionId};

use super::types::{
    truncate_error, ClaimedJob, EnqueueOutcome, Job, JobStatus, Report, ReportStatus, MAX_ERROR_LEN,
};

/// Persistence for report jobs and the reports they populate.
///
/// Every outcome write (`complete`, `requeue`, `fail`, `release`) is conditional on the
/// job still being `PROCESSING` and held by the claimant recorded in the [`ClaimedJob`].
/// A write against a job the caller no longer holds returns [`JobStoreError::LostClaim`].
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Idempotently enqueue report generation for a session.
    async fn enqueue(
        &self,
        session_id: SessionId,
        max_attempts: u32,
    ) -> Result<EnqueueOutcome, JobStoreError>;

    /// Atomically claim up to `limit` due `QUEUED` jobs for `locked_by`, oldest first.
    async fn claim(&self, limit: usize, locked_by: &str) -> Result<Vec<ClaimedJob>, JobStoreError>;

    /// Hand claimed jobs back to the queue untouched (dry run). Returns rows released.
    async fn release(&self, jobs: &[ClaimedJob]) -> Result<u64, JobStoreError>;

    async fn report_status(
        &self,
        session_id: SessionId,
    ) -> Result<Option<ReportStatus>, JobStoreError>;

    /// Mark the job `DONE`; with `content`, also flip the report to `READY` in the same write.
    async fn complete(
        &self,
        job: &ClaimedJob,
        content: Option<JsonValue>,
    ) -> Result<(), JobStoreError>;

    /// Put the job back to `QUEUED`, eligible again at `run_at`.
    async fn requeue(
        &self,
        job: &ClaimedJob,
        attempts: u32,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), JobStoreError>;

    /// Terminally fail the job and its report.
    async fn fail(&self, job: &ClaimedJob, attempts: u32, reason: &str)
        -> Result<(), JobStoreError>;

    async fn job(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    async fn job_for_session(&self, session_id: SessionId) -> Result<Option<Job>, JobStoreError>;

    async fn report(&self, session_id: SessionId) -> Result<Option<Report>, JobStoreError>;

    /// Job counts per status.
    async fn stats(&self) -> Result<JobStats, JobStoreError>;

    /// `PROCESSING` jobs locked before `older_than`. Read-only.
    async fn stale_processing(&self, older_than: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    /// A conditional write matched no row for a reason other than a lost claim.
    #[error("conflict: {0}")]
    Conflict(String),
    /// The job is no longer `PROCESSING` under this claimant (released, finished, or reclaimed).
    #[error("job {job_id} is no longer held by {locked_by}")]
    LostClaim { job_id: JobId, locked_by: String },
    #[error("storage error: {0}")]
    Storage(String),
}

impl JobStoreError {
    pub(crate) fn not_held(job: &ClaimedJob) -> Self {
        Self::LostClaim {
            job_id: job.job_id,
            locked_by: job.locked_by.clone(),
        }
    }
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub queued: u64,
    pub processing: u64,
    pub done: u64,
    pub failed: u64,
}

impl JobStats {
    pub fn total(&self) -> u64 {
        self.queued + self.processing + self.done + self.failed
    }

    pub(crate) fn count(&mut self, status: JobStatus) {
        match status {
            JobStatus::Queued => self.queued += 1,
            JobStatus::Processing => self.processing += 1,
            JobStatus::Done => self.done += 1,
            JobStatus::Failed => self.failed += 1,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    /// Insertion order doubles as `created_at` order.
    jobs: Vec<Job>,
    reports: Vec<Report>,
}

impl State {
    fn job_mut(&mut self, job_id: JobId) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.job_id == job_id)
    }

    fn job_for_session_mut(&mut self, session_id: SessionId) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.session_id == session_id)
    }

    fn report_mut(&mut self, session_id: SessionId) -> Option<&mut Report> {
        self.reports.iter_mut().find(|r| r.session_id == session_id)
    }

    fn held_job_mut(&mut self, claimed: &ClaimedJob) -> Result<&mut Job, JobStoreError> {
        match self.job_mut(claimed.job_id) {
            Some(job) if job.is_held_by(&claimed.locked_by) => Ok(job),
            Some(_) => Err(JobStoreError::not_held(claimed)),
            None => Err(JobStoreError::NotFound(claimed.job_id)),
        }
    }
}

/// In-memory job store for tests/dev.
///
/// One mutex guards both tables, so every operation is atomic and claims are
/// mutually exclusive.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    state: Mutex<State>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Insert or replace a report row directly (test seeding).
    pub fn insert_report(&self, report: Report) -> Result<(), JobStoreError> {
        let mut state = self.lock()?;
        match state.report_mut(report.session_id) {
            Some(existing) => *existing = report,
            None => state.reports.push(report),
        }
        Ok(())
    }

    /// Insert or replace a job row directly (test seeding). No report row is created.
    pub fn insert_job(&self, job: Job) -> Result<(), JobStoreError> {
        let mut state = self.lock()?;
        match state.job_for_session_mut(job.session_id) {
            Some(existing) => *existing = job,
            None => state.jobs.push(job),
        }
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, JobStoreError> {
        self.state
            .lock()
            .map_err(|_| JobStoreError::Storage("in-memory job store lock poisoned".to_string()))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(
        &self,
        session_id: SessionId,
        max_attempts: u32,
    ) -> Result<EnqueueOutcome, JobStoreError> {
        let mut state = self.lock()?;
        let now = Utc::now();

        if state.report_mut(session_id).is_none() {
            state.reports.push(Report::pending(session_id, now));
        }

        let Some(job) = state.job_for_session_mut(session_id) else {
            state.jobs.push(Job::queued(session_id, max_attempts, now));
            return Ok(EnqueueOutcome::Created);
        };

        if !job.status.is_requeueable() {
            return Ok(EnqueueOutcome::Unchanged(job.status));
        }

        let was_failed = job.status == JobStatus::Failed;
        job.status = JobStatus::Queued;
        job.run_at = now;
        job.locked_at = None;
        job.locked_by = None;
        job.updated_at = now;
        if was_failed {
            job.attempts = 0;
            job.last_error = None;
            if let Some(report) = state.report_mut(session_id) {
                if report.status == ReportStatus::Failed {
                    report.status = ReportStatus::Pending;
                    report.failure_reason = None;
                    report.updated_at = now;
                }
            }
        }

        Ok(EnqueueOutcome::Requeued)
    }

    async fn claim(&self, limit: usize, locked_by: &str) -> Result<Vec<ClaimedJob>, JobStoreError> {
        let mut state = self.lock()?;
        let now = Utc::now();

        let mut due: Vec<&mut Job> = state.jobs.iter_mut().filter(|j| j.is_due(now)).collect();
        // Stable sort keeps insertion order for equal timestamps.
        due.sort_by_key(|j| j.created_at);

        let claimed = due
            .into_iter()
            .take(limit)
            .map(|job| {
                job.status = JobStatus::Processing;
                job.locked_at = Some(now);
                job.locked_by = Some(locked_by.to_string());
                job.updated_at = now;
                ClaimedJob {
                    job_id: job.job_id,
                    session_id: job.session_id,
                    attempts: job.attempts,
                    max_attempts: job.max_attempts,
                    locked_by: locked_by.to_string(),
                    locked_at: now,
                }
            })
            .collect();

        Ok(claimed)
    }

    async fn release(&self, jobs: &[ClaimedJob]) -> Result<u64, JobStoreError> {
        let mut state = self.lock()?;
        let now = Utc::now();

        let mut released = 0;
        for claimed in jobs {
            if let Some(job) = state.job_mut(claimed.job_id) {
                if job.is_held_by(&claimed.locked_by) {
                    job.status = JobStatus::Queued;
                    job.locked_at = None;
                    job.locked_by = None;
                    job.updated_at = now;
                    released += 1;
                }
            }
        }
        Ok(released)
    }

    async fn report_status(
        &self,
        session_id: SessionId,
    ) -> Result<Option<ReportStatus>, JobStoreError> {
        let mut state = self.lock()?;
        Ok(state.report_mut(session_id).map(|r| r.status))
    }

    async fn complete(
        &self,
        claimed: &ClaimedJob,
        content: Option<JsonValue>,
    ) -> Result<(), JobStoreError> {
        let mut state = self.lock()?;
        let now = Utc::now();

        // Validate both rows before touching either.
        state.held_job_mut(claimed)?;
        if content.is_some() {
            match state.report_mut(claimed.session_id) {
                Some(report) if report.status == ReportStatus::Pending => {}
                Some(report) => {
                    return Err(JobStoreError::Conflict(format!(
                        "report for session {} is {}",
                        claimed.session_id,
                        report.status.as_str()
                    )))
                }
                None => {
                    return Err(JobStoreError::Conflict(format!(
                        "report for session {} not found",
                        claimed.session_id
                    )))
                }
            }
        }

        if let Some(content) = content {
            if let Some(report) = state.report_mut(claimed.session_id) {
                report.status = ReportStatus::Ready;
                report.content_json = Some(content);
                report.updated_at = now;
            }
        }

        let job = state.held_job_mut(claimed)?;
        job.status = JobStatus::Done;
        job.updated_at = now;
        Ok(())
    }

    async fn requeue(
        &self,
        claimed: &ClaimedJob,
        attempts: u32,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), JobStoreError> {
        let mut state = self.lock()?;
        let job = state.held_job_mut(claimed)?;

        job.status = JobStatus::Queued;
        job.attempts = attempts;
        job.run_at = run_at;
        job.last_error = Some(truncate_error(error, MAX_ERROR_LEN));
        job.locked_at = None;
        job.locked_by = None;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn fail(
        &self,
        claimed: &ClaimedJob,
        attempts: u32,
        reason: &str,
    ) -> Result<(), JobStoreError> {
        let mut state = self.lock()?;
        let now = Utc::now();
        let reason = truncate_error(reason, MAX_ERROR_LEN);

        let job = state.held_job_mut(claimed)?;
        job.status = JobStatus::Failed;
        job.attempts = attempts;
        job.last_error = Some(reason.clone());
        job.updated_at = now;

        if let Some(report) = state.report_mut(claimed.session_id) {
            if report.status == ReportStatus::Pending {
                report.status = ReportStatus::Failed;
                report.failure_reason = Some(reason);
                report.updated_at = now;
            }
        }
        Ok(())
    }

    async fn job(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let mut state = self.lock()?;
        Ok(state.job_mut(job_id).map(|j| j.clone()))
    }

    async fn job_for_session(&self, session_id: SessionId) -> Result<Option<Job>, JobStoreError> {
        let mut state = self.lock()?;
        Ok(state.job_for_session_mut(session_id).map(|j| j.clone()))
    }

    async fn report(&self, session_id: SessionId) -> Result<Option<Report>, JobStoreError> {
        let mut state = self.lock()?;
        Ok(state.report_mut(session_id).map(|r| r.clone()))
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let state = self.lock()?;
        let mut stats = JobStats::default();
        for job in &state.jobs {
            stats.count(job.status);
        }
        Ok(stats)
    }

    async fn stale_processing(&self, older_than: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        let state = self.lock()?;
        Ok(state
            .jobs
            .iter()
            .filter(|j| {
                j.status == JobStatus::Processing && j.locked_at.is_some_and(|at| at < older_than)
            })
            .cloned()
            .collect())
    }
}
