//! Executes one claimed report job and records its outcome.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use playreport_ai::{GenerateError, ReportGenerator};

use crate::sessions::{SessionFactsError, SessionFactsProvider};

use super::store::{JobStore, JobStoreError};
use super::types::{ClaimedJob, ReportStatus, RetryDecision, RetryPolicy};

/// Default bound on one generator call.
pub const DEFAULT_GENERATOR_TIMEOUT: Duration = Duration::from_secs(60);

/// Why one attempt failed. Every variant consumes retry budget the same way.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("report row not found")]
    ReportMissing,
    #[error("session not found")]
    SessionMissing,
    #[error(transparent)]
    Generate(#[from] GenerateError),
    #[error("report generation timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Facts(#[from] SessionFactsError),
    #[error("failed to encode report content: {0}")]
    Encode(String),
}

impl ExecutionError {
    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionError::ReportMissing => "report_missing",
            ExecutionError::SessionMissing => "session_missing",
            ExecutionError::Generate(err) => err.kind(),
            ExecutionError::Timeout(_) => "timeout",
            ExecutionError::Store(_) => "store",
            ExecutionError::Facts(_) => "facts",
            ExecutionError::Encode(_) => "encode",
        }
    }
}

/// What happened to a job after one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Report written `READY`, job `DONE`
    Completed,
    /// Report was already `READY`; job marked `DONE` without generating
    AlreadyReady,
    /// Attempt failed; job back to `QUEUED` until `run_at`
    RetryScheduled {
        attempts: u32,
        run_at: DateTime<Utc>,
        error: String,
    },
    /// Attempt failed and the budget is spent; job and report `FAILED`
    Failed { attempts: u32, error: String },
    /// The outcome could not be persisted; the job row is as the store left it
    Unrecorded { error: String },
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Completed | JobOutcome::AlreadyReady)
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            JobOutcome::Completed | JobOutcome::AlreadyReady => None,
            JobOutcome::RetryScheduled { error, .. }
            | JobOutcome::Failed { error, .. }
            | JobOutcome::Unrecorded { error } => Some(error),
        }
    }
}

enum Attempt {
    Generated,
    AlreadyReady,
}

/// Runs claimed jobs against a store, a facts source, and a report generator.
#[derive(Clone)]
pub struct JobExecutor {
    store: Arc<dyn JobStore>,
    sessions: Arc<dyn SessionFactsProvider>,
    generator: Arc<dyn ReportGenerator>,
    retry_policy: RetryPolicy,
    generator_timeout: Duration,
}

impl JobExecutor {
    pub fn new(
        store: Arc<dyn JobStore>,
        sessions: Arc<dyn SessionFactsProvider>,
        generator: Arc<dyn ReportGenerator>,
    ) -> Self {
        Self {
            store,
            sessions,
            generator,
            retry_policy: RetryPolicy::default(),
            generator_timeout: DEFAULT_GENERATOR_TIMEOUT,
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_generator_timeout(mut self, timeout: Duration) -> Self {
        self.generator_timeout = timeout;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Execute one claimed job and persist the result.
    ///
    /// Never returns an error: failures become a [`JobOutcome`] so one bad job
    /// cannot abort the batch it belongs to.
    pub async fn execute(&self, job: &ClaimedJob) -> JobOutcome {
        debug!(
            job_id = %job.job_id,
            session_id = %job.session_id,
            attempts = job.attempts,
            "executing report job"
        );

        let attempt = match self.attempt(job).await {
            Ok(attempt) => attempt,
            Err(err) => return self.record_failure(job, err).await,
        };

        let content = match attempt {
            Attempt::AlreadyReady => None,
            Attempt::Generated => match self.generate(job).await {
                Ok(content) => Some(content),
                Err(err) => return self.record_failure(job, err).await,
            },
        };
        let generated = content.is_some();

        match self.store.complete(job, content).await {
            Ok(()) if generated => {
                info!(job_id = %job.job_id, session_id = %job.session_id, "report job done");
                JobOutcome::Completed
            }
            Ok(()) => {
                info!(
                    job_id = %job.job_id,
                    session_id = %job.session_id,
                    "report already ready; job marked done"
                );
                JobOutcome::AlreadyReady
            }
            Err(err @ JobStoreError::LostClaim { .. }) => {
                error!(
                    job_id = %job.job_id,
                    session_id = %job.session_id,
                    error = %err,
                    "claim lost before report job completion"
                );
                JobOutcome::Unrecorded {
                    error: err.to_string(),
                }
            }
            // The claim is still ours; the attempt failed and goes through retry.
            Err(err) => self.record_failure(job, ExecutionError::Store(err)).await,
        }
    }

    /// Report-state check that runs before any generation.
    async fn attempt(&self, job: &ClaimedJob) -> Result<Attempt, ExecutionError> {
        match self.store.report_status(job.session_id).await? {
            None => Err(ExecutionError::ReportMissing),
            Some(ReportStatus::Ready) => Ok(Attempt::AlreadyReady),
            Some(_) => Ok(Attempt::Generated),
        }
    }

    async fn generate(&self, job: &ClaimedJob) -> Result<serde_json::Value, ExecutionError> {
        let facts = self
            .sessions
            .session_facts(job.session_id)
            .await?
            .ok_or(ExecutionError::SessionMissing)?;

        let content = tokio::time::timeout(self.generator_timeout, self.generator.generate(&facts))
            .await
            .map_err(|_| ExecutionError::Timeout(self.generator_timeout))??;

        serde_json::to_value(&content).map_err(|e| ExecutionError::Encode(e.to_string()))
    }

    async fn record_failure(&self, job: &ClaimedJob, err: ExecutionError) -> JobOutcome {
        let message = err.to_string();

        let recorded = match self.retry_policy.decide(job.attempts, job.max_attempts) {
            RetryDecision::Requeue { attempts, delay } => {
                let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                let run_at = Utc::now() + delay;
                self.store
                    .requeue(job, attempts, run_at, &message)
                    .await
                    .map(|()| {
                        warn!(
                            job_id = %job.job_id,
                            session_id = %job.session_id,
                            attempts,
                            max_attempts = job.max_attempts,
                            run_at = %run_at,
                            kind = err.kind(),
                            error = %message,
                            "report job retry scheduled"
                        );
                        JobOutcome::RetryScheduled {
                            attempts,
                            run_at,
                            error: message.clone(),
                        }
                    })
            }
            RetryDecision::Fail { attempts } => self
                .store
                .fail(job, attempts, &message)
                .await
                .map(|()| {
                    warn!(
                        job_id = %job.job_id,
                        session_id = %job.session_id,
                        attempts,
                        kind = err.kind(),
                        error = %message,
                        "report job failed (max attempts)"
                    );
                    JobOutcome::Failed {
                        attempts,
                        error: message.clone(),
                    }
                }),
        };

        recorded.unwrap_or_else(|store_err| {
            error!(
                job_id = %job.job_id,
                session_id = %job.session_id,
                error = %message,
                store_error = %store_err,
                "failed to record report job failure"
            );
            JobOutcome::Unrecorded {
                error: format!("{message} (not recorded: {store_err})"),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::{JobStatus, Report};
    use crate::sessions::InMemorySessionFacts;
    use playreport_ai::{ScriptedReportGenerator, SessionFacts};
    use playreport_core::SessionId;

    struct Harness {
        store: Arc<InMemoryJobStore>,
        sessions: Arc<InMemorySessionFacts>,
        generator: Arc<ScriptedReportGenerator>,
        executor: JobExecutor,
    }

    fn harness(generator: ScriptedReportGenerator) -> Harness {
        let store = InMemoryJobStore::arc();
        let sessions = InMemorySessionFacts::arc();
        let generator = Arc::new(generator);
        let executor = JobExecutor::new(store.clone(), sessions.clone(), generator.clone());
        Harness {
            store,
            sessions,
            generator,
            executor,
        }
    }

    impl Harness {
        async fn claimed_session(&self, max_attempts: u32) -> ClaimedJob {
            let session_id = SessionId::new();
            let mut facts = SessionFacts::new(session_id, "user-1", "ball-1", Utc::now());
            facts.duration_sec = Some(600);
            self.sessions.insert(facts);
            self.store.enqueue(session_id, max_attempts).await.unwrap();
            self.store.claim(1, "worker-test").await.unwrap().remove(0)
        }
    }

    #[tokio::test]
    async fn success_writes_report_and_marks_done() {
        let h = harness(ScriptedReportGenerator::succeeding());
        let job = h.claimed_session(5).await;

        assert_eq!(h.executor.execute(&job).await, JobOutcome::Completed);
        assert_eq!(h.generator.calls(), 1);

        let stored = h.store.job(job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Done);
        let report = h.store.report(job.session_id).await.unwrap().unwrap();
        assert_eq!(report.status, ReportStatus::Ready);
        assert_eq!(report.content_json.unwrap()["stats"]["durationSec"], 600.0);
    }

    #[tokio::test]
    async fn ready_report_short_circuits_without_generating() {
        let h = harness(ScriptedReportGenerator::succeeding());
        let job = h.claimed_session(5).await;

        let mut report = Report::pending(job.session_id, Utc::now());
        report.status = ReportStatus::Ready;
        report.content_json = Some(serde_json::json!({"summary": "earlier"}));
        h.store.insert_report(report).unwrap();

        assert_eq!(h.executor.execute(&job).await, JobOutcome::AlreadyReady);
        assert_eq!(h.generator.calls(), 0);
        assert_eq!(
            h.store.job(job.job_id).await.unwrap().unwrap().status,
            JobStatus::Done
        );
        let report = h.store.report(job.session_id).await.unwrap().unwrap();
        assert_eq!(report.content_json.unwrap()["summary"], "earlier");
    }

    #[tokio::test]
    async fn missing_session_schedules_first_retry_after_a_minute() {
        let h = harness(ScriptedReportGenerator::succeeding());
        let session_id = SessionId::new();
        h.store.enqueue(session_id, 5).await.unwrap();
        let job = h.store.claim(1, "worker-test").await.unwrap().remove(0);

        let before = Utc::now();
        let outcome = h.executor.execute(&job).await;

        let JobOutcome::RetryScheduled {
            attempts,
            run_at,
            error,
        } = outcome.clone()
        else {
            panic!("expected retry, got {outcome:?}");
        };
        assert_eq!(attempts, 1);
        assert_eq!(error, "session not found");
        assert!(run_at >= before + chrono::Duration::seconds(60));
        assert!(run_at <= Utc::now() + chrono::Duration::seconds(60));
        assert_eq!(h.generator.calls(), 0);

        let stored = h.store.job(job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(stored.last_error.as_deref(), Some("session not found"));
        assert_eq!(
            h.store.report_status(session_id).await.unwrap(),
            Some(ReportStatus::Pending)
        );
    }

    #[tokio::test]
    async fn missing_report_row_is_a_failed_attempt() {
        let h = harness(ScriptedReportGenerator::succeeding());
        let session_id = SessionId::new();
        h.store
            .insert_job(crate::jobs::types::Job::queued(session_id, 5, Utc::now()))
            .unwrap();
        let job = h.store.claim(1, "worker-test").await.unwrap().remove(0);

        let outcome = h.executor.execute(&job).await;
        assert_eq!(outcome.error(), Some("report row not found"));
        assert!(matches!(outcome, JobOutcome::RetryScheduled { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn generator_timeout_is_an_ordinary_failure() {
        let h = harness(
            ScriptedReportGenerator::succeeding().with_delay(Duration::from_millis(500)),
        );
        let executor = h
            .executor
            .clone()
            .with_generator_timeout(Duration::from_millis(20));
        let job = h.claimed_session(5).await;

        let outcome = executor.execute(&job).await;
        assert!(matches!(outcome, JobOutcome::RetryScheduled { attempts: 1, .. }));
        assert!(outcome.error().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn last_attempt_fails_job_and_report() {
        let h = harness(ScriptedReportGenerator::failing(GenerateError::Api {
            status: 500,
            body: "upstream down".to_string(),
        }));
        let job = h.claimed_session(1).await;

        let outcome = h.executor.execute(&job).await;
        assert!(matches!(outcome, JobOutcome::Failed { attempts: 1, .. }));

        let stored = h.store.job(job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        let report = h.store.report(job.session_id).await.unwrap().unwrap();
        assert_eq!(report.status, ReportStatus::Failed);
        assert!(report.failure_reason.unwrap().contains("upstream down"));
    }

    /// Fails the first `complete` with a storage error, then delegates.
    struct FlakyCompleteStore {
        inner: Arc<InMemoryJobStore>,
        failures_left: std::sync::Mutex<u32>,
    }

    #[async_trait::async_trait]
    impl JobStore for FlakyCompleteStore {
        async fn enqueue(
            &self,
            session_id: SessionId,
            max_attempts: u32,
        ) -> Result<crate::jobs::types::EnqueueOutcome, JobStoreError> {
            self.inner.enqueue(session_id, max_attempts).await
        }

        async fn claim(
            &self,
            limit: usize,
            locked_by: &str,
        ) -> Result<Vec<ClaimedJob>, JobStoreError> {
            self.inner.claim(limit, locked_by).await
        }

        async fn release(&self, jobs: &[ClaimedJob]) -> Result<u64, JobStoreError> {
            self.inner.release(jobs).await
        }

        async fn report_status(
            &self,
            session_id: SessionId,
        ) -> Result<Option<ReportStatus>, JobStoreError> {
            self.inner.report_status(session_id).await
        }

        async fn complete(
            &self,
            job: &ClaimedJob,
            content: Option<serde_json::Value>,
        ) -> Result<(), JobStoreError> {
            {
                let mut left = self.failures_left.lock().unwrap();
                if *left > 0 {
                    *left -= 1;
                    return Err(JobStoreError::Storage("connection reset".to_string()));
                }
            }
            self.inner.complete(job, content).await
        }

        async fn requeue(
            &self,
            job: &ClaimedJob,
            attempts: u32,
            run_at: DateTime<Utc>,
            error: &str,
        ) -> Result<(), JobStoreError> {
            self.inner.requeue(job, attempts, run_at, error).await
        }

        async fn fail(
            &self,
            job: &ClaimedJob,
            attempts: u32,
            reason: &str,
        ) -> Result<(), JobStoreError> {
            self.inner.fail(job, attempts, reason).await
        }

        async fn job(
            &self,
            job_id: playreport_core::JobId,
        ) -> Result<Option<crate::jobs::types::Job>, JobStoreError> {
            self.inner.job(job_id).await
        }

        async fn job_for_session(
            &self,
            session_id: SessionId,
        ) -> Result<Option<crate::jobs::types::Job>, JobStoreError> {
            self.inner.job_for_session(session_id).await
        }

        async fn report(&self, session_id: SessionId) -> Result<Option<Report>, JobStoreError> {
            self.inner.report(session_id).await
        }

        async fn stats(&self) -> Result<crate::jobs::store::JobStats, JobStoreError> {
            self.inner.stats().await
        }

        async fn stale_processing(
            &self,
            older_than: DateTime<Utc>,
        ) -> Result<Vec<crate::jobs::types::Job>, JobStoreError> {
            self.inner.stale_processing(older_than).await
        }
    }

    #[tokio::test]
    async fn storage_error_on_completion_schedules_retry() {
        let h = harness(ScriptedReportGenerator::succeeding());
        let flaky = Arc::new(FlakyCompleteStore {
            inner: h.store.clone(),
            failures_left: std::sync::Mutex::new(1),
        });
        let executor = JobExecutor::new(flaky, h.sessions.clone(), h.generator.clone());
        let job = h.claimed_session(5).await;

        let outcome = executor.execute(&job).await;
        assert!(matches!(outcome, JobOutcome::RetryScheduled { attempts: 1, .. }));
        assert!(outcome.error().unwrap().contains("connection reset"));

        let stored = h.store.job(job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(stored.attempts, 1);
        assert!(stored.locked_by.is_none());
        assert_eq!(
            h.store.report_status(job.session_id).await.unwrap(),
            Some(ReportStatus::Pending)
        );
    }

    #[tokio::test]
    async fn report_left_pending_state_is_a_failed_attempt() {
        let h = harness(ScriptedReportGenerator::succeeding());
        let job = h.claimed_session(5).await;

        // Report moved on underneath the claim; generation runs, the READY write conflicts.
        let mut report = h.store.report(job.session_id).await.unwrap().unwrap();
        report.status = ReportStatus::Failed;
        h.store.insert_report(report).unwrap();

        let outcome = h.executor.execute(&job).await;
        assert!(matches!(outcome, JobOutcome::RetryScheduled { attempts: 1, .. }));
        assert_eq!(
            h.store.job(job.job_id).await.unwrap().unwrap().status,
            JobStatus::Queued
        );
    }

    #[tokio::test]
    async fn lost_claim_is_reported_not_raised() {
        let h = harness(ScriptedReportGenerator::succeeding());
        let mut job = h.claimed_session(5).await;
        job.locked_by = "someone-else".to_string();

        let outcome = h.executor.execute(&job).await;
        assert!(matches!(outcome, JobOutcome::Unrecorded { .. }));
        assert!(!outcome.is_success());
        // The real claimant's row is untouched.
        let stored = h.store.job(job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Processing);
        assert_eq!(stored.attempts, 0);
    }
}
