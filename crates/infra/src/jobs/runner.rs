//! The run coordinator: one claim, one sequential pass, one summary.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use playreport_ai::ReportGenerator;
use playreport_core::{JobId, SessionId};

use crate::sessions::SessionFactsProvider;

use super::executor::{JobExecutor, JobOutcome, DEFAULT_GENERATOR_TIMEOUT};
use super::store::{JobStore, JobStoreError};
use super::types::{truncate_error, RetryPolicy};

/// Upper bound on jobs claimed by one run.
pub const MAX_BATCH_SIZE: usize = 10;

/// Longest per-job error carried in a run summary.
pub const DETAIL_ERROR_LEN: usize = 80;

/// Parameters of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    /// Jobs to claim; clamped to `1..=MAX_BATCH_SIZE`
    pub limit: usize,
    /// Claim and release without executing
    pub dry_run: bool,
    /// Claimant identity written to `locked_by`
    pub locked_by: String,
}

impl RunRequest {
    pub fn new(limit: usize, locked_by: impl Into<String>) -> Self {
        Self {
            limit,
            dry_run: false,
            locked_by: locked_by.into(),
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// `limit` after clamping.
    pub fn effective_limit(&self) -> usize {
        self.limit.clamp(1, MAX_BATCH_SIZE)
    }
}

/// Per-job status in a run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DetailStatus {
    Done,
    /// Failed attempt, retry scheduled
    Queued,
    /// Failed terminally, or the outcome could not be recorded
    Failed,
    DryRun,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDetail {
    pub job_id: JobId,
    pub session_id: SessionId,
    pub status: DetailStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate outcome of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub details: Vec<RunDetail>,
}

impl RunSummary {
    fn record(&mut self, job_id: JobId, session_id: SessionId, outcome: &JobOutcome) {
        let status = match outcome {
            JobOutcome::Completed | JobOutcome::AlreadyReady => DetailStatus::Done,
            JobOutcome::RetryScheduled { .. } => DetailStatus::Queued,
            JobOutcome::Failed { .. } | JobOutcome::Unrecorded { .. } => DetailStatus::Failed,
        };

        self.processed += 1;
        if outcome.is_success() {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.details.push(RunDetail {
            job_id,
            session_id,
            status,
            error: outcome
                .error()
                .map(|e| truncate_error(e, DETAIL_ERROR_LEN)),
        });
    }
}

/// Errors that abort a whole run.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("failed to claim report jobs: {0}")]
    Claim(#[source] JobStoreError),
    #[error("failed to release dry-run claim: {0}")]
    Release(#[source] JobStoreError),
}

/// Settings that shape every run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerSettings {
    pub retry_policy: RetryPolicy,
    pub generator_timeout: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            generator_timeout: DEFAULT_GENERATOR_TIMEOUT,
        }
    }
}

/// Processes batches of report jobs.
///
/// Holds no timers and no per-run state; any number of triggers may call
/// [`ReportJobRunner::run_jobs`] concurrently. The claim protocol keeps their
/// batches disjoint.
#[derive(Clone)]
pub struct ReportJobRunner {
    store: Arc<dyn JobStore>,
    executor: JobExecutor,
}

impl ReportJobRunner {
    pub fn new(
        store: Arc<dyn JobStore>,
        sessions: Arc<dyn SessionFactsProvider>,
        generator: Arc<dyn ReportGenerator>,
        settings: RunnerSettings,
    ) -> Self {
        let executor = JobExecutor::new(store.clone(), sessions, generator)
            .with_retry_policy(settings.retry_policy)
            .with_generator_timeout(settings.generator_timeout);
        Self { store, executor }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// `max_attempts` stamped on jobs enqueued through this runner's configuration.
    pub fn default_max_attempts(&self) -> u32 {
        self.executor.retry_policy().max_attempts
    }

    /// Claim up to `request.limit` due jobs and process them in claim order.
    pub async fn run_jobs(&self, request: RunRequest) -> Result<RunSummary, RunError> {
        let limit = request.effective_limit();
        let jobs = self
            .store
            .claim(limit, &request.locked_by)
            .await
            .map_err(RunError::Claim)?;

        let mut summary = RunSummary::default();
        if jobs.is_empty() {
            info!(locked_by = %request.locked_by, "no queued report jobs");
            return Ok(summary);
        }

        info!(
            locked_by = %request.locked_by,
            count = jobs.len(),
            dry_run = request.dry_run,
            "claimed report jobs"
        );

        if request.dry_run {
            for job in &jobs {
                summary.processed += 1;
                summary.details.push(RunDetail {
                    job_id: job.job_id,
                    session_id: job.session_id,
                    status: DetailStatus::DryRun,
                    error: None,
                });
            }
            let released = self.store.release(&jobs).await.map_err(RunError::Release)?;
            if usize::try_from(released).map_or(true, |released| released != jobs.len()) {
                warn!(
                    locked_by = %request.locked_by,
                    claimed = jobs.len(),
                    released,
                    "dry run released fewer jobs than it claimed"
                );
            }
            info!(locked_by = %request.locked_by, released, "dry run released claim");
            return Ok(summary);
        }

        for job in &jobs {
            let outcome = self.executor.execute(job).await;
            summary.record(job.job_id, job.session_id, &outcome);
        }

        info!(
            locked_by = %request.locked_by,
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "report job run finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::{JobStatus, ReportStatus};
    use crate::sessions::InMemorySessionFacts;
    use playreport_ai::{GenerateError, ScriptedReportGenerator, SessionFacts};

    struct Fixture {
        store: Arc<InMemoryJobStore>,
        sessions: Arc<InMemorySessionFacts>,
        generator: Arc<ScriptedReportGenerator>,
        runner: ReportJobRunner,
    }

    fn fixture(generator: ScriptedReportGenerator, settings: RunnerSettings) -> Fixture {
        let store = InMemoryJobStore::arc();
        let sessions = InMemorySessionFacts::arc();
        let generator = Arc::new(generator);
        let runner = ReportJobRunner::new(
            store.clone(),
            sessions.clone(),
            generator.clone(),
            settings,
        );
        Fixture {
            store,
            sessions,
            generator,
            runner,
        }
    }

    impl Fixture {
        async fn enqueue_session(&self) -> SessionId {
            let session_id = SessionId::new();
            self.sessions
                .insert(SessionFacts::new(session_id, "user-1", "ball-1", Utc::now()));
            self.store
                .enqueue(session_id, self.runner.default_max_attempts())
                .await
                .unwrap();
            session_id
        }
    }

    #[tokio::test]
    async fn end_to_end_success() {
        let f = fixture(ScriptedReportGenerator::succeeding(), RunnerSettings::default());
        let session_id = f.enqueue_session().await;

        let summary = f.runner.run_jobs(RunRequest::new(5, "cron")).await.unwrap();

        assert_eq!(summary.processed, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.details[0].status, DetailStatus::Done);
        assert_eq!(summary.details[0].session_id, session_id);
        assert!(summary.details[0].error.is_none());

        let job = f.store.job_for_session(session_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
        let report = f.store.report(session_id).await.unwrap().unwrap();
        assert_eq!(report.status, ReportStatus::Ready);
        assert!(report.content_json.is_some());
    }

    #[tokio::test]
    async fn dry_run_releases_claim_untouched() {
        let f = fixture(ScriptedReportGenerator::succeeding(), RunnerSettings::default());
        let mut before = Vec::new();
        for _ in 0..3 {
            let session_id = f.enqueue_session().await;
            before.push(f.store.job_for_session(session_id).await.unwrap().unwrap());
        }

        let summary = f
            .runner
            .run_jobs(RunRequest::new(10, "cron").dry_run(true))
            .await
            .unwrap();

        assert_eq!(summary.processed, 3);
        assert_eq!(summary.succeeded, 0);
        assert_eq!(summary.failed, 0);
        assert!(summary
            .details
            .iter()
            .all(|d| d.status == DetailStatus::DryRun));
        assert_eq!(f.generator.calls(), 0);

        for job in before {
            let after = f.store.job(job.job_id).await.unwrap().unwrap();
            assert_eq!(after.status, JobStatus::Queued);
            assert_eq!(after.attempts, job.attempts);
            assert_eq!(after.run_at, job.run_at);
            assert!(after.locked_by.is_none());
        }
    }

    #[tokio::test]
    async fn limit_is_clamped_to_batch_size() {
        let f = fixture(ScriptedReportGenerator::succeeding(), RunnerSettings::default());
        for _ in 0..12 {
            f.enqueue_session().await;
        }

        let summary = f.runner.run_jobs(RunRequest::new(50, "cron")).await.unwrap();
        assert_eq!(summary.processed, MAX_BATCH_SIZE);

        let summary = f.runner.run_jobs(RunRequest::new(0, "cron")).await.unwrap();
        assert_eq!(summary.processed, 1);
    }

    #[tokio::test]
    async fn empty_queue_yields_empty_summary() {
        let f = fixture(ScriptedReportGenerator::succeeding(), RunnerSettings::default());
        let summary = f.runner.run_jobs(RunRequest::new(3, "cron")).await.unwrap();
        assert_eq!(summary, RunSummary::default());
    }

    #[tokio::test]
    async fn always_failing_job_exhausts_and_is_never_claimed_again() {
        let settings = RunnerSettings {
            retry_policy: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
            },
            ..RunnerSettings::default()
        };
        let f = fixture(
            ScriptedReportGenerator::failing(GenerateError::Transport("connection reset".into())),
            settings,
        );
        let session_id = f.enqueue_session().await;

        let first = f.runner.run_jobs(RunRequest::new(1, "cron")).await.unwrap();
        assert_eq!(first.details[0].status, DetailStatus::Queued);
        assert_eq!(first.failed, 1);

        f.runner.run_jobs(RunRequest::new(1, "cron")).await.unwrap();
        let last = f.runner.run_jobs(RunRequest::new(1, "cron")).await.unwrap();
        assert_eq!(last.details[0].status, DetailStatus::Failed);

        let job = f.store.job_for_session(session_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 3);
        assert_eq!(
            f.store.report_status(session_id).await.unwrap(),
            Some(ReportStatus::Failed)
        );

        let after = f.runner.run_jobs(RunRequest::new(10, "cron")).await.unwrap();
        assert_eq!(after.processed, 0);
        assert_eq!(f.generator.calls(), 3);
    }

    #[tokio::test]
    async fn detail_errors_are_truncated() {
        let f = fixture(
            ScriptedReportGenerator::failing(GenerateError::InvalidJson("x".repeat(300))),
            RunnerSettings::default(),
        );
        f.enqueue_session().await;

        let summary = f.runner.run_jobs(RunRequest::new(1, "cron")).await.unwrap();
        let error = summary.details[0].error.as_deref().unwrap();
        assert_eq!(error.chars().count(), DETAIL_ERROR_LEN);
    }

    #[test]
    fn summary_serializes_camel_case_with_screaming_statuses() {
        let summary = RunSummary {
            processed: 1,
            succeeded: 0,
            failed: 0,
            details: vec![RunDetail {
                job_id: JobId::new(),
                session_id: SessionId::new(),
                status: DetailStatus::DryRun,
                error: None,
            }],
        };

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["details"][0]["status"], "DRY_RUN");
        assert!(json["details"][0].get("jobId").is_some());
        assert!(json["details"][0].get("error").is_none());
    }
}
