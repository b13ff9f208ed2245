//! Report job queue: storage, claim protocol, execution, retry, and run coordination.
//!
//! ## Components
//!
//! - `JobStore`: persistence for `report_jobs` and `ai_reports` (Postgres or in-memory)
//! - `RetryPolicy`: capped exponential backoff and the requeue/fail decision
//! - `JobExecutor`: runs one claimed job and records its outcome
//! - `ReportJobRunner`: claims a batch and drives it through the executor

pub mod executor;
pub mod postgres;
pub mod runner;
pub mod store;
pub mod types;

pub use executor::{ExecutionError, JobExecutor, JobOutcome, DEFAULT_GENERATOR_TIMEOUT};
pub use postgres::PostgresJobStore;
pub use runner::{
    DetailStatus, ReportJobRunner, RunDetail, RunError, RunRequest, RunSummary, RunnerSettings,
    DETAIL_ERROR_LEN, MAX_BATCH_SIZE,
};
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{
    truncate_error, ClaimedJob, EnqueueOutcome, Job, JobStatus, Report, ReportStatus,
    RetryDecision, RetryPolicy, MAX_ERROR_LEN,
};
