//! Core job types and the retry policy.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use playreport_core::{DomainError, JobId, SessionId};

/// Longest `last_error` / `failure_reason` kept in storage.
pub const MAX_ERROR_LEN: usize = 500;

/// Truncate a failure message to at most `max` characters (char-boundary safe).
pub fn truncate_error(message: &str, max: usize) -> String {
    message.chars().take(max).collect()
}

/// `report_jobs.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting for `run_at`, then claimable
    Queued,
    /// Claimed by a worker run
    Processing,
    /// Report written (or already present)
    Done,
    /// Retry budget exhausted
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Done => "DONE",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }

    /// Whether an enqueue may reset this job back to `QUEUED`.
    pub fn is_requeueable(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Failed)
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(JobStatus::Queued),
            "PROCESSING" => Ok(JobStatus::Processing),
            "DONE" => Ok(JobStatus::Done),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(DomainError::unknown_status(format!("job status {other:?}"))),
        }
    }
}

/// `ai_reports.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportStatus {
    Pending,
    Ready,
    Failed,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Pending => "PENDING",
            ReportStatus::Ready => "READY",
            ReportStatus::Failed => "FAILED",
        }
    }
}

impl FromStr for ReportStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(ReportStatus::Pending),
            "READY" => Ok(ReportStatus::Ready),
            "FAILED" => Ok(ReportStatus::Failed),
            other => Err(DomainError::unknown_status(format!("report status {other:?}"))),
        }
    }
}

/// One `report_jobs` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub session_id: SessionId,
    pub status: JobStatus,
    /// Not claimable before this instant
    pub run_at: DateTime<Utc>,
    /// Attempts made so far (starts at 0)
    pub attempts: u32,
    pub max_attempts: u32,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    /// Diagnostics only; never read for control flow
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// A fresh `QUEUED` job, eligible immediately.
    pub fn queued(session_id: SessionId, max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            job_id: JobId::new(),
            session_id,
            status: JobStatus::Queued,
            run_at: now,
            attempts: 0,
            max_attempts,
            locked_at: None,
            locked_by: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Claimable at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued && self.run_at <= now
    }

    /// Held by `claimant` right now.
    pub fn is_held_by(&self, claimant: &str) -> bool {
        self.status == JobStatus::Processing && self.locked_by.as_deref() == Some(claimant)
    }
}

/// One `ai_reports` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub session_id: SessionId,
    pub status: ReportStatus,
    /// Set only when `READY`
    pub content_json: Option<JsonValue>,
    /// Set only when `FAILED`
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Report {
    pub fn pending(session_id: SessionId, now: DateTime<Utc>) -> Self {
        Self {
            session_id,
            status: ReportStatus::Pending,
            content_json: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A job as handed to a worker by the claim protocol.
///
/// Carries the claimant identity; every outcome write is conditional on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedJob {
    pub job_id: JobId,
    pub session_id: SessionId,
    /// Attempts made before this one
    pub attempts: u32,
    pub max_attempts: u32,
    pub locked_by: String,
    pub locked_at: DateTime<Utc>,
}

/// What an enqueue call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "result", content = "status")]
pub enum EnqueueOutcome {
    /// New job row inserted
    Created,
    /// Existing `QUEUED`/`FAILED` job reset to `QUEUED`, due now
    Requeued,
    /// Existing `PROCESSING`/`DONE` job left as it was
    Unchanged(JobStatus),
}

/// Retry policy: exponential backoff with a cap.
///
/// `delay(n) = min(base_delay * 2^n, max_delay)` where `n` is the attempt
/// count *after* the failed attempt, so the first retry waits `2 * base_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempt ceiling stamped on newly enqueued jobs
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30 * 60),
        }
    }
}

/// Outcome of a failed attempt under a [`RetryPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to `QUEUED`, claimable again after `delay`
    Requeue { attempts: u32, delay: Duration },
    /// Terminal `FAILED`
    Fail { attempts: u32 },
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Backoff before the next attempt, given the post-increment attempt count.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let base_ms = self.base_delay.as_millis().min(u64::MAX as u128) as u64;
        let max_ms = self.max_delay.as_millis().min(u64::MAX as u128) as u64;

        let factor = 2_u64.checked_pow(attempts).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
    }

    /// Decide what happens after a failed attempt.
    ///
    /// `previous_attempts` is the job's count before the attempt that failed.
    pub fn decide(&self, previous_attempts: u32, max_attempts: u32) -> RetryDecision {
        let attempts = previous_attempts.saturating_add(1);
        if attempts >= max_attempts {
            RetryDecision::Fail { attempts }
        } else {
            RetryDecision::Requeue {
                attempts,
                delay: self.delay_for_attempt(attempts),
            }
        }
    }
}
