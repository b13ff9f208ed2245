use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use playreport_core::SessionId;
use playreport_infra::jobs::{EnqueueOutcome, RunSummary, MAX_BATCH_SIZE};

/// Body of `POST /internal/jobs/run`. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunJobsBody {
    pub limit: Option<usize>,
    #[serde(default)]
    pub dry_run: bool,
}

impl RunJobsBody {
    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(MAX_BATCH_SIZE)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunJobsResponse {
    pub ran_at: DateTime<Utc>,
    pub dry_run: bool,
    #[serde(flatten)]
    pub summary: RunSummary,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueResponse {
    pub session_id: SessionId,
    #[serde(flatten)]
    pub outcome: EnqueueOutcome,
}
