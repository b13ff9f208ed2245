use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured report content, stored verbatim in `ai_reports.content_json`.
///
/// Serialized camelCase; clients read this JSON directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportContent {
    pub summary_title: String,
    pub summary: String,
    pub highlights: Vec<String>,
    pub stats: ReportStats,
    pub recommendations: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportStats {
    pub duration_sec: f64,
    pub calories: Option<f64>,
    pub battery_delta: Option<f64>,
}

/// Why a generation attempt produced no content.
///
/// Every variant is retried the same way by the job pipeline; [`GenerateError::kind`]
/// exists for logs and diagnostics.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GenerateError {
    #[error("report generator is not configured: {0}")]
    Config(String),

    #[error("report generator API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("report generator request failed: {0}")]
    Transport(String),

    #[error("report generator returned an empty response")]
    EmptyResponse,

    #[error("report generator returned invalid JSON: {0}")]
    InvalidJson(String),
}

impl GenerateError {
    pub fn kind(&self) -> &'static str {
        match self {
            GenerateError::Config(_) => "config",
            GenerateError::Api { .. } => "api",
            GenerateError::Transport(_) => "transport",
            GenerateError::EmptyResponse => "empty_response",
            GenerateError::InvalidJson(_) => "invalid_json",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_serializes_camel_case() {
        let content = ReportContent {
            summary_title: "Zoomies!".to_string(),
            summary: "Great session.".to_string(),
            highlights: vec!["120 rolls".to_string()],
            stats: ReportStats {
                duration_sec: 300.0,
                calories: None,
                battery_delta: Some(-4.0),
            },
            recommendations: vec![],
            generated_at: Utc::now(),
        };

        let json = serde_json::to_value(&content).unwrap();
        assert_eq!(json["summaryTitle"], "Zoomies!");
        assert_eq!(json["stats"]["durationSec"], 300.0);
        assert!(json["stats"]["calories"].is_null());
        assert_eq!(json["stats"]["batteryDelta"], -4.0);
        assert!(json.get("generatedAt").is_some());
    }
}
