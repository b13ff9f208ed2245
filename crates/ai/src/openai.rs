//! Report generation through an OpenAI-compatible chat completions API.
//!
//! The model is asked for a strict JSON document; whatever comes back is
//! normalized against the session facts so that missing stats are filled from
//! measured values instead of being invented.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::facts::SessionFacts;
use crate::generator::ReportGenerator;
use crate::result::{GenerateError, ReportContent, ReportStats};

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

const ERROR_BODY_LIMIT: usize = 200;

const SYSTEM_PROMPT: &str = r#"You are an upbeat pet activity coach. You read the data of one play session and write a short, encouraging report for the pet owner.

OUTPUT RULES:
- Respond with a single JSON object and nothing else: no markdown, no code fences, no extra keys.
- Use exactly the schema below.
- Never make up statistics. When a value is unknown, use null.
- Refer to the animal as "pet" unless the session data names a species.

CONTENT:
- summaryTitle: short and positive, about six words at most.
- summary: two or three sentences: encouragement, then one insight grounded in the stats, then an optional safety or enrichment note.
- highlights: three to five facts taken from the session data (steps, rolls, distance...). Skip anything the data does not contain.
- recommendations: three to six items, each naming a concrete next action (frequency, duration, variety, environment) and a short reason tied to this session. Keep each under roughly 120 characters.

SCHEMA:
{
  "summaryTitle": "string",
  "summary": "string",
  "highlights": ["string"],
  "stats": {
    "durationSec": number,
    "calories": number|null,
    "batteryDelta": number|null
  },
  "recommendations": ["string"],
  "generatedAt": "ISO8601 string"
}

Very short sessions (under 30 seconds): focus on making play easy to start, frequent micro-sessions, novelty and owner engagement.
Medium or long sessions: focus on progression, variety, and rest.
A large battery drop: suggest a charging routine and shorter sessions."#;

/// Connection settings for an OpenAI-compatible endpoint.
#[derive(Clone)]
pub struct OpenAiConfig {
    /// Bearer token. `None` or blank makes every call fail with [`GenerateError::Config`].
    pub api_key: Option<String>,
    pub model: String,
    /// Base URL up to and including the version segment, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    /// Per-request HTTP timeout.
    pub request_timeout: Duration,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl fmt::Debug for OpenAiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// [`ReportGenerator`] backed by the chat completions API.
#[derive(Debug, Clone)]
pub struct OpenAiReportGenerator {
    config: OpenAiConfig,
    client: reqwest::Client,
}

impl OpenAiReportGenerator {
    pub fn new(config: OpenAiConfig) -> Result<Self, GenerateError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| GenerateError::Config(format!("http client: {e}")))?;
        Ok(Self { config, client })
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn api_key(&self) -> Result<&str, GenerateError> {
        self.config
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| GenerateError::Config("OPENAI_API_KEY is not set".to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[async_trait]
impl ReportGenerator for OpenAiReportGenerator {
    async fn generate(&self, facts: &SessionFacts) -> Result<ReportContent, GenerateError> {
        let api_key = self.api_key()?;

        let body = json!({
            "model": self.config.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": user_prompt(facts) },
            ],
            "response_format": { "type": "json_object" },
        });

        debug!(session_id = %facts.session_id, model = %self.config.model, "requesting report");

        let res = self
            .client
            .post(self.chat_url())
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerateError::Transport(e.to_string()))?;

        let status = res.status();
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            return Err(GenerateError::Api {
                status: status.as_u16(),
                body: text.chars().take(ERROR_BODY_LIMIT).collect(),
            });
        }

        let data: ChatResponse = res
            .json()
            .await
            .map_err(|e| GenerateError::InvalidJson(format!("response envelope: {e}")))?;

        let content = data
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(GenerateError::EmptyResponse)?;

        parse_report_content(&content, facts, Utc::now())
    }
}

/// The user message: session values only, `N/A` for anything unmeasured.
pub fn user_prompt(facts: &SessionFacts) -> String {
    fn or_na<T: ToString>(value: Option<T>) -> String {
        value.map(|v| v.to_string()).unwrap_or_else(|| "N/A".to_string())
    }

    let metrics = facts
        .metrics
        .clone()
        .unwrap_or_else(|| Value::Object(Map::new()));

    format!(
        "Session data:\n\
         - Session ID: {}\n\
         - Device: {}\n\
         - Started: {}\n\
         - Ended: {}\n\
         - Duration (sec): {}\n\
         - Calories: {}\n\
         - Battery start: {}\n\
         - Battery end: {}\n\
         - Battery delta: {}\n\
         - Metrics: {}\n\n\
         Use only the values above. Any stat marked N/A must be null in stats. Generate the report JSON.",
        facts.session_id,
        facts.device_label(),
        facts.started_at.to_rfc3339(),
        or_na(facts.ended_at.map(|t| t.to_rfc3339())),
        or_na(facts.duration_sec),
        or_na(facts.calories),
        or_na(facts.battery_start),
        or_na(facts.battery_end),
        or_na(facts.battery_delta()),
        metrics,
    )
}

/// Parse and normalize the model's JSON answer.
///
/// Unknown or mistyped fields fall back to empty values; stats fall back to
/// the session's own measurements; a missing or unparseable `generatedAt`
/// becomes `now`.
pub fn parse_report_content(
    raw: &str,
    facts: &SessionFacts,
    now: DateTime<Utc>,
) -> Result<ReportContent, GenerateError> {
    let parsed: Value =
        serde_json::from_str(raw).map_err(|e| GenerateError::InvalidJson(e.to_string()))?;
    let empty = Map::new();
    let obj = parsed.as_object().unwrap_or(&empty);
    let stats = obj.get("stats").and_then(Value::as_object).unwrap_or(&empty);

    let number = |key: &str| stats.get(key).and_then(Value::as_f64);

    Ok(ReportContent {
        summary_title: string_field(obj, "summaryTitle"),
        summary: string_field(obj, "summary"),
        highlights: string_list(obj, "highlights"),
        stats: ReportStats {
            duration_sec: number("durationSec")
                .or(facts.duration_sec.map(|d| d as f64))
                .unwrap_or(0.0),
            calories: number("calories").or(facts.calories),
            battery_delta: number("batteryDelta").or_else(|| facts.battery_delta()),
        },
        recommendations: string_list(obj, "recommendations"),
        generated_at: obj
            .get("generatedAt")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or(now),
    })
}

fn string_field(obj: &Map<String, Value>, key: &str) -> String {
    obj.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn string_list(obj: &Map<String, Value>, key: &str) -> Vec<String> {
    obj.get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
