use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use playreport_core::SessionId;

/// Snapshot of one completed play session, as handed to a report generator.
///
/// Every measurement is optional: devices report partial data and the
/// generator must not invent values for what is missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionFacts {
    pub session_id: SessionId,
    pub user_id: String,
    pub device_id: String,
    /// Owner-chosen device name, when paired with one.
    pub device_nickname: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_sec: Option<i64>,
    pub calories: Option<f64>,
    pub battery_start: Option<f64>,
    pub battery_end: Option<f64>,
    /// Free-form device metrics (steps, rolls, distance, ...).
    pub metrics: Option<JsonValue>,
}

impl SessionFacts {
    /// Minimal facts for a session with no measurements yet.
    pub fn new(
        session_id: SessionId,
        user_id: impl Into<String>,
        device_id: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id,
            user_id: user_id.into(),
            device_id: device_id.into(),
            device_nickname: None,
            started_at,
            ended_at: None,
            duration_sec: None,
            calories: None,
            battery_start: None,
            battery_end: None,
            metrics: None,
        }
    }

    /// `battery_end - battery_start`, only when both readings exist.
    pub fn battery_delta(&self) -> Option<f64> {
        match (self.battery_start, self.battery_end) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// Display name for the device: nickname if set, raw id otherwise.
    pub fn device_label(&self) -> &str {
        self.device_nickname.as_deref().unwrap_or(&self.device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn battery_delta_requires_both_readings() {
        let mut facts = SessionFacts::new(SessionId::new(), "u1", "dev-1", Utc::now());
        assert_eq!(facts.battery_delta(), None);

        facts.battery_start = Some(90.0);
        assert_eq!(facts.battery_delta(), None);

        facts.battery_end = Some(72.5);
        assert_eq!(facts.battery_delta(), Some(-17.5));
    }

    #[test]
    fn device_label_prefers_nickname() {
        let mut facts = SessionFacts::new(SessionId::new(), "u1", "dev-1", Utc::now());
        assert_eq!(facts.device_label(), "dev-1");

        facts.device_nickname = Some("Bouncy".to_string());
        assert_eq!(facts.device_label(), "Bouncy");
    }
}
