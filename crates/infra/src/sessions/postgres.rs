use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{postgres::PgRow, FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use playreport_ai::SessionFacts;
use playreport_core::SessionId;

use super::{SessionFactsError, SessionFactsProvider};

/// Reads `play_sessions`, joined with `user_devices` for the device nickname.
///
/// Identifier and numeric columns are cast in SQL so the row decodes the same
/// whether the schema stores them as text/uuid or integer/numeric.
#[derive(Debug, Clone)]
pub struct PostgresSessionFacts {
    pool: Arc<PgPool>,
}

impl PostgresSessionFacts {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl SessionFactsProvider for PostgresSessionFacts {
    #[instrument(skip(self), fields(session_id = %session_id), err)]
    async fn session_facts(
        &self,
        session_id: SessionId,
    ) -> Result<Option<SessionFacts>, SessionFactsError> {
        let row = sqlx::query(
            r#"
            SELECT
                s.session_id,
                s.user_id::text AS user_id,
                s.device_id::text AS device_id,
                s.started_at,
                s.ended_at,
                s.duration_sec::int8 AS duration_sec,
                s.calories::float8 AS calories,
                s.battery_start::float8 AS battery_start,
                s.battery_end::float8 AS battery_end,
                s.metrics_json::jsonb AS metrics_json,
                ud.nickname
            FROM play_sessions s
            LEFT JOIN user_devices ud
                ON ud.user_id = s.user_id AND ud.device_id = s.device_id
            WHERE s.session_id = $1
            "#,
        )
        .bind(session_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| SessionFactsError::Storage(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let row = SessionRow::from_row(&row)
            .map_err(|e| SessionFactsError::Storage(format!("failed to decode session row: {e}")))?;
        Ok(Some(row.into()))
    }
}

#[derive(Debug)]
struct SessionRow {
    session_id: Uuid,
    user_id: String,
    device_id: String,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    duration_sec: Option<i64>,
    calories: Option<f64>,
    battery_start: Option<f64>,
    battery_end: Option<f64>,
    metrics_json: Option<JsonValue>,
    nickname: Option<String>,
}

impl<'r> FromRow<'r, PgRow> for SessionRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(SessionRow {
            session_id: row.try_get("session_id")?,
            user_id: row.try_get("user_id")?,
            device_id: row.try_get("device_id")?,
            started_at: row.try_get("started_at")?,
            ended_at: row.try_get("ended_at")?,
            duration_sec: row.try_get("duration_sec")?,
            calories: row.try_get("calories")?,
            battery_start: row.try_get("battery_start")?,
            battery_end: row.try_get("battery_end")?,
            metrics_json: row.try_get("metrics_json")?,
            nickname: row.try_get("nickname")?,
        })
    }
}

impl From<SessionRow> for SessionFacts {
    fn from(row: SessionRow) -> Self {
        SessionFacts {
            session_id: SessionId::from_uuid(row.session_id),
            user_id: row.user_id,
            device_id: row.device_id,
            device_nickname: row.nickname,
            started_at: row.started_at,
            ended_at: row.ended_at,
            duration_sec: row.duration_sec,
            calories: row.calories,
            battery_start: row.battery_start,
            battery_end: row.battery_end,
            metrics: row.metrics_json,
        }
    }
}
