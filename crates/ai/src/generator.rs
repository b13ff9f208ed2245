use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::facts::SessionFacts;
use crate::result::{GenerateError, ReportContent, ReportStats};

/// Produces report content for one session.
///
/// Implementations are slow, fallible, and usually rate-limited. Callers bound
/// every call with a timeout and treat any error as a failed attempt.
#[async_trait]
pub trait ReportGenerator: Send + Sync + 'static {
    async fn generate(&self, facts: &SessionFacts) -> Result<ReportContent, GenerateError>;
}

#[derive(Debug)]
enum Fallback {
    Summarize,
    Fail(GenerateError),
}

/// Deterministic generator for tests/dev.
///
/// Scripted results are consumed first, in push order; once the script is
/// empty every call gets the fallback (a summary built from the facts, or a
/// fixed error). Counts every invocation.
#[derive(Debug)]
pub struct ScriptedReportGenerator {
    script: Mutex<VecDeque<Result<ReportContent, GenerateError>>>,
    fallback: Fallback,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedReportGenerator {
    pub fn succeeding() -> Self {
        Self::with_fallback(Fallback::Summarize)
    }

    pub fn failing(error: GenerateError) -> Self {
        Self::with_fallback(Fallback::Fail(error))
    }

    fn with_fallback(fallback: Fallback) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Sleep this long before answering (exercises caller timeouts).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue one result for the next unscripted call.
    pub fn push(&self, result: Result<ReportContent, GenerateError>) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(result);
    }

    /// Number of `generate` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The content returned by the summarizing fallback.
    pub fn summarize(facts: &SessionFacts) -> ReportContent {
        let duration = facts.duration_sec.unwrap_or(0);
        ReportContent {
            summary_title: "Play session recap".to_string(),
            summary: format!("{} played for {} seconds.", facts.device_label(), duration),
            highlights: vec![format!("Session length: {duration}s")],
            stats: ReportStats {
                duration_sec: duration as f64,
                calories: facts.calories,
                battery_delta: facts.battery_delta(),
            },
            recommendations: vec!["Keep sessions short and frequent.".to_string()],
            generated_at: Utc::now(),
        }
    }
}

#[async_trait]
impl ReportGenerator for ScriptedReportGenerator {
    async fn generate(&self, facts: &SessionFacts) -> Result<ReportContent, GenerateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        if let Some(result) = scripted {
            return result;
        }

        match &self.fallback {
            Fallback::Summarize => Ok(Self::summarize(facts)),
            Fallback::Fail(err) => Err(err.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use playreport_core::SessionId;

    fn facts() -> SessionFacts {
        let mut facts = SessionFacts::new(SessionId::new(), "u1", "dev-1", Utc::now());
        facts.duration_sec = Some(42);
        facts
    }

    #[tokio::test]
    async fn script_is_consumed_before_fallback() {
        let generator = ScriptedReportGenerator::succeeding();
        generator.push(Err(GenerateError::EmptyResponse));

        let first = generator.generate(&facts()).await;
        assert_eq!(first.unwrap_err(), GenerateError::EmptyResponse);

        let second = generator.generate(&facts()).await.unwrap();
        assert_eq!(second.stats.duration_sec, 42.0);
        assert_eq!(generator.calls(), 2);
    }

    #[tokio::test]
    async fn failing_generator_always_errors() {
        let generator = ScriptedReportGenerator::failing(GenerateError::Transport("down".into()));
        for _ in 0..3 {
            assert!(generator.generate(&facts()).await.is_err());
        }
        assert_eq!(generator.calls(), 3);
    }
}
