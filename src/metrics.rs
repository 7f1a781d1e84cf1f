//! Session metrics
//!
//! Tracks outcome counters and a bounded history of recent capture sessions.
//! Used for the status snapshot and diagnostics.

use std::collections::VecDeque;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::debounce::RejectReason;
use crate::state_machine::FaultKind;

/// Maximum number of finished sessions to retain in history
const MAX_SESSION_HISTORY: usize = 50;

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    Persisted,
    /// Persisted, but the waveform could not be rendered
    PersistedWithoutWaveform,
    Failed,
    /// Store retries exhausted, record lost
    Abandoned,
    Cancelled,
}

/// Metrics for a finished session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub total_ms: u64,
    pub outcome: SessionOutcome,
    pub store_attempts: u32,
    pub error_message: Option<String>,
}

/// Counters across the process lifetime
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSummary {
    pub sessions_started: u64,
    pub sessions_persisted: u64,
    pub sessions_failed: u64,
    pub sessions_abandoned: u64,
    pub sessions_cancelled: u64,
    pub render_failures: u64,
    pub store_retries: u64,
    pub triggers_queued: u64,
    pub triggers_dropped: u64,
    pub noise_events: u64,
    pub last_error: Option<String>,
}

/// Internal state for tracking an in-progress session
struct SessionInProgress {
    session_id: Uuid,
    started_at: Instant,
    started_at_utc: DateTime<Utc>,
    store_attempts: u32,
    render_failed: bool,
}

/// Collects counters and history for capture sessions
pub struct SessionMetrics {
    /// History of finished sessions (newest first)
    history: VecDeque<SessionSummary>,
    current: Option<SessionInProgress>,
    summary: MetricsSummary,
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(MAX_SESSION_HISTORY),
            current: None,
            summary: MetricsSummary::default(),
        }
    }

    /// Start tracking a new session
    ///
    /// An in-progress session still open at this point is recorded as failed
    /// (this indicates a controller bug).
    pub fn session_started(&mut self, session_id: Uuid) {
        if let Some(old) = self.current.take() {
            log::warn!(
                "Metrics: discarding in-progress session {} to start {}",
                old.session_id,
                session_id
            );
            self.finish(
                old,
                SessionOutcome::Failed,
                Some("Discarded: new session started".to_string()),
            );
        }

        self.current = Some(SessionInProgress {
            session_id,
            started_at: Instant::now(),
            started_at_utc: Utc::now(),
            store_attempts: 0,
            render_failed: false,
        });
        self.summary.sessions_started += 1;
    }

    pub fn store_attempted(&mut self) {
        if let Some(ref mut current) = self.current {
            current.store_attempts += 1;
        }
    }

    pub fn store_retry_scheduled(&mut self, error: &str) {
        self.summary.store_retries += 1;
        self.summary.last_error = Some(error.to_string());
    }

    pub fn render_failed(&mut self, error: &str) {
        if let Some(ref mut current) = self.current {
            current.render_failed = true;
        }
        self.summary.render_failures += 1;
        self.summary.last_error = Some(error.to_string());
    }

    pub fn session_persisted(&mut self) {
        if let Some(current) = self.current.take() {
            let outcome = if current.render_failed {
                SessionOutcome::PersistedWithoutWaveform
            } else {
                SessionOutcome::Persisted
            };
            self.summary.sessions_persisted += 1;
            self.finish(current, outcome, None);
        }
    }

    pub fn session_failed(&mut self, fault: FaultKind, error: &str) {
        let outcome = match fault {
            FaultKind::StoreFault => {
                self.summary.sessions_abandoned += 1;
                SessionOutcome::Abandoned
            }
            _ => {
                self.summary.sessions_failed += 1;
                SessionOutcome::Failed
            }
        };
        self.summary.last_error = Some(error.to_string());
        if let Some(current) = self.current.take() {
            self.finish(current, outcome, Some(error.to_string()));
        }
    }

    /// Record an error not tied to a session (e.g. the sensor dropping out)
    pub fn record_error(&mut self, error: &str) {
        self.summary.last_error = Some(error.to_string());
    }

    pub fn session_cancelled(&mut self) {
        if let Some(current) = self.current.take() {
            self.summary.sessions_cancelled += 1;
            self.finish(current, SessionOutcome::Cancelled, None);
        }
    }

    pub fn trigger_queued(&mut self) {
        self.summary.triggers_queued += 1;
    }

    pub fn trigger_rejected(&mut self, reason: RejectReason) {
        match reason {
            RejectReason::Noise => self.summary.noise_events += 1,
            _ => self.summary.triggers_dropped += 1,
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        self.summary.clone()
    }

    /// Get the session history (newest first)
    pub fn history(&self) -> Vec<SessionSummary> {
        self.history.iter().cloned().collect()
    }

    fn finish(
        &mut self,
        session: SessionInProgress,
        outcome: SessionOutcome,
        error_message: Option<String>,
    ) {
        let summary = SessionSummary {
            session_id: session.session_id,
            started_at: session.started_at_utc,
            total_ms: session.started_at.elapsed().as_millis() as u64,
            outcome,
            store_attempts: session.store_attempts,
            error_message,
        };
        log::debug!(
            "Metrics: session {} finished {:?} after {}ms",
            summary.session_id,
            summary.outcome,
            summary.total_ms
        );

        // Add to front (newest first)
        self.history.push_front(summary);

        // Trim if over limit
        while self.history.len() > MAX_SESSION_HISTORY {
            self.history.pop_back();
        }
    }
}

impl Default for SessionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_collector_is_empty() {
        let metrics = SessionMetrics::new();
        assert_eq!(metrics.summary(), MetricsSummary::default());
        assert!(metrics.history().is_empty());
    }

    #[test]
    fn test_persisted_session_tracking() {
        let mut metrics = SessionMetrics::new();
        metrics.session_started(Uuid::new_v4());
        metrics.store_attempted();
        metrics.session_persisted();

        let summary = metrics.summary();
        assert_eq!(summary.sessions_started, 1);
        assert_eq!(summary.sessions_persisted, 1);
        let history = metrics.history();
        assert_eq!(history[0].outcome, SessionOutcome::Persisted);
        assert_eq!(history[0].store_attempts, 1);
    }

    #[test]
    fn test_render_failure_marks_outcome() {
        let mut metrics = SessionMetrics::new();
        metrics.session_started(Uuid::new_v4());
        metrics.render_failed("bad header");
        metrics.session_persisted();

        assert_eq!(metrics.summary().render_failures, 1);
        assert_eq!(
            metrics.history()[0].outcome,
            SessionOutcome::PersistedWithoutWaveform
        );
    }

    #[test]
    fn test_store_fault_counts_as_abandoned() {
        let mut metrics = SessionMetrics::new();
        metrics.session_started(Uuid::new_v4());
        metrics.session_failed(FaultKind::StoreFault, "disk full");

        let summary = metrics.summary();
        assert_eq!(summary.sessions_abandoned, 1);
        assert_eq!(summary.sessions_failed, 0);
        assert_eq!(summary.last_error.as_deref(), Some("disk full"));
    }

    #[test]
    fn test_trigger_counters() {
        let mut metrics = SessionMetrics::new();
        metrics.trigger_rejected(RejectReason::Noise);
        metrics.trigger_rejected(RejectReason::Cooldown);
        metrics.trigger_queued();

        let summary = metrics.summary();
        assert_eq!(summary.noise_events, 1);
        assert_eq!(summary.triggers_dropped, 1);
        assert_eq!(summary.triggers_queued, 1);
    }

    #[test]
    fn test_history_limit() {
        let mut metrics = SessionMetrics::new();
        for _ in 0..(MAX_SESSION_HISTORY + 10) {
            metrics.session_started(Uuid::new_v4());
            metrics.session_persisted();
        }
        assert_eq!(metrics.history().len(), MAX_SESSION_HISTORY);
        assert_eq!(
            metrics.summary().sessions_persisted,
            (MAX_SESSION_HISTORY + 10) as u64
        );
    }
}
