//! Read-only status surface
//!
//! The controller publishes a [`ControllerStatus`] after every transition. Readers
//! hold a [`StatusHandle`] and only ever see the latest committed snapshot, so a
//! status query never waits on the controller.

use std::time::Instant;

use serde::Serialize;
use tokio::sync::watch;
use uuid::Uuid;

use crate::logging::{LogBuffer, LogLine};
use crate::metrics::{MetricsSummary, SessionSummary};
use crate::sensor::DetectionEvent;
use crate::state_machine::{FaultKind, StateKind};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerStatus {
    pub state: StateKind,
    pub last_event: Option<DetectionEvent>,
    pub active_session_id: Option<Uuid>,
    /// Filled in by [`StatusHandle::snapshot`].
    pub uptime_secs: u64,
    pub fault: Option<FaultKind>,
    pub error: Option<String>,
    pub sensor_online: bool,
    pub pending_trigger: Option<DetectionEvent>,
    pub metrics: MetricsSummary,
    pub recent_sessions: Vec<SessionSummary>,
}

impl Default for ControllerStatus {
    fn default() -> Self {
        Self {
            state: StateKind::Idle,
            last_event: None,
            active_session_id: None,
            uptime_secs: 0,
            fault: None,
            error: None,
            sensor_online: true,
            pending_trigger: None,
            metrics: MetricsSummary::default(),
            recent_sessions: Vec::new(),
        }
    }
}

/// Writer side, owned by the state loop.
pub struct StatusPublisher {
    tx: watch::Sender<ControllerStatus>,
}

impl StatusPublisher {
    pub fn publish(&self, status: ControllerStatus) {
        // send_replace never fails, even with every reader gone
        self.tx.send_replace(status);
    }
}

/// Reader side. Cheap to clone and safe to query from any thread.
#[derive(Clone)]
pub struct StatusHandle {
    rx: watch::Receiver<ControllerStatus>,
    started: Instant,
    logs: LogBuffer,
}

impl StatusHandle {
    /// Latest committed snapshot with current uptime.
    pub fn snapshot(&self) -> ControllerStatus {
        let mut status = self.rx.borrow().clone();
        status.uptime_secs = self.started.elapsed().as_secs();
        status
    }

    pub fn snapshot_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.snapshot())
    }

    /// Most recent log lines, oldest first.
    pub fn log_tail(&self, n: usize) -> Vec<LogLine> {
        self.logs.tail(n)
    }

    /// Wait for the next published snapshot. Returns false once the publisher is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

pub fn status_channel(logs: LogBuffer) -> (StatusPublisher, StatusHandle) {
    let (tx, rx) = watch::channel(ControllerStatus::default());
    (
        StatusPublisher { tx },
        StatusHandle {
            rx,
            started: Instant::now(),
            logs,
        },
    )
}
