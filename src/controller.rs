//! Capture controller
//!
//! Wraps the pure reducer with what needs memory across sessions: the
//! debounce gate, the single queued trigger, the sticky hardware fault and the
//! metrics collector. Driven by exactly one task (see `run_state_loop`).

use crate::config::ControllerConfig;
use crate::debounce::{Admission, AdmissionGate, Occupancy, RejectReason};
use crate::metrics::SessionMetrics;
use crate::sensor::DetectionEvent;
use crate::state_machine::{reduce, Effect, Event, FaultKind, RetryPolicy, State};
use crate::status::ControllerStatus;

/// Finished sessions included in each status snapshot.
const STATUS_HISTORY_LEN: usize = 10;

pub struct CaptureController {
    config: ControllerConfig,
    policy: RetryPolicy,
    state: State,
    gate: AdmissionGate,
    /// Trigger admitted while busy, serviced on the next return to Idle
    pending: Option<DetectionEvent>,
    last_event: Option<DetectionEvent>,
    /// Set once the sensor is lost; never cleared
    hardware_fault: Option<String>,
    metrics: SessionMetrics,
}

impl CaptureController {
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            policy: config.retry_policy(),
            gate: AdmissionGate::new(config.admission_policy()),
            config,
            state: State::Idle,
            pending: None,
            last_event: None,
            hardware_fault: None,
            metrics: SessionMetrics::new(),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn metrics(&self) -> &SessionMetrics {
        &self.metrics
    }

    /// Forget the queued trigger, if any. Used when the service is stopping.
    pub fn drop_pending(&mut self) {
        if let Some(trigger) = self.pending.take() {
            log::info!(
                "Dropping queued {} trigger (intensity={})",
                trigger.kind().as_str(),
                trigger.intensity()
            );
            self.metrics.trigger_rejected(RejectReason::Busy);
        }
    }

    /// Feed one event and return the effects to run.
    pub fn handle(&mut self, event: Event) -> Vec<Effect> {
        match event {
            Event::Detection(detection) => self.on_detection(detection),
            Event::SensorFault { err } => self.on_sensor_fault(err),
            other => self.apply(other),
        }
    }

    /// Projection of the current state for readers.
    pub fn status(&self) -> ControllerStatus {
        let (fault, error) = match &self.state {
            State::Error { fault, message, .. } => (Some(*fault), Some(message.clone())),
            _ => (None, None),
        };
        ControllerStatus {
            state: self.state.kind(),
            last_event: self.last_event.clone(),
            active_session_id: self.state.session().map(|s| s.id),
            uptime_secs: 0,
            fault,
            error,
            sensor_online: self.hardware_fault.is_none(),
            pending_trigger: self.pending.clone(),
            metrics: self.metrics.summary(),
            recent_sessions: self
                .metrics
                .history()
                .into_iter()
                .take(STATUS_HISTORY_LEN)
                .collect(),
        }
    }

    fn on_detection(&mut self, detection: DetectionEvent) -> Vec<Effect> {
        self.last_event = Some(detection.clone());

        let occupancy = if self.state.is_idle() {
            Occupancy::Idle
        } else {
            Occupancy::Busy {
                queue_free: self.pending.is_none(),
            }
        };

        match self.gate.evaluate(&detection, occupancy) {
            Admission::Start => self.apply(Event::Detection(detection)),
            Admission::Queue => {
                log::info!(
                    "Trigger queued while {} ({}, intensity={})",
                    self.state.kind().as_str(),
                    detection.kind().as_str(),
                    detection.intensity()
                );
                self.metrics.trigger_queued();
                self.pending = Some(detection);
                vec![Effect::EmitStatus]
            }
            Admission::Reject(reason) => {
                log::debug!(
                    "Trigger rejected ({}): {} intensity={}",
                    reason.as_str(),
                    detection.kind().as_str(),
                    detection.intensity()
                );
                self.metrics.trigger_rejected(reason);
                vec![Effect::EmitStatus]
            }
        }
    }

    fn on_sensor_fault(&mut self, err: String) -> Vec<Effect> {
        log::error!("Sensor lost: {}", err);
        self.metrics.record_error(&err);
        self.hardware_fault = Some(err.clone());

        if self.state.is_idle() {
            self.transition(State::hardware_fault(err));
        } else {
            log::warn!(
                "Sensor lost while {}; finishing current session first",
                self.state.kind().as_str()
            );
        }
        vec![Effect::EmitStatus]
    }

    fn apply(&mut self, event: Event) -> Vec<Effect> {
        let (next, mut effects) = reduce(&self.state, event, &self.policy);
        self.track_metrics(&next);
        self.transition(next);

        if self.state.is_idle() {
            if let Some(trigger) = self.pending.take() {
                log::info!("Servicing queued trigger");
                effects.extend(self.apply(Event::Detection(trigger)));
            } else if let Some(err) = self.hardware_fault.clone() {
                self.transition(State::hardware_fault(err));
                effects.push(Effect::EmitStatus);
            }
        }
        effects
    }

    fn transition(&mut self, next: State) {
        if self.state.kind() != next.kind() {
            log::info!(
                "State transition: {} -> {}",
                self.state.kind().as_str(),
                next.kind().as_str()
            );
        }
        self.state = next;
    }

    fn track_metrics(&mut self, next: &State) {
        match (&self.state, next) {
            (State::Recording { .. }, State::Recording { .. }) => {}
            (_, State::Recording { session, .. }) => self.metrics.session_started(session.id),

            (State::Rendering { .. }, State::Persisting { session, .. }) => {
                if let Some(err) = &session.error {
                    self.metrics.render_failed(err);
                }
                self.metrics.store_attempted();
            }
            (State::Error { retry: Some(_), .. }, State::Persisting { .. }) => {
                self.metrics.store_attempted();
            }

            (State::Persisting { .. }, State::Idle) => self.metrics.session_persisted(),
            (
                State::Persisting { .. },
                State::Error {
                    retry: Some(_),
                    message,
                    ..
                },
            ) => self.metrics.store_retry_scheduled(message),
            (State::Persisting { .. }, State::Error { fault, message, .. })
            | (State::Recording { .. }, State::Error { fault, message, .. }) => {
                self.metrics.session_failed(*fault, message)
            }

            (State::Recording { .. }, State::Idle) => self.metrics.session_cancelled(),
            (State::Error { retry: Some(_), .. }, State::Idle) => self
                .metrics
                .session_failed(FaultKind::StoreFault, "store retry cancelled"),
            _ => {}
        }
    }
}
