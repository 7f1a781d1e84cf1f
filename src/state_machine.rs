//! State machine for the capture lifecycle
//!
//! This module implements the core state machine using a single-writer pattern.
//! All lifecycle transitions go through the `reduce()` function, which returns
//! a new state and a list of effects to execute. Trigger admission (debounce,
//! busy queueing) happens before an event reaches the reducer; see
//! `controller.rs`.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Serialize;
use uuid::Uuid;

use crate::sensor::{DetectionEvent, DetectionKind};
use crate::session::{CaptureSession, EventRecord, Recording};

/// Upper bound for a single retry delay.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Fault taxonomy shown in status and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Sensor unreadable; terminal until restart.
    HardwareFault,
    /// Audio device or file I/O failure.
    CaptureFault,
    /// Waveform generation failure; never fatal to a record.
    RenderFault,
    /// Database write failure.
    StoreFault,
}

impl FaultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultKind::HardwareFault => "hardware",
            FaultKind::CaptureFault => "capture",
            FaultKind::RenderFault => "render",
            FaultKind::StoreFault => "store",
        }
    }
}

/// Store write waiting to be attempted again.
#[derive(Debug, Clone)]
pub struct PendingRetry {
    pub session: CaptureSession,
    pub record: EventRecord,
    pub next_attempt: u32,
}

/// Internal state of the capture workflow.
/// This is the authoritative state - all transitions go through the reducer.
#[derive(Debug, Clone)]
pub enum State {
    Idle,
    Recording {
        session: CaptureSession,
        started_at: Instant,
    },
    Rendering {
        session: CaptureSession,
        recording: Recording,
    },
    Persisting {
        session: CaptureSession,
        record: EventRecord,
        attempt: u32,
    },
    Error {
        fault: FaultKind,
        message: String,
        /// Matches the `RecoveryDue` that will bring us back to Idle.
        token: Uuid,
        session_id: Option<Uuid>,
        retry: Option<PendingRetry>,
    },
}

impl Default for State {
    fn default() -> Self {
        State::Idle
    }
}

/// Flat view of [`State`] for status and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    Idle,
    Recording,
    Rendering,
    Persisting,
    Error,
}

impl StateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateKind::Idle => "idle",
            StateKind::Recording => "recording",
            StateKind::Rendering => "rendering",
            StateKind::Persisting => "persisting",
            StateKind::Error => "error",
        }
    }
}

impl State {
    pub fn kind(&self) -> StateKind {
        match self {
            State::Idle => StateKind::Idle,
            State::Recording { .. } => StateKind::Recording,
            State::Rendering { .. } => StateKind::Rendering,
            State::Persisting { .. } => StateKind::Persisting,
            State::Error { .. } => StateKind::Error,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, State::Idle)
    }

    /// Session currently owned by the controller, if any.
    pub fn session(&self) -> Option<&CaptureSession> {
        match self {
            State::Recording { session, .. }
            | State::Rendering { session, .. }
            | State::Persisting { session, .. } => Some(session),
            State::Error {
                retry: Some(retry), ..
            } => Some(&retry.session),
            State::Idle | State::Error { .. } => None,
        }
    }

    pub fn session_id(&self) -> Option<Uuid> {
        match self {
            State::Error { session_id, .. } => *session_id,
            other => other.session().map(|s| s.id),
        }
    }

    /// Terminal error state after the sensor is lost. No recovery is scheduled.
    pub fn hardware_fault(message: String) -> Self {
        State::Error {
            fault: FaultKind::HardwareFault,
            message,
            token: Uuid::new_v4(),
            session_id: None,
            retry: None,
        }
    }
}

/// Events that can trigger state transitions.
/// These are sent from the sensor pump, the effect runner, and the operator.
#[derive(Debug, Clone)]
pub enum Event {
    /// Decoded sensor report (admission is decided by the controller)
    Detection(DetectionEvent),
    /// The sensor source failed for good
    SensorFault {
        err: String,
    },

    // Audio events
    RecordingOk {
        id: Uuid,
        recording: Recording,
    },
    RecordingFail {
        id: Uuid,
        err: String,
    },

    // Waveform events
    RenderOk {
        id: Uuid,
        image_path: PathBuf,
    },
    RenderFail {
        id: Uuid,
        err: String,
    },

    // Store events
    StoreOk {
        id: Uuid,
        record_id: i64,
    },
    StoreFail {
        id: Uuid,
        err: String,
    },

    /// Backoff elapsed for a pending store retry
    RetryDue {
        id: Uuid,
    },
    /// Error hold elapsed (includes token to prevent stale recoveries)
    RecoveryDue {
        token: Uuid,
    },

    /// Finish the current recording early and keep it
    StopRecording,
    /// Abort the current recording and discard the session
    Cancel,
    /// Process shutdown requested
    Shutdown,
}

/// Effects to be executed after a state transition.
/// The effect runner handles these asynchronously.
#[derive(Debug, Clone)]
pub enum Effect {
    StartRecording {
        session: CaptureSession,
    },
    StopRecording {
        id: Uuid,
    },
    CancelRecording {
        id: Uuid,
    },
    RenderWaveform {
        id: Uuid,
        audio_path: PathBuf,
    },
    PersistRecord {
        id: Uuid,
        record: EventRecord,
    },
    ScheduleRetry {
        id: Uuid,
        delay: Duration,
    },
    ScheduleRecovery {
        token: Uuid,
        delay: Duration,
    },
    /// Remove files that no record will ever reference
    DiscardFiles {
        id: Uuid,
        paths: Vec<PathBuf>,
    },
    /// Signal to publish a fresh status snapshot
    EmitStatus,
}

/// Retry and recovery timing used by the reducer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retry_count: u32,
    pub backoff: Duration,
    pub recovery: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): backoff * 2^(attempt-1), capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.backoff.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry_count: 3,
            backoff: Duration::from_millis(250),
            recovery: Duration::from_millis(1000),
        }
    }
}

fn enter_error(
    fault: FaultKind,
    message: String,
    session_id: Option<Uuid>,
    policy: &RetryPolicy,
) -> (State, Vec<Effect>) {
    let token = Uuid::new_v4();
    (
        State::Error {
            fault,
            message,
            token,
            session_id,
            retry: None,
        },
        vec![
            Effect::ScheduleRecovery {
                token,
                delay: policy.recovery,
            },
            Effect::EmitStatus,
        ],
    )
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Ignore events with stale session IDs
/// - Always emit EmitStatus after state changes
pub fn reduce(state: &State, event: Event, policy: &RetryPolicy) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;

    let current_id = state.session_id();

    // Helper: check if event's ID is stale (doesn't match current workflow)
    let is_stale = |eid: Uuid| Some(eid) != current_id;

    match (state, event) {
        // -----------------
        // Idle
        // -----------------
        (State::Idle, Detection(trigger)) if trigger.kind() != DetectionKind::Noise => {
            let session = CaptureSession::new(trigger);
            log::info!(
                "Session {} opened by {} (distance={:?}, intensity={})",
                session.id,
                session.trigger.kind().as_str(),
                session.trigger.distance_km(),
                session.trigger.intensity()
            );
            (
                State::Recording {
                    session: session.clone(),
                    started_at: Instant::now(),
                },
                vec![StartRecording { session }, EmitStatus],
            )
        }

        // -----------------
        // Recording
        // -----------------
        (State::Recording { session, .. }, RecordingOk { id, recording }) if session.id == id => {
            let mut session = session.clone();
            session.audio_path = Some(recording.path.clone());
            let audio_path = recording.path.clone();
            (
                State::Rendering { session, recording },
                vec![RenderWaveform { id, audio_path }, EmitStatus],
            )
        }
        (State::Recording { session, .. }, RecordingFail { id, err }) if session.id == id => {
            log::error!("Session {} capture fault: {}", id, err);
            enter_error(FaultKind::CaptureFault, err, Some(id), policy)
        }
        (State::Recording { session, .. }, Event::StopRecording) => {
            (state.clone(), vec![Effect::StopRecording { id: session.id }])
        }
        // Cancel during recording discards the session without a record
        (State::Recording { session, .. }, Cancel) => {
            log::info!("Session {} cancelled during recording", session.id);
            (
                State::Idle,
                vec![CancelRecording { id: session.id }, EmitStatus],
            )
        }

        // -----------------
        // Rendering
        // -----------------
        (State::Rendering { session, recording }, RenderOk { id, image_path })
            if session.id == id =>
        {
            let mut session = session.clone();
            session.waveform_path = Some(image_path.clone());
            let record = EventRecord::for_session(&session, recording, Some(image_path));
            (
                State::Persisting {
                    session,
                    record: record.clone(),
                    attempt: 1,
                },
                vec![PersistRecord { id, record }, EmitStatus],
            )
        }
        // A render failure must not cost us the audio: persist without an image
        (State::Rendering { session, recording }, RenderFail { id, err }) if session.id == id => {
            log::warn!(
                "Session {} render fault, persisting without waveform: {}",
                id,
                err
            );
            let mut session = session.clone();
            session.error = Some(err);
            let record = EventRecord::for_session(&session, recording, None);
            (
                State::Persisting {
                    session,
                    record: record.clone(),
                    attempt: 1,
                },
                vec![PersistRecord { id, record }, EmitStatus],
            )
        }

        // -----------------
        // Persisting
        // -----------------
        (State::Persisting { session, .. }, StoreOk { id, record_id }) if session.id == id => {
            log::info!("Session {} persisted as record {}", id, record_id);
            (State::Idle, vec![EmitStatus])
        }
        (
            State::Persisting {
                session,
                record,
                attempt,
            },
            StoreFail { id, err },
        ) if session.id == id => {
            if *attempt <= policy.max_retry_count {
                let delay = policy.delay_for(*attempt);
                log::warn!(
                    "Session {} store attempt {} failed, retrying in {:?}: {}",
                    id,
                    attempt,
                    delay,
                    err
                );
                (
                    State::Error {
                        fault: FaultKind::StoreFault,
                        message: err,
                        token: Uuid::new_v4(),
                        session_id: Some(id),
                        retry: Some(PendingRetry {
                            session: session.clone(),
                            record: record.clone(),
                            next_attempt: attempt + 1,
                        }),
                    },
                    vec![ScheduleRetry { id, delay }, EmitStatus],
                )
            } else {
                log::error!(
                    "Session {} abandoned after {} store attempts (audio={:?}, waveform={:?}): {}",
                    id,
                    attempt,
                    record.audio_path,
                    record.waveform_path,
                    err
                );
                enter_error(
                    FaultKind::StoreFault,
                    format!("record lost after {} attempts: {}", attempt, err),
                    Some(id),
                    policy,
                )
            }
        }

        // -----------------
        // Error
        // -----------------
        (
            State::Error {
                retry: Some(retry), ..
            },
            RetryDue { id },
        ) if retry.session.id == id => (
            State::Persisting {
                session: retry.session.clone(),
                record: retry.record.clone(),
                attempt: retry.next_attempt,
            },
            vec![
                PersistRecord {
                    id,
                    record: retry.record.clone(),
                },
                EmitStatus,
            ],
        ),
        (
            State::Error {
                token, retry: None, ..
            },
            RecoveryDue { token: due },
        ) if *token == due => (State::Idle, vec![EmitStatus]),
        (State::Error { retry, .. }, Cancel) => {
            if let Some(retry) = retry {
                log::warn!(
                    "Session {} pending store retry abandoned by cancel",
                    retry.session.id
                );
            }
            (State::Idle, vec![EmitStatus])
        }

        // -----------------
        // Stale events (drop silently)
        // -----------------
        // A recording that completes after its session was cancelled leaves a file nobody owns
        (_, RecordingOk { id, recording }) if is_stale(id) => (
            state.clone(),
            vec![DiscardFiles {
                id,
                paths: vec![recording.path],
            }],
        ),
        (_, RenderOk { id, image_path }) if is_stale(id) => (
            state.clone(),
            vec![DiscardFiles {
                id,
                paths: vec![image_path],
            }],
        ),
        (_, RecordingFail { id, .. }) if is_stale(id) => (state.clone(), vec![]),
        (_, RenderFail { id, .. }) if is_stale(id) => (state.clone(), vec![]),
        (_, StoreOk { id, .. }) if is_stale(id) => (state.clone(), vec![]),
        (_, StoreFail { id, .. }) if is_stale(id) => (state.clone(), vec![]),

        // -----------------
        // Unhandled: no transition
        // -----------------
        _ => (state.clone(), vec![]),
    }
}
