//! Capture sessions and the records they become.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::sensor::{DetectionEvent, DetectionKind};

/// A finished audio recording.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recording {
    pub path: PathBuf,
    pub duration_ms: u64,
}

/// One admitted trigger on its way to becoming an [`EventRecord`].
///
/// Only the controller mutates a session; which stage it is in is given by the
/// controller state that currently holds it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureSession {
    pub id: Uuid,
    pub trigger: DetectionEvent,
    pub started_at: DateTime<Utc>,
    pub audio_path: Option<PathBuf>,
    pub waveform_path: Option<PathBuf>,
    pub error: Option<String>,
}

impl CaptureSession {
    pub fn new(trigger: DetectionEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            trigger,
            started_at: Utc::now(),
            audio_path: None,
            waveform_path: None,
            error: None,
        }
    }
}

/// Durable form of a completed session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventRecord {
    pub session_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: DetectionKind,
    pub distance_km: Option<u8>,
    pub intensity: u32,
    pub duration_ms: u64,
    pub audio_path: PathBuf,
    pub waveform_path: Option<PathBuf>,
}

impl EventRecord {
    /// Build the record for a session whose audio is on disk.
    /// The timestamp is that of the triggering detection.
    pub fn for_session(
        session: &CaptureSession,
        recording: &Recording,
        waveform_path: Option<PathBuf>,
    ) -> Self {
        Self {
            session_id: session.id,
            timestamp: session.trigger.timestamp(),
            kind: session.trigger.kind(),
            distance_km: session.trigger.distance_km(),
            intensity: session.trigger.intensity(),
            duration_ms: recording.duration_ms,
            audio_path: recording.path.clone(),
            waveform_path,
        }
    }
}

/// A record as read back from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredRecord {
    pub id: i64,
    #[serde(flatten)]
    pub record: EventRecord,
}
