//! Audio capture and waveform rendering
//!
//! Capture uses CPAL for input and hound for WAV encoding. A synthetic capture
//! writes generated audio so the pipeline can run without a microphone.
//! Recordings are blocking calls; the effect runner moves them off the
//! controller task.

mod paths;
pub mod recorder;
mod synthetic;
mod waveform;

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::session::Recording;

pub use paths::{manual_wav_path, session_wav_path, waveform_path_for};
pub use recorder::CpalCapture;
pub use synthetic::SyntheticCapture;
pub use waveform::{RenderError, SvgWaveformRenderer, WaveformRenderer, WaveformStyle};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("no audio input device found")]
    NoInputDevice,
    #[error("no supported audio configuration")]
    NoSupportedConfig,
    #[error("failed to create audio stream: {0}")]
    StreamCreationFailed(String),
    #[error("failed to create WAV file: {0}")]
    FileCreationFailed(String),
    #[error("failed to write audio data: {0}")]
    WriteFailed(String),
    #[error("recording interrupted: {0}")]
    Interrupted(String),
    #[error("recording cancelled")]
    Cancelled,
    #[error("recording timed out after {0:?}")]
    TimedOut(Duration),
}

impl CaptureError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            CaptureError::Cancelled | CaptureError::TimedOut(_) | CaptureError::NoSupportedConfig
        )
    }
}

/// What to record and where.
#[derive(Debug, Clone)]
pub struct RecordingRequest {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub path: PathBuf,
    pub max_duration: Duration,
}

/// Stop and cancel signals for one recording.
///
/// `stop` ends the recording early and keeps it; `cancel` discards it.
#[derive(Debug, Clone, Default)]
pub struct RecordingControl {
    pub stop: CancellationToken,
    pub cancel: CancellationToken,
}

impl RecordingControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block the calling thread until stop, cancel or the deadline.
    /// Returns `Err(Cancelled)` on cancel.
    pub(crate) fn wait(&self, max_duration: Duration) -> Result<(), CaptureError> {
        self.wait_until(max_duration, || None)
    }

    /// Like [`wait`](Self::wait), but also ends early with the error `check`
    /// returns (e.g. a device reported by the stream callback as gone).
    pub(crate) fn wait_until(
        &self,
        max_duration: Duration,
        mut check: impl FnMut() -> Option<CaptureError>,
    ) -> Result<(), CaptureError> {
        const POLL: Duration = Duration::from_millis(20);
        let deadline = std::time::Instant::now() + max_duration;
        loop {
            if self.cancel.is_cancelled() {
                return Err(CaptureError::Cancelled);
            }
            if let Some(err) = check() {
                return Err(err);
            }
            if self.stop.is_cancelled() {
                return Ok(());
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep(POLL.min(deadline - now));
        }
    }
}

/// Blocking audio recorder.
///
/// Implementations write to `request.path` and must remove a partially
/// written file before returning an error.
pub trait AudioCapture: Send + Sync {
    fn record(
        &self,
        request: &RecordingRequest,
        control: &RecordingControl,
    ) -> Result<Recording, CaptureError>;
}

/// Remove a partial file, ignoring "not found".
pub(crate) fn discard_partial(path: &std::path::Path) {
    match std::fs::remove_file(path) {
        Ok(()) => log::debug!("Removed partial recording {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Failed to remove partial recording {:?}: {}", path, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_returns_at_deadline() {
        let control = RecordingControl::new();
        let started = std::time::Instant::now();
        assert!(control.wait(Duration::from_millis(50)).is_ok());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn wait_stops_early_and_reports_cancel() {
        let control = RecordingControl::new();
        control.stop.cancel();
        assert!(control.wait(Duration::from_secs(60)).is_ok());

        let control = RecordingControl::new();
        control.cancel.cancel();
        assert_eq!(
            control.wait(Duration::from_secs(60)),
            Err(CaptureError::Cancelled)
        );
    }

    #[test]
    fn cancel_and_timeout_are_not_retryable() {
        assert!(!CaptureError::Cancelled.is_retryable());
        assert!(!CaptureError::TimedOut(Duration::from_secs(1)).is_retryable());
        assert!(CaptureError::NoInputDevice.is_retryable());
        assert!(CaptureError::WriteFailed("disk".to_string()).is_retryable());
    }
}
