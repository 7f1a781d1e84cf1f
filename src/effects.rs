//! Effect runner
//!
//! Executes effects produced by the state machine. Blocking work (audio,
//! rendering, SQLite) runs on the blocking pool; completion events are sent
//! back to the state loop.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::audio::{
    session_wav_path, waveform_path_for, AudioCapture, CaptureError, RecordingControl,
    RecordingRequest, WaveformRenderer,
};
use crate::config::ControllerConfig;
use crate::session::{CaptureSession, EventRecord, Recording};
use crate::state_machine::{Effect, Event, RetryPolicy};
use crate::store::EventStore;

/// Extra time a recording may take past its configured maximum before it is
/// considered stuck.
const CAPTURE_GRACE: Duration = Duration::from_secs(5);

/// Trait for running effects asynchronously.
/// Completion events are sent back via the provided channel.
pub trait EffectRunner: Send + Sync + 'static {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>);
}

struct ActiveRecording {
    control: RecordingControl,
    handle: JoinHandle<()>,
}

/// Effect runner backed by real (or injected) capture, renderer and store.
pub struct CaptureEffectRunner {
    capture: Arc<dyn AudioCapture>,
    renderer: Arc<dyn WaveformRenderer>,
    store: Arc<dyn EventStore>,
    config: ControllerConfig,
    policy: RetryPolicy,
    active_recordings: Arc<Mutex<HashMap<Uuid, ActiveRecording>>>,
}

impl CaptureEffectRunner {
    pub fn new(
        capture: Arc<dyn AudioCapture>,
        renderer: Arc<dyn WaveformRenderer>,
        store: Arc<dyn EventStore>,
        config: ControllerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            capture,
            renderer,
            store,
            policy: config.retry_policy(),
            config,
            active_recordings: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Cancel every in-flight recording and wait for it to clean up.
    pub async fn shutdown(&self) {
        let active: Vec<ActiveRecording> = self.recordings().drain().map(|(_, a)| a).collect();
        for recording in &active {
            recording.control.cancel.cancel();
        }
        for recording in active {
            if let Err(e) = recording.handle.await {
                log::warn!("Recording task ended abnormally: {}", e);
            }
        }
    }

    fn recordings(&self) -> MutexGuard<'_, HashMap<Uuid, ActiveRecording>> {
        self.active_recordings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn start_recording(&self, session: CaptureSession, tx: mpsc::Sender<Event>) {
        let id = session.id;
        let request = RecordingRequest {
            session_id: id,
            started_at: session.started_at,
            path: session_wav_path(&self.config.file_paths.audio_dir, id, session.started_at),
            max_duration: self.config.max_recording_duration(),
        };
        let control = RecordingControl::new();
        let capture = self.capture.clone();
        let policy = self.policy;
        let task_control = control.clone();

        let handle = tokio::spawn(async move {
            let event = match record_with_retry(capture, request, task_control, policy).await {
                Ok(recording) => Event::RecordingOk { id, recording },
                Err(e) => Event::RecordingFail {
                    id,
                    err: e.to_string(),
                },
            };
            if let Err(mpsc::error::SendError(event)) = tx.send(event).await {
                log::debug!("State loop gone, dropping completion event");
                if let Event::RecordingOk { recording, .. } = event {
                    discard_files(id, &[recording.path]);
                }
            }
        });

        let mut active = self.recordings();
        active.retain(|_, a| !a.handle.is_finished());
        active.insert(id, ActiveRecording { control, handle });
    }

    fn signal_recording(&self, id: Uuid, cancel: bool) {
        let active = self.recordings();
        match active.get(&id) {
            Some(recording) if cancel => recording.control.cancel.cancel(),
            Some(recording) => recording.control.stop.cancel(),
            None => log::debug!("No active recording for {}", id),
        }
    }
}

impl EffectRunner for CaptureEffectRunner {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>) {
        match effect {
            Effect::StartRecording { session } => self.start_recording(session, tx),

            Effect::StopRecording { id } => {
                log::info!("Stopping recording for session {}", id);
                self.signal_recording(id, false);
            }

            Effect::CancelRecording { id } => {
                log::info!("Cancelling recording for session {}", id);
                self.signal_recording(id, true);
            }

            Effect::RenderWaveform { id, audio_path } => {
                let renderer = self.renderer.clone();
                let image_path = waveform_path_for(&self.config.file_paths.image_dir, &audio_path);

                tokio::spawn(async move {
                    let result = tokio::task::spawn_blocking(move || {
                        renderer.render(&audio_path, &image_path)
                    })
                    .await;

                    let event = match result {
                        Ok(Ok(image_path)) => Event::RenderOk { id, image_path },
                        Ok(Err(e)) => Event::RenderFail {
                            id,
                            err: e.to_string(),
                        },
                        Err(e) => Event::RenderFail {
                            id,
                            err: format!("render task failed: {}", e),
                        },
                    };
                    send(&tx, event).await;
                });
            }

            Effect::PersistRecord { id, record } => {
                let store = self.store.clone();
                tokio::spawn(async move {
                    let event = match persist(store, record).await {
                        Ok(record_id) => Event::StoreOk { id, record_id },
                        Err(err) => Event::StoreFail { id, err },
                    };
                    send(&tx, event).await;
                });
            }

            Effect::ScheduleRetry { id, delay } => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    log::debug!("Retry due for session {}", id);
                    send(&tx, Event::RetryDue { id }).await;
                });
            }

            Effect::ScheduleRecovery { token, delay } => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    log::debug!("Recovery due (token={})", token);
                    send(&tx, Event::RecoveryDue { token }).await;
                });
            }

            Effect::DiscardFiles { id, paths } => {
                tokio::task::spawn_blocking(move || discard_files(id, &paths));
            }

            Effect::EmitStatus => {
                log::debug!("EmitStatus reached the effect runner; handled by the state loop");
            }
        }
    }
}

async fn send(tx: &mpsc::Sender<Event>, event: Event) {
    if tx.send(event).await.is_err() {
        log::debug!("State loop gone, dropping completion event");
    }
}

/// Run one capture, retrying transient failures with backoff.
async fn record_with_retry(
    capture: Arc<dyn AudioCapture>,
    request: RecordingRequest,
    control: RecordingControl,
    policy: RetryPolicy,
) -> Result<Recording, CaptureError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match record_once(capture.clone(), request.clone(), control.clone()).await {
            // A capture that ignored the cancel still must not leave its file
            Ok(recording) if control.cancel.is_cancelled() => {
                log::info!(
                    "Session {} cancelled while capture finished, discarding {:?}",
                    request.session_id,
                    recording.path
                );
                crate::audio::discard_partial(&recording.path);
                return Err(CaptureError::Cancelled);
            }
            Ok(recording) => return Ok(recording),
            Err(e)
                if e.is_retryable()
                    && attempt <= policy.max_retry_count
                    && !control.stop.is_cancelled() =>
            {
                let delay = policy.delay_for(attempt);
                log::warn!(
                    "Session {} capture attempt {} failed, retrying in {:?}: {}",
                    request.session_id,
                    attempt,
                    delay,
                    e
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = control.cancel.cancelled() => return Err(CaptureError::Cancelled),
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// One blocking capture, bounded by the maximum duration plus a grace period.
async fn record_once(
    capture: Arc<dyn AudioCapture>,
    request: RecordingRequest,
    control: RecordingControl,
) -> Result<Recording, CaptureError> {
    let limit = request.max_duration + CAPTURE_GRACE;
    let path = request.path.clone();
    let blocking_control = control.clone();
    let mut blocking =
        tokio::task::spawn_blocking(move || capture.record(&request, &blocking_control));

    match tokio::time::timeout(limit, &mut blocking).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            crate::audio::discard_partial(&path);
            Err(CaptureError::Interrupted(format!("capture task failed: {}", e)))
        }
        Err(_) => {
            control.cancel.cancel();
            crate::audio::discard_partial(&path);
            log::error!("Capture stuck past {:?}, abandoning {:?}", limit, path);
            // The worker may still finish and write the file after we gave up
            tokio::spawn(async move {
                let _ = blocking.await;
                crate::audio::discard_partial(&path);
            });
            Err(CaptureError::TimedOut(limit))
        }
    }
}

async fn persist(store: Arc<dyn EventStore>, record: EventRecord) -> Result<i64, String> {
    match tokio::task::spawn_blocking(move || store.insert(&record)).await {
        Ok(Ok(id)) => Ok(id),
        Ok(Err(e)) => Err(e.to_string()),
        Err(e) => Err(format!("store task failed: {}", e)),
    }
}

pub(crate) fn discard_files(id: Uuid, paths: &[PathBuf]) {
    for path in paths {
        match std::fs::remove_file(path) {
            Ok(()) => log::info!("Session {}: discarded {:?}", id, path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Session {}: failed to discard {:?}: {}", id, path, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyCapture {
        failures: u32,
        calls: AtomicU32,
        error: CaptureError,
    }

    impl AudioCapture for FlakyCapture {
        fn record(
            &self,
            request: &RecordingRequest,
            _control: &RecordingControl,
        ) -> Result<Recording, CaptureError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(self.error.clone());
            }
            Ok(Recording {
                path: request.path.clone(),
                duration_ms: 100,
            })
        }
    }

    fn request() -> RecordingRequest {
        RecordingRequest {
            session_id: Uuid::new_v4(),
            started_at: chrono::Utc::now(),
            path: PathBuf::from("/tmp/thunder-test-never-written.wav"),
            max_duration: Duration::from_millis(100),
        }
    }

    fn policy(max_retry_count: u32) -> RetryPolicy {
        RetryPolicy {
            max_retry_count,
            backoff: Duration::from_millis(1),
            recovery: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn capture_retries_transient_failures() {
        let capture = Arc::new(FlakyCapture {
            failures: 2,
            calls: AtomicU32::new(0),
            error: CaptureError::NoInputDevice,
        });
        let result =
            record_with_retry(capture.clone(), request(), RecordingControl::new(), policy(3)).await;
        assert!(result.is_ok());
        assert_eq!(capture.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn capture_gives_up_after_max_retries() {
        let capture = Arc::new(FlakyCapture {
            failures: 10,
            calls: AtomicU32::new(0),
            error: CaptureError::WriteFailed("disk full".to_string()),
        });
        let result =
            record_with_retry(capture.clone(), request(), RecordingControl::new(), policy(2)).await;
        assert!(matches!(result, Err(CaptureError::WriteFailed(_))));
        assert_eq!(capture.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancelled_capture_is_not_retried() {
        let capture = Arc::new(FlakyCapture {
            failures: 10,
            calls: AtomicU32::new(0),
            error: CaptureError::Cancelled,
        });
        let result =
            record_with_retry(capture.clone(), request(), RecordingControl::new(), policy(3)).await;
        assert_eq!(result, Err(CaptureError::Cancelled));
        assert_eq!(capture.calls.load(Ordering::SeqCst), 1);
    }

    /// Ignores both signals, sleeps, then writes its file and reports success.
    struct StubbornCapture {
        hold: Duration,
    }

    impl AudioCapture for StubbornCapture {
        fn record(
            &self,
            request: &RecordingRequest,
            _control: &RecordingControl,
        ) -> Result<Recording, CaptureError> {
            std::thread::sleep(self.hold);
            std::fs::write(&request.path, b"RIFF")
                .map_err(|e| CaptureError::WriteFailed(e.to_string()))?;
            Ok(Recording {
                path: request.path.clone(),
                duration_ms: self.hold.as_millis() as u64,
            })
        }
    }

    #[tokio::test]
    async fn capture_finishing_after_cancel_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = request();
        req.path = dir.path().join("late.wav");
        let control = RecordingControl::new();
        control.cancel.cancel();

        let capture = Arc::new(StubbornCapture {
            hold: Duration::from_millis(20),
        });
        let result = record_with_retry(capture, req.clone(), control, policy(3)).await;
        assert_eq!(result, Err(CaptureError::Cancelled));
        assert!(!req.path.exists());
    }

    #[tokio::test]
    async fn stuck_capture_file_is_removed_once_worker_returns() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = request();
        req.path = dir.path().join("stuck.wav");
        let capture = Arc::new(StubbornCapture {
            hold: CAPTURE_GRACE + Duration::from_millis(400),
        });

        let result = record_once(capture, req.clone(), RecordingControl::new()).await;
        assert!(matches!(result, Err(CaptureError::TimedOut(_))));

        // The worker writes its file after the timeout; the cleanup task removes it
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(!req.path.exists());
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn discard_files_ignores_missing() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("a.wav");
        std::fs::write(&present, b"x").unwrap();
        discard_files(Uuid::new_v4(), &[present.clone(), dir.path().join("missing.wav")]);
        assert!(!present.exists());
    }
}
