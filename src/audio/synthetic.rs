//! Generated thunder audio for simulation mode
//!
//! Writes low-passed noise under a decaying envelope: close enough to a rumble
//! for the waveform and the dashboard, and fully deterministic per session.

use std::path::Path;
use std::time::{Duration, Instant};

use hound::{SampleFormat, WavSpec, WavWriter};

use super::{discard_partial, AudioCapture, CaptureError, RecordingControl, RecordingRequest};
use crate::session::Recording;

const SAMPLE_RATE: u32 = 16_000;

/// Capture that synthesises audio instead of opening a device.
#[derive(Debug, Clone)]
pub struct SyntheticCapture {
    clip: Duration,
    /// Hold the recording for its full duration like a real device would
    realtime: bool,
}

impl SyntheticCapture {
    pub fn new(clip: Duration) -> Self {
        Self {
            clip,
            realtime: false,
        }
    }

    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }
}

impl AudioCapture for SyntheticCapture {
    fn record(
        &self,
        request: &RecordingRequest,
        control: &RecordingControl,
    ) -> Result<Recording, CaptureError> {
        let mut duration = self.clip.min(request.max_duration);

        if self.realtime {
            let started = Instant::now();
            control.wait(duration)?;
            duration = started.elapsed().min(duration);
        } else if control.cancel.is_cancelled() {
            return Err(CaptureError::Cancelled);
        }

        let seed = request.session_id.as_u128() as u64;
        if let Err(e) = write_rumble(&request.path, duration, seed) {
            discard_partial(&request.path);
            return Err(e);
        }

        log::info!(
            "Synthetic recording written: {:?} ({}ms)",
            request.path,
            duration.as_millis()
        );
        Ok(Recording {
            path: request.path.clone(),
            duration_ms: duration.as_millis() as u64,
        })
    }
}

fn write_rumble(path: &Path, duration: Duration, seed: u64) -> Result<(), CaptureError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| CaptureError::FileCreationFailed(e.to_string()))?;
    }

    let spec = WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer =
        WavWriter::create(path, spec).map_err(|e| CaptureError::FileCreationFailed(e.to_string()))?;

    let total = (duration.as_secs_f64() * f64::from(SAMPLE_RATE)) as usize;
    let mut state = seed | 1;
    let mut filtered = 0.0f32;

    for i in 0..total {
        // xorshift64
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        let noise = (state >> 40) as f32 / (1u64 << 24) as f32 * 2.0 - 1.0;

        filtered += 0.05 * (noise - filtered);

        let t = i as f32 / SAMPLE_RATE as f32;
        let attack = (t / 0.05).min(1.0);
        let envelope = attack * (-1.5 * t).exp();
        let sample = (filtered * 6.0 * envelope).clamp(-1.0, 1.0);

        writer
            .write_sample((sample * i16::MAX as f32) as i16)
            .map_err(|e| CaptureError::WriteFailed(e.to_string()))?;
    }

    writer
        .finalize()
        .map_err(|e| CaptureError::WriteFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn request(dir: &Path, max: Duration) -> RecordingRequest {
        RecordingRequest {
            session_id: Uuid::new_v4(),
            started_at: Utc::now(),
            path: dir.join("clip.wav"),
            max_duration: max,
        }
    }

    #[test]
    fn writes_clip_capped_by_max_duration() {
        let dir = tempfile::tempdir().unwrap();
        let capture = SyntheticCapture::new(Duration::from_secs(5));
        let req = request(dir.path(), Duration::from_millis(500));

        let recording = capture.record(&req, &RecordingControl::new()).unwrap();
        assert_eq!(recording.duration_ms, 500);

        let reader = hound::WavReader::open(&recording.path).unwrap();
        assert_eq!(reader.spec().sample_rate, SAMPLE_RATE);
        assert_eq!(reader.duration(), SAMPLE_RATE / 2);
    }

    #[test]
    fn cancelled_capture_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let capture = SyntheticCapture::new(Duration::from_secs(1)).realtime(true);
        let req = request(dir.path(), Duration::from_secs(1));
        let control = RecordingControl::new();
        control.cancel.cancel();

        assert_eq!(capture.record(&req, &control), Err(CaptureError::Cancelled));
        assert!(!req.path.exists());
    }

    #[test]
    fn stop_keeps_a_shorter_recording() {
        let dir = tempfile::tempdir().unwrap();
        let capture = SyntheticCapture::new(Duration::from_secs(30)).realtime(true);
        let req = request(dir.path(), Duration::from_secs(30));
        let control = RecordingControl::new();
        control.stop.cancel();

        let recording = capture.record(&req, &control).unwrap();
        assert!(recording.duration_ms < 1000);
        assert!(recording.path.exists());
    }
}
