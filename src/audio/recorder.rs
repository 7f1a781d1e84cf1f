//! Microphone capture using CPAL for input and hound for WAV writing
//!
//! Each call to `record` opens the configured input device, streams samples
//! into a 16-bit WAV file until the duration limit or a stop signal, then
//! finalizes the file. Any failure removes the partial file.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, SampleFormat, Stream, StreamConfig};
use hound::{WavSpec, WavWriter};

use super::{discard_partial, AudioCapture, CaptureError, RecordingControl, RecordingRequest};
use crate::session::Recording;

type SharedWriter = Arc<Mutex<Option<WavWriter<std::io::BufWriter<std::fs::File>>>>>;
type SharedError = Arc<Mutex<Option<String>>>;

/// Records from a CPAL input device.
pub struct CpalCapture {
    /// Device name to open; the host default when `None`.
    device_name: Option<String>,
}

impl CpalCapture {
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }

    fn open_device(&self) -> Result<(Device, StreamConfig, SampleFormat), CaptureError> {
        let host = cpal::default_host();

        let device = match &self.device_name {
            Some(wanted) => host
                .input_devices()
                .map_err(|e| CaptureError::StreamCreationFailed(e.to_string()))?
                .find(|d| d.name().map(|n| &n == wanted).unwrap_or(false))
                .ok_or(CaptureError::NoInputDevice)?,
            None => host
                .default_input_device()
                .ok_or(CaptureError::NoInputDevice)?,
        };

        log::info!("Using audio input device: {:?}", device.name());

        let supported_config = device
            .default_input_config()
            .map_err(|_| CaptureError::NoSupportedConfig)?;

        log::debug!(
            "Audio config: {} Hz, {} channels, {:?}",
            supported_config.sample_rate().0,
            supported_config.channels(),
            supported_config.sample_format()
        );

        let sample_format = supported_config.sample_format();
        Ok((device, supported_config.into(), sample_format))
    }

    fn record_to(
        &self,
        request: &RecordingRequest,
        control: &RecordingControl,
    ) -> Result<Recording, CaptureError> {
        let (device, config, sample_format) = self.open_device()?;

        if let Some(parent) = request.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CaptureError::FileCreationFailed(e.to_string()))?;
        }

        let spec = WavSpec {
            channels: config.channels,
            sample_rate: config.sample_rate.0,
            bits_per_sample: 16, // Always write as 16-bit
            sample_format: hound::SampleFormat::Int,
        };
        let writer = WavWriter::create(&request.path, spec)
            .map_err(|e| CaptureError::FileCreationFailed(e.to_string()))?;

        let writer: SharedWriter = Arc::new(Mutex::new(Some(writer)));
        let failure: SharedError = Arc::new(Mutex::new(None));
        let samples_written = Arc::new(AtomicU64::new(0));

        let stream = build_stream(
            &device,
            &config,
            sample_format,
            writer.clone(),
            failure.clone(),
            samples_written.clone(),
        )?;
        stream.play().map_err(|e| {
            CaptureError::StreamCreationFailed(format!("Failed to start stream: {}", e))
        })?;

        log::info!("Recording started: {:?}", request.path);

        let waited = control.wait_until(request.max_duration, || {
            failure
                .lock()
                .ok()
                .and_then(|f| f.clone())
                .map(CaptureError::Interrupted)
        });

        // Dropping the stream stops callbacks before the writer is finalized
        drop(stream);
        waited?;

        let writer = writer
            .lock()
            .map_err(|_| CaptureError::WriteFailed("writer lock poisoned".to_string()))?
            .take();
        if let Some(writer) = writer {
            writer
                .finalize()
                .map_err(|e| CaptureError::WriteFailed(e.to_string()))?;
        }

        let samples = samples_written.load(Ordering::SeqCst);
        let per_second = u64::from(spec.sample_rate) * u64::from(spec.channels);
        let duration_ms = if per_second == 0 {
            0
        } else {
            samples * 1000 / per_second
        };

        log::info!(
            "Recording finished: {:?} ({}ms)",
            request.path,
            duration_ms
        );
        Ok(Recording {
            path: request.path.clone(),
            duration_ms,
        })
    }
}

impl AudioCapture for CpalCapture {
    fn record(
        &self,
        request: &RecordingRequest,
        control: &RecordingControl,
    ) -> Result<Recording, CaptureError> {
        let result = self.record_to(request, control);
        if result.is_err() {
            discard_partial(&request.path);
        }
        result
    }
}

fn build_stream(
    device: &Device,
    config: &StreamConfig,
    sample_format: SampleFormat,
    writer: SharedWriter,
    failure: SharedError,
    samples_written: Arc<AtomicU64>,
) -> Result<Stream, CaptureError> {
    match sample_format {
        SampleFormat::I16 => {
            build_stream_typed::<i16>(device, config, writer, failure, samples_written)
        }
        SampleFormat::U16 => {
            build_stream_typed::<u16>(device, config, writer, failure, samples_written)
        }
        SampleFormat::F32 => {
            build_stream_typed::<f32>(device, config, writer, failure, samples_written)
        }
        _ => Err(CaptureError::NoSupportedConfig),
    }
}

fn build_stream_typed<T>(
    device: &Device,
    config: &StreamConfig,
    writer: SharedWriter,
    failure: SharedError,
    samples_written: Arc<AtomicU64>,
) -> Result<Stream, CaptureError>
where
    T: cpal::SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let write_failure = failure.clone();
    let err_fn = move |err: cpal::StreamError| {
        log::error!("Audio stream error: {}", err);
        record_failure(&failure, err.to_string());
    };

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let Ok(mut guard) = writer.lock() else {
                    return;
                };
                let Some(w) = guard.as_mut() else {
                    return;
                };
                let mut failed = None;
                for &sample in data {
                    if let Err(e) = w.write_sample(sample_to_i16(sample)) {
                        failed = Some(e.to_string());
                        break;
                    }
                }
                match failed {
                    // Stop writing; the waiting thread sees the failure and aborts
                    Some(message) => {
                        record_failure(&write_failure, message);
                        *guard = None;
                    }
                    None => {
                        samples_written.fetch_add(data.len() as u64, Ordering::SeqCst);
                    }
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| CaptureError::StreamCreationFailed(e.to_string()))
}

fn record_failure(slot: &SharedError, message: String) {
    if let Ok(mut slot) = slot.lock() {
        slot.get_or_insert(message);
    }
}

/// Convert any sample type to i16 for WAV writing.
fn sample_to_i16<T>(sample: T) -> i16
where
    f32: FromSample<T>,
{
    let f32_sample = f32::from_sample_(sample);
    let clamped = f32_sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32) as i16
}
