//! Waveform images
//!
//! Reads a finished WAV file, reduces it to one peak/RMS pair per pixel
//! column and writes an SVG envelope. Output depends only on the input
//! samples and the style, so re-rendering the same file gives identical bytes.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use hound::{SampleFormat, WavReader};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("audio file not found: {0:?}")]
    Missing(PathBuf),
    #[error("audio file has no samples: {0:?}")]
    Empty(PathBuf),
    #[error("cannot decode {path:?}: {message}")]
    Decode { path: PathBuf, message: String },
    #[error("cannot write image {path:?}: {message}")]
    Write { path: PathBuf, message: String },
}

/// Turns a recording into an image file.
pub trait WaveformRenderer: Send + Sync {
    /// Render `audio_path` to `image_path` and return the written path.
    fn render(&self, audio_path: &Path, image_path: &Path) -> Result<PathBuf, RenderError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaveformStyle {
    pub width: u32,
    pub height: u32,
    pub color: String,
}

impl Default for WaveformStyle {
    fn default() -> Self {
        Self {
            width: 600,
            height: 120,
            color: "#007bff".to_string(),
        }
    }
}

/// Peak and RMS of one pixel column, both normalized to 0.0-1.0.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Column {
    peak: f32,
    rms: f32,
}

pub struct SvgWaveformRenderer {
    style: WaveformStyle,
}

impl SvgWaveformRenderer {
    pub fn new(mut style: WaveformStyle) -> Self {
        style.width = style.width.max(1);
        style.height = style.height.max(2);
        if !is_safe_color(&style.color) {
            log::warn!(
                "Waveform color {:?} rejected, using default",
                style.color
            );
            style.color = WaveformStyle::default().color;
        }
        Self { style }
    }

    fn svg(&self, columns: &[Column]) -> String {
        let WaveformStyle {
            width,
            height,
            color,
        } = &self.style;
        let mid = *height as f32 / 2.0;

        let mut peaks = String::new();
        let mut rms = String::new();
        for (x, column) in columns.iter().enumerate() {
            let x = x as f32 + 0.5;
            let peak = (column.peak * mid).max(0.5);
            let body = column.rms * mid;
            let _ = write!(peaks, "M{:.1} {:.2}V{:.2}", x, mid - peak, mid + peak);
            if body > 0.0 {
                let _ = write!(rms, "M{:.1} {:.2}V{:.2}", x, mid - body, mid + body);
            }
        }

        format!(
            concat!(
                "<svg xmlns=\"http://www.w3.org/2000/svg\" ",
                "width=\"{w}\" height=\"{h}\" viewBox=\"0 0 {w} {h}\">\n",
                "<rect width=\"{w}\" height=\"{h}\" fill=\"#ffffff\"/>\n",
                "<path d=\"{peaks}\" stroke=\"{c}\" stroke-opacity=\"0.45\" stroke-width=\"1\"/>\n",
                "<path d=\"{rms}\" stroke=\"{c}\" stroke-width=\"1\"/>\n",
                "</svg>\n"
            ),
            w = width,
            h = height,
            c = color,
            peaks = peaks,
            rms = rms,
        )
    }
}

impl WaveformRenderer for SvgWaveformRenderer {
    fn render(&self, audio_path: &Path, image_path: &Path) -> Result<PathBuf, RenderError> {
        let samples = read_samples(audio_path)?;
        if samples.is_empty() {
            return Err(RenderError::Empty(audio_path.to_path_buf()));
        }

        let columns = compute_columns(&samples, self.style.width as usize);
        let svg = self.svg(&columns);

        let write_err = |e: std::io::Error| RenderError::Write {
            path: image_path.to_path_buf(),
            message: e.to_string(),
        };
        if let Some(parent) = image_path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        std::fs::write(image_path, svg).map_err(write_err)?;

        log::debug!("Waveform written: {:?}", image_path);
        Ok(image_path.to_path_buf())
    }
}

/// Decode every sample (all channels interleaved) to f32 in -1.0..=1.0.
fn read_samples(path: &Path) -> Result<Vec<f32>, RenderError> {
    let decode_err = |e: hound::Error| RenderError::Decode {
        path: path.to_path_buf(),
        message: e.to_string(),
    };

    let reader = match WavReader::open(path) {
        Ok(reader) => reader,
        Err(hound::Error::IoError(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(RenderError::Missing(path.to_path_buf()))
        }
        Err(e) => return Err(decode_err(e)),
    };

    let spec = reader.spec();
    match spec.sample_format {
        SampleFormat::Float => reader
            .into_samples::<f32>()
            .map(|s| s.map_err(decode_err))
            .collect(),
        SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1).min(31))) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale).map_err(decode_err))
                .collect()
        }
    }
}

/// Split samples into `width` equal segments and compute peak and RMS of each.
fn compute_columns(samples: &[f32], width: usize) -> Vec<Column> {
    let width = width.max(1);
    let mut columns = vec![
        Column {
            peak: 0.0,
            rms: 0.0
        };
        width
    ];

    for (idx, column) in columns.iter_mut().enumerate() {
        let start = idx * samples.len() / width;
        let end = ((idx + 1) * samples.len() / width).min(samples.len());
        if start >= end {
            continue;
        }

        let segment = &samples[start..end];
        let peak = segment.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
        let sum_squares: f64 = segment.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
        let rms = (sum_squares / segment.len() as f64).sqrt() as f32;

        *column = Column {
            peak: peak.clamp(0.0, 1.0),
            rms: rms.clamp(0.0, 1.0),
        };
    }

    columns
}

fn is_safe_color(color: &str) -> bool {
    !color.is_empty() && color.chars().all(|c| c == '#' || c.is_ascii_alphanumeric())
}
