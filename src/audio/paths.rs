//! File naming for recordings and waveform images
//!
//! Audio: <recording dir>/thunder_<YYYYmmdd-HHMMSS>_<session id>.wav
//! Image: <waveform dir>/<audio stem>.svg

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use uuid::Uuid;

const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Deterministic audio path for a capture session.
pub fn session_wav_path(dir: &Path, session_id: Uuid, started_at: DateTime<Utc>) -> PathBuf {
    let filename = format!(
        "thunder_{}_{}.wav",
        started_at.format(TIMESTAMP_FORMAT),
        session_id
    );
    dir.join(filename)
}

/// Audio path for a manually imported file. Keeps the source stem so the
/// operator can recognise it.
pub fn manual_wav_path(dir: &Path, imported_at: DateTime<Utc>, source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "recording".to_string());
    let filename = format!("manual_{}_{}.wav", imported_at.format(TIMESTAMP_FORMAT), stem);
    dir.join(filename)
}

/// Image path for a given audio file.
pub fn waveform_path_for(image_dir: &Path, audio_path: &Path) -> PathBuf {
    let stem = audio_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "waveform".to_string());
    image_dir.join(format!("{}.svg", stem))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-07-04T21:05:09Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn session_path_is_deterministic() {
        let id = Uuid::new_v4();
        let a = session_wav_path(Path::new("/rec"), id, at());
        let b = session_wav_path(Path::new("/rec"), id, at());
        assert_eq!(a, b);
        assert_eq!(
            a,
            PathBuf::from(format!("/rec/thunder_20240704-210509_{}.wav", id))
        );
    }

    #[test]
    fn manual_path_keeps_source_stem() {
        let path = manual_wav_path(Path::new("/rec"), at(), Path::new("/tmp/storm.WAV"));
        assert_eq!(path, PathBuf::from("/rec/manual_20240704-210509_storm.wav"));
    }

    #[test]
    fn waveform_path_uses_audio_stem() {
        let path = waveform_path_for(
            Path::new("/img"),
            Path::new("/rec/thunder_20240704-210509_x.wav"),
        );
        assert_eq!(path, PathBuf::from("/img/thunder_20240704-210509_x.svg"));
    }
}
