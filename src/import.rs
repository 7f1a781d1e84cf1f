//! Manual import of existing WAV files into the event history.

use std::path::{Path, PathBuf};

use chrono::Utc;
use uuid::Uuid;

use crate::audio::{manual_wav_path, waveform_path_for, WaveformRenderer};
use crate::sensor::DetectionKind;
use crate::session::EventRecord;
use crate::store::{EventStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("source file not found: {0:?}")]
    SourceMissing(PathBuf),
    #[error("not a readable WAV file {path:?}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: hound::Error,
    },
    #[error("copy failed: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Where imported files go.
#[derive(Debug, Clone)]
pub struct ImportTarget<'a> {
    pub recording_dir: &'a Path,
    pub waveform_dir: &'a Path,
}

/// Copy `source` into the recording directory, render its waveform and
/// insert a record. A failed render still imports the audio.
pub fn import_wav(
    source: &Path,
    distance_km: Option<u8>,
    intensity: Option<u32>,
    target: &ImportTarget<'_>,
    renderer: &dyn WaveformRenderer,
    store: &dyn EventStore,
) -> Result<i64, ImportError> {
    if !source.is_file() {
        return Err(ImportError::SourceMissing(source.to_path_buf()));
    }

    let duration_ms = wav_duration_ms(source)?;

    let now = Utc::now();
    std::fs::create_dir_all(target.recording_dir)?;
    let audio_path = manual_wav_path(target.recording_dir, now, source);
    std::fs::copy(source, &audio_path)?;
    log::info!("Imported {:?} as {:?}", source, audio_path);

    let image_path = waveform_path_for(target.waveform_dir, &audio_path);
    let waveform_path = match renderer.render(&audio_path, &image_path) {
        Ok(path) => Some(path),
        Err(e) => {
            log::warn!("Waveform for {:?} failed, importing without it: {}", audio_path, e);
            None
        }
    };

    let record = EventRecord {
        session_id: Uuid::new_v4(),
        timestamp: now,
        kind: DetectionKind::Strike,
        distance_km,
        intensity: intensity.unwrap_or(0),
        duration_ms,
        audio_path,
        waveform_path,
    };

    match store.insert(&record) {
        Ok(id) => Ok(id),
        Err(e) => {
            // Keep the tree consistent with the table
            remove_copied(&record.audio_path);
            if let Some(image) = &record.waveform_path {
                remove_copied(image);
            }
            Err(e.into())
        }
    }
}

fn wav_duration_ms(path: &Path) -> Result<u64, ImportError> {
    let reader = hound::WavReader::open(path).map_err(|source| ImportError::Decode {
        path: path.to_path_buf(),
        source,
    })?;
    let spec = reader.spec();
    if spec.sample_rate == 0 {
        return Ok(0);
    }
    // duration() counts frames, not interleaved samples
    Ok(u64::from(reader.duration()) * 1000 / u64::from(spec.sample_rate))
}

fn remove_copied(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Import: failed to remove {:?} after store error: {}", path, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{SvgWaveformRenderer, WaveformStyle};
    use crate::store::SqliteEventStore;

    fn write_wav(path: &Path, frames: u32) {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for i in 0..frames {
            writer.write_sample((i % 1000) as i16).unwrap();
            writer.write_sample(-((i % 1000) as i16)).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn imports_copy_waveform_and_record() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("storm.wav");
        write_wav(&source, 16_000);

        let store = SqliteEventStore::open(dir.path().join("db.sqlite")).unwrap();
        let renderer = SvgWaveformRenderer::new(WaveformStyle::default());
        let recordings = dir.path().join("recordings");
        let waveforms = dir.path().join("waveforms");
        let target = ImportTarget {
            recording_dir: &recordings,
            waveform_dir: &waveforms,
        };

        let id = import_wav(&source, Some(7), Some(900), &target, &renderer, &store).unwrap();
        let stored = store.get(id).unwrap().record;

        assert_eq!(stored.duration_ms, 2000);
        assert_eq!(stored.distance_km, Some(7));
        assert_eq!(stored.intensity, 900);
        assert!(stored.audio_path.starts_with(&recordings));
        assert!(stored
            .audio_path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("manual_"));
        assert!(stored.audio_path.exists());
        assert!(stored.waveform_path.unwrap().exists());
        assert!(source.exists());
    }

    #[test]
    fn missing_source_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteEventStore::open(dir.path().join("db.sqlite")).unwrap();
        let renderer = SvgWaveformRenderer::new(WaveformStyle::default());
        let target = ImportTarget {
            recording_dir: dir.path(),
            waveform_dir: dir.path(),
        };
        let result = import_wav(
            &dir.path().join("nope.wav"),
            None,
            None,
            &target,
            &renderer,
            &store,
        );
        assert!(matches!(result, Err(ImportError::SourceMissing(_))));
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn non_wav_source_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("notes.wav");
        std::fs::write(&source, b"definitely not audio").unwrap();
        let store = SqliteEventStore::open(dir.path().join("db.sqlite")).unwrap();
        let renderer = SvgWaveformRenderer::new(WaveformStyle::default());
        let target = ImportTarget {
            recording_dir: dir.path(),
            waveform_dir: dir.path(),
        };
        let result = import_wav(&source, None, None, &target, &renderer, &store);
        assert!(matches!(result, Err(ImportError::Decode { .. })));
    }

    struct RejectingStore;

    impl EventStore for RejectingStore {
        fn insert(&self, _record: &EventRecord) -> Result<i64, StoreError> {
            Err(StoreError::Io(std::io::Error::other("disk full")))
        }
        fn get(&self, id: i64) -> Result<crate::session::StoredRecord, StoreError> {
            Err(StoreError::NotFound(id))
        }
        fn list_recent(
            &self,
            _limit: usize,
        ) -> Result<Vec<crate::session::StoredRecord>, StoreError> {
            Ok(Vec::new())
        }
        fn delete_by_path_prefix(&self, _prefix: &str) -> Result<usize, StoreError> {
            Ok(0)
        }
        fn count(&self) -> Result<u64, StoreError> {
            Ok(0)
        }
    }

    #[test]
    fn store_failure_removes_copied_files() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("storm.wav");
        write_wav(&source, 8_000);
        let renderer = SvgWaveformRenderer::new(WaveformStyle::default());
        let recordings = dir.path().join("recordings");
        let waveforms = dir.path().join("waveforms");
        let target = ImportTarget {
            recording_dir: &recordings,
            waveform_dir: &waveforms,
        };

        let result = import_wav(&source, None, None, &target, &renderer, &RejectingStore);
        assert!(matches!(result, Err(ImportError::Store(_))));
        for d in [&recordings, &waveforms] {
            let leftover = std::fs::read_dir(d)
                .map(|entries| entries.count())
                .unwrap_or(0);
            assert_eq!(leftover, 0, "files left in {:?}", d);
        }
        assert!(source.exists());
    }
}
