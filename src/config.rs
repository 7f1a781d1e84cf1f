use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::debounce::AdmissionPolicy;
use crate::state_machine::RetryPolicy;

const CONFIG_FILE_NAME: &str = "config.json";
const APP_DIR_NAME: &str = "thunder-capture";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config I/O on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialize config: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorMode {
    /// Synthetic detections, no hardware required.
    Simulated,
    /// AS3935 over a bus supplied by the integrator.
    Hardware,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub mode: SensorMode,
    /// Tick interval of the simulated sensor.
    pub simulated_interval_ms: u64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            mode: SensorMode::Simulated,
            simulated_interval_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Detections weaker than this never open a session.
    pub detection_intensity_threshold: u32,

    /// Only one trigger is admitted per window; extra interrupts from the same
    /// strike fall inside it.
    pub cooldown_window_ms: u64,

    /// Recordings stop after this long.
    pub max_recording_duration_ms: u64,

    /// Retries after the first attempt for audio capture and store writes.
    pub max_retry_count: u32,

    /// Base delay between retries; doubles per attempt.
    pub retry_backoff_ms: u64,

    /// How long the controller stays in Error before returning to Idle.
    pub error_recovery_ms: u64,

    /// Triggers arriving while busy are queued when at least this strong,
    /// dropped otherwise.
    pub override_intensity_threshold: u32,

    pub recording_directory: PathBuf,
    pub waveform_directory: PathBuf,
    pub database_file: PathBuf,

    /// Lines kept in the in-memory log tail.
    pub log_buffer_lines: usize,

    /// Input device name; the default input device when unset.
    pub audio_device: Option<String>,

    pub waveform_width_px: u32,
    pub waveform_height_px: u32,
    pub waveform_color: String,

    pub sensor: SensorConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            detection_intensity_threshold: 0,
            cooldown_window_ms: 2_000,
            max_recording_duration_ms: 60_000,
            max_retry_count: 3,
            retry_backoff_ms: 250,
            error_recovery_ms: 1_000,
            override_intensity_threshold: 0,
            recording_directory: data_dir.join("recordings"),
            waveform_directory: data_dir.join("waveforms"),
            database_file: data_dir.join("db").join("recordings.db"),
            log_buffer_lines: 500,
            audio_device: None,
            waveform_width_px: 600,
            waveform_height_px: 120,
            waveform_color: "#007bff".to_string(),
            sensor: SensorConfig::default(),
        }
    }
}

/// Where audio and images land. The core only needs resolvable paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePaths {
    pub audio_dir: PathBuf,
    pub image_dir: PathBuf,
}

/// What the capture controller is constructed with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub detection_intensity_threshold: u32,
    pub cooldown_window_ms: u64,
    pub max_recording_duration_ms: u64,
    pub max_retry_count: u32,
    pub retry_backoff_ms: u64,
    pub error_recovery_ms: u64,
    pub override_intensity_threshold: u32,
    pub file_paths: FilePaths,
}

impl ControllerConfig {
    pub fn admission_policy(&self) -> AdmissionPolicy {
        AdmissionPolicy {
            intensity_threshold: self.detection_intensity_threshold,
            cooldown_ms: self.cooldown_window_ms,
            override_intensity: self.override_intensity_threshold,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retry_count: self.max_retry_count,
            backoff: Duration::from_millis(self.retry_backoff_ms),
            recovery: Duration::from_millis(self.error_recovery_ms),
        }
    }

    pub fn max_recording_duration(&self) -> Duration {
        Duration::from_millis(self.max_recording_duration_ms)
    }
}

impl AppConfig {
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            detection_intensity_threshold: self.detection_intensity_threshold,
            cooldown_window_ms: self.cooldown_window_ms,
            max_recording_duration_ms: self.max_recording_duration_ms,
            max_retry_count: self.max_retry_count,
            retry_backoff_ms: self.retry_backoff_ms,
            error_recovery_ms: self.error_recovery_ms,
            override_intensity_threshold: self.override_intensity_threshold,
            file_paths: FilePaths {
                audio_dir: self.recording_directory.clone(),
                image_dir: self.waveform_directory.clone(),
            },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_recording_duration_ms == 0 {
            return Err(ConfigError::Invalid(
                "max_recording_duration_ms must be greater than 0".to_string(),
            ));
        }
        if i64::try_from(self.cooldown_window_ms).is_err() {
            return Err(ConfigError::Invalid(
                "cooldown_window_ms is out of range".to_string(),
            ));
        }
        if self.log_buffer_lines == 0 {
            return Err(ConfigError::Invalid(
                "log_buffer_lines must be greater than 0".to_string(),
            ));
        }
        if self.waveform_width_px == 0 || self.waveform_height_px == 0 {
            return Err(ConfigError::Invalid(
                "waveform dimensions must be non-zero".to_string(),
            ));
        }
        for (name, path) in [
            ("recording_directory", &self.recording_directory),
            ("waveform_directory", &self.waveform_directory),
            ("database_file", &self.database_file),
        ] {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::Invalid(format!("{} must not be empty", name)));
            }
        }
        Ok(())
    }
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

/// Default location: ~/.config/thunder-capture/config.json
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
        .join(CONFIG_FILE_NAME)
}

/// Load the config, falling back to defaults when the file is missing or broken.
pub fn load_config(path: &Path) -> AppConfig {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<AppConfig>(&contents) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("Config: failed to parse {:?}: {}", path, e);
                AppConfig::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppConfig::default(),
        Err(e) => {
            log::warn!("Config: failed to read {:?}: {}", path, e);
            AppConfig::default()
        }
    }
}

pub fn save_config(path: &Path, config: &AppConfig) -> Result<(), ConfigError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| ConfigError::Io { path, source }
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err(parent))?;
    }

    let contents = serde_json::to_string_pretty(config)?;

    // Write atomically: write to a temp file in the same directory, then rename.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents).map_err(io_err(&tmp_path))?;

    // On Windows, rename fails if the destination exists.
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(io_err(path)(e));
            }
        }
    }

    std::fs::rename(&tmp_path, path).map_err(io_err(path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("nope.json"));
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = AppConfig {
            detection_intensity_threshold: 30,
            audio_device: Some("plughw:3,0".to_string()),
            ..AppConfig::default()
        };

        save_config(&path, &config).unwrap();
        assert_eq!(load_config(&path), config);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"cooldown_window_ms": 500, "sensor": {"mode": "hardware"}}"#)
            .unwrap();

        let config = load_config(&path);
        assert_eq!(config.cooldown_window_ms, 500);
        assert_eq!(config.sensor.mode, SensorMode::Hardware);
        assert_eq!(config.sensor.simulated_interval_ms, 10_000);
        assert_eq!(config.max_retry_count, 3);
    }

    #[test]
    fn unparsable_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(load_config(&path), AppConfig::default());
    }

    #[test]
    fn validate_rejects_zero_duration() {
        let config = AppConfig {
            max_recording_duration_ms: 0,
            ..AppConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn validate_rejects_out_of_range_cooldown() {
        let config = AppConfig {
            cooldown_window_ms: 1 << 63,
            ..AppConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = AppConfig {
            cooldown_window_ms: i64::MAX as u64,
            ..AppConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn controller_config_projects_policies() {
        let config = AppConfig {
            detection_intensity_threshold: 30,
            cooldown_window_ms: 2000,
            max_retry_count: 3,
            ..AppConfig::default()
        }
        .controller_config();

        assert_eq!(config.admission_policy().intensity_threshold, 30);
        assert_eq!(config.admission_policy().cooldown_ms, 2000);
        assert_eq!(config.retry_policy().max_retry_count, 3);
        assert_eq!(config.file_paths.audio_dir, AppConfig::default().recording_directory);
    }
}
