//! thunder-capture - lightning-triggered audio capture
//!
//! Subcommands:
//! - `thunder-capture run` - Run the capture service until Ctrl-C
//! - `thunder-capture add <wav>` - Import an existing recording
//! - `thunder-capture list` - Print recent records as JSON lines
//! - `thunder-capture purge` - Delete records by audio path prefix
//! - `thunder-capture config` - Print (or save) the effective configuration

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use thunder_capture::audio::{
    AudioCapture, CpalCapture, SvgWaveformRenderer, SyntheticCapture, WaveformStyle,
};
use thunder_capture::config::{self, AppConfig, SensorMode};
use thunder_capture::import::{import_wav, ImportTarget};
use thunder_capture::logging;
use thunder_capture::sensor::{spawn_sensor_pump, SensorEventSource, SimulatedSource};
use thunder_capture::store::{EventStore, SqliteEventStore};
use thunder_capture::CaptureService;

/// Longest clip the synthetic capture produces.
const SYNTHETIC_CLIP: Duration = Duration::from_secs(8);

#[derive(Parser)]
#[command(name = "thunder-capture")]
#[command(about = "Lightning-triggered audio capture with waveform rendering")]
#[command(version)]
struct Cli {
    /// Path to config.json
    #[arg(long, env = "THUNDER_CAPTURE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the capture service until Ctrl-C
    Run {
        /// Simulated sensor and synthetic audio; no hardware needed
        #[arg(long)]
        simulate: bool,

        /// Log a status snapshot every N seconds (0 = never)
        #[arg(long, default_value = "0")]
        status_every: u64,
    },

    /// Import an existing WAV file as a record
    Add {
        wav_file: PathBuf,

        /// Strike distance in km
        #[arg(long)]
        distance: Option<u8>,

        /// Strike intensity (sensor energy value)
        #[arg(long)]
        intensity: Option<u32>,
    },

    /// Print recent records as JSON lines
    List {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Delete records whose audio path starts with a prefix
    Purge {
        /// Audio path prefix
        prefix: Option<String>,

        /// Delete manual and simulated recordings under the recording directory
        #[arg(long, conflicts_with = "prefix")]
        simulated: bool,
    },

    /// Print the effective configuration
    Config {
        /// Write it back to the config path (fills in defaults)
        #[arg(long)]
        save: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for development convenience)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let logs = logging::init(AppConfig::default().log_buffer_lines);

    let config_path = cli.config.unwrap_or_else(config::default_config_path);
    let app_config = config::load_config(&config_path);
    app_config
        .validate()
        .with_context(|| format!("Invalid configuration in {:?}", config_path))?;
    logs.set_capacity(app_config.log_buffer_lines);

    match cli.command {
        Commands::Run {
            simulate,
            status_every,
        } => run(app_config, logs, simulate, status_every).await,
        Commands::Add {
            wav_file,
            distance,
            intensity,
        } => add(&app_config, &wav_file, distance, intensity),
        Commands::List { limit } => list(&app_config, limit),
        Commands::Purge { prefix, simulated } => purge(&app_config, prefix, simulated),
        Commands::Config { save } => {
            println!("{}", serde_json::to_string_pretty(&app_config)?);
            if save {
                config::save_config(&config_path, &app_config)?;
                log::info!("Configuration saved to {:?}", config_path);
            }
            Ok(())
        }
    }
}

fn open_store(config: &AppConfig) -> Result<SqliteEventStore> {
    SqliteEventStore::open(&config.database_file)
        .with_context(|| format!("Failed to open database {:?}", config.database_file))
}

fn renderer(config: &AppConfig) -> SvgWaveformRenderer {
    SvgWaveformRenderer::new(WaveformStyle {
        width: config.waveform_width_px,
        height: config.waveform_height_px,
        color: config.waveform_color.clone(),
    })
}

async fn run(
    config: AppConfig,
    logs: logging::LogBuffer,
    simulate: bool,
    status_every: u64,
) -> Result<()> {
    let sensor: Box<dyn SensorEventSource> = match (simulate, config.sensor.mode) {
        (true, _) | (false, SensorMode::Simulated) => Box::new(SimulatedSource::new(
            Duration::from_millis(config.sensor.simulated_interval_ms),
        )),
        (false, SensorMode::Hardware) => bail!(
            "sensor mode is \"hardware\" but this build has no AS3935 bus driver; \
             run with --simulate or set sensor.mode to \"simulated\""
        ),
    };

    let capture: Arc<dyn AudioCapture> = if simulate {
        Arc::new(SyntheticCapture::new(SYNTHETIC_CLIP).realtime(true))
    } else {
        Arc::new(CpalCapture::new(config.audio_device.clone()))
    };

    let store = Arc::new(open_store(&config)?);
    let service = CaptureService::start(
        config.controller_config(),
        capture,
        Arc::new(renderer(&config)),
        store,
        logs,
    );

    spawn_sensor_pump(sensor, service.sender()).context("Failed to start sensor thread")?;
    log::info!(
        "thunder-capture running (simulate={}, recordings={:?})",
        simulate,
        config.recording_directory
    );

    let status = service.status();
    if status_every > 0 {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(status_every));
            loop {
                ticker.tick().await;
                match status.snapshot_json() {
                    Ok(json) => log::info!("Status: {}", json),
                    Err(e) => log::warn!("Status serialization failed: {}", e),
                }
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    log::info!("Ctrl-C received, shutting down");

    if let Some(controller) = service.shutdown().await {
        log::info!(
            "Final metrics: {}",
            serde_json::to_string(&controller.metrics().summary())?
        );
    }
    Ok(())
}

fn add(
    config: &AppConfig,
    wav_file: &Path,
    distance: Option<u8>,
    intensity: Option<u32>,
) -> Result<()> {
    let store = open_store(config)?;
    let target = ImportTarget {
        recording_dir: &config.recording_directory,
        waveform_dir: &config.waveform_directory,
    };
    let id = import_wav(wav_file, distance, intensity, &target, &renderer(config), &store)
        .with_context(|| format!("Failed to import {:?}", wav_file))?;
    println!("{}", id);
    Ok(())
}

fn list(config: &AppConfig, limit: usize) -> Result<()> {
    let store = open_store(config)?;
    for record in store.list_recent(limit)? {
        println!("{}", serde_json::to_string(&record)?);
    }
    Ok(())
}

fn purge(config: &AppConfig, prefix: Option<String>, simulated: bool) -> Result<()> {
    let prefixes: Vec<String> = match (prefix, simulated) {
        (Some(prefix), _) => vec![prefix],
        (None, true) => ["manual_", "thunder_"]
            .iter()
            .map(|name| {
                config
                    .recording_directory
                    .join(name)
                    .to_string_lossy()
                    .into_owned()
            })
            .collect(),
        (None, false) => bail!("give a path prefix or --simulated"),
    };

    let store = open_store(config)?;
    let mut removed = 0;
    for prefix in &prefixes {
        let count = store.delete_by_path_prefix(prefix)?;
        log::info!("Purged {} record(s) under {:?}", count, prefix);
        removed += count;
    }
    println!("{}", removed);
    Ok(())
}
