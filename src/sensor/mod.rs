//! Lightning sensor abstraction
//!
//! The sensor is modelled as a blocking, non-restartable stream of
//! [`DetectionEvent`]s. Hardware interrupt handling lives behind the
//! [`SensorEventSource`] trait so the controller can be driven by a synthetic
//! feed in tests and in simulation mode.

pub mod as3935;
mod simulated;

use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::state_machine::Event;

pub use as3935::{As3935Source, InterruptLine, RegisterBus};
pub use simulated::{ScriptedSource, SimulatedSource};

/// What the sensor reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionKind {
    Strike,
    Disturbance,
    Noise,
}

impl DetectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionKind::Strike => "strike",
            DetectionKind::Disturbance => "disturbance",
            DetectionKind::Noise => "noise",
        }
    }

    /// Parse the stored form back (used when reading records).
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "strike" => Some(DetectionKind::Strike),
            "disturbance" => Some(DetectionKind::Disturbance),
            "noise" => Some(DetectionKind::Noise),
            _ => None,
        }
    }
}

/// A single decoded sensor report. Immutable once emitted.
///
/// `distance_km` is only ever present for strikes; the constructors enforce it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectionEvent {
    timestamp: DateTime<Utc>,
    kind: DetectionKind,
    distance_km: Option<u8>,
    intensity: u32,
}

impl DetectionEvent {
    pub fn strike(timestamp: DateTime<Utc>, distance_km: Option<u8>, intensity: u32) -> Self {
        Self {
            timestamp,
            kind: DetectionKind::Strike,
            distance_km,
            intensity,
        }
    }

    pub fn disturbance(timestamp: DateTime<Utc>, intensity: u32) -> Self {
        Self {
            timestamp,
            kind: DetectionKind::Disturbance,
            distance_km: None,
            intensity,
        }
    }

    pub fn noise(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            kind: DetectionKind::Noise,
            distance_km: None,
            intensity: 0,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn kind(&self) -> DetectionKind {
        self.kind
    }

    pub fn distance_km(&self) -> Option<u8> {
        self.distance_km
    }

    pub fn intensity(&self) -> u32 {
        self.intensity
    }
}

/// Errors surfaced by a sensor source.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SensorError {
    /// Sensor unreadable. Terminal until process restart.
    #[error("sensor hardware fault: {0}")]
    HardwareFault(String),
    /// A finite feed ran out of events (scripted sources only).
    #[error("sensor feed exhausted")]
    Exhausted,
}

/// Blocking source of detection events.
///
/// Implementations must not restart after a [`SensorError::HardwareFault`]:
/// every later call returns the fault again.
pub trait SensorEventSource: Send {
    fn next_event(&mut self) -> Result<DetectionEvent, SensorError>;
}

impl<S: SensorEventSource + ?Sized> SensorEventSource for Box<S> {
    fn next_event(&mut self) -> Result<DetectionEvent, SensorError> {
        (**self).next_event()
    }
}

/// Run a sensor source on a dedicated OS thread, forwarding every event to
/// the controller loop.
///
/// The thread ends when the source faults, the feed is exhausted, or the
/// controller stops receiving. A hardware fault is forwarded as
/// [`Event::SensorFault`] before the thread exits.
pub fn spawn_sensor_pump<S>(
    mut source: S,
    tx: mpsc::Sender<Event>,
) -> std::io::Result<JoinHandle<()>>
where
    S: SensorEventSource + 'static,
{
    std::thread::Builder::new()
        .name("sensor-pump".to_string())
        .spawn(move || {
            log::info!("Sensor pump started");
            loop {
                match source.next_event() {
                    Ok(event) => {
                        log::debug!(
                            "Sensor: {} (distance={:?}, intensity={})",
                            event.kind().as_str(),
                            event.distance_km(),
                            event.intensity()
                        );
                        if tx.blocking_send(Event::Detection(event)).is_err() {
                            log::info!("Sensor pump: controller gone, stopping");
                            break;
                        }
                    }
                    Err(SensorError::Exhausted) => {
                        log::info!("Sensor pump: feed exhausted");
                        break;
                    }
                    Err(err @ SensorError::HardwareFault(_)) => {
                        log::error!("Sensor pump: {}", err);
                        let _ = tx.blocking_send(Event::SensorFault {
                            err: err.to_string(),
                        });
                        break;
                    }
                }
            }
            log::info!("Sensor pump stopped");
        })
}
