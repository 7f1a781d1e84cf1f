//! Sensor sources that need no hardware.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::Utc;

use super::{DetectionEvent, SensorError, SensorEventSource};

/// Simulated detector for running on machines without the sensor attached.
///
/// Wakes every `interval`; every fifth tick is a strike, every other even
/// tick a disturber, the rest are quiet.
pub struct SimulatedSource {
    interval: Duration,
    tick: u64,
}

impl SimulatedSource {
    pub fn new(interval: Duration) -> Self {
        Self { interval, tick: 0 }
    }
}

impl SensorEventSource for SimulatedSource {
    fn next_event(&mut self) -> Result<DetectionEvent, SensorError> {
        loop {
            std::thread::sleep(self.interval);
            self.tick += 1;

            if self.tick % 5 == 0 {
                return Ok(DetectionEvent::strike(Utc::now(), Some(15), 12_345));
            }
            if self.tick % 2 == 0 {
                return Ok(DetectionEvent::disturbance(Utc::now(), 500));
            }
            log::trace!("Simulated sensor: still listening (tick {})", self.tick);
        }
    }
}

/// Finite, pre-recorded feed. Used by tests and demos.
pub struct ScriptedSource {
    events: VecDeque<(Duration, DetectionEvent)>,
    fault: Option<String>,
}

impl ScriptedSource {
    pub fn new(events: Vec<DetectionEvent>) -> Self {
        Self {
            events: events.into_iter().map(|e| (Duration::ZERO, e)).collect(),
            fault: None,
        }
    }

    /// Each event is delivered after its paired delay.
    pub fn with_delays(events: Vec<(Duration, DetectionEvent)>) -> Self {
        Self {
            events: events.into(),
            fault: None,
        }
    }

    /// Report a hardware fault once the scripted events run out.
    pub fn then_fault(mut self, message: impl Into<String>) -> Self {
        self.fault = Some(message.into());
        self
    }
}

impl SensorEventSource for ScriptedSource {
    fn next_event(&mut self) -> Result<DetectionEvent, SensorError> {
        match self.events.pop_front() {
            Some((delay, event)) => {
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
                Ok(event)
            }
            None => match &self.fault {
                Some(message) => Err(SensorError::HardwareFault(message.clone())),
                None => Err(SensorError::Exhausted),
            },
        }
    }
}
