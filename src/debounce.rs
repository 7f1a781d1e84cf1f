//! Trigger admission: intensity floor, cooldown window and busy policy
//!
//! A single physical strike can raise several sensor interrupts within a few
//! hundred milliseconds. The gate admits at most one trigger per cooldown
//! window, measured on sensor timestamps. A timestamp more than one window
//! before the last admission is treated as a wall-clock step backwards (NTP
//! correction, RTC reset) and does not block the trigger.

use chrono::{DateTime, Duration, Utc};

use crate::sensor::{DetectionEvent, DetectionKind};

/// Why a detection did not become a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Noise,
    BelowThreshold,
    Cooldown,
    /// Controller busy and the event is below the override intensity
    Busy,
    /// Controller busy and a trigger is already queued
    QueueFull,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Noise => "noise",
            RejectReason::BelowThreshold => "below threshold",
            RejectReason::Cooldown => "cooldown",
            RejectReason::Busy => "busy",
            RejectReason::QueueFull => "queue full",
        }
    }
}

/// Outcome of [`AdmissionGate::evaluate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Open a session now
    Start,
    /// Hold until the controller is idle again
    Queue,
    Reject(RejectReason),
}

/// What the controller is doing when a detection arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occupancy {
    Idle,
    Busy { queue_free: bool },
}

/// Admission thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionPolicy {
    pub intensity_threshold: u32,
    pub cooldown_ms: u64,
    /// Minimum intensity for a busy-time trigger to be queued instead of dropped.
    pub override_intensity: u32,
}

/// Stateful debounce gate. Remembers the last admitted trigger.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    policy: AdmissionPolicy,
    cooldown: Duration,
    last_admitted: Option<DateTime<Utc>>,
}

impl AdmissionGate {
    pub fn new(policy: AdmissionPolicy) -> Self {
        Self {
            cooldown: cooldown_window(policy.cooldown_ms),
            policy,
            last_admitted: None,
        }
    }

    pub fn last_admitted(&self) -> Option<DateTime<Utc>> {
        self.last_admitted
    }

    /// Check a detection and, when admitted or queued, start a new cooldown window.
    pub fn evaluate(&mut self, event: &DetectionEvent, occupancy: Occupancy) -> Admission {
        if event.kind() == DetectionKind::Noise {
            return Admission::Reject(RejectReason::Noise);
        }
        if event.intensity() < self.policy.intensity_threshold {
            return Admission::Reject(RejectReason::BelowThreshold);
        }
        if self.in_cooldown(event.timestamp()) {
            return Admission::Reject(RejectReason::Cooldown);
        }

        let admission = match occupancy {
            Occupancy::Idle => Admission::Start,
            Occupancy::Busy { .. } if event.intensity() < self.policy.override_intensity => {
                return Admission::Reject(RejectReason::Busy)
            }
            Occupancy::Busy { queue_free: false } => {
                return Admission::Reject(RejectReason::QueueFull)
            }
            Occupancy::Busy { queue_free: true } => Admission::Queue,
        };

        self.last_admitted = Some(event.timestamp());
        admission
    }

    fn in_cooldown(&self, at: DateTime<Utc>) -> bool {
        let Some(last) = self.last_admitted else {
            return false;
        };
        let elapsed = at.signed_duration_since(last);
        if elapsed <= -self.cooldown {
            log::warn!(
                "Detection at {} is {}ms before the last admitted trigger, clock stepped back",
                at,
                -elapsed.num_milliseconds()
            );
            return false;
        }
        // Slightly out-of-order timestamps count as inside the window.
        elapsed < self.cooldown
    }
}

/// Window length, saturating for values beyond what a `Duration` holds.
fn cooldown_window(cooldown_ms: u64) -> Duration {
    i64::try_from(cooldown_ms)
        .ok()
        .and_then(Duration::try_milliseconds)
        .unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(threshold: u32, cooldown_ms: u64, override_intensity: u32) -> AdmissionGate {
        AdmissionGate::new(AdmissionPolicy {
            intensity_threshold: threshold,
            cooldown_ms,
            override_intensity,
        })
    }

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(1_700_000_000_000 + ms).unwrap()
    }

    #[test]
    fn noise_is_always_rejected() {
        let mut g = gate(0, 0, 0);
        assert_eq!(
            g.evaluate(&DetectionEvent::noise(at(0)), Occupancy::Idle),
            Admission::Reject(RejectReason::Noise)
        );
        assert!(g.last_admitted().is_none());
    }

    #[test]
    fn below_threshold_is_rejected() {
        let mut g = gate(30, 2000, 0);
        assert_eq!(
            g.evaluate(&DetectionEvent::strike(at(0), Some(5), 29), Occupancy::Idle),
            Admission::Reject(RejectReason::BelowThreshold)
        );
        assert_eq!(
            g.evaluate(&DetectionEvent::strike(at(0), Some(5), 30), Occupancy::Idle),
            Admission::Start
        );
    }

    #[test]
    fn second_interrupt_within_cooldown_is_rejected() {
        let mut g = gate(30, 2000, 0);
        assert_eq!(
            g.evaluate(&DetectionEvent::disturbance(at(0), 50), Occupancy::Idle),
            Admission::Start
        );
        assert_eq!(
            g.evaluate(&DetectionEvent::strike(at(500), Some(3), 45), Occupancy::Idle),
            Admission::Reject(RejectReason::Cooldown)
        );
        assert_eq!(
            g.evaluate(&DetectionEvent::strike(at(2000), Some(3), 45), Occupancy::Idle),
            Admission::Start
        );
    }

    #[test]
    fn rejected_events_do_not_extend_cooldown() {
        let mut g = gate(30, 2000, 0);
        g.evaluate(&DetectionEvent::strike(at(0), None, 40), Occupancy::Idle);
        g.evaluate(&DetectionEvent::strike(at(1500), None, 40), Occupancy::Idle);
        assert_eq!(
            g.evaluate(&DetectionEvent::strike(at(2100), None, 40), Occupancy::Idle),
            Admission::Start
        );
    }

    #[test]
    fn busy_policy_queues_strong_and_drops_weak() {
        let mut g = gate(10, 0, 100);
        let busy = Occupancy::Busy { queue_free: true };
        assert_eq!(
            g.evaluate(&DetectionEvent::strike(at(0), None, 50), busy),
            Admission::Reject(RejectReason::Busy)
        );
        assert_eq!(
            g.evaluate(&DetectionEvent::strike(at(10), None, 150), busy),
            Admission::Queue
        );
        assert_eq!(
            g.evaluate(
                &DetectionEvent::strike(at(20), None, 150),
                Occupancy::Busy { queue_free: false }
            ),
            Admission::Reject(RejectReason::QueueFull)
        );
    }

    #[test]
    fn out_of_order_timestamp_is_inside_window() {
        let mut g = gate(0, 1000, 0);
        g.evaluate(&DetectionEvent::strike(at(5000), None, 1), Occupancy::Idle);
        assert_eq!(
            g.evaluate(&DetectionEvent::strike(at(4500), None, 1), Occupancy::Idle),
            Admission::Reject(RejectReason::Cooldown)
        );
    }

    #[test]
    fn clock_stepping_back_does_not_block_triggers() {
        let mut g = gate(0, 2000, 0);
        let hour = 3_600_000;
        g.evaluate(&DetectionEvent::strike(at(hour), None, 1), Occupancy::Idle);
        assert_eq!(
            g.evaluate(&DetectionEvent::strike(at(0), None, 1), Occupancy::Idle),
            Admission::Start
        );
        // The window now runs from the corrected clock
        assert_eq!(
            g.evaluate(&DetectionEvent::strike(at(500), None, 1), Occupancy::Idle),
            Admission::Reject(RejectReason::Cooldown)
        );
    }

    #[test]
    fn huge_cooldown_saturates_instead_of_overflowing() {
        let mut g = gate(0, 1 << 63, 0);
        assert_eq!(
            g.evaluate(&DetectionEvent::strike(at(0), None, 1), Occupancy::Idle),
            Admission::Start
        );
        assert_eq!(
            g.evaluate(&DetectionEvent::strike(at(500), None, 1), Occupancy::Idle),
            Admission::Reject(RejectReason::Cooldown)
        );

        let mut g = gate(0, u64::MAX, 0);
        g.evaluate(&DetectionEvent::strike(at(0), None, 1), Occupancy::Idle);
        assert_eq!(
            g.evaluate(&DetectionEvent::strike(at(3_600_000), None, 1), Occupancy::Idle),
            Admission::Reject(RejectReason::Cooldown)
        );
    }
}
