//! AS3935 lightning sensor: interrupt decoding
//!
//! Bus transport (I2C/SPI) and GPIO edge waiting are provided by the
//! integrator through [`RegisterBus`] and [`InterruptLine`]; this module only
//! turns the register payload into [`DetectionEvent`]s.

use std::time::Duration;

use chrono::Utc;

use super::{DetectionEvent, DetectionKind, SensorError, SensorEventSource};

/// Interrupt source register (bits 3:0).
const REG_INT: u8 = 0x03;
/// Strike energy, least significant byte.
const REG_ENERGY_LSB: u8 = 0x04;
/// Strike energy, most significant byte.
const REG_ENERGY_MSB: u8 = 0x05;
/// Strike energy, bits 4:0 are the top of the 21-bit value.
const REG_ENERGY_MMSB: u8 = 0x06;
/// Distance estimation register (bits 5:0).
const REG_DISTANCE: u8 = 0x07;

const INT_NOISE_HIGH: u8 = 0x01;
const INT_DISTURBER: u8 = 0x04;
const INT_LIGHTNING: u8 = 0x08;

const DISTANCE_OUT_OF_RANGE: u8 = 0x3F;

/// The datasheet requires 2ms between IRQ and reading INT; the vendor driver waits 5ms.
const IRQ_SETTLE: Duration = Duration::from_millis(5);

/// Register-level access to the chip.
pub trait RegisterBus: Send {
    fn read_register(&mut self, register: u8) -> std::io::Result<u8>;
}

/// The IRQ pin. Blocks until the next rising edge.
pub trait InterruptLine: Send {
    fn wait_for_edge(&mut self) -> std::io::Result<()>;
}

/// Map the INT register to a detection kind. Unknown values (including 0,
/// which the chip reports after a distance purge) yield `None`.
pub fn decode_interrupt(int_reg: u8) -> Option<DetectionKind> {
    match int_reg & 0x0F {
        INT_LIGHTNING => Some(DetectionKind::Strike),
        INT_DISTURBER => Some(DetectionKind::Disturbance),
        INT_NOISE_HIGH => Some(DetectionKind::Noise),
        _ => None,
    }
}

/// Distance in km, `None` when the storm is out of range.
/// A value of 1 means the storm is overhead.
pub fn decode_distance(reg: u8) -> Option<u8> {
    match reg & 0x3F {
        DISTANCE_OUT_OF_RANGE => None,
        km => Some(km),
    }
}

/// Assemble the 21-bit raw strike energy.
pub fn decode_energy(lsb: u8, msb: u8, mmsb: u8) -> u32 {
    (u32::from(mmsb & 0x1F) << 16) | (u32::from(msb) << 8) | u32::from(lsb)
}

/// Event source reading an AS3935 over a register bus.
pub struct As3935Source<B, L> {
    bus: B,
    irq: L,
    fault: Option<String>,
}

impl<B: RegisterBus, L: InterruptLine> As3935Source<B, L> {
    pub fn new(bus: B, irq: L) -> Self {
        Self {
            bus,
            irq,
            fault: None,
        }
    }

    fn read(&mut self, register: u8) -> Result<u8, SensorError> {
        match self.bus.read_register(register) {
            Ok(value) => Ok(value),
            Err(e) => Err(self.latch_fault(format!("read register 0x{:02x}: {}", register, e))),
        }
    }

    fn latch_fault(&mut self, message: String) -> SensorError {
        self.fault = Some(message.clone());
        SensorError::HardwareFault(message)
    }

    fn read_energy(&mut self) -> Result<u32, SensorError> {
        let lsb = self.read(REG_ENERGY_LSB)?;
        let msb = self.read(REG_ENERGY_MSB)?;
        let mmsb = self.read(REG_ENERGY_MMSB)?;
        Ok(decode_energy(lsb, msb, mmsb))
    }
}

impl<B: RegisterBus, L: InterruptLine> SensorEventSource for As3935Source<B, L> {
    fn next_event(&mut self) -> Result<DetectionEvent, SensorError> {
        if let Some(message) = &self.fault {
            return Err(SensorError::HardwareFault(message.clone()));
        }

        loop {
            if let Err(e) = self.irq.wait_for_edge() {
                return Err(self.latch_fault(format!("irq wait: {}", e)));
            }
            std::thread::sleep(IRQ_SETTLE);

            let int_reg = self.read(REG_INT)?;
            let timestamp = Utc::now();
            let Some(kind) = decode_interrupt(int_reg) else {
                log::trace!("AS3935: ignoring interrupt 0x{:02x}", int_reg);
                continue;
            };

            return Ok(match kind {
                DetectionKind::Strike => {
                    let distance = decode_distance(self.read(REG_DISTANCE)?);
                    let energy = self.read_energy()?;
                    DetectionEvent::strike(timestamp, distance, energy)
                }
                // The chip has no disturber energy; the registers hold the last reading.
                DetectionKind::Disturbance => {
                    DetectionEvent::disturbance(timestamp, self.read_energy()?)
                }
                DetectionKind::Noise => DetectionEvent::noise(timestamp),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};

    struct FakeBus {
        regs: HashMap<u8, VecDeque<u8>>,
        fail: bool,
    }

    impl FakeBus {
        fn new() -> Self {
            Self {
                regs: HashMap::new(),
                fail: false,
            }
        }

        fn push(&mut self, reg: u8, value: u8) {
            self.regs.entry(reg).or_default().push_back(value);
        }
    }

    impl RegisterBus for FakeBus {
        fn read_register(&mut self, register: u8) -> std::io::Result<u8> {
            if self.fail {
                return Err(std::io::Error::other("nack"));
            }
            Ok(self
                .regs
                .get_mut(&register)
                .and_then(|q| q.pop_front())
                .unwrap_or(0))
        }
    }

    struct AlwaysEdge;

    impl InterruptLine for AlwaysEdge {
        fn wait_for_edge(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_decode_interrupt() {
        assert_eq!(decode_interrupt(0x08), Some(DetectionKind::Strike));
        assert_eq!(decode_interrupt(0x04), Some(DetectionKind::Disturbance));
        assert_eq!(decode_interrupt(0x01), Some(DetectionKind::Noise));
        // upper nibble is not part of the interrupt field
        assert_eq!(decode_interrupt(0xF8), Some(DetectionKind::Strike));
        assert_eq!(decode_interrupt(0x00), None);
    }

    #[test]
    fn test_decode_distance() {
        assert_eq!(decode_distance(0x3F), None);
        assert_eq!(decode_distance(0x01), Some(1));
        assert_eq!(decode_distance(0x28), Some(40));
        assert_eq!(decode_distance(0xC0 | 0x0E), Some(14));
    }

    #[test]
    fn test_decode_energy() {
        assert_eq!(decode_energy(0x01, 0x00, 0x00), 1);
        assert_eq!(decode_energy(0x34, 0x12, 0x01), 0x01_1234);
        // only five bits of the top register count
        assert_eq!(decode_energy(0xFF, 0xFF, 0xFF), 0x1F_FFFF);
    }

    #[test]
    fn strike_reads_distance_and_energy() {
        let mut bus = FakeBus::new();
        bus.push(REG_INT, INT_LIGHTNING);
        bus.push(REG_DISTANCE, 12);
        bus.push(REG_ENERGY_LSB, 0x39);
        bus.push(REG_ENERGY_MSB, 0x30);
        let mut source = As3935Source::new(bus, AlwaysEdge);

        let event = source.next_event().unwrap();
        assert_eq!(event.kind(), DetectionKind::Strike);
        assert_eq!(event.distance_km(), Some(12));
        assert_eq!(event.intensity(), 0x3039);
    }

    #[test]
    fn unknown_interrupts_are_skipped() {
        let mut bus = FakeBus::new();
        bus.push(REG_INT, 0x00);
        bus.push(REG_INT, INT_NOISE_HIGH);
        let mut source = As3935Source::new(bus, AlwaysEdge);

        assert_eq!(source.next_event().unwrap().kind(), DetectionKind::Noise);
    }

    #[test]
    fn fault_is_sticky() {
        let mut bus = FakeBus::new();
        bus.fail = true;
        let mut source = As3935Source::new(bus, AlwaysEdge);

        assert!(matches!(
            source.next_event(),
            Err(SensorError::HardwareFault(_))
        ));
        source.bus.fail = false;
        source.bus.push(REG_INT, INT_LIGHTNING);
        assert!(matches!(
            source.next_event(),
            Err(SensorError::HardwareFault(_))
        ));
    }
}
