//! Grid controller wire protocol
//!
//! Status bytes, the handshake sequence, the device descriptor table, and
//! the step/track address mapping. Everything here is pure data or pure
//! functions; the transport layer owns the actual I/O.

use std::fmt;

/// Pad press (note on). Also the status byte for outbound LED writes.
pub const STATUS_PAD_DOWN: u8 = 0x90;
/// Pad release (note off).
pub const STATUS_PAD_UP: u8 = 0x80;
/// Continuous controller change (knobs, transport strip on some firmwares).
pub const STATUS_CONTROL_CHANGE: u8 = 0xB0;

/// Highest valid pad/LED address on the reference device (40 cells, 0..=39).
pub const MAX_ADDRESS: u8 = 39;

/// Pads per physical row on the reference device.
pub const GRID_COLUMNS: usize = 8;

/// Transport strip on the bottom row of the reference device.
pub const ADDR_TRANSPORT_PLAY: u8 = 32;
pub const ADDR_TRANSPORT_STOP: u8 = 33;
pub const ADDR_TRANSPORT_PAUSE: u8 = 34;

/// Frames sent once after connect to put the device into host-controlled
/// LED mode. First frame enters host mode, second clears the LED buffer.
pub const HANDSHAKE_FRAMES: &[&[u8]] = &[
    &[0xF0, 0x00, 0x20, 0x6B, 0x7F, 0x42, 0x02, 0x00, 0x01, 0xF7],
    &[0xB0, 0x00, 0x00],
];

/// Static capabilities of a supported grid controller family.
#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    /// Substring patterns matched (case-insensitively) against port names.
    pub name_patterns: Vec<String>,
    pub has_leds: bool,
    pub has_velocity_pads: bool,
    pub step_buttons: usize,
    pub track_buttons: usize,
}

impl DeviceDescriptor {
    /// The reference 16-step, 4-track pad grid.
    pub fn pad_controller() -> Self {
        Self {
            name_patterns: vec![
                "PadController".to_string(),
                "Pad Controller".to_string(),
                "PadCtl".to_string(),
            ],
            has_leds: true,
            has_velocity_pads: true,
            step_buttons: 16,
            track_buttons: 4,
        }
    }

    /// Case-insensitive substring match against a port name.
    pub fn matches(&self, port_name: &str) -> bool {
        let lower = port_name.to_lowercase();
        self.name_patterns
            .iter()
            .any(|p| lower.contains(&p.to_lowercase()))
    }
}

/// Bijective step↔address and track↔row mapping, built once per connection.
///
/// Steps take the first `step_count` protocol addresses. Tracks invert to
/// rows because the physical grid is wired bottom-up (track 0 is the
/// highest row).
#[derive(Debug, Clone)]
pub struct GridMapping {
    step_count: usize,
    track_count: usize,
}

impl GridMapping {
    pub fn new(step_count: usize, track_count: usize) -> crate::error::Result<Self> {
        if step_count == 0 || step_count > MAX_ADDRESS as usize + 1 {
            return Err(crate::error::BridgeError::InitializationFailed(format!(
                "step count {} outside addressable range 1..={}",
                step_count,
                MAX_ADDRESS as usize + 1
            )));
        }
        Ok(Self {
            step_count,
            track_count,
        })
    }

    pub fn step_count(&self) -> usize {
        self.step_count
    }

    pub fn track_count(&self) -> usize {
        self.track_count
    }

    pub fn is_valid_address(&self, address: u8) -> bool {
        address <= MAX_ADDRESS
    }

    pub fn address_for_step(&self, step: usize) -> Option<u8> {
        (step < self.step_count).then(|| step as u8)
    }

    pub fn step_for_address(&self, address: u8) -> Option<usize> {
        ((address as usize) < self.step_count).then_some(address as usize)
    }

    /// Track index to physical row, inverted for bottom-up wiring.
    pub fn row_for_track(&self, track: usize) -> Option<usize> {
        (track < self.track_count).then(|| self.track_count - 1 - track)
    }

    pub fn track_for_row(&self, row: usize) -> Option<usize> {
        (row < self.track_count).then(|| self.track_count - 1 - row)
    }
}

/// A classified inbound frame from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PadMessage {
    /// Pad press: address (0-39), velocity (1-127)
    PadDown { address: u8, velocity: u8 },
    /// Pad release: address (0-39)
    PadUp { address: u8 },
    /// Controller change: cc (0-127), value (0-127)
    ControlChange { cc: u8, value: u8 },
}

impl PadMessage {
    /// Parse a raw 2-3 byte frame by its leading status byte.
    ///
    /// Returns `None` for frames the bridge does not handle (running
    /// status, system messages, truncated frames).
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 3 {
            return None;
        }

        let status = data[0] & 0xF0;
        let d1 = data[1] & 0x7F;
        let d2 = data[2] & 0x7F;

        match status {
            // Press with velocity 0 is a release on this protocol family
            STATUS_PAD_DOWN => {
                if d2 == 0 {
                    Some(PadMessage::PadUp { address: d1 })
                } else {
                    Some(PadMessage::PadDown {
                        address: d1,
                        velocity: d2,
                    })
                }
            }
            STATUS_PAD_UP => Some(PadMessage::PadUp { address: d1 }),
            STATUS_CONTROL_CHANGE => Some(PadMessage::ControlChange { cc: d1, value: d2 }),
            _ => None,
        }
    }

    /// Encode the message back to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        match *self {
            PadMessage::PadDown { address, velocity } => {
                vec![STATUS_PAD_DOWN, address & 0x7F, velocity & 0x7F]
            }
            PadMessage::PadUp { address } => vec![STATUS_PAD_UP, address & 0x7F, 0],
            PadMessage::ControlChange { cc, value } => {
                vec![STATUS_CONTROL_CHANGE, cc & 0x7F, value & 0x7F]
            }
        }
    }
}

impl fmt::Display for PadMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            PadMessage::PadDown { address, velocity } => {
                write!(f, "PadDown addr:{} v:{}", address, velocity)
            }
            PadMessage::PadUp { address } => write!(f, "PadUp addr:{}", address),
            PadMessage::ControlChange { cc, value } => {
                write!(f, "CC cc:{} v:{}", cc, value)
            }
        }
    }
}

/// Encode one outbound LED write as a wire frame.
pub fn led_frame(address: u8, color: u8) -> [u8; 3] {
    [STATUS_PAD_DOWN, address & 0x7F, color & 0x7F]
}

/// Format raw bytes as hex for debug logging.
pub fn format_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_pad_down_parsing() {
        let msg = PadMessage::parse(&[0x90, 5, 100]).unwrap();
        assert_eq!(
            msg,
            PadMessage::PadDown {
                address: 5,
                velocity: 100
            }
        );
    }

    #[test]
    fn test_pad_down_velocity_zero_is_release() {
        let msg = PadMessage::parse(&[0x90, 5, 0]).unwrap();
        assert_eq!(msg, PadMessage::PadUp { address: 5 });
    }

    #[test]
    fn test_control_change_parsing() {
        let msg = PadMessage::parse(&[0xB0, 16, 64]).unwrap();
        assert_eq!(msg, PadMessage::ControlChange { cc: 16, value: 64 });
    }

    #[test]
    fn test_unhandled_frames() {
        assert_eq!(PadMessage::parse(&[]), None);
        assert_eq!(PadMessage::parse(&[0x90, 5]), None);
        assert_eq!(PadMessage::parse(&[0xF8, 0, 0]), None);
    }

    #[test]
    fn test_led_frame() {
        assert_eq!(led_frame(12, 21), [0x90, 12, 21]);
    }

    #[test]
    fn test_descriptor_match_is_case_insensitive() {
        let desc = DeviceDescriptor::pad_controller();
        assert!(desc.matches("MIDIIN2 (padcontroller mk2)"));
        assert!(desc.matches("PadController"));
        assert!(!desc.matches("IAC Driver Bus 1"));
    }

    #[test]
    fn test_track_row_inversion() {
        let mapping = GridMapping::new(16, 4).unwrap();
        assert_eq!(mapping.row_for_track(0), Some(3));
        assert_eq!(mapping.row_for_track(3), Some(0));
        assert_eq!(mapping.track_for_row(3), Some(0));
        assert_eq!(mapping.row_for_track(4), None);
    }

    #[test]
    fn test_mapping_rejects_oversized_grid() {
        assert!(GridMapping::new(41, 4).is_err());
        assert!(GridMapping::new(0, 4).is_err());
        assert!(GridMapping::new(40, 4).is_ok());
    }

    proptest! {
        // Round-trip bijection over the whole step domain
        #[test]
        fn step_address_roundtrip(step_count in 1usize..=40, track_count in 1usize..=8) {
            let mapping = GridMapping::new(step_count, track_count).unwrap();
            let mut seen = std::collections::HashSet::new();
            for s in 0..step_count {
                let addr = mapping.address_for_step(s).unwrap();
                prop_assert!(mapping.is_valid_address(addr));
                prop_assert!(seen.insert(addr), "address collision at step {}", s);
                prop_assert_eq!(mapping.step_for_address(addr), Some(s));
            }
            prop_assert_eq!(mapping.address_for_step(step_count), None);
        }

        #[test]
        fn parse_encode_roundtrip(addr in 0u8..=127, vel in 1u8..=127) {
            let msg = PadMessage::PadDown { address: addr, velocity: vel };
            prop_assert_eq!(PadMessage::parse(&msg.encode()), Some(msg));
        }
    }
}
