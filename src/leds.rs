//! LED color and intensity policy
//!
//! Pure functions from sequencer state to per-pad LED state. The mapper is
//! stateless so identical inputs always produce identical output; the
//! controller does the diffing against its last-known cache.

use std::collections::HashSet;

/// Protocol color codes for the reference device palette.
pub mod color {
    pub const OFF: u8 = 0;
    /// Active step (green).
    pub const ACTIVE: u8 = 21;
    /// Accented active step, velocity >= ACCENT_VELOCITY (red).
    pub const ACCENT: u8 = 5;
    /// Current playback position (white).
    pub const PLAYHEAD: u8 = 3;
    /// Upcoming step inside the lookahead window (amber).
    pub const LOOKAHEAD: u8 = 9;
}

/// Velocity at or above which an active step renders the accent color.
pub const ACCENT_VELOCITY: u8 = 112;

/// Floor for any non-zero velocity so quiet steps stay perceptible.
pub const MIN_VISIBLE_INTENSITY: u8 = 24;

pub const FULL_INTENSITY: u8 = 127;

/// Desired state of one LED cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedState {
    pub color: u8,
    pub intensity: u8,
    pub blink: bool,
}

impl LedState {
    pub const OFF: LedState = LedState {
        color: color::OFF,
        intensity: 0,
        blink: false,
    };

    /// Encode for the 3-byte LED frame: low 6 bits carry the palette code,
    /// bit 6 selects the device's blink mode. Intensity below the device's
    /// own floor renders as off.
    pub fn wire_byte(&self) -> u8 {
        if self.intensity == 0 {
            return color::OFF;
        }
        (self.color & 0x3F) | if self.blink { 0x40 } else { 0 }
    }
}

/// Clamped, monotonically non-decreasing velocity-to-intensity mapping.
///
/// 0 maps to 0 (off), 127 maps to full; everything in between is scaled
/// linearly but floored at [`MIN_VISIBLE_INTENSITY`].
pub fn intensity_for_velocity(velocity: u8) -> u8 {
    let velocity = velocity.min(127);
    if velocity == 0 {
        return 0;
    }
    let scaled = ((velocity as u16 * FULL_INTENSITY as u16) / 127) as u8;
    scaled.max(MIN_VISIBLE_INTENSITY)
}

/// Compute the LED state for one step cell.
///
/// Precedence: playhead > lookahead > active-with-velocity > off.
pub fn led_for_step(
    active: bool,
    velocity: u8,
    step: usize,
    playhead: Option<usize>,
    lookahead: &HashSet<usize>,
) -> LedState {
    if playhead == Some(step) {
        return LedState {
            color: color::PLAYHEAD,
            intensity: FULL_INTENSITY,
            blink: false,
        };
    }
    if lookahead.contains(&step) {
        return LedState {
            color: color::LOOKAHEAD,
            intensity: intensity_for_velocity(velocity).max(MIN_VISIBLE_INTENSITY),
            blink: true,
        };
    }
    if active && velocity > 0 {
        let color = if velocity >= ACCENT_VELOCITY {
            color::ACCENT
        } else {
            color::ACTIVE
        };
        return LedState {
            color,
            intensity: intensity_for_velocity(velocity),
            blink: false,
        };
    }
    LedState::OFF
}
