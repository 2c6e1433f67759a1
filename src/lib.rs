//! padbridge - grid controller hardware bridge
//!
//! Bridges one physical pad/button grid controller to an external step
//! sequencer: device discovery and handshake, inbound event classification,
//! coalesced RGB LED feedback, clock-synchronized playhead rendering, and
//! heartbeat-driven error recovery.
//!
//! The embedding application supplies [`events::SequencerSnapshot`]s on
//! every meaningful pattern change and an implementation of
//! [`timing::MusicalClock`] for tick scheduling; the bridge produces
//! [`events::HardwareEvent`]s in return.

pub mod batch;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod health;
pub mod leds;
pub mod protocol;
pub mod recovery;
pub mod timing;
pub mod transport;

pub use config::BridgeConfig;
pub use controller::{ControllerState, PadController};
pub use error::{BridgeError, ErrorCode};
pub use events::{EventKind, EventType, HardwareEvent, SequencerSnapshot};
pub use timing::{InternalClock, MusicalClock, SyncState};
pub use transport::{GridTransport, MidiTransport};
