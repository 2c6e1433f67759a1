//! Hardware events and sequencer snapshot types
//!
//! Events are created by the controller, immutable once emitted, and fanned
//! out synchronously to registered listeners. Payloads are tagged per event
//! kind so dispatch sites match exhaustively.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::error;

/// Event categories listeners subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    StepToggle,
    ConnectionChange,
    HardwareInput,
}

/// Typed event payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// A step-row pad was pressed, toggling that step in the pattern
    StepToggle {
        step: usize,
        track: usize,
        velocity: u8,
    },
    ConnectionChange {
        connected: bool,
        error: Option<String>,
        error_code: Option<crate::error::ErrorCode>,
    },
    PadPress { address: u8, velocity: u8 },
    PadRelease { address: u8 },
    TransportPress { command: TransportCommand },
    ControlChange { cc: u8, value: u8 },
}

impl EventKind {
    pub fn event_type(&self) -> EventType {
        match self {
            EventKind::StepToggle { .. } => EventType::StepToggle,
            EventKind::ConnectionChange { .. } => EventType::ConnectionChange,
            EventKind::PadPress { .. }
            | EventKind::PadRelease { .. }
            | EventKind::TransportPress { .. }
            | EventKind::ControlChange { .. } => EventType::HardwareInput,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportCommand {
    Play,
    Stop,
    Pause,
}

/// An event emitted by the controller.
#[derive(Debug, Clone)]
pub struct HardwareEvent {
    pub controller_id: String,
    pub timestamp: SystemTime,
    pub kind: EventKind,
}

impl HardwareEvent {
    pub fn new(controller_id: &str, kind: EventKind) -> Self {
        Self {
            controller_id: controller_id.to_string(),
            timestamp: SystemTime::now(),
            kind,
        }
    }
}

/// One cell of the externally produced pattern grid.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct PatternCell {
    pub active: bool,
    pub velocity: u8,
}

impl From<bool> for PatternCell {
    fn from(active: bool) -> Self {
        Self {
            active,
            velocity: if active { 100 } else { 0 },
        }
    }
}

/// Read-only view of the external sequencer, consumed once per update.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SequencerSnapshot {
    pub current_step: usize,
    pub is_playing: bool,
    pub tempo: f64,
    /// pattern[track][step]
    pub pattern: Vec<Vec<PatternCell>>,
    pub track_count: usize,
}

pub type EventCallback = Arc<dyn Fn(&HardwareEvent) + Send + Sync>;

/// Opaque handle returned by `add`, used to remove a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

/// Per-type listener lists with synchronous fan-out.
///
/// A panicking listener is caught and logged; it never poisons the other
/// listeners or the dispatching transport callback.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<HashMap<EventType, Vec<(ListenerId, EventCallback)>>>,
    next_id: RwLock<u64>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, event_type: EventType, callback: EventCallback) -> ListenerId {
        let id = {
            let mut next = self.next_id.write();
            *next += 1;
            ListenerId(*next)
        };
        self.listeners
            .write()
            .entry(event_type)
            .or_default()
            .push((id, callback));
        id
    }

    pub fn remove(&self, event_type: EventType, id: ListenerId) {
        if let Some(list) = self.listeners.write().get_mut(&event_type) {
            list.retain(|(lid, _)| *lid != id);
        }
    }

    /// Fan an event out to every listener registered for its type.
    pub fn emit(&self, event: &HardwareEvent) {
        let callbacks: Vec<EventCallback> = {
            let guard = self.listeners.read();
            guard
                .get(&event.kind.event_type())
                .map(|list| list.iter().map(|(_, cb)| Arc::clone(cb)).collect())
                .unwrap_or_default()
        };

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                error!(
                    "Event listener panicked handling {:?} from {}",
                    event.kind.event_type(),
                    event.controller_id
                );
            }
        }
    }

    pub fn count(&self, event_type: EventType) -> usize {
        self.listeners
            .read()
            .get(&event_type)
            .map(|l| l.len())
            .unwrap_or(0)
    }
}
