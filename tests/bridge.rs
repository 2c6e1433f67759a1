//! End-to-end bridge scenarios against a scripted transport

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use padbridge::config::BridgeConfig;
use padbridge::controller::PadController;
use padbridge::error::{BridgeError, ErrorCode};
use padbridge::events::{EventKind, EventType, PatternCell, SequencerSnapshot};
use padbridge::protocol::{DeviceDescriptor, HANDSHAKE_FRAMES};
use padbridge::transport::{GridTransport, PortPair, RawCallback};

/// Records every outbound frame and exposes the inbound callback so tests
/// can play the device's side of the conversation.
struct ScriptedTransport {
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    callback: Arc<Mutex<Option<RawCallback>>>,
    refuse_open: Arc<AtomicBool>,
    open: bool,
}

struct ScriptedHandles {
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    callback: Arc<Mutex<Option<RawCallback>>>,
    refuse_open: Arc<AtomicBool>,
}

impl ScriptedTransport {
    fn new() -> (Box<Self>, ScriptedHandles) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let callback = Arc::new(Mutex::new(None));
        let refuse_open = Arc::new(AtomicBool::new(false));
        let handles = ScriptedHandles {
            sent: Arc::clone(&sent),
            callback: Arc::clone(&callback),
            refuse_open: Arc::clone(&refuse_open),
        };
        (
            Box::new(Self {
                sent,
                callback,
                refuse_open,
                open: false,
            }),
            handles,
        )
    }
}

impl GridTransport for ScriptedTransport {
    fn enumerate(&self, descriptor: &DeviceDescriptor) -> padbridge::error::Result<Vec<PortPair>> {
        let name = "PadController MK2 (port 1)".to_string();
        if !descriptor.matches(&name) {
            return Err(BridgeError::DeviceNotFound {
                patterns: descriptor.name_patterns.clone(),
            });
        }
        Ok(vec![PortPair {
            input_name: name.clone(),
            output_name: Some(name),
        }])
    }

    fn open(&mut self, _pair: &PortPair, on_message: RawCallback) -> padbridge::error::Result<()> {
        if self.refuse_open.load(Ordering::SeqCst) {
            return Err(BridgeError::ConnectionFailed("scripted open failure".into()));
        }
        *self.callback.lock() = Some(on_message);
        self.open = true;
        Ok(())
    }

    fn send(&self, bytes: &[u8]) -> padbridge::error::Result<()> {
        self.sent.lock().push(bytes.to_vec());
        Ok(())
    }

    fn close(&mut self) {
        *self.callback.lock() = None;
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

fn one_step_snapshot() -> SequencerSnapshot {
    let mut row = vec![PatternCell::from(false); 16];
    row[0] = PatternCell {
        active: true,
        velocity: 100,
    };
    SequencerSnapshot {
        current_step: 0,
        is_playing: true,
        tempo: 120.0,
        pattern: vec![row],
        track_count: 1,
    }
}

#[tokio::test(start_paused = true)]
async fn connect_update_flush_scenario() {
    let (transport, handles) = ScriptedTransport::new();
    let controller = PadController::new("pad-0", BridgeConfig::default(), transport).unwrap();

    controller.connect().await.unwrap();

    // Handshake went out exactly once
    let handshakes = handles
        .sent
        .lock()
        .iter()
        .filter(|f| f.as_slice() == HANDSHAKE_FRAMES[0])
        .count();
    assert_eq!(handshakes, 1);
    handles.sent.lock().clear();

    controller.update_sequencer_state(one_step_snapshot());

    // Queued before the batch delay elapses, not yet on the wire
    assert!(handles.sent.lock().is_empty());
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Exactly one flush wrote exactly one frame: playhead sits on step 0,
    // which outranks the active color
    let frames = handles.sent.lock().clone();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0][1], 0);
    assert_eq!(frames[0][2] & 0x3F, padbridge::leds::color::PLAYHEAD);
}

#[tokio::test(start_paused = true)]
async fn inactive_playback_shows_active_color() {
    let (transport, handles) = ScriptedTransport::new();
    let controller = PadController::new("pad-0", BridgeConfig::default(), transport).unwrap();
    controller.connect().await.unwrap();
    handles.sent.lock().clear();

    let mut snapshot = one_step_snapshot();
    snapshot.is_playing = false;
    controller.update_sequencer_state(snapshot);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let frames = handles.sent.lock().clone();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0][2], padbridge::leds::color::ACTIVE);
}

#[tokio::test(start_paused = true)]
async fn pad_press_round_trip() {
    let (transport, handles) = ScriptedTransport::new();
    let controller = PadController::new("pad-0", BridgeConfig::default(), transport).unwrap();
    controller.connect().await.unwrap();

    let toggles = Arc::new(Mutex::new(Vec::new()));
    let toggles_clone = Arc::clone(&toggles);
    controller.add_event_listener(
        EventType::StepToggle,
        Arc::new(move |event| {
            toggles_clone.lock().push(event.kind.clone());
        }),
    );

    let callback = handles.callback.lock().clone().unwrap();
    callback(&[0x90, 3, 64]);
    callback(&[0x80, 3, 0]);
    tokio::time::sleep(Duration::from_millis(10)).await;

    let seen = toggles.lock().clone();
    assert_eq!(seen.len(), 1);
    assert!(matches!(
        seen[0],
        EventKind::StepToggle {
            step: 3,
            velocity: 64,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn repeated_open_failures_escalate_to_notify() {
    let (transport, handles) = ScriptedTransport::new();
    handles.refuse_open.store(true, Ordering::SeqCst);
    let controller = PadController::new("pad-0", BridgeConfig::default(), transport).unwrap();

    let notifications = Arc::new(Mutex::new(Vec::new()));
    let notifications_clone = Arc::clone(&notifications);
    controller.add_event_listener(
        EventType::ConnectionChange,
        Arc::new(move |event| {
            if let EventKind::ConnectionChange {
                error: Some(message),
                error_code: None,
                ..
            } = &event.kind
            {
                notifications_clone.lock().push(message.clone());
            }
        }),
    );

    for _ in 0..3 {
        let err = controller.connect().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConnectionFailed);
    }

    // Third attempt ran the fallback phase: one notify, record cleared
    let seen = notifications.lock().clone();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].contains("connection failures"));
    assert_eq!(
        controller.state().diagnostics["recovery_records"],
        serde_json::json!(0)
    );

    // Device comes back; the fallback's reconnect eventually lands
    handles.refuse_open.store(false, Ordering::SeqCst);
    controller.connect().await.unwrap();
    assert!(controller.state().connected);
}

#[tokio::test(start_paused = true)]
async fn disconnect_flushes_and_goes_quiet() {
    let (transport, handles) = ScriptedTransport::new();
    let controller = PadController::new("pad-0", BridgeConfig::default(), transport).unwrap();
    controller.connect().await.unwrap();

    controller.update_sequencer_state(one_step_snapshot());
    controller.disconnect().await;

    let frames_after = handles.sent.lock().len();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        handles.sent.lock().len(),
        frames_after,
        "nothing fires after teardown"
    );
    assert!(!controller.state().connected);
}
