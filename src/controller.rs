//! Controller orchestration
//!
//! Owns the connection lifecycle for one physical grid controller: device
//! discovery and handshake, inbound message classification, LED diffing
//! through the batching queue, health monitoring, recovery action handling,
//! and the clock-sync toggles.

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::batch::{LedBatcher, LedWriter};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, ErrorCode, Result};
use crate::events::{
    EventCallback, EventKind, EventType, HardwareEvent, ListenerId, ListenerRegistry,
    SequencerSnapshot, TransportCommand,
};
use crate::health::{HealthBand, HealthMonitor};
use crate::leds::{led_for_step, LedState};
use crate::protocol::{
    led_frame, DeviceDescriptor, GridMapping, PadMessage, ADDR_TRANSPORT_PAUSE,
    ADDR_TRANSPORT_PLAY, ADDR_TRANSPORT_STOP, GRID_COLUMNS, HANDSHAKE_FRAMES, MAX_ADDRESS,
};
use crate::recovery::{RecoveryAction, RecoveryEngine};
use crate::timing::{LedUpdateEvent, MusicalClock, SyncState, SyncUpdate, TimingSynchronizer};
use crate::transport::GridTransport;

/// Connection lifecycle; owned exclusively by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Snapshot of the controller for embedding code and diagnostics.
#[derive(Debug, Clone)]
pub struct ControllerState {
    pub connected: bool,
    pub last_update: Option<SystemTime>,
    pub diagnostics: Map<String, Value>,
}

/// Bridge to one physical grid controller. Cheap to clone handles are not
/// provided; the embedding application owns exactly one per device.
pub struct PadController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    id: String,
    config: BridgeConfig,
    descriptor: DeviceDescriptor,
    mapping: GridMapping,
    transport: Arc<Mutex<Box<dyn GridTransport>>>,
    conn_state: Mutex<ConnectionState>,
    led_cache: Mutex<HashMap<u8, LedState>>,
    snapshot: Mutex<Option<SequencerSnapshot>>,
    last_update: Mutex<Option<SystemTime>>,
    batcher: LedBatcher,
    listeners: ListenerRegistry,
    recovery: RecoveryEngine,
    health: HealthMonitor,
    sync: Mutex<Option<TimingSynchronizer>>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

impl PadController {
    pub fn new(id: &str, config: BridgeConfig, transport: Box<dyn GridTransport>) -> Result<Self> {
        let mapping = GridMapping::new(config.device.step_count, config.device.track_count)?;
        let descriptor = DeviceDescriptor {
            name_patterns: config.device.name_patterns.clone(),
            ..DeviceDescriptor::pad_controller()
        };
        let transport = Arc::new(Mutex::new(transport));

        let inner = Arc::new_cyclic(|weak: &Weak<ControllerInner>| {
            let writer_transport = Arc::clone(&transport);
            let writer_weak = weak.clone();
            // One failing address write never aborts the rest of a batch
            let writer: LedWriter = Arc::new(move |address, color| {
                let frame = led_frame(address, color);
                let result = writer_transport.lock().send(&frame);
                if let Err(e) = result {
                    warn!("LED write for address {} failed: {}", address, e);
                    if let Some(inner) = writer_weak.upgrade() {
                        inner.health.record_error();
                        inner.recovery.handle_error(&inner.id, ErrorCode::ProtocolWriteFailed);
                    }
                }
            });

            ControllerInner {
                id: id.to_string(),
                descriptor,
                mapping,
                transport: Arc::clone(&transport),
                conn_state: Mutex::new(ConnectionState::Disconnected),
                led_cache: Mutex::new(HashMap::new()),
                snapshot: Mutex::new(None),
                last_update: Mutex::new(None),
                batcher: LedBatcher::new(config.batch, config.leds.reverse_output_order, writer),
                listeners: ListenerRegistry::new(),
                recovery: RecoveryEngine::new(config.recovery),
                health: HealthMonitor::new(config.health),
                sync: Mutex::new(None),
                dispatch_task: Mutex::new(None),
                reconnect_task: Mutex::new(None),
                config,
            }
        });

        let action_weak = Arc::downgrade(&inner);
        inner.recovery.set_action_callback(Arc::new(move |action| {
            if let Some(inner) = action_weak.upgrade() {
                inner.apply_recovery_action(action);
            }
        }));

        Ok(Self { inner })
    }

    /// Discover, open, handshake and light up the device.
    ///
    /// Failures are classified and routed to the recovery engine before
    /// being returned; a scheduled retry may succeed later even though
    /// this call rejected.
    pub async fn connect(&self) -> Result<()> {
        self.inner.clone().connect().await
    }

    /// Tear everything down. Idempotent, reachable from any state, never
    /// fails.
    pub async fn disconnect(&self) {
        self.inner.disconnect(true);
    }

    pub fn add_event_listener(&self, event_type: EventType, callback: EventCallback) -> ListenerId {
        self.inner.listeners.add(event_type, callback)
    }

    pub fn remove_event_listener(&self, event_type: EventType, id: ListenerId) {
        self.inner.listeners.remove(event_type, id);
    }

    /// Reconcile an external sequencer snapshot into batched LED writes.
    /// Only addresses whose desired state changed are queued.
    pub fn update_sequencer_state(&self, snapshot: SequencerSnapshot) {
        let inner = &self.inner;
        *inner.last_update.lock() = Some(SystemTime::now());

        if let Some(sync) = inner.sync.lock().as_ref() {
            sync.update_state(SyncUpdate {
                is_playing: Some(snapshot.is_playing),
                current_step: Some(snapshot.current_step),
                bpm: Some(snapshot.tempo),
            });
        }

        let playhead = snapshot.is_playing.then_some(snapshot.current_step);
        *inner.snapshot.lock() = Some(snapshot);
        inner.render_steps(playhead, &HashSet::new());
    }

    /// Start driving playhead/lookahead LEDs from the external clock.
    pub fn enable_clock_sync(&self, initial: SyncState, clock: &dyn MusicalClock) {
        let mut guard = self.inner.sync.lock();
        if guard.is_some() {
            debug!("Clock sync already enabled for {}", self.inner.id);
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let sync = TimingSynchronizer::new(
            self.inner.config.timing,
            Arc::new(move |event| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_led_update(event);
                }
            }),
        );
        sync.start_sync(initial, clock);
        *guard = Some(sync);
        info!("Clock sync enabled for {}", self.inner.id);
    }

    pub fn disable_clock_sync(&self) {
        if let Some(sync) = self.inner.sync.lock().take() {
            sync.stop_sync();
            info!("Clock sync disabled for {}", self.inner.id);
        }
    }

    /// Connection flag, last snapshot time, and a diagnostics map.
    pub fn state(&self) -> ControllerState {
        let inner = &self.inner;
        let conn = *inner.conn_state.lock();

        let mut diagnostics = Map::new();
        diagnostics.insert("connection_state".into(), json!(format!("{:?}", conn)));
        diagnostics.insert("health_score".into(), json!(inner.health.current_score()));
        diagnostics.insert("pending_batch".into(), json!(inner.batcher.pending_len()));
        diagnostics.insert("flush_count".into(), json!(inner.batcher.flush_count()));
        diagnostics.insert(
            "recovery_records".into(),
            json!(inner.recovery.active_records()),
        );
        if let Some(sync) = inner.sync.lock().as_ref() {
            let metrics = sync.metrics();
            diagnostics.insert(
                "tick_latency".into(),
                json!({
                    "avg_ms": metrics.avg_ms,
                    "max_ms": metrics.max_ms,
                    "samples": metrics.samples,
                }),
            );
        }

        ControllerState {
            connected: conn == ConnectionState::Connected,
            last_update: *inner.last_update.lock(),
            diagnostics,
        }
    }
}

impl ControllerInner {
    async fn connect(self: Arc<Self>) -> Result<()> {
        {
            let mut state = self.conn_state.lock();
            match *state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting => {
                    return Err(BridgeError::ConnectionFailed(
                        "connect already in progress".to_string(),
                    ))
                }
                _ => *state = ConnectionState::Connecting,
            }
        }
        info!("Connecting to grid controller '{}'...", self.id);

        match self.clone().try_connect().await {
            Ok(()) => {
                *self.conn_state.lock() = ConnectionState::Connected;
                self.recovery.clear(&self.id);
                self.emit(EventKind::ConnectionChange {
                    connected: true,
                    error: None,
                    error_code: None,
                });
                info!("Grid controller '{}' connected", self.id);
                Ok(())
            }
            Err(e) => {
                let code = e.code();
                warn!("Connect failed for '{}': {} ({})", self.id, e, code);
                *self.conn_state.lock() = ConnectionState::Error;
                self.recovery.handle_error(&self.id, code);
                Err(e)
            }
        }
    }

    async fn try_connect(self: Arc<Self>) -> Result<()> {
        // Enumerate and open. The raw callback runs on the device thread;
        // it forwards into a channel consumed by the dispatch task.
        let (raw_tx, mut raw_rx) = mpsc::channel::<Vec<u8>>(1000);
        {
            let mut transport = self.transport.lock();
            let pairs = transport.enumerate(&self.descriptor)?;
            let pair = pairs.first().ok_or_else(|| BridgeError::DeviceNotFound {
                patterns: self.descriptor.name_patterns.clone(),
            })?;
            let tx = raw_tx.clone();
            transport.open(
                pair,
                Arc::new(move |data: &[u8]| {
                    let _ = tx.try_send(data.to_vec());
                }),
            )?;
        }

        let weak = Arc::downgrade(&self);
        let dispatch = tokio::spawn(async move {
            while let Some(data) = raw_rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.handle_raw(&data);
            }
        });
        if let Some(old) = self.dispatch_task.lock().replace(dispatch) {
            old.abort();
        }

        // Handshake puts the device into host-controlled LED mode
        {
            let transport = self.transport.lock();
            for frame in HANDSHAKE_FRAMES {
                transport
                    .send(frame)
                    .map_err(|e| BridgeError::InitializationFailed(e.to_string()))?;
            }
        }
        self.clear_all_leds();

        let health_weak = Arc::downgrade(&self);
        self.health.start(Arc::new(move |band, score| {
            if let Some(inner) = health_weak.upgrade() {
                inner.on_health_band(band, score);
            }
        }));

        Ok(())
    }

    fn disconnect(&self, emit_event: bool) {
        let was_disconnected = {
            let mut state = self.conn_state.lock();
            let was = *state == ConnectionState::Disconnected;
            *state = ConnectionState::Disconnected;
            was
        };

        if let Some(sync) = self.sync.lock().take() {
            sync.stop_sync();
        }
        self.batcher.force_flush();
        self.clear_all_leds();
        if let Some(task) = self.dispatch_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.reconnect_task.lock().take() {
            task.abort();
        }
        self.transport.lock().close();
        self.health.stop();
        self.recovery.clear(&self.id);
        self.led_cache.lock().clear();

        if emit_event && !was_disconnected {
            self.emit(EventKind::ConnectionChange {
                connected: false,
                error: None,
                error_code: None,
            });
            info!("Grid controller '{}' disconnected", self.id);
        }
    }

    /// Best-effort all-off; write failures here are logged by the
    /// transport and otherwise ignored.
    fn clear_all_leds(&self) {
        {
            let transport = self.transport.lock();
            for address in 0..=MAX_ADDRESS {
                let _ = transport.send(&led_frame(address, 0));
            }
        }
        let mut cache = self.led_cache.lock();
        for address in 0..=MAX_ADDRESS {
            cache.insert(address, LedState::OFF);
        }
    }

    /// Classify one raw inbound frame and fan it out as hardware events.
    fn handle_raw(&self, data: &[u8]) {
        self.health.record_message();

        let Some(message) = PadMessage::parse(data) else {
            debug!("Unhandled frame: {}", crate::protocol::format_hex(data));
            return;
        };

        match message {
            PadMessage::PadDown { address, velocity } => {
                if let Some(command) = transport_command_for(address) {
                    self.emit(EventKind::TransportPress { command });
                    return;
                }
                self.emit(EventKind::PadPress { address, velocity });
                if let Some(step) = self.mapping.step_for_address(address) {
                    let track = self
                        .mapping
                        .track_for_row(address as usize / GRID_COLUMNS)
                        .unwrap_or(0);
                    self.emit(EventKind::StepToggle {
                        step,
                        track,
                        velocity,
                    });
                }
            }
            PadMessage::PadUp { address } => {
                if transport_command_for(address).is_none() {
                    self.emit(EventKind::PadRelease { address });
                }
            }
            PadMessage::ControlChange { cc, value } => {
                self.emit(EventKind::ControlChange { cc, value });
            }
        }
    }

    /// Recompute every step LED for the given playhead/lookahead and queue
    /// only the addresses whose desired state changed.
    fn render_steps(&self, playhead: Option<usize>, lookahead: &HashSet<usize>) {
        let snapshot = self.snapshot.lock().clone();

        // Diff under the cache lock, queue outside it: a full queue flushes
        // synchronously through the writer, whose failure path may run a
        // recovery reset that takes the cache lock again.
        let changed: Vec<(u8, LedState)> = {
            let mut cache = self.led_cache.lock();
            let mut changed = Vec::new();
            for step in 0..self.mapping.step_count() {
                let (active, velocity) = match &snapshot {
                    Some(snap) => composite_cell(snap, step),
                    None => (false, 0),
                };
                let desired = led_for_step(active, velocity, step, playhead, lookahead);
                let Some(address) = self.mapping.address_for_step(step) else {
                    continue;
                };
                if cache.get(&address) != Some(&desired) {
                    cache.insert(address, desired);
                    changed.push((address, desired));
                }
            }
            changed
        };

        for (address, desired) in changed {
            self.batcher.queue(address, desired.wire_byte());
        }
    }

    fn on_led_update(&self, event: &LedUpdateEvent) {
        match event {
            LedUpdateEvent::StepChange { step, lookahead, .. } => {
                self.render_steps(Some(*step), lookahead);
            }
            LedUpdateEvent::TransportStart { step } => {
                self.render_steps(Some(*step), &HashSet::new());
            }
            LedUpdateEvent::TransportStop | LedUpdateEvent::TransportPause => {
                self.render_steps(None, &HashSet::new());
            }
        }
    }

    fn on_health_band(self: &Arc<Self>, band: HealthBand, score: u8) {
        if band != HealthBand::Critical {
            debug!("Health band for '{}' now {:?} ({})", self.id, band, score);
            return;
        }
        // Critical staleness goes through the standard fault path
        let elapsed_ms = self.config.health.timeout_ms;
        self.fault(BridgeError::HeartbeatTimeout { elapsed_ms });
    }

    /// Mid-session fault: never thrown into application code, surfaced as
    /// an event and handed to recovery.
    fn fault(self: &Arc<Self>, error: BridgeError) {
        let code = error.code();
        warn!("Fault on '{}': {} ({})", self.id, error, code);
        *self.conn_state.lock() = ConnectionState::Error;
        self.recovery.handle_error(&self.id, code);
        self.emit(EventKind::ConnectionChange {
            connected: false,
            error: Some(error.to_string()),
            error_code: Some(code),
        });
    }

    fn apply_recovery_action(self: &Arc<Self>, action: RecoveryAction) {
        match action {
            RecoveryAction::Retry { delay } => self.schedule_reconnect(delay),
            RecoveryAction::Reconnect => self.schedule_reconnect(Duration::ZERO),
            RecoveryAction::Reset => {
                info!("Recovery reset for '{}'", self.id);
                self.led_cache.lock().clear();
                self.batcher.clear();
                self.recovery.clear(&self.id);
                self.schedule_reconnect(Duration::ZERO);
            }
            RecoveryAction::Notify { message } => {
                let connected = *self.conn_state.lock() == ConnectionState::Connected;
                self.emit(EventKind::ConnectionChange {
                    connected,
                    error: Some(message),
                    error_code: None,
                });
            }
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, delay: Duration) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let Some(inner) = weak.upgrade() else { return };
            // Drop back to disconnected so connect() can run
            {
                let mut state = inner.conn_state.lock();
                if *state == ConnectionState::Connected {
                    return;
                }
                *state = ConnectionState::Disconnected;
            }
            inner.transport.lock().close();
            if let Err(e) = inner.clone().connect().await {
                debug!("Scheduled reconnect for '{}' failed: {}", inner.id, e);
            }
        });
        if let Some(old) = self.reconnect_task.lock().replace(handle) {
            old.abort();
        }
    }

    fn emit(&self, kind: EventKind) {
        self.listeners.emit(&HardwareEvent::new(&self.id, kind));
    }
}

impl Drop for ControllerInner {
    fn drop(&mut self) {
        for task in [
            self.dispatch_task.lock().take(),
            self.reconnect_task.lock().take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}

fn transport_command_for(address: u8) -> Option<TransportCommand> {
    match address {
        ADDR_TRANSPORT_PLAY => Some(TransportCommand::Play),
        ADDR_TRANSPORT_STOP => Some(TransportCommand::Stop),
        ADDR_TRANSPORT_PAUSE => Some(TransportCommand::Pause),
        _ => None,
    }
}

/// Collapse the 2D pattern into one step row: active if any track has the
/// step set, with the loudest velocity winning.
fn composite_cell(snapshot: &SequencerSnapshot, step: usize) -> (bool, u8) {
    let mut active = false;
    let mut velocity = 0u8;
    for row in &snapshot.pattern {
        if let Some(cell) = row.get(step) {
            if cell.active {
                active = true;
                velocity = velocity.max(cell.velocity);
            }
        }
    }
    (active, velocity)
}
