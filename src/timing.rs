//! Clock-synchronized LED timing
//!
//! The synchronizer subscribes to an external musical clock, advances the
//! step counter on every subdivision tick, computes the lookahead window at
//! the current tempo, and emits LED update events with latency metrics.
//! Step advancement is driven purely by tick arrival, never by wall-clock
//! drift, so a slow tick still advances exactly one step.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::TimingConfig;

/// Musical subdivision the clock ticks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subdivision {
    Quarter,
    Eighth,
    Sixteenth,
}

impl Subdivision {
    /// Tick period at the given tempo.
    pub fn period(&self, bpm: f64) -> Duration {
        let quarter_ms = 60_000.0 / bpm.max(1.0);
        let ms = match self {
            Subdivision::Quarter => quarter_ms,
            Subdivision::Eighth => quarter_ms / 2.0,
            Subdivision::Sixteenth => quarter_ms / 4.0,
        };
        Duration::from_secs_f64(ms / 1000.0)
    }
}

/// Events delivered by a musical clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockEvent {
    Tick { scheduled: Instant },
    Start,
    Stop,
    Pause,
}

/// External musical clock contract: a repeating tick schedule at a given
/// subdivision plus transport notifications, delivered over one channel.
pub trait MusicalClock: Send + Sync {
    fn subscribe(&self, subdivision: Subdivision) -> mpsc::Receiver<ClockEvent>;
}

/// Tokio-interval clock used by the CLI and tests.
pub struct InternalClock {
    bpm: Arc<Mutex<f64>>,
    running: Arc<AtomicBool>,
    senders: Arc<Mutex<Vec<mpsc::Sender<ClockEvent>>>>,
}

impl InternalClock {
    pub fn new(bpm: f64) -> Self {
        Self {
            bpm: Arc::new(Mutex::new(bpm)),
            running: Arc::new(AtomicBool::new(false)),
            senders: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn set_bpm(&self, bpm: f64) {
        *self.bpm.lock() = bpm;
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::Relaxed);
        self.broadcast(ClockEvent::Start);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.broadcast(ClockEvent::Stop);
    }

    pub fn pause(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.broadcast(ClockEvent::Pause);
    }

    fn broadcast(&self, event: ClockEvent) {
        self.senders.lock().retain(|tx| match tx.try_send(event) {
            Ok(()) => true,
            // A full subscriber just misses this notification
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

impl MusicalClock for InternalClock {
    fn subscribe(&self, subdivision: Subdivision) -> mpsc::Receiver<ClockEvent> {
        let (tx, rx) = mpsc::channel(64);
        self.senders.lock().push(tx.clone());

        let bpm = Arc::clone(&self.bpm);
        let running = Arc::clone(&self.running);
        tokio::spawn(async move {
            loop {
                let period = subdivision.period(*bpm.lock());
                tokio::time::sleep(period).await;
                if tx.is_closed() {
                    break;
                }
                if running.load(Ordering::Relaxed) {
                    let scheduled = Instant::now();
                    if tx.send(ClockEvent::Tick { scheduled }).await.is_err() {
                        break;
                    }
                }
            }
        });
        rx
    }
}

/// LED update events emitted toward the controller.
#[derive(Debug, Clone)]
pub enum LedUpdateEvent {
    StepChange {
        step: usize,
        lookahead: HashSet<usize>,
        scheduled: Instant,
        actual: Instant,
        bpm: f64,
    },
    TransportStart { step: usize },
    TransportStop,
    TransportPause,
}

pub type LedUpdateCallback = Arc<dyn Fn(&LedUpdateEvent) + Send + Sync>;

/// State tracked while synchronization is active.
#[derive(Debug, Clone)]
pub struct SyncState {
    pub is_playing: bool,
    pub current_step: usize,
    pub bpm: f64,
    pub total_steps: usize,
}

/// Partial update pushed by external callers without restarting the
/// schedule.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncUpdate {
    pub is_playing: Option<bool>,
    pub current_step: Option<usize>,
    pub bpm: Option<f64>,
}

/// Running latency statistics, rebased periodically so the counters never
/// grow without bound.
#[derive(Debug, Clone, Copy)]
pub struct LatencyMetrics {
    pub avg_ms: f64,
    pub max_ms: f64,
    pub samples: u64,
}

const METRICS_REBASE_EVERY: u64 = 1024;

#[derive(Debug, Default)]
struct MetricsInner {
    sum_ms: f64,
    max_ms: f64,
    samples: u64,
}

impl MetricsInner {
    fn record(&mut self, latency: Duration) {
        let ms = latency.as_secs_f64() * 1000.0;
        self.samples += 1;
        self.sum_ms += ms;
        if ms > self.max_ms {
            self.max_ms = ms;
        }
        if self.samples >= METRICS_REBASE_EVERY {
            // Keep the running average, drop the history
            self.sum_ms /= self.samples as f64;
            self.samples = 1;
            self.max_ms = ms;
        }
    }

    fn snapshot(&self) -> LatencyMetrics {
        LatencyMetrics {
            avg_ms: if self.samples == 0 {
                0.0
            } else {
                self.sum_ms / self.samples as f64
            },
            max_ms: self.max_ms,
            samples: self.samples,
        }
    }
}

/// State machine over {idle, active}; `state` is `None` while idle.
pub struct TimingSynchronizer {
    config: TimingConfig,
    state: Arc<Mutex<Option<SyncState>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    callback: LedUpdateCallback,
    metrics: Arc<Mutex<MetricsInner>>,
}

impl TimingSynchronizer {
    pub fn new(config: TimingConfig, callback: LedUpdateCallback) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(None)),
            task: Mutex::new(None),
            callback,
            metrics: Arc::new(Mutex::new(MetricsInner::default())),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().is_some()
    }

    pub fn current_step(&self) -> Option<usize> {
        self.state.lock().as_ref().map(|s| s.current_step)
    }

    pub fn metrics(&self) -> LatencyMetrics {
        self.metrics.lock().snapshot()
    }

    /// Store the initial state, subscribe to the clock at sixteenth notes,
    /// and emit `TransportStart`. No-op when already active.
    pub fn start_sync(&self, initial: SyncState, clock: &dyn MusicalClock) {
        if self.is_active() {
            debug!("start_sync while active, ignoring");
            return;
        }

        let start_step = initial.current_step % initial.total_steps.max(1);
        *self.state.lock() = Some(SyncState {
            current_step: start_step,
            ..initial
        });
        (self.callback)(&LedUpdateEvent::TransportStart { step: start_step });

        let rx = clock.subscribe(Subdivision::Sixteenth);
        let state = Arc::clone(&self.state);
        let metrics = Arc::clone(&self.metrics);
        let callback = Arc::clone(&self.callback);
        let config = self.config;

        let handle = tokio::spawn(async move {
            let mut rx = rx;
            while let Some(event) = rx.recv().await {
                match event {
                    ClockEvent::Tick { scheduled } => {
                        let update = {
                            let mut guard = state.lock();
                            let Some(s) = guard.as_mut() else { break };
                            if !s.is_playing {
                                continue;
                            }
                            s.current_step = (s.current_step + 1) % s.total_steps.max(1);
                            Some(build_step_change(s, &config, scheduled, Instant::now()))
                        };
                        if let Some(event) = update {
                            record_latency(&metrics, &config, &event);
                            callback(&event);
                        }
                    }
                    ClockEvent::Start => {
                        let step = {
                            let mut guard = state.lock();
                            let Some(s) = guard.as_mut() else { break };
                            s.is_playing = true;
                            s.current_step
                        };
                        callback(&LedUpdateEvent::TransportStart { step });
                    }
                    ClockEvent::Stop => {
                        if let Some(s) = state.lock().as_mut() {
                            s.is_playing = false;
                        }
                        callback(&LedUpdateEvent::TransportStop);
                    }
                    ClockEvent::Pause => {
                        if let Some(s) = state.lock().as_mut() {
                            s.is_playing = false;
                        }
                        callback(&LedUpdateEvent::TransportPause);
                    }
                }
            }
        });
        *self.task.lock() = Some(handle);
    }

    /// Push tempo/step/playing changes without restarting the schedule. An
    /// externally supplied step that differs from the tracked one emits an
    /// out-of-band `StepChange` immediately.
    pub fn update_state(&self, update: SyncUpdate) {
        let out_of_band = {
            let mut guard = self.state.lock();
            let Some(s) = guard.as_mut() else { return };
            if let Some(bpm) = update.bpm {
                s.bpm = bpm;
            }
            if let Some(playing) = update.is_playing {
                s.is_playing = playing;
            }
            match update.current_step {
                Some(step) if step % s.total_steps.max(1) != s.current_step => {
                    s.current_step = step % s.total_steps.max(1);
                    let now = Instant::now();
                    Some(build_step_change(s, &self.config, now, now))
                }
                _ => None,
            }
        };
        if let Some(event) = out_of_band {
            (self.callback)(&event);
        }
    }

    /// Cancel the clock subscription and emit `TransportStop`. After this
    /// returns no further events fire.
    pub fn stop_sync(&self) {
        let was_active = {
            let mut task = self.task.lock();
            match task.take() {
                Some(handle) => {
                    handle.abort();
                    true
                }
                None => false,
            }
        };
        *self.state.lock() = None;
        if was_active {
            (self.callback)(&LedUpdateEvent::TransportStop);
        }
    }
}

impl Drop for TimingSynchronizer {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

fn build_step_change(
    state: &SyncState,
    config: &TimingConfig,
    scheduled: Instant,
    actual: Instant,
) -> LedUpdateEvent {
    LedUpdateEvent::StepChange {
        step: state.current_step,
        lookahead: lookahead_steps(
            state.current_step,
            state.total_steps,
            state.bpm,
            config.lookahead_ms,
        ),
        scheduled,
        actual,
        bpm: state.bpm,
    }
}

/// Convert the configured lookahead duration into upcoming step indices at
/// the current tempo. Capped below a full cycle so the window never wraps
/// onto the playhead itself.
pub fn lookahead_steps(
    current: usize,
    total_steps: usize,
    bpm: f64,
    lookahead_ms: u64,
) -> HashSet<usize> {
    let total = total_steps.max(1);
    let step_ms = Subdivision::Sixteenth.period(bpm).as_secs_f64() * 1000.0;
    let count = ((lookahead_ms as f64 / step_ms).ceil() as usize).min(total - 1);
    (1..=count).map(|i| (current + i) % total).collect()
}

fn record_latency(metrics: &Mutex<MetricsInner>, config: &TimingConfig, event: &LedUpdateEvent) {
    if let LedUpdateEvent::StepChange {
        scheduled, actual, ..
    } = event
    {
        let latency = actual.saturating_duration_since(*scheduled);
        if latency.as_millis() as u64 > config.latency_warn_ms {
            warn!("Step tick latency {}ms", latency.as_millis());
        }
        metrics.lock().record(latency);
    }
}
