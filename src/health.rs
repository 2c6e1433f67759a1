//! Connection health monitoring
//!
//! A periodic task derives a 0-100 score from heartbeat staleness and the
//! accumulated error count. Band transitions are reported through a
//! registered callback; Critical is the caller's cue to treat the
//! connection as timed out.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::HealthConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthBand {
    Healthy,
    Good,
    Warning,
    Poor,
    Critical,
}

impl HealthBand {
    pub fn from_score(score: u8) -> Self {
        match score {
            90..=100 => HealthBand::Healthy,
            75..=89 => HealthBand::Good,
            50..=74 => HealthBand::Warning,
            25..=49 => HealthBand::Poor,
            _ => HealthBand::Critical,
        }
    }
}

/// Score below which the connection counts as critically degraded.
pub const CRITICAL_THRESHOLD: u8 = 25;

/// Pure scoring function: staleness tiers plus error deductions, floored
/// at zero.
pub fn score(elapsed: Duration, errors: u32, config: &HealthConfig) -> u8 {
    let elapsed_ms = elapsed.as_millis() as u64;
    let mut deduction: u32 = if elapsed_ms >= config.timeout_ms {
        80
    } else if elapsed_ms >= config.stale_after_ms * 2 {
        40
    } else if elapsed_ms >= config.stale_after_ms {
        15
    } else {
        0
    };
    deduction += errors.saturating_mul(10);
    100u32.saturating_sub(deduction).min(100) as u8
}

/// Invoked on every band transition with the new band and score.
pub type HealthCallback = Arc<dyn Fn(HealthBand, u8) + Send + Sync>;

pub struct HealthMonitor {
    config: HealthConfig,
    last_message: Arc<Mutex<Instant>>,
    errors: Arc<AtomicU32>,
    task: Mutex<Option<JoinHandle<()>>>,
    last_score: Arc<Mutex<u8>>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            last_message: Arc::new(Mutex::new(Instant::now())),
            errors: Arc::new(AtomicU32::new(0)),
            task: Mutex::new(None),
            last_score: Arc::new(Mutex::new(100)),
        }
    }

    /// Stamp receipt of an inbound device message.
    pub fn record_message(&self) {
        *self.last_message.lock() = Instant::now();
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn current_score(&self) -> u8 {
        score(
            self.last_message.lock().elapsed(),
            self.errors.load(Ordering::Relaxed),
            &self.config,
        )
    }

    /// Start the periodic check. Replaces any previous monitoring task and
    /// resets the heartbeat stamp and error count.
    pub fn start(&self, callback: HealthCallback) {
        self.stop();
        *self.last_message.lock() = Instant::now();
        self.errors.store(0, Ordering::Relaxed);
        *self.last_score.lock() = 100;

        let config = self.config;
        let last_message = Arc::clone(&self.last_message);
        let errors = Arc::clone(&self.errors);
        let last_score = Arc::clone(&self.last_score);
        let interval = Duration::from_millis(config.check_interval_ms);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // Interval fires immediately; skip that first tick
            ticker.tick().await;
            let mut band = HealthBand::Healthy;
            loop {
                ticker.tick().await;
                let current = score(
                    last_message.lock().elapsed(),
                    errors.load(Ordering::Relaxed),
                    &config,
                );
                *last_score.lock() = current;
                let new_band = HealthBand::from_score(current);
                if new_band != band {
                    debug!("Health band {:?} -> {:?} (score {})", band, new_band, current);
                    band = new_band;
                    callback(new_band, current);
                }
            }
        });
        *self.task.lock() = Some(handle);
    }

    /// Abort the periodic check; no callbacks fire after this returns.
    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
