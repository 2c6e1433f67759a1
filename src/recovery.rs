//! Declarative error recovery
//!
//! A static strategy table maps classified error codes to three ordered
//! phases: immediate actions on first occurrence, delayed actions after a
//! backoff while the error persists, and fallback actions once the attempt
//! count for that error key reaches its threshold. Actions are delivered
//! through an explicitly registered callback; the controller decides what
//! "retry", "reconnect", "reset" and "notify" mean in terms of its own
//! operations.

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::RecoveryConfig;
use crate::error::ErrorCode;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Try the failed operation again after a short delay hint.
    Retry { delay: Duration },
    /// Tear down and re-establish the device connection.
    Reconnect,
    /// Clear cached state before the next reconnect attempt.
    Reset,
    /// Surface a human-readable message to the embedding application.
    Notify { message: String },
}

#[derive(Debug, Clone)]
pub struct RecoveryStrategy {
    pub immediate: Vec<RecoveryAction>,
    pub delayed: Vec<RecoveryAction>,
    pub fallback: Vec<RecoveryAction>,
}

static STRATEGIES: Lazy<HashMap<ErrorCode, RecoveryStrategy>> = Lazy::new(|| {
    let mut table = HashMap::new();
    table.insert(
        ErrorCode::DeviceNotFound,
        RecoveryStrategy {
            immediate: vec![],
            delayed: vec![RecoveryAction::Retry {
                delay: Duration::from_secs(2),
            }],
            fallback: vec![RecoveryAction::Notify {
                message: "Grid controller not found. Check the USB connection.".to_string(),
            }],
        },
    );
    table.insert(
        ErrorCode::ConnectionFailed,
        RecoveryStrategy {
            immediate: vec![RecoveryAction::Retry {
                delay: Duration::from_millis(500),
            }],
            delayed: vec![RecoveryAction::Reconnect],
            fallback: vec![
                RecoveryAction::Reset,
                RecoveryAction::Notify {
                    message: "Repeated connection failures. The device driver may need a restart."
                        .to_string(),
                },
            ],
        },
    );
    table.insert(
        ErrorCode::InitializationFailed,
        RecoveryStrategy {
            immediate: vec![RecoveryAction::Retry {
                delay: Duration::from_millis(500),
            }],
            delayed: vec![RecoveryAction::Reconnect],
            fallback: vec![
                RecoveryAction::Reset,
                RecoveryAction::Notify {
                    message: "Device refused the handshake. Power-cycle the controller."
                        .to_string(),
                },
            ],
        },
    );
    table.insert(
        ErrorCode::ProtocolWriteFailed,
        RecoveryStrategy {
            immediate: vec![],
            delayed: vec![RecoveryAction::Reconnect],
            fallback: vec![
                RecoveryAction::Reset,
                RecoveryAction::Notify {
                    message: "LED writes keep failing. Reconnecting from scratch.".to_string(),
                },
            ],
        },
    );
    table.insert(
        ErrorCode::HeartbeatTimeout,
        RecoveryStrategy {
            immediate: vec![RecoveryAction::Reconnect],
            delayed: vec![RecoveryAction::Reconnect],
            fallback: vec![
                RecoveryAction::Reset,
                RecoveryAction::Notify {
                    message: "Controller stopped responding. Check the cable.".to_string(),
                },
            ],
        },
    );
    table.insert(
        ErrorCode::Unknown,
        RecoveryStrategy {
            immediate: vec![],
            delayed: vec![RecoveryAction::Reconnect],
            fallback: vec![RecoveryAction::Notify {
                message: "Unrecoverable grid controller error.".to_string(),
            }],
        },
    );
    table
});

pub fn strategy_for(code: ErrorCode) -> &'static RecoveryStrategy {
    STRATEGIES.get(&code).unwrap_or_else(|| {
        STRATEGIES
            .get(&ErrorCode::Unknown)
            .expect("strategy table always has an Unknown entry")
    })
}

/// Per-error-key attempt tracking. Attempts only reset via explicit clear.
#[derive(Debug, Clone)]
pub struct RecoveryRecord {
    pub started: Instant,
    pub attempts: u32,
}

type ErrorKey = (String, ErrorCode);

pub type ActionCallback = Arc<dyn Fn(RecoveryAction) + Send + Sync>;

pub struct RecoveryEngine {
    config: RecoveryConfig,
    records: Mutex<HashMap<ErrorKey, RecoveryRecord>>,
    timers: Mutex<HashMap<ErrorKey, JoinHandle<()>>>,
    callback: RwLock<Option<ActionCallback>>,
}

impl RecoveryEngine {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            records: Mutex::new(HashMap::new()),
            timers: Mutex::new(HashMap::new()),
            callback: RwLock::new(None),
        }
    }

    /// Register the single receiver of recovery actions.
    pub fn set_action_callback(&self, callback: ActionCallback) {
        *self.callback.write() = Some(callback);
    }

    /// Record an occurrence of `code` for `controller_id` and run the
    /// matching strategy phase.
    pub fn handle_error(&self, controller_id: &str, code: ErrorCode) {
        let key: ErrorKey = (controller_id.to_string(), code);
        let attempts = {
            let mut records = self.records.lock();
            let record = records.entry(key.clone()).or_insert_with(|| RecoveryRecord {
                started: Instant::now(),
                attempts: 0,
            });
            record.attempts += 1;
            record.attempts
        };

        let strategy = strategy_for(code);
        debug!(
            "Recovery: {} attempt #{} for {}",
            code, attempts, controller_id
        );

        if attempts >= self.config.max_attempts {
            warn!(
                "Recovery exhausted for {} ({}), running fallback",
                controller_id, code
            );
            self.cancel_timer(&key);
            self.records.lock().remove(&key);
            self.deliver(&strategy.fallback);
        } else if attempts == 1 {
            self.deliver(&strategy.immediate);
        } else {
            // Error persists; schedule the delayed phase with linear backoff
            let backoff = Duration::from_millis(self.config.backoff_ms * attempts as u64);
            self.schedule_delayed(key, strategy.delayed.clone(), backoff);
        }
    }

    /// Remove all records and pending timers for a controller. Called on
    /// manual reset and on successful reconnect.
    pub fn clear(&self, controller_id: &str) {
        self.records
            .lock()
            .retain(|(id, _), _| id != controller_id);
        let mut timers = self.timers.lock();
        let stale: Vec<ErrorKey> = timers
            .keys()
            .filter(|(id, _)| id == controller_id)
            .cloned()
            .collect();
        for key in stale {
            if let Some(handle) = timers.remove(&key) {
                handle.abort();
            }
        }
    }

    pub fn attempts_for(&self, controller_id: &str, code: ErrorCode) -> Option<u32> {
        self.records
            .lock()
            .get(&(controller_id.to_string(), code))
            .map(|r| r.attempts)
    }

    pub fn active_records(&self) -> usize {
        self.records.lock().len()
    }

    fn deliver(&self, actions: &[RecoveryAction]) {
        let callback = self.callback.read().clone();
        if let Some(cb) = callback {
            for action in actions {
                cb(action.clone());
            }
        }
    }

    fn schedule_delayed(&self, key: ErrorKey, actions: Vec<RecoveryAction>, backoff: Duration) {
        self.cancel_timer(&key);
        let callback = self.callback.read().clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            if let Some(cb) = callback {
                for action in actions {
                    cb(action);
                }
            }
        });
        self.timers.lock().insert(key, handle);
    }

    fn cancel_timer(&self, key: &ErrorKey) {
        if let Some(handle) = self.timers.lock().remove(key) {
            handle.abort();
        }
    }
}

impl Drop for RecoveryEngine {
    fn drop(&mut self) {
        for (_, handle) in self.timers.lock().drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> RecoveryConfig {
        RecoveryConfig {
            max_attempts: 3,
            backoff_ms: 100,
        }
    }

    fn recording_engine() -> (Arc<RecoveryEngine>, Arc<Mutex<Vec<RecoveryAction>>>) {
        let engine = Arc::new(RecoveryEngine::new(test_config()));
        let actions = Arc::new(Mutex::new(Vec::new()));
        let actions_clone = Arc::clone(&actions);
        engine.set_action_callback(Arc::new(move |action| {
            actions_clone.lock().push(action);
        }));
        (engine, actions)
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_occurrence_runs_immediate_phase() {
        let (engine, actions) = recording_engine();
        engine.handle_error("pad-0", ErrorCode::ConnectionFailed);

        let seen = actions.lock().clone();
        assert_eq!(
            seen,
            vec![RecoveryAction::Retry {
                delay: Duration::from_millis(500)
            }]
        );
        assert_eq!(engine.attempts_for("pad-0", ErrorCode::ConnectionFailed), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeat_schedules_delayed_phase() {
        let (engine, actions) = recording_engine();
        engine.handle_error("pad-0", ErrorCode::ConnectionFailed);
        engine.handle_error("pad-0", ErrorCode::ConnectionFailed);

        // Delayed phase waits out its backoff
        assert_eq!(actions.lock().len(), 1);
        tokio::time::sleep(Duration::from_millis(250)).await;

        let seen = actions.lock().clone();
        assert!(seen.contains(&RecoveryAction::Reconnect));
    }

    #[tokio::test(start_paused = true)]
    async fn test_third_attempt_runs_fallback_once_and_clears_record() {
        let (engine, actions) = recording_engine();
        for _ in 0..3 {
            engine.handle_error("pad-0", ErrorCode::ConnectionFailed);
        }

        let fallbacks = actions
            .lock()
            .iter()
            .filter(|a| matches!(a, RecoveryAction::Notify { .. }))
            .count();
        assert_eq!(fallbacks, 1);
        assert_eq!(engine.attempts_for("pad-0", ErrorCode::ConnectionFailed), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_cancels_pending_delayed_actions() {
        let (engine, actions) = recording_engine();
        engine.handle_error("pad-0", ErrorCode::ProtocolWriteFailed);
        engine.handle_error("pad-0", ErrorCode::ProtocolWriteFailed);
        engine.clear("pad-0");

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!actions.lock().contains(&RecoveryAction::Reconnect));
        assert_eq!(engine.active_records(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_per_controller() {
        let (engine, _actions) = recording_engine();
        engine.handle_error("pad-0", ErrorCode::ConnectionFailed);
        engine.handle_error("pad-1", ErrorCode::ConnectionFailed);

        engine.clear("pad-0");
        assert_eq!(engine.attempts_for("pad-0", ErrorCode::ConnectionFailed), None);
        assert_eq!(engine.attempts_for("pad-1", ErrorCode::ConnectionFailed), Some(1));
    }

    #[test]
    fn test_every_code_has_a_strategy() {
        for code in [
            ErrorCode::DeviceNotFound,
            ErrorCode::ConnectionFailed,
            ErrorCode::InitializationFailed,
            ErrorCode::ProtocolWriteFailed,
            ErrorCode::HeartbeatTimeout,
            ErrorCode::Unknown,
        ] {
            let strategy = strategy_for(code);
            assert!(
                !strategy.fallback.is_empty(),
                "{} needs a fallback phase",
                code
            );
        }
    }
}
