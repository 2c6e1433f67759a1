//! Coalescing LED write queue
//!
//! Bursts of LED changes (a full pattern redraw) collapse into one flush;
//! steady-state single updates still go out within one batch window. Writes
//! to the same address inside a window are last-write-wins.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::BatchConfig;

/// Writes one LED frame for (address, color).
pub type LedWriter = Arc<dyn Fn(u8, u8) + Send + Sync>;

pub struct LedBatcher {
    pending: Arc<Mutex<HashMap<u8, u8>>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    writer: LedWriter,
    config: BatchConfig,
    reverse_order: bool,
    flush_count: Arc<AtomicU64>,
}

impl LedBatcher {
    pub fn new(config: BatchConfig, reverse_order: bool, writer: LedWriter) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            timer: Mutex::new(None),
            writer,
            config,
            reverse_order,
            flush_count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Upsert a pending write. Flushes immediately once the pending map
    /// reaches the batch size cap, otherwise (re)arms the window timer.
    pub fn queue(&self, address: u8, color: u8) {
        let pending_len = {
            let mut pending = self.pending.lock();
            pending.insert(address, color);
            pending.len()
        };

        if pending_len >= self.config.max_batch {
            warn!(
                "LED batch reached size cap ({}), flushing early",
                self.config.max_batch
            );
            self.flush();
        } else {
            self.rearm_timer();
        }
    }

    /// Drain and write all pending entries, cancelling the window timer.
    pub fn flush(&self) {
        self.cancel_timer();
        Self::drain(
            &self.pending,
            &self.writer,
            self.reverse_order,
            &self.flush_count,
        );
    }

    /// Flush bypassing the timer, for urgent contexts (pre-disconnect).
    pub fn force_flush(&self) {
        self.flush();
    }

    /// Drop everything queued without writing it.
    pub fn clear(&self) {
        self.cancel_timer();
        self.pending.lock().clear();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn flush_count(&self) -> u64 {
        self.flush_count.load(Ordering::Relaxed)
    }

    fn rearm_timer(&self) {
        let pending = Arc::clone(&self.pending);
        let writer = Arc::clone(&self.writer);
        let flush_count = Arc::clone(&self.flush_count);
        let reverse = self.reverse_order;
        let window = Duration::from_millis(self.config.window_ms);

        let mut timer = self.timer.lock();
        if let Some(handle) = timer.take() {
            handle.abort();
        }
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            Self::drain(&pending, &writer, reverse, &flush_count);
        }));
    }

    fn cancel_timer(&self) {
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
        }
    }

    fn drain(
        pending: &Mutex<HashMap<u8, u8>>,
        writer: &LedWriter,
        reverse: bool,
        flush_count: &AtomicU64,
    ) {
        let mut entries: Vec<(u8, u8)> = {
            let mut map = pending.lock();
            if map.is_empty() {
                return;
            }
            map.drain().collect()
        };

        entries.sort_by_key(|(addr, _)| *addr);
        if reverse {
            entries.reverse();
        }
        for (address, color) in entries {
            writer(address, color);
        }
        flush_count.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for LedBatcher {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}
