//! ksync store: the cooldown queue that collapses watch bursts, and the
//! per-kind shadow object store backing patch generation.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::time::Duration;

use ksync_core::WatchEvent;
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

mod shadow;

pub use ksync_core::config::DEFAULT_QUEUE_SIZE;
pub use shadow::ShadowStore;

/// Pending events keyed by dedup key, with one cooldown timer per key.
///
/// A key's timer starts when the key is first seen and is not extended by
/// later events; when it elapses only the latest event for that key is
/// released. The cooldown is fixed, so deadlines are monotone in insertion
/// order and a FIFO is enough to track them.
pub struct Coalescer {
    pending: FxHashMap<String, WatchEvent>,
    order: VecDeque<(Instant, String)>,
    cooldown: Duration,
    collapsed: u64,
}

impl Coalescer {
    pub fn new(cooldown: Duration) -> Self {
        Self { pending: FxHashMap::default(), order: VecDeque::new(), cooldown, collapsed: 0 }
    }

    pub fn len(&self) -> usize { self.pending.len() }
    pub fn is_empty(&self) -> bool { self.pending.is_empty() }
    pub fn collapsed(&self) -> u64 { self.collapsed }

    /// Record `event`, replacing any pending event under the same key.
    pub fn push(&mut self, event: WatchEvent, now: Instant) {
        let key = event.dedup_key();
        if self.pending.insert(key.clone(), event).is_some() {
            self.collapsed += 1;
            counter!("ksync_cooldown_collapsed_total", 1u64);
        } else {
            self.order.push_back((now + self.cooldown, key));
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.order.front().map(|(deadline, _)| *deadline)
    }

    /// Release every event whose timer has elapsed at `now`, in expiry order.
    pub fn drain_expired(&mut self, now: Instant) -> Vec<WatchEvent> {
        let mut out = Vec::new();
        while let Some((deadline, _)) = self.order.front() {
            if *deadline > now { break; }
            if let Some((_, key)) = self.order.pop_front() {
                if let Some(ev) = self.pending.remove(&key) {
                    out.push(ev);
                }
            }
        }
        out
    }

    /// Release every pending event regardless of its timer, in expiry order.
    pub fn drain_all(&mut self) -> Vec<WatchEvent> {
        let out = self.order.drain(..).filter_map(|(_, key)| self.pending.remove(&key)).collect();
        self.pending.clear();
        out
    }
}

/// Debouncing queue between a watch stream and its consumer.
///
/// `enqueue` waits while the input buffer is full, so a slow consumer applies
/// backpressure to the watcher instead of losing events. `close` ends the
/// input and releases everything still cooling down before the output closes;
/// `stop` (and dropping the queue) closes the output and discards those events.
pub struct CooldownQueue {
    tx: mpsc::Sender<WatchEvent>,
    cancel: CancellationToken,
    draining: bool,
}

impl CooldownQueue {
    /// Spawn the queue task. Must be called within a tokio runtime.
    pub fn new(capacity: usize, cooldown: Duration) -> (Self, mpsc::Receiver<WatchEvent>) {
        Self::with_cancel(capacity, cooldown, CancellationToken::new())
    }

    /// Like [`CooldownQueue::new`], stopped when `cancel` fires.
    pub fn with_cancel(
        capacity: usize,
        cooldown: Duration,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<WatchEvent>) {
        let cap = capacity.max(1);
        let (tx, rx) = mpsc::channel::<WatchEvent>(cap);
        let (out_tx, out_rx) = mpsc::channel::<WatchEvent>(cap);
        tokio::spawn(pump(rx, out_tx, cancel.clone(), cooldown));
        (Self { tx, cancel, draining: false }, out_rx)
    }

    /// No-op once the queue is stopped.
    pub async fn enqueue(&self, event: WatchEvent) {
        if self.cancel.is_cancelled() { return; }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {}
            res = self.tx.send(event) => {
                if res.is_err() { debug!("cooldown queue closed; event dropped"); }
            }
        }
    }

    /// Idempotent.
    pub fn stop(&self) { self.cancel.cancel(); }

    /// Stop accepting events and flush the pending ones, in first-seen order,
    /// without waiting for their cooldown. The output closes once the last
    /// one is delivered. Cancellation still discards whatever is left.
    pub fn close(mut self) {
        self.draining = true;
    }

    pub fn is_stopped(&self) -> bool { self.cancel.is_cancelled() }
}

impl Drop for CooldownQueue {
    fn drop(&mut self) {
        if !self.draining {
            self.cancel.cancel();
        }
    }
}

async fn pump(
    mut rx: mpsc::Receiver<WatchEvent>,
    out_tx: mpsc::Sender<WatchEvent>,
    cancel: CancellationToken,
    cooldown: Duration,
) {
    let mut coalescer = Coalescer::new(cooldown);
    loop {
        let deadline = coalescer.next_deadline();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                for ev in coalescer.drain_expired(Instant::now()) {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        res = out_tx.send(ev) => if res.is_err() { return; },
                    }
                }
            }
            maybe = rx.recv() => match maybe {
                Some(ev) => coalescer.push(ev, Instant::now()),
                None => {
                    let pending = coalescer.drain_all();
                    debug!(flushed = pending.len(), "cooldown queue input closed");
                    for ev in pending {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return,
                            res = out_tx.send(ev) => if res.is_err() { return; },
                        }
                    }
                    return;
                }
            },
        }
    }
    if !coalescer.is_empty() {
        debug!(discarded = coalescer.len(), "cooldown queue stopped with pending events");
    }
}
