//! Admission control for handshake connections
//!
//! Bounds the number of simultaneously active handshake sessions. Upgrades
//! beyond the ceiling are held in a FIFO queue, not refused: a slot opening
//! promotes the oldest waiter, and only a waiter whose own timer fires gets
//! turned away (HTTP 503). Active connections are never closed to admit a
//! queued one.
//!
//! Slot accounting is permit-based: a permit is taken at upgrade and released
//! on drop, so every exit path of a connection task (completion, failure,
//! timeout, client close, server shutdown) converges on the same release.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

struct Waiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

struct Inner {
    active: usize,
    queue: VecDeque<Waiter>,
}

pub struct AdmissionController {
    ceiling: usize,
    next_waiter_id: AtomicU64,
    inner: Mutex<Inner>,
}

/// Outcome of asking for a slot.
pub enum Admission {
    /// A slot was free; proceed with the upgrade.
    Immediate(AdmissionPermit),
    /// At the ceiling; the caller holds the un-upgraded request and waits.
    Queued(QueuedUpgrade),
}

impl AdmissionController {
    pub fn new(ceiling: usize) -> Arc<Self> {
        Arc::new(Self {
            ceiling: ceiling.max(1),
            next_waiter_id: AtomicU64::new(1),
            inner: Mutex::new(Inner {
                active: 0,
                queue: VecDeque::new(),
            }),
        })
    }

    /// Request a slot.
    pub fn admit(self: &Arc<Self>) -> Admission {
        let mut inner = self.inner.lock().expect("admission lock poisoned");
        if inner.active < self.ceiling {
            inner.active += 1;
            Admission::Immediate(AdmissionPermit {
                controller: Arc::clone(self),
            })
        } else {
            let id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            inner.queue.push_back(Waiter { id, tx });
            debug!(queued = inner.queue.len(), "Handshake upgrade held at ceiling");
            Admission::Queued(QueuedUpgrade {
                id,
                rx,
                controller: Arc::clone(self),
            })
        }
    }

    /// Release a slot: hand it to the oldest live waiter, else decrement.
    /// Queue pop and send happen under the same lock `cancel` takes, so a
    /// timed-out waiter can distinguish "still queued" from "slot in flight".
    fn release(self: &Arc<Self>) {
        let mut inner = self.inner.lock().expect("admission lock poisoned");
        while let Some(waiter) = inner.queue.pop_front() {
            if waiter.tx.send(()).is_ok() {
                // Slot transferred; active count unchanged.
                return;
            }
            // Receiver gone (timed out and cancelled between polls); try next.
        }
        inner.active = inner.active.saturating_sub(1);
    }

    /// Remove a waiter after its queue timer fired. Returns false when the
    /// waiter had already been popped for promotion.
    fn cancel(&self, waiter_id: u64) -> bool {
        let mut inner = self.inner.lock().expect("admission lock poisoned");
        let before = inner.queue.len();
        inner.queue.retain(|w| w.id != waiter_id);
        inner.queue.len() < before
    }

    /// Drop every queued waiter (server shutdown). Their `wait` calls return
    /// `None` and the held requests are answered 503.
    pub fn drain_queue(&self) {
        let mut inner = self.inner.lock().expect("admission lock poisoned");
        let dropped = inner.queue.len();
        inner.queue.clear();
        if dropped > 0 {
            debug!(dropped, "Admission queue drained for shutdown");
        }
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().expect("admission lock poisoned").active
    }

    pub fn queued_count(&self) -> usize {
        self.inner.lock().expect("admission lock poisoned").queue.len()
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }
}

/// RAII slot: dropping it releases the slot and promotes the next waiter.
pub struct AdmissionPermit {
    controller: Arc<AdmissionController>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.controller.release();
    }
}

/// A held upgrade waiting for promotion.
pub struct QueuedUpgrade {
    id: u64,
    rx: oneshot::Receiver<()>,
    controller: Arc<AdmissionController>,
}

impl QueuedUpgrade {
    /// Wait up to `timeout` for a slot. `None` means the caller answers 503
    /// and destroys the socket; this is the only rejecting path.
    pub async fn wait(mut self, timeout: Duration) -> Option<AdmissionPermit> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(())) => Some(AdmissionPermit {
                controller: self.controller,
            }),
            // Sender dropped without sending: queue drained for shutdown.
            Ok(Err(_)) => None,
            Err(_) => {
                if self.controller.cancel(self.id) {
                    return None;
                }
                // Popped for promotion concurrently with the timer; the send
                // has already happened (pop and send share the lock).
                match self.rx.try_recv() {
                    Ok(()) => Some(AdmissionPermit {
                        controller: self.controller,
                    }),
                    Err(_) => None,
                }
            }
        }
    }
}
