//! Coalescing "new frame" notifications.
//!
//! Each subscriber gets a channel of capacity 1 carrying the loop's frame
//! generation. When a subscriber has not consumed its previous notification,
//! the new one is dropped: the subscriber will read the latest frame anyway,
//! so there is nothing to catch up on. The producer never blocks.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Receiving end handed to a consumer.
pub struct Subscription {
    id: u64,
    rx: Receiver<u64>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next generation. `Disconnected` once unsubscribed.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<u64, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Option<u64> {
        self.rx.try_recv().ok()
    }

    /// Notifications waiting to be consumed (0 or 1).
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NotifyOutcome {
    pub delivered: usize,
    pub coalesced: usize,
}

#[derive(Default)]
pub struct FrameNotifier {
    subscribers: Mutex<Vec<(u64, Sender<u64>)>>,
    next_id: AtomicU64,
}

impl FrameNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = crossbeam_channel::bounded(1);
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push((id, tx));
        }
        Subscription { id, rx }
    }

    /// Drop a subscriber's sender. Returns false when the id was unknown.
    pub fn unsubscribe(&self, id: u64) -> bool {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|(sub_id, _)| *sub_id != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Signal every subscriber without blocking.
    pub fn notify(&self, generation: u64) -> NotifyOutcome {
        let mut outcome = NotifyOutcome::default();
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return outcome;
        };
        subscribers.retain(|(_, tx)| match tx.try_send(generation) {
            Ok(()) => {
                outcome.delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                outcome.coalesced += 1;
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
        outcome
    }
}
