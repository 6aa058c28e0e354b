use crate::range::ByteRange;
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};
use tokio::sync::mpsc as tokio_mpsc;

type SubscriptionId = u64;

/// State changes of a streaming cache, for progress displays and diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    ConnectionStarted { range: ByteRange },
    /// A running connection was replaced; `remaining` was never delivered
    ConnectionSuperseded { remaining: ByteRange },
    ConnectionFinished { range: ByteRange },
    ConnectionFailed {
        range: ByteRange,
        message: String,
        attempt: u32,
    },
    ChunkReceived { range: ByteRange },
    RangesEvicted { ranges: Vec<ByteRange> },
    ReadResolved { range: ByteRange },
}

/// Fan-out of cache events to any number of subscribers
#[derive(Clone, Default)]
pub struct CacheEventHandle {
    subscriptions: Arc<Mutex<HashMap<SubscriptionId, tokio_mpsc::UnboundedSender<CacheEvent>>>>,
    next_id: Arc<AtomicU64>,
}

impl CacheEventHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to all cache events
    /// Subscription is automatically removed when receiver is dropped
    pub fn subscribe_all(&self) -> tokio_mpsc::UnboundedReceiver<CacheEvent> {
        let (tx, rx) = tokio_mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        self.lock().insert(id, tx);
        rx
    }

    pub(crate) fn emit(&self, event: CacheEvent) {
        let mut subs = self.lock();
        if subs.is_empty() {
            return;
        }
        // If send fails, receiver was dropped
        subs.retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<SubscriptionId, tokio_mpsc::UnboundedSender<CacheEvent>>>
    {
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
