//! Explicit subscriber registries.
//!
//! Each subscriber owns an unbounded channel receiver; dropping the
//! [`Subscription`] unregisters it, and [`Subscribers::clear`] ends every
//! stream at once.

use dashmap::DashMap;
use futures::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;

pub struct Subscribers<T> {
    next_id: AtomicU64,
    senders: DashMap<u64, mpsc::UnboundedSender<T>>,
    closed: AtomicBool,
}

impl<T: Clone> Subscribers<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            senders: DashMap::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Register a subscriber. After [`clear`](Self::clear) the returned
    /// subscription is already finished.
    pub fn subscribe(self: &Arc<Self>) -> Subscription<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.closed.load(Ordering::SeqCst) {
            self.senders.insert(id, tx);
            // Lost a race with clear().
            if self.closed.load(Ordering::SeqCst) {
                self.senders.remove(&id);
            }
        }
        Subscription {
            id,
            rx,
            registry: Arc::downgrade(self),
        }
    }

    /// Deliver a value to every live subscriber.
    pub fn emit(&self, value: T) {
        self.senders
            .retain(|_, sender| sender.send(value.clone()).is_ok());
    }

    /// Drop every subscriber and refuse new ones.
    pub fn clear(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.senders.clear();
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    fn remove(&self, id: u64) {
        self.senders.remove(&id);
    }
}

/// Receiving end of one subscription. Unsubscribes on drop.
pub struct Subscription<T: Clone> {
    id: u64,
    rx: mpsc::UnboundedReceiver<T>,
    registry: Weak<Subscribers<T>>,
}

impl<T: Clone> Subscription<T> {
    /// Next value; `None` once the registry was cleared.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T: Clone> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

impl<T: Clone> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}
