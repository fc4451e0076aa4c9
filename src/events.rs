//! A small typed publish/subscribe hub composed into every stateful
//! component (`Device`, `Scanner`, `DevicePair`).
//!
//! Subscribers get an unbounded [`mpsc`] receiver of cloned events; one-shot
//! listeners get a [`oneshot`] receiver resolved by the next emission; and
//! [`EventHub::wait_for`] provides the async "next occurrence matching a
//! predicate" primitive. Closed subscriptions are pruned lazily on emit, so
//! dropping a receiver is all the cleanup a consumer ever does.

use std::sync::Mutex;

use tokio::sync::{mpsc, oneshot};

/// A fan-out registry of listeners for one event type.
pub struct EventHub<E: Clone> {
    inner: Mutex<Listeners<E>>,
}

struct Listeners<E> {
    subscribers: Vec<mpsc::UnboundedSender<E>>,
    once: Vec<oneshot::Sender<E>>,
}

impl<E: Clone> EventHub<E> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Listeners {
                subscribers: Vec::new(),
                once: Vec::new(),
            }),
        }
    }

    /// Subscribe to every future emission.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().unwrap().subscribers.push(tx);
        rx
    }

    /// Listen for exactly the next emission.
    pub fn once(&self) -> oneshot::Receiver<E> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().unwrap().once.push(tx);
        rx
    }

    /// Wait for the next emission matching `pred`. Returns `None` if the hub
    /// is dropped before a match arrives.
    pub async fn wait_for<F>(&self, pred: F) -> Option<E>
    where
        F: Fn(&E) -> bool,
    {
        let mut rx = self.subscribe();
        while let Some(event) = rx.recv().await {
            if pred(&event) {
                return Some(event);
            }
        }
        None
    }

    /// Deliver `event` to every live listener, draining one-shot listeners
    /// and pruning subscribers whose receiver has been dropped.
    pub fn emit(&self, event: E) {
        let mut inner = self.inner.lock().unwrap();
        for tx in inner.once.drain(..) {
            let _ = tx.send(event.clone());
        }
        inner.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of live persistent subscribers (after the last prune).
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().subscribers.len()
    }
}

impl<E: Clone> Default for EventHub<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fan_out_reaches_every_subscriber() {
        let hub = EventHub::new();
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        hub.emit(7u32);
        assert_eq!(a.recv().await, Some(7));
        assert_eq!(b.recv().await, Some(7));
    }

    #[tokio::test]
    async fn once_listener_fires_a_single_time() {
        let hub = EventHub::new();
        let once = hub.once();
        hub.emit("first");
        hub.emit("second");
        assert_eq!(once.await.unwrap(), "first");
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let hub = EventHub::new();
        drop(hub.subscribe());
        hub.emit(1u8);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn wait_for_skips_non_matching_events() {
        let hub = std::sync::Arc::new(EventHub::new());
        let waiter = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.wait_for(|e: &u32| *e > 10).await })
        };
        // Give the waiter a chance to subscribe before emitting.
        tokio::task::yield_now().await;
        hub.emit(3);
        hub.emit(42);
        assert_eq!(waiter.await.unwrap(), Some(42));
    }
}
