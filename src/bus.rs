//! Typed in-process pub/sub.
//!
//! Publishing is fire-and-forget. Each subscription runs its handler on a
//! spawned task and stops receiving as soon as the [`Subscription`] is
//! dropped or unsubscribed.

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;

const DEFAULT_CAPACITY: usize = 64;

pub struct MessageBus<T> {
    tx: broadcast::Sender<T>,
}

impl<T> Clone for MessageBus<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Default for MessageBus<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl<T: Clone + Send + 'static> MessageBus<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Deliver `message` to current subscribers. Returns how many receivers
    /// got it; zero subscribers is not an error.
    pub fn publish(&self, message: T) -> usize {
        self.tx.send(message).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Raw receiver for callers that drive their own loop.
    pub fn receiver(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    /// Run `handler` for every message published after this call.
    /// Must be called within a Tokio runtime.
    pub fn subscribe<F>(&self, mut handler: F) -> Subscription
    where
        F: FnMut(T) + Send + 'static,
    {
        let mut rx = self.tx.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => handler(message),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "bus subscriber lagged, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription { task: Some(task) }
    }
}

/// Handle for an active subscription. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.stop();
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let bus: MessageBus<u32> = MessageBus::default();
        assert_eq!(bus.publish(1), 0);
    }

    #[tokio::test]
    async fn test_subscribe_receives_and_unsubscribe_stops() {
        let bus: MessageBus<u32> = MessageBus::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = bus.subscribe(move |n| sink.lock().unwrap().push(n));

        assert_eq!(bus.publish(1), 1);
        assert_eq!(bus.publish(2), 1);
        settle().await;
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);

        assert!(sub.is_active());
        sub.unsubscribe();
        settle().await;
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(3);
        settle().await;
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let bus: MessageBus<&'static str> = MessageBus::default();
        {
            let _sub = bus.subscribe(|_| {});
            assert_eq!(bus.subscriber_count(), 1);
        }
        settle().await;
        assert_eq!(bus.subscriber_count(), 0);
    }
}
