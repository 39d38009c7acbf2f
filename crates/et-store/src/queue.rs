use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;

/// Errors surfaced by a [`MessageQueue`] operation.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("no such topic: {0}")]
    UnknownTopic(String),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// The external-queue contract: serialize-and-publish on one side,
/// subscribe-and-consume on the other (spec 4.3). Generalized from the
/// original's NSQ-specific client, since no NSQ client crate is present
/// anywhere in this codebase's dependency corpus.
#[async_trait::async_trait]
pub trait MessageQueue: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), QueueError>;

    /// Returns a receiver yielding each published payload in order. Multiple
    /// subscribers on the same topic each get their own receiver (broadcast
    /// semantics), mirroring independent NSQ consumer processes.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Vec<u8>>, QueueError>;
}

/// An in-process [`MessageQueue`] used by tests and by a single-process
/// `et-worker` deployment that still wants the external-queue scheduler's
/// code path exercised without standing up a real broker.
#[derive(Default)]
pub struct InMemoryQueue {
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<Vec<u8>>>>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl MessageQueue for InMemoryQueue {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), QueueError> {
        let senders = {
            let guard = self.subscribers.lock().expect("queue mutex poisoned");
            guard.get(topic).cloned().unwrap_or_default()
        };
        for sender in senders {
            // A full/closed consumer channel does not fail the publish —
            // consumption is best-effort per-worker, mirroring NSQ's
            // fire-and-forget publish.
            let _ = sender.send(payload.clone()).await;
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Vec<u8>>, QueueError> {
        let (tx, rx) = mpsc::channel(64);
        self.subscribers
            .lock()
            .expect("queue mutex poisoned")
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_after_subscribe_is_delivered() {
        let queue = InMemoryQueue::new();
        let mut rx = queue.subscribe("jobs").await.unwrap();
        queue.publish("jobs", b"hello".to_vec()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), b"hello");
    }
}
