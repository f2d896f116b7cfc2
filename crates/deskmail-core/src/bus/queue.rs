//! Bounded work queues — the hand-off points between adapters and workers.
//!
//! Uses tokio::sync::mpsc bounded channels. Producers wait when a queue is
//! full; any number of workers share the receiver.

use tokio::sync::mpsc;

use super::types::{OutgoingMessage, RawMessage};

/// Queue from every adapter's receive loop to the ingestion workers.
pub type IngestQueue = WorkQueue<RawMessage>;

/// Queue from the dispatch feeder to the dispatch workers.
pub type DispatchQueue = WorkQueue<OutgoingMessage>;

/// A fixed-capacity multi-producer, multi-consumer queue.
pub struct WorkQueue<T> {
    tx: mpsc::Sender<T>,
    rx: tokio::sync::Mutex<mpsc::Receiver<T>>,
}

impl<T: Send> WorkQueue<T> {
    /// Create a new queue holding at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        WorkQueue {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Push an item, waiting while the queue is full.
    pub async fn publish(&self, item: T) -> Result<(), mpsc::error::SendError<T>> {
        self.tx.send(item).await
    }

    /// Push without waiting. Fails when the queue is full.
    pub fn try_publish(&self, item: T) -> Result<(), mpsc::error::TrySendError<T>> {
        self.tx.try_send(item)
    }

    /// Take the next item (blocks until available).
    /// Returns None once every sender is dropped and the queue is drained.
    pub async fn consume(&self) -> Option<T> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }

    /// Get a clone of the sender (for producers that outlive a borrow).
    pub fn sender(&self) -> mpsc::Sender<T> {
        self.tx.clone()
    }

    /// Items currently waiting.
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::types::MessageHeaders;
    use std::sync::Arc;
    use std::time::Duration;

    fn raw(source: &str) -> RawMessage {
        RawMessage::new(1, source, MessageHeaders::default())
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let q = IngestQueue::new(10);
        for i in 1..=3 {
            q.publish(raw(&format!("m{i}"))).await.unwrap();
        }
        assert_eq!(q.depth(), 3);
        assert_eq!(q.consume().await.unwrap().source_id, "m1");
        assert_eq!(q.consume().await.unwrap().source_id, "m2");
        assert_eq!(q.consume().await.unwrap().source_id, "m3");
        assert_eq!(q.depth(), 0);
    }

    #[tokio::test]
    async fn test_full_queue_blocks_producer() {
        let q = Arc::new(IngestQueue::new(1));
        q.publish(raw("first")).await.unwrap();
        assert!(q.try_publish(raw("overflow")).is_err());

        let q2 = q.clone();
        let producer = tokio::spawn(async move { q2.publish(raw("second")).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished());

        assert_eq!(q.consume().await.unwrap().source_id, "first");
        producer.await.unwrap().unwrap();
        assert_eq!(q.consume().await.unwrap().source_id, "second");
    }

    #[tokio::test]
    async fn test_multiple_consumers_share_items() {
        let q = Arc::new(IngestQueue::new(10));
        for i in 0..4 {
            q.publish(raw(&i.to_string())).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..2 {
            let q = q.clone();
            handles.push(tokio::spawn(async move {
                let a = q.consume().await.unwrap();
                let b = q.consume().await.unwrap();
                vec![a.source_id, b.source_id]
            }));
        }

        let mut seen: Vec<String> = Vec::new();
        for h in handles {
            seen.extend(h.await.unwrap());
        }
        seen.sort();
        assert_eq!(seen, vec!["0", "1", "2", "3"]);
    }
}
