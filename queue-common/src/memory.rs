//! In-memory durable queue for tests and local development.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;

use crate::message::Message;
use crate::queue::{DurableQueue, QueueError, QueueResult};

/// A message held by the in-memory queue, with its visibility deadline.
#[derive(Debug, Clone)]
struct StoredMessage {
    id: i64,
    body: serde_json::Value,
    read_count: i32,
    enqueued_at: chrono::DateTime<Utc>,
    visible_at: Instant,
}

impl StoredMessage {
    fn is_visible(&self, now: Instant) -> bool {
        self.visible_at <= now
    }

    fn to_message(&self) -> Message {
        Message {
            id: self.id,
            body: self.body.clone(),
            read_count: self.read_count,
            enqueued_at: self.enqueued_at,
        }
    }
}

#[derive(Default)]
struct InMemoryState {
    /// Live messages per queue, kept in id order.
    queues: HashMap<String, Vec<StoredMessage>>,
    /// Archived messages per queue, kept for inspection.
    archived: HashMap<String, Vec<StoredMessage>>,
    next_id: i64,
}

/// A thread-safe `DurableQueue` held entirely in memory.
///
/// Behaves like pgmq as far as consumers can tell: reads hide messages for
/// the visibility timeout and bump their read count, archives are terminal,
/// and sends may be delayed. Queues spring into existence on first use.
#[derive(Default)]
pub struct InMemoryQueue {
    state: Mutex<InMemoryState>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, InMemoryState> {
        self.state.lock().expect("in-memory queue state lock poisoned")
    }

    /// Number of live (visible or in-flight) messages in a queue.
    pub fn len(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, Vec::len)
    }

    /// Number of archived messages for a queue.
    pub fn archived_len(&self, queue: &str) -> usize {
        self.state().archived.get(queue).map_or(0, Vec::len)
    }

    /// Copy of a queue's live messages, without affecting visibility or read counts.
    pub fn snapshot(&self, queue: &str) -> Vec<Message> {
        self.state()
            .queues
            .get(queue)
            .map(|messages| messages.iter().map(StoredMessage::to_message).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DurableQueue for InMemoryQueue {
    async fn read(
        &self,
        queue: &str,
        visibility_timeout: Duration,
        quantity: usize,
    ) -> QueueResult<Vec<Message>> {
        let now = Instant::now();
        let mut state = self.state();
        let messages = state.queues.entry(queue.to_owned()).or_default();

        let mut read = Vec::new();
        for stored in messages.iter_mut() {
            if read.len() == quantity {
                break;
            }
            if stored.is_visible(now) {
                stored.read_count += 1;
                stored.visible_at = now + visibility_timeout;
                read.push(stored.to_message());
            }
        }

        Ok(read)
    }

    async fn archive(&self, queue: &str, message_id: i64) -> QueueResult<()> {
        let mut state = self.state();
        let messages = state.queues.entry(queue.to_owned()).or_default();

        match messages.iter().position(|stored| stored.id == message_id) {
            Some(index) => {
                let stored = messages.remove(index);
                state.archived.entry(queue.to_owned()).or_default().push(stored);
                Ok(())
            }
            None => Err(QueueError::MessageNotFound {
                queue: queue.to_owned(),
                id: message_id,
            }),
        }
    }

    async fn set_visibility_timeout(
        &self,
        queue: &str,
        message_id: i64,
        delay: Duration,
    ) -> QueueResult<()> {
        let mut state = self.state();
        let messages = state.queues.entry(queue.to_owned()).or_default();

        match messages.iter_mut().find(|stored| stored.id == message_id) {
            Some(stored) => {
                stored.visible_at = Instant::now() + delay;
                Ok(())
            }
            None => Err(QueueError::MessageNotFound {
                queue: queue.to_owned(),
                id: message_id,
            }),
        }
    }

    async fn send(
        &self,
        queue: &str,
        body: serde_json::Value,
        delay: Duration,
    ) -> QueueResult<i64> {
        let mut state = self.state();
        state.next_id += 1;
        let id = state.next_id;

        state.queues.entry(queue.to_owned()).or_default().push(StoredMessage {
            id,
            body,
            read_count: 0,
            enqueued_at: Utc::now(),
            visible_at: Instant::now() + delay,
        });

        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_read_hides_messages_and_increments_read_count() {
        let queue = InMemoryQueue::new();
        queue
            .send("jobs", json!({"kind": "refresh"}), Duration::ZERO)
            .await
            .unwrap();

        let first = queue
            .read("jobs", Duration::from_secs(30), 10)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].read_count, 1);

        // Still hidden by the visibility timeout.
        let second = queue
            .read("jobs", Duration::from_secs(30), 10)
            .await
            .unwrap();
        assert!(second.is_empty());
        assert_eq!(queue.len("jobs"), 1);
    }

    #[tokio::test]
    async fn test_set_visibility_timeout_makes_message_visible_again() {
        let queue = InMemoryQueue::new();
        let id = queue.send("jobs", json!({}), Duration::ZERO).await.unwrap();

        queue.read("jobs", Duration::from_secs(30), 1).await.unwrap();
        queue
            .set_visibility_timeout("jobs", id, Duration::ZERO)
            .await
            .unwrap();

        let read = queue.read("jobs", Duration::from_secs(30), 1).await.unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].read_count, 2);
    }

    #[tokio::test]
    async fn test_archive_removes_message_permanently() {
        let queue = InMemoryQueue::new();
        let id = queue.send("jobs", json!({}), Duration::ZERO).await.unwrap();

        queue.archive("jobs", id).await.unwrap();

        assert_eq!(queue.len("jobs"), 0);
        assert_eq!(queue.archived_len("jobs"), 1);
        assert!(matches!(
            queue.archive("jobs", id).await,
            Err(QueueError::MessageNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_delayed_send_is_invisible_until_delay_elapses() {
        let queue = InMemoryQueue::new();
        queue
            .send("jobs", json!({}), Duration::from_millis(50))
            .await
            .unwrap();

        let early = queue.read("jobs", Duration::from_secs(30), 1).await.unwrap();
        assert!(early.is_empty());

        tokio::time::sleep(Duration::from_millis(80)).await;

        let late = queue.read("jobs", Duration::from_secs(30), 1).await.unwrap();
        assert_eq!(late.len(), 1);
    }

    #[tokio::test]
    async fn test_reads_preserve_id_order() {
        let queue = InMemoryQueue::new();
        for index in 0..3 {
            queue
                .send("jobs", json!({ "index": index }), Duration::ZERO)
                .await
                .unwrap();
        }

        let read = queue.read("jobs", Duration::from_secs(30), 3).await.unwrap();
        let ids: Vec<i64> = read.iter().map(|message| message.id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
    }
}
