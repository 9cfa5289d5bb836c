use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Suffix appended to a queue name to derive the name of its dead letter queue.
const DEAD_LETTER_SUFFIX: &str = "_dlq";

/// Derive the dead letter queue name for a queue, by naming convention.
pub fn dead_letter_queue_name(queue: &str) -> String {
    format!("{}{}", queue, DEAD_LETTER_SUFFIX)
}

/// A message read from a durable queue.
///
/// Messages are owned by the queue; consumers only read them and then either
/// archive them or make them visible again. `read_count` is maintained by the
/// queue itself and increments on every delivery.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: i64,
    pub body: serde_json::Value,
    pub read_count: i32,
    pub enqueued_at: DateTime<Utc>,
}

/// The body written to a dead letter queue when a message exhausts its retries.
/// `id` refers to the original message so operators can correlate the two.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterMessage {
    pub id: i64,
    pub error: String,
}

impl DeadLetterMessage {
    pub fn new(id: i64, error: &str) -> Self {
        Self {
            id,
            error: error.to_owned(),
        }
    }

    /// Render this dead letter record as a queue message body.
    pub fn into_body(self) -> serde_json::Value {
        json!({
            "id": self.id,
            "error": self.error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dead_letter_queue_name() {
        assert_eq!(dead_letter_queue_name("store_refresh"), "store_refresh_dlq");
    }

    #[test]
    fn test_dead_letter_message_round_trips_through_body() {
        let dead_letter = DeadLetterMessage::new(42, "handler failed: boom");
        let body = dead_letter.into_body();

        let parsed: DeadLetterMessage =
            serde_json::from_value(body).expect("body should deserialize");
        assert_eq!(parsed, DeadLetterMessage::new(42, "handler failed: boom"));
    }
}
