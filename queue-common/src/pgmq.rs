use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::message::Message;
use crate::queue::{DurableQueue, QueueError, QueueResult};

/// A durable queue client backed by the pgmq PostgreSQL extension.
///
/// One client serves every queue in the database; queue names are passed per
/// call. The dead letter queue for a queue must exist before anything is sent
/// to it, like any other pgmq queue.
pub struct PgmqQueue {
    pool: PgPool,
}

/// Row shape returned by `pgmq.read`.
#[derive(sqlx::FromRow)]
struct PgmqRow {
    msg_id: i64,
    read_ct: i32,
    enqueued_at: DateTime<Utc>,
    message: sqlx::types::Json<serde_json::Value>,
}

impl From<PgmqRow> for Message {
    fn from(row: PgmqRow) -> Self {
        Self {
            id: row.msg_id,
            body: row.message.0,
            read_count: row.read_ct,
            enqueued_at: row.enqueued_at,
        }
    }
}

impl PgmqQueue {
    /// Initialize a new PgmqQueue connected to the given database.
    pub async fn new(url: &str, max_connections: u32) -> QueueResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|error| QueueError::ConnectionError { error })?;

        Ok(Self { pool })
    }

    /// Initialize a new PgmqQueue from an existing connection pool.
    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DurableQueue for PgmqQueue {
    async fn read(
        &self,
        queue: &str,
        visibility_timeout: Duration,
        quantity: usize,
    ) -> QueueResult<Vec<Message>> {
        let base_query = r#"
SELECT
    msg_id,
    read_ct,
    enqueued_at,
    message
FROM
    pgmq.read($1::text, $2::integer, $3::integer)
        "#;

        let rows: Vec<PgmqRow> = sqlx::query_as(base_query)
            .bind(queue)
            .bind(visibility_timeout.as_secs() as i32)
            .bind(quantity as i32)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "pgmq.read".to_owned(),
                error,
            })?;

        Ok(rows.into_iter().map(Message::from).collect())
    }

    async fn archive(&self, queue: &str, message_id: i64) -> QueueResult<()> {
        let archived: bool = sqlx::query_scalar("SELECT pgmq.archive($1::text, $2::bigint)")
            .bind(queue)
            .bind(message_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "pgmq.archive".to_owned(),
                error,
            })?;

        if archived {
            Ok(())
        } else {
            Err(QueueError::MessageNotFound {
                queue: queue.to_owned(),
                id: message_id,
            })
        }
    }

    async fn set_visibility_timeout(
        &self,
        queue: &str,
        message_id: i64,
        delay: Duration,
    ) -> QueueResult<()> {
        let updated: Option<i64> =
            sqlx::query_scalar("SELECT msg_id FROM pgmq.set_vt($1::text, $2::bigint, $3::integer)")
                .bind(queue)
                .bind(message_id)
                .bind(delay.as_secs() as i32)
                .fetch_optional(&self.pool)
                .await
                .map_err(|error| QueueError::QueryError {
                    command: "pgmq.set_vt".to_owned(),
                    error,
                })?;

        match updated {
            Some(_) => Ok(()),
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
        let message_id: i64 =
            sqlx::query_scalar("SELECT pgmq.send($1::text, $2::jsonb, $3::integer)")
                .bind(queue)
                .bind(sqlx::types::Json(body))
                .bind(delay.as_secs() as i32)
                .fetch_one(&self.pool)
                .await
                .map_err(|error| QueueError::QueryError {
                    command: "pgmq.send".to_owned(),
                    error,
                })?;

        Ok(message_id)
    }
}
