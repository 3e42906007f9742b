//! PostgreSQL-backed queue.
//!
//! All queues share the `queue_messages` table, keyed by queue name. Consumers claim
//! rows with `FOR UPDATE SKIP LOCKED` so concurrent workers never receive the same
//! message from one receive call. Each receive issues a fresh receipt, which is what
//! makes deletes from superseded receives a no-op.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::error::{RelayError, Result};

use super::{MessageQueue, QueueDepth, QueuePolicy, ReceivedMessage, Receipt};

#[derive(Debug, FromRow)]
struct ClaimedRow {
    id: Uuid,
    body: String,
    receive_count: i32,
    receipt: Uuid,
    enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Redrive {
    dead_letter_queue: String,
    max_receive_count: u32,
}

#[derive(Clone)]
pub struct PostgresQueue {
    pool: PgPool,
    name: String,
    policy: QueuePolicy,
    redrive: Option<Redrive>,
}

impl PostgresQueue {
    pub fn new(pool: PgPool, name: impl Into<String>, policy: QueuePolicy) -> Self {
        Self {
            pool,
            name: name.into(),
            policy,
            redrive: None,
        }
    }

    /// Move messages to the queue named `dead_letter_queue` once they have been
    /// received `max_receive_count` times without being deleted.
    pub fn with_dead_letter(mut self, dead_letter_queue: impl Into<String>, max_receive_count: u32) -> Self {
        self.redrive = Some(Redrive {
            dead_letter_queue: dead_letter_queue.into(),
            max_receive_count,
        });
        self
    }

    fn queue_error(&self) -> impl Fn(sqlx::Error) -> RelayError + '_ {
        move |e| RelayError::Queue(format!("{}: {e}", self.name))
    }

    async fn redrive_exhausted(&self, redrive: &Redrive) -> Result<()> {
        let moved = sqlx::query(
            r#"
            UPDATE queue_messages
            SET queue_name = $2, receive_count = 0, receipt = NULL, visible_at = now()
            WHERE queue_name = $1 AND visible_at <= now() AND receive_count >= $3
            "#,
        )
        .bind(&self.name)
        .bind(&redrive.dead_letter_queue)
        .bind(redrive.max_receive_count as i32)
        .execute(&self.pool)
        .await
        .map_err(self.queue_error())?
        .rows_affected();

        if moved > 0 {
            warn!(
                queue = %self.name,
                dead_letter_queue = %redrive.dead_letter_queue,
                count = moved,
                "Moved exhausted messages to dead-letter queue"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl MessageQueue for PostgresQueue {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, body), fields(queue = %self.name), err)]
    async fn send(&self, body: &str) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO queue_messages (id, queue_name, body) VALUES ($1, $2, $3)")
            .bind(id)
            .bind(&self.name)
            .bind(body)
            .execute(&self.pool)
            .await
            .map_err(self.queue_error())?;
        Ok(id)
    }

    #[instrument(skip(self), fields(queue = %self.name), err)]
    async fn receive(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>> {
        if let Some(redrive) = &self.redrive {
            self.redrive_exhausted(redrive).await?;
        }

        // Visibility for the nth receive is base * factor^(n-1), and receive_count
        // still holds n-1 when the expression is evaluated. The exponent is clamped
        // so queues without redrive can't overflow float8 on long-lived messages.
        let rows = sqlx::query_as::<_, ClaimedRow>(
            r#"
            WITH claimable AS (
                SELECT id FROM queue_messages
                WHERE queue_name = $1 AND visible_at <= now()
                ORDER BY visible_at, enqueued_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE queue_messages q
            SET receive_count = q.receive_count + 1,
                receipt = gen_random_uuid(),
                visible_at = now() + make_interval(
                    secs => LEAST($3::float8 * power($4::float8, LEAST(q.receive_count, 30)), $5::float8)
                )
            FROM claimable
            WHERE q.id = claimable.id
            RETURNING q.id, q.body, q.receive_count, q.receipt, q.enqueued_at
            "#,
        )
        .bind(&self.name)
        .bind(max_messages as i64)
        .bind(self.policy.visibility_timeout.as_secs_f64())
        .bind(self.policy.backoff_factor.max(1) as f64)
        .bind(self.policy.max_visibility_timeout.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(self.queue_error())?;

        let mut received: Vec<ReceivedMessage> = rows
            .into_iter()
            .map(|row| ReceivedMessage {
                message_id: row.id,
                receipt: Receipt(row.receipt),
                body: row.body,
                receive_count: u32::try_from(row.receive_count).unwrap_or_default(),
                enqueued_at: row.enqueued_at,
            })
            .collect();
        received.sort_by_key(|m| m.enqueued_at);
        Ok(received)
    }

    #[instrument(skip(self), fields(queue = %self.name, receipt = %receipt), err)]
    async fn delete(&self, receipt: &Receipt) -> Result<()> {
        sqlx::query("DELETE FROM queue_messages WHERE queue_name = $1 AND receipt = $2")
            .bind(&self.name)
            .bind(receipt.0)
            .execute(&self.pool)
            .await
            .map_err(self.queue_error())?;
        Ok(())
    }

    async fn depth(&self) -> Result<QueueDepth> {
        let (visible, in_flight): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE visible_at <= now()),
                COUNT(*) FILTER (WHERE visible_at > now())
            FROM queue_messages
            WHERE queue_name = $1
            "#,
        )
        .bind(&self.name)
        .fetch_one(&self.pool)
        .await
        .map_err(self.queue_error())?;
        Ok(QueueDepth {
            visible: visible as u64,
            in_flight: in_flight as u64,
        })
    }
}
