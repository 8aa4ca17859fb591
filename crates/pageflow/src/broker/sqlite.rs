//! SQLite-backed broker.
//!
//! Messages are an append-only log per topic. Delivery state is tracked per
//! consumer group in `broker_deliveries`: a row appears when a group first
//! claims a message and carries the lease, the attempt count and the final
//! disposition (acked or dead-lettered). Times are epoch milliseconds.
//!
//! Messages every subscribed group has acked are removed by
//! [`MessageBroker::compact`]; dead letters stay until [`SqliteBroker::purge_all`].

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use rusqlite::{params, params_from_iter, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::{BrokerError, Delivery, MessageBroker, Topic};
use crate::db::{migrations, Database};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    /// How long a received message stays invisible to other consumers.
    pub visibility_timeout: Duration,
    /// Delay before a nacked message becomes visible again.
    pub redelivery_delay: Duration,
    /// Deliveries after which a message is dead-lettered instead of redelivered.
    pub max_deliveries: u32,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(600),
            redelivery_delay: Duration::from_secs(5),
            max_deliveries: 5,
        }
    }
}

/// A message a group gave up on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message_id: i64,
    pub key: String,
    pub attempts: u32,
    pub reason: Option<String>,
}

/// Rows removed by [`SqliteBroker::purge_all`], per table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BrokerPurgeCounts {
    pub deliveries: usize,
    pub messages: usize,
}

#[derive(Clone)]
pub struct SqliteBroker {
    db: Database,
    settings: BrokerSettings,
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

impl SqliteBroker {
    pub fn new(db: Database, settings: BrokerSettings) -> Self {
        Self { db, settings }
    }

    /// Opens the broker database at `path`, retrying per `policy`.
    pub fn open(
        path: &Path,
        settings: BrokerSettings,
        policy: &RetryPolicy,
    ) -> Result<Self, BrokerError> {
        let db = Database::open_with_retry(path, migrations::BROKER, policy)?;
        Ok(Self::new(db, settings))
    }

    pub fn open_in_memory(settings: BrokerSettings) -> Result<Self, BrokerError> {
        let db = Database::open_in_memory(migrations::BROKER)?;
        Ok(Self::new(db, settings))
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    /// Messages of `topic` that `group` has not yet acked or dead-lettered.
    pub fn pending_count(&self, topic: Topic, group: &str) -> Result<u64, BrokerError> {
        let count = self.db.with_conn(|conn| {
            let count: u64 = conn.query_row(
                "SELECT COUNT(*) FROM broker_messages m
                 LEFT JOIN broker_deliveries d ON d.message_id = m.id AND d.group_name = ?2
                 WHERE m.topic = ?1 AND d.acked_at IS NULL AND d.dead_lettered_at IS NULL",
                params![topic.as_str(), group],
                |r| r.get(0),
            )?;
            Ok(count)
        })?;
        Ok(count)
    }

    /// Messages of `topic` still in the log, settled or not.
    pub fn stored_count(&self, topic: Topic) -> Result<u64, BrokerError> {
        let count = self.db.with_conn(|conn| {
            let count: u64 = conn.query_row(
                "SELECT COUNT(*) FROM broker_messages WHERE topic = ?1",
                params![topic.as_str()],
                |r| r.get(0),
            )?;
            Ok(count)
        })?;
        Ok(count)
    }

    /// Dead-lettered messages of `topic` for `group`, oldest first.
    pub fn dead_letters(&self, topic: Topic, group: &str) -> Result<Vec<DeadLetter>, BrokerError> {
        let rows = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.message_key, d.attempts, d.last_error
                 FROM broker_deliveries d JOIN broker_messages m ON m.id = d.message_id
                 WHERE m.topic = ?1 AND d.group_name = ?2 AND d.dead_lettered_at IS NOT NULL
                 ORDER BY m.id ASC",
            )?;
            let rows = stmt
                .query_map(params![topic.as_str(), group], |r| {
                    Ok(DeadLetter {
                        message_id: r.get(0)?,
                        key: r.get(1)?,
                        attempts: r.get(2)?,
                        reason: r.get(3)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        Ok(rows)
    }

    /// Deletes every message and delivery record, dead letters included.
    /// Topics are kept.
    pub fn purge_all(&self) -> Result<BrokerPurgeCounts, BrokerError> {
        let counts = self.db.with_transaction(|tx| {
            let deliveries = tx.execute("DELETE FROM broker_deliveries", [])?;
            let messages = tx.execute("DELETE FROM broker_messages", [])?;
            Ok(BrokerPurgeCounts {
                deliveries,
                messages,
            })
        })?;
        log::warn!(
            "Purged broker: {} messages, {} delivery records",
            counts.messages,
            counts.deliveries
        );
        Ok(counts)
    }
}

impl MessageBroker for SqliteBroker {
    fn ensure_topics(&self, topics: &[Topic]) -> Result<(), BrokerError> {
        let now = now_millis();
        self.db.with_transaction(|tx| {
            for topic in topics {
                let created = tx.execute(
                    "INSERT OR IGNORE INTO broker_topics (name, created_at) VALUES (?1, ?2)",
                    params![topic.as_str(), now],
                )?;
                if created > 0 {
                    log::info!("Created topic '{}'", topic);
                }
            }
            Ok(())
        })?;
        Ok(())
    }

    fn publish(&self, topic: Topic, key: &str, payload: &str) -> Result<i64, BrokerError> {
        let now = now_millis();
        let id = self.db.with_conn(|conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM broker_topics WHERE name = ?1)",
                params![topic.as_str()],
                |r| r.get(0),
            )?;
            if !exists {
                return Ok(None);
            }
            conn.execute(
                "INSERT INTO broker_messages (topic, message_key, payload, published_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![topic.as_str(), key, payload, now],
            )?;
            Ok(Some(conn.last_insert_rowid()))
        })?;

        let id = id.ok_or(BrokerError::MissingTopic(topic))?;
        log::debug!("Published message {} to '{}' (key {})", id, topic, key);
        Ok(id)
    }

    fn receive(
        &self,
        topic: Topic,
        group: &str,
        consumer: &str,
    ) -> Result<Option<Delivery>, BrokerError> {
        let now = now_millis();
        let lease_until = now.saturating_add(millis(self.settings.visibility_timeout));
        let max = self.settings.max_deliveries.max(1);

        let claimed = self.db.with_transaction(|tx| {
            // Expired leases that used up their attempts are parked, not redelivered.
            let exhausted = tx.execute(
                "UPDATE broker_deliveries
                 SET dead_lettered_at = ?3,
                     last_error = 'delivery attempts exhausted: ' || COALESCE(last_error, 'lease expired')
                 WHERE group_name = ?2 AND acked_at IS NULL AND dead_lettered_at IS NULL
                   AND lease_expires_at <= ?3 AND attempts >= ?4
                   AND message_id IN (SELECT id FROM broker_messages WHERE topic = ?1)",
                params![topic.as_str(), group, now, max],
            )?;
            if exhausted > 0 {
                log::warn!(
                    "Dead-lettered {} message(s) on '{}' for group '{}' after {} deliveries",
                    exhausted,
                    topic,
                    group,
                    max
                );
            }

            let next = tx
                .query_row(
                    "SELECT m.id, m.message_key, m.payload, COALESCE(d.attempts, 0)
                     FROM broker_messages m
                     LEFT JOIN broker_deliveries d ON d.message_id = m.id AND d.group_name = ?2
                     WHERE m.topic = ?1
                       AND (d.message_id IS NULL
                            OR (d.acked_at IS NULL AND d.dead_lettered_at IS NULL
                                AND d.lease_expires_at <= ?3 AND d.attempts < ?4))
                     ORDER BY m.id ASC
                     LIMIT 1",
                    params![topic.as_str(), group, now, max],
                    |r| {
                        Ok((
                            r.get::<_, i64>(0)?,
                            r.get::<_, String>(1)?,
                            r.get::<_, String>(2)?,
                            r.get::<_, u32>(3)?,
                        ))
                    },
                )
                .optional()?;

            let Some((message_id, key, payload, previous_attempts)) = next else {
                return Ok(None);
            };

            tx.execute(
                "INSERT INTO broker_deliveries
                    (message_id, group_name, consumer, attempts, lease_expires_at)
                 VALUES (?1, ?2, ?3, 1, ?4)
                 ON CONFLICT(message_id, group_name) DO UPDATE SET
                    consumer = excluded.consumer,
                    attempts = broker_deliveries.attempts + 1,
                    lease_expires_at = excluded.lease_expires_at",
                params![message_id, group, consumer, lease_until],
            )?;

            Ok(Some(Delivery {
                message_id,
                topic,
                key,
                payload,
                group: group.to_string(),
                consumer: consumer.to_string(),
                attempt: previous_attempts + 1,
            }))
        })?;

        Ok(claimed)
    }

    fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let now = now_millis();
        let updated = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE broker_deliveries SET acked_at = ?3
                 WHERE message_id = ?1 AND group_name = ?2
                   AND acked_at IS NULL AND dead_lettered_at IS NULL",
                params![delivery.message_id, delivery.group, now],
            )?)
        })?;
        if updated == 0 {
            log::debug!(
                "Message {} already settled for group '{}'",
                delivery.message_id,
                delivery.group
            );
        }
        Ok(())
    }

    fn nack(&self, delivery: &Delivery, reason: &str) -> Result<(), BrokerError> {
        let visible_at = now_millis().saturating_add(millis(self.settings.redelivery_delay));
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE broker_deliveries SET lease_expires_at = ?4, last_error = ?5
                 WHERE message_id = ?1 AND group_name = ?2 AND consumer = ?3
                   AND acked_at IS NULL AND dead_lettered_at IS NULL",
                params![
                    delivery.message_id,
                    delivery.group,
                    delivery.consumer,
                    visible_at,
                    reason
                ],
            )?;
            Ok(())
        })?;
        log::debug!(
            "Message {} nacked by {} (attempt {}): {}",
            delivery.message_id,
            delivery.consumer,
            delivery.attempt,
            reason
        );
        Ok(())
    }

    fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), BrokerError> {
        let now = now_millis();
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE broker_deliveries SET dead_lettered_at = ?3, last_error = ?4
                 WHERE message_id = ?1 AND group_name = ?2
                   AND acked_at IS NULL AND dead_lettered_at IS NULL",
                params![delivery.message_id, delivery.group, now, reason],
            )?;
            Ok(())
        })?;
        log::warn!(
            "Dead-lettered message {} ({}) on '{}': {}",
            delivery.message_id,
            delivery.key,
            delivery.topic,
            reason
        );
        Ok(())
    }

    fn ping(&self) -> Result<(), BrokerError> {
        Ok(self.db.ping()?)
    }

    fn compact(&self, topic: Topic, groups: &[&str]) -> Result<usize, BrokerError> {
        let groups: BTreeSet<&str> = groups.iter().copied().collect();
        if groups.is_empty() {
            return Ok(0);
        }

        let placeholders = (0..groups.len())
            .map(|i| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        // A message goes once each listed group has an acked delivery and no
        // delivery of any group is still open or dead-lettered.
        let sql = format!(
            "DELETE FROM broker_messages
             WHERE topic = ?1 AND id IN (
                SELECT d.message_id FROM broker_deliveries d
                JOIN broker_messages m ON m.id = d.message_id
                WHERE m.topic = ?1
                GROUP BY d.message_id
                HAVING SUM(d.acked_at IS NULL) = 0
                   AND COUNT(DISTINCT CASE WHEN d.group_name IN ({}) THEN d.group_name END) = {}
             )",
            placeholders,
            groups.len()
        );

        let values: Vec<&str> = std::iter::once(topic.as_str()).chain(groups).collect();
        let deleted = self
            .db
            .with_conn(|conn| Ok(conn.execute(&sql, params_from_iter(values.iter()))?))?;
        if deleted > 0 {
            log::debug!("Compacted {} acked message(s) from '{}'", deleted, topic);
        }
        Ok(deleted)
    }
}
