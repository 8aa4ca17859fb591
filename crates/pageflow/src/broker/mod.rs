//! Durable message broker.
//!
//! Producers publish JSON payloads to a [`Topic`]. Consumers in a named group
//! receive each message at least once: a received message is leased to one
//! consumer and comes back if the lease expires or the consumer nacks it.
//! Messages that can never be processed are dead-lettered with a reason.

mod message;
mod sqlite;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::db::DatabaseError;

pub use message::{AggregationTrigger, PageTask, Topic};
pub use sqlite::{BrokerPurgeCounts, BrokerSettings, DeadLetter, SqliteBroker};

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Broker storage error: {0}")]
    Storage(#[from] DatabaseError),

    #[error("Topic '{0}' does not exist")]
    MissingTopic(Topic),

    #[error("Failed to encode message for topic '{topic}': {source}")]
    Encode {
        topic: Topic,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to decode message {message_id}: {source}")]
    Decode {
        message_id: i64,
        #[source]
        source: serde_json::Error,
    },
}

/// A message leased to one consumer of a group.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: i64,
    pub topic: Topic,
    pub key: String,
    pub payload: String,
    pub group: String,
    pub consumer: String,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt: u32,
}

impl Delivery {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, BrokerError> {
        serde_json::from_str(&self.payload).map_err(|source| BrokerError::Decode {
            message_id: self.message_id,
            source,
        })
    }
}

/// At-least-once topic broker shared by producers and consumer pools.
pub trait MessageBroker: Send + Sync {
    /// Creates any missing topics. Idempotent.
    fn ensure_topics(&self, topics: &[Topic]) -> Result<(), BrokerError>;

    /// Appends a message to a topic and returns its id.
    fn publish(&self, topic: Topic, key: &str, payload: &str) -> Result<i64, BrokerError>;

    /// Leases the next available message of `topic` for `group`, if any.
    fn receive(
        &self,
        topic: Topic,
        group: &str,
        consumer: &str,
    ) -> Result<Option<Delivery>, BrokerError>;

    /// Marks the delivery as processed for its group.
    fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Releases the delivery for redelivery after the configured delay.
    fn nack(&self, delivery: &Delivery, reason: &str) -> Result<(), BrokerError>;

    /// Parks the delivery permanently for its group.
    fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), BrokerError>;

    fn ping(&self) -> Result<(), BrokerError>;

    /// Deletes messages of `topic` that every one of `groups` has acked.
    /// Dead-lettered messages are kept. Returns how many were deleted.
    fn compact(&self, _topic: Topic, _groups: &[&str]) -> Result<usize, BrokerError> {
        Ok(0)
    }
}

/// Serializes `payload` as JSON and publishes it.
pub fn publish_json<T: Serialize>(
    broker: &dyn MessageBroker,
    topic: Topic,
    key: &str,
    payload: &T,
) -> Result<i64, BrokerError> {
    let body =
        serde_json::to_string(payload).map_err(|source| BrokerError::Encode { topic, source })?;
    broker.publish(topic, key, &body)
}
