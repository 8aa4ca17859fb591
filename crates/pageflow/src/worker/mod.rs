//! Broker consumers.
//!
//! A [`ConsumerPool`] runs a fixed number of threads that pull deliveries for
//! one topic and consumer group and hand them to a [`MessageHandler`]. The
//! handler decides the fate of each delivery through its [`Outcome`].

mod pool;

pub use pool::{ConsumerPool, ConsumerSettings};

use crate::broker::{Delivery, Topic};

/// What to do with a delivery once the handler is done with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Processed (or deliberately ignored); never deliver again.
    Ack,
    /// Transient failure; deliver again after the redelivery delay.
    Retry(String),
    /// Can never succeed; park it as a dead letter.
    Reject(String),
}

pub trait MessageHandler: Send + Sync {
    /// Used in thread names and log lines.
    fn name(&self) -> &str;

    fn topic(&self) -> Topic;

    fn handle(&self, delivery: &Delivery) -> Outcome;
}
