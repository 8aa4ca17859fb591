use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};

use super::{MessageHandler, Outcome};
use crate::broker::{BrokerError, Delivery, MessageBroker};
use crate::error::WorkerError;

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub group: String,
    pub consumers: usize,
    /// Idle wait between polls when the topic is empty.
    pub poll_interval: Duration,
}

pub struct ConsumerPool {
    name: String,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    /// Never sent on; dropping it wakes idle consumers.
    wake_sender: Sender<()>,
}

impl ConsumerPool {
    pub fn spawn(
        handler: Arc<dyn MessageHandler>,
        broker: Arc<dyn MessageBroker>,
        settings: ConsumerSettings,
    ) -> Result<Self, WorkerError> {
        if settings.consumers == 0 {
            return Err(WorkerError::SpawnFailed(format!(
                "{}: consumer count must be > 0",
                handler.name()
            )));
        }

        let name = handler.name().to_string();
        let (wake_sender, wake_receiver) = bounded::<()>(0);
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(settings.consumers);

        for consumer_id in 0..settings.consumers {
            let consumer = Consumer {
                name: format!("{}-{}", name, consumer_id),
                handler: Arc::clone(&handler),
                broker: Arc::clone(&broker),
                group: settings.group.clone(),
                poll_interval: settings.poll_interval,
                shutdown: Arc::clone(&shutdown),
                wake: wake_receiver.clone(),
            };

            let spawned = thread::Builder::new()
                .name(consumer.name.clone())
                .spawn(move || consumer.run());

            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    shutdown.store(true, Ordering::Release);
                    drop(wake_sender);
                    for worker in workers {
                        let _ = worker.join();
                    }
                    return Err(WorkerError::SpawnFailed(format!("{}: {}", name, e)));
                }
            }
        }

        info!(
            "Started {} '{}' consumer(s) in group '{}'",
            settings.consumers, name, settings.group
        );

        Ok(Self {
            name,
            workers,
            shutdown,
            wake_sender,
        })
    }

    /// Stops taking new deliveries. In-flight handlers run to completion.
    pub fn shutdown(&self) {
        info!("Shutting down '{}' consumers...", self.name);
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn wait(self) {
        self.shutdown.store(true, Ordering::Release);
        // Drop sender to wake idle consumers
        drop(self.wake_sender);

        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Consumer {}-{} panicked: {:?}", self.name, i, e);
            } else {
                debug!("Consumer {}-{} finished", self.name, i);
            }
        }

        info!("All '{}' consumers have stopped", self.name);
    }
}

struct Consumer {
    name: String,
    handler: Arc<dyn MessageHandler>,
    broker: Arc<dyn MessageBroker>,
    group: String,
    poll_interval: Duration,
    shutdown: Arc<AtomicBool>,
    wake: Receiver<()>,
}

impl Consumer {
    fn run(self) {
        debug!("Consumer {} started", self.name);
        let topic = self.handler.topic();

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                debug!("Consumer {} received shutdown signal", self.name);
                break;
            }

            match self.broker.receive(topic, &self.group, &self.name) {
                Ok(Some(delivery)) => self.process(&delivery),
                Ok(None) => {
                    if !self.idle() {
                        break;
                    }
                }
                Err(BrokerError::Storage(e)) if e.is_busy() => {
                    debug!("Consumer {}: broker busy, backing off", self.name);
                    if !self.idle() {
                        break;
                    }
                }
                Err(e) => {
                    error!("Consumer {} failed to receive from '{}': {}", self.name, topic, e);
                    if !self.idle() {
                        break;
                    }
                }
            }
        }

        debug!("Consumer {} stopped", self.name);
    }

    /// Waits one poll interval. Returns false once the pool is closing.
    fn idle(&self) -> bool {
        match self.wake.recv_timeout(self.poll_interval) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => true,
            Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    fn process(&self, delivery: &Delivery) {
        let _span = tracing::info_span!(
            "consumer.handle",
            handler = %self.handler.name(),
            message_id = delivery.message_id,
            key = %delivery.key,
            attempt = delivery.attempt,
        )
        .entered();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.handler.handle(delivery)))
            .unwrap_or_else(|_| {
                error!(
                    "Handler '{}' panicked on message {}",
                    self.handler.name(),
                    delivery.message_id
                );
                Outcome::Retry("handler panicked".to_string())
            });

        let settled = match &outcome {
            Outcome::Ack => self.broker.ack(delivery),
            Outcome::Retry(reason) => {
                warn!(
                    "Message {} ({}) will be redelivered: {}",
                    delivery.message_id, delivery.key, reason
                );
                self.broker.nack(delivery, reason)
            }
            Outcome::Reject(reason) => self.broker.dead_letter(delivery, reason),
        };

        // The lease expires on its own if settling fails, so the message
        // comes back either way.
        if let Err(e) = settled {
            error!(
                "Consumer {} failed to settle message {} ({:?}): {}",
                self.name, delivery.message_id, outcome, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerSettings, SqliteBroker, Topic};
    use std::sync::Mutex;
    use std::time::Instant;

    const GROUP: &str = "test-group";

    /// Records payloads and answers with a scripted outcome per payload.
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl MessageHandler for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn topic(&self) -> Topic {
            Topic::PageProcessing
        }

        fn handle(&self, delivery: &Delivery) -> Outcome {
            self.seen.lock().unwrap().push(delivery.payload.clone());
            match delivery.payload.as_str() {
                "poison" => Outcome::Reject("cannot parse".to_string()),
                "flaky" if delivery.attempt == 1 => Outcome::Retry("try again".to_string()),
                "panic" if delivery.attempt == 1 => panic!("boom"),
                _ => Outcome::Ack,
            }
        }
    }

    fn broker() -> Arc<SqliteBroker> {
        let broker = SqliteBroker::open_in_memory(BrokerSettings {
            visibility_timeout: Duration::from_secs(60),
            redelivery_delay: Duration::ZERO,
            max_deliveries: 5,
        })
        .unwrap();
        broker.ensure_topics(&Topic::ALL).unwrap();
        Arc::new(broker)
    }

    fn settings(consumers: usize) -> ConsumerSettings {
        ConsumerSettings {
            group: GROUP.to_string(),
            consumers,
            poll_interval: Duration::from_millis(10),
        }
    }

    fn wait_until_drained(broker: &SqliteBroker) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while broker.pending_count(Topic::PageProcessing, GROUP).unwrap() > 0 {
            assert!(Instant::now() < deadline, "messages were not drained in time");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_pool_rejects_zero_consumers() {
        let handler = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let result = ConsumerPool::spawn(handler, broker(), settings(0));
        assert!(matches!(result, Err(WorkerError::SpawnFailed(_))));
    }

    #[test]
    fn test_pool_shutdown_without_messages() {
        let handler = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let pool = ConsumerPool::spawn(handler, broker(), settings(2)).unwrap();
        assert!(!pool.is_shutdown());
        pool.shutdown();
        assert!(pool.is_shutdown());
        pool.wait();
    }

    #[test]
    fn test_outcomes_are_applied() {
        let broker = broker();
        for payload in ["ok", "poison", "flaky", "panic"] {
            broker.publish(Topic::PageProcessing, payload, payload).unwrap();
        }

        let handler = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let pool = ConsumerPool::spawn(
            Arc::clone(&handler) as Arc<dyn MessageHandler>,
            Arc::clone(&broker) as Arc<dyn MessageBroker>,
            settings(2),
        )
        .unwrap();

        wait_until_drained(&broker);
        pool.shutdown();
        pool.wait();

        let seen = handler.seen.lock().unwrap();
        assert_eq!(seen.iter().filter(|p| *p == "ok").count(), 1);
        assert_eq!(seen.iter().filter(|p| *p == "flaky").count(), 2);
        assert_eq!(seen.iter().filter(|p| *p == "panic").count(), 2);

        let dead = broker.dead_letters(Topic::PageProcessing, GROUP).unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].key, "poison");
    }
}
