//! Process wiring.
//!
//! [`Service`] owns the store and broker handles and supervises every
//! background task: the page worker pool, the aggregator and the completion
//! monitor. Shutdown stops intake, lets in-flight handlers finish and joins
//! every thread before the handles are dropped.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::broker::{MessageBroker, SqliteBroker, Topic};
use crate::config::Config;
use crate::db::{migrations, Database};
use crate::error::Result;
use crate::extract::ExtractorRegistry;
use crate::models::{Backend, ModelRegistry};
use crate::pipeline::{Aggregator, CompletionMonitor, Dispatcher, MonitorScheduler, PageWorker};
use crate::summarize::{PageMergeSummarizer, Summarizer};
use crate::worker::{ConsumerPool, ConsumerSettings};

/// Opens the job store described by `config`, retrying per `config.connection`.
pub fn open_store(config: &Config) -> Result<Database> {
    let path = config.store_path();
    Ok(Database::open_with_retry(
        &path,
        migrations::STORE,
        &config.connection,
    )?)
}

/// Opens the broker described by `config` and makes sure both topics exist.
pub fn open_broker(config: &Config) -> Result<SqliteBroker> {
    let path = config.broker_path();
    let broker = SqliteBroker::open(&path, config.broker.settings(), &config.connection)?;
    broker.ensure_topics(&Topic::ALL)?;
    Ok(broker)
}

pub struct Service {
    store: Database,
    broker: Arc<SqliteBroker>,
    models: Arc<ModelRegistry>,
    backends: Vec<Backend>,
    page_workers: ConsumerPool,
    aggregators: ConsumerPool,
    scheduler: MonitorScheduler,
    monitor_thread: JoinHandle<()>,
    trigger_tx: broadcast::Sender<()>,
}

impl Service {
    /// Opens the store and broker from `config` and starts all stages with
    /// the configured extraction backends.
    pub fn start(config: &Config) -> Result<Self> {
        let store = open_store(config)?;
        let broker = open_broker(config)?;
        let extractors = ExtractorRegistry::from_config(&config.extraction)?;
        let summarizer = Arc::new(PageMergeSummarizer::new(
            config.aggregation.max_content_chars,
        ));
        Self::start_with(config, store, broker, extractors, summarizer)
    }

    /// Starts all stages on already opened handles.
    pub fn start_with(
        config: &Config,
        store: Database,
        broker: SqliteBroker,
        extractors: ExtractorRegistry,
        summarizer: Arc<dyn Summarizer>,
    ) -> Result<Self> {
        let _span = tracing::info_span!("service.start").entered();

        broker.ensure_topics(&Topic::ALL)?;
        let broker = Arc::new(broker);
        let dyn_broker: Arc<dyn MessageBroker> = broker.clone();
        let models = Arc::new(ModelRegistry::from_map(config.models.clone()));

        for (name, spec) in models.iter() {
            if !extractors.supports(spec.backend) {
                log::warn!(
                    "Model '{}' uses backend '{}', which is not available in this build",
                    name,
                    spec.backend
                );
            }
        }

        let backends = extractors.backends();
        let page_worker = PageWorker::new(
            store.clone(),
            Arc::clone(&dyn_broker),
            Arc::clone(&models),
            Arc::new(extractors),
        )
        .with_push_on_completion(config.monitor.push_on_page_completion);

        let page_workers = ConsumerPool::spawn(
            Arc::new(page_worker),
            Arc::clone(&dyn_broker),
            ConsumerSettings {
                group: config.workers.consumer_group.clone(),
                consumers: config.workers.count,
                poll_interval: config.broker.poll_interval(),
            },
        )?;

        let aggregators = match ConsumerPool::spawn(
            Arc::new(Aggregator::new(store.clone(), summarizer)),
            Arc::clone(&dyn_broker),
            ConsumerSettings {
                group: config.aggregation.consumer_group.clone(),
                consumers: 1,
                poll_interval: config.broker.poll_interval(),
            },
        ) {
            Ok(pool) => pool,
            Err(e) => {
                page_workers.wait();
                return Err(e.into());
            }
        };

        let monitor = CompletionMonitor::new(store.clone(), Arc::clone(&dyn_broker))
            .with_stale_after(config.monitor.stale_after_secs.map(Duration::from_secs))
            .with_compaction(Topic::PageProcessing, vec![config.workers.consumer_group.clone()])
            .with_compaction(
                Topic::AggregationTrigger,
                vec![config.aggregation.consumer_group.clone()],
            );
        let scheduler = MonitorScheduler::new(
            Arc::new(monitor),
            Duration::from_secs(config.monitor.interval_secs),
        );
        let (trigger_tx, trigger_rx) = broadcast::channel(16);
        let monitor_thread = scheduler.start(trigger_rx);

        log::info!(
            "Service started: {} page worker(s), monitor every {}s, {} model(s)",
            config.workers.count,
            config.monitor.interval_secs,
            models.len()
        );

        Ok(Self {
            store,
            broker,
            models,
            backends,
            page_workers,
            aggregators,
            scheduler,
            monitor_thread,
            trigger_tx,
        })
    }

    pub fn store(&self) -> &Database {
        &self.store
    }

    pub fn broker(&self) -> &SqliteBroker {
        &self.broker
    }

    pub fn models(&self) -> &ModelRegistry {
        &self.models
    }

    /// A dispatcher publishing to this service's broker. Models whose
    /// backend has no extractor here are rejected at submission.
    pub fn dispatcher(&self) -> Dispatcher {
        let broker: Arc<dyn MessageBroker> = self.broker.clone();
        Dispatcher::new(self.store.clone(), broker, Arc::clone(&self.models))
            .with_backends(self.backends.iter().copied())
    }

    /// Requests an immediate completion check.
    pub fn trigger_monitor(&self) {
        if self.trigger_tx.send(()).is_err() {
            log::debug!("Completion monitor is not listening for triggers");
        }
    }

    pub fn shutdown(self) {
        log::info!("Shutting down service...");

        self.page_workers.shutdown();
        self.aggregators.shutdown();
        self.page_workers.wait();
        self.aggregators.wait();

        self.scheduler.stop();
        // Wake the monitor so it sees the stop flag
        let _ = self.trigger_tx.send(());
        if self.monitor_thread.join().is_err() {
            log::error!("Completion monitor thread panicked");
        }

        log::info!("Service stopped");
    }
}
