//! Completion detection.
//!
//! Each tick recomputes `processed_pages` for every processing job from its
//! page results and publishes an aggregation trigger for every job whose
//! pages are all in. Triggers are not deduplicated across ticks; the
//! aggregator absorbs repeats. When subscriptions are configured, each tick
//! also compacts messages their consumer groups have acked.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::broker::{publish_json, AggregationTrigger, MessageBroker, Topic};
use crate::db::job_repo::{self, JobRow};
use crate::db::{page_result_repo, Database, DatabaseError};
use crate::job::JobStatus;

/// What a single tick saw and did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub jobs_scanned: usize,
    /// Jobs whose `processed_pages` moved forward.
    pub jobs_progressed: usize,
    pub triggers_published: usize,
    /// Incomplete jobs without progress for longer than the staleness threshold.
    pub stalled: usize,
    /// Jobs skipped because the store or broker failed for them.
    pub failures: usize,
    /// Acked messages removed from the broker.
    pub messages_compacted: usize,
}

pub struct CompletionMonitor {
    store: Database,
    broker: Arc<dyn MessageBroker>,
    stale_after: Option<Duration>,
    /// Consumer groups reading each topic.
    subscriptions: Vec<(Topic, Vec<String>)>,
}

impl CompletionMonitor {
    pub fn new(store: Database, broker: Arc<dyn MessageBroker>) -> Self {
        Self {
            store,
            broker,
            stale_after: None,
            subscriptions: Vec::new(),
        }
    }

    pub fn with_stale_after(mut self, stale_after: Option<Duration>) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Compact `topic` on every tick once all of `groups` have acked.
    pub fn with_compaction(mut self, topic: Topic, groups: Vec<String>) -> Self {
        self.subscriptions.push((topic, groups));
        self
    }

    fn compact(&self) -> usize {
        let mut deleted = 0;
        for (topic, groups) in &self.subscriptions {
            let groups: Vec<&str> = groups.iter().map(String::as_str).collect();
            match self.broker.compact(*topic, &groups) {
                Ok(n) => deleted += n,
                Err(e) => log::warn!("Failed to compact '{}': {}", topic, e),
            }
        }
        deleted
    }

    pub fn tick(&self) -> Result<TickReport, DatabaseError> {
        let _span = tracing::info_span!("monitor.tick").entered();

        let jobs = job_repo::list_by_status(&self.store, JobStatus::Processing)?;
        let mut report = TickReport {
            jobs_scanned: jobs.len(),
            ..TickReport::default()
        };
        let now = Utc::now();

        for job in &jobs {
            if let Err(e) = self.check_job(job, now, &mut report) {
                report.failures += 1;
                log::warn!("Completion check failed for job {}: {}", job.job_id, e);
            }
        }

        report.messages_compacted = self.compact();

        if report.triggers_published > 0 || report.stalled > 0 || report.failures > 0 {
            log::info!(
                "Monitor tick: {} processing, {} triggered, {} stalled, {} failed",
                report.jobs_scanned,
                report.triggers_published,
                report.stalled,
                report.failures
            );
        }

        Ok(report)
    }

    fn check_job(
        &self,
        job: &JobRow,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), String> {
        let count = page_result_repo::count_for_job(&self.store, &job.job_id)
            .map_err(|e| e.to_string())?;

        if job_repo::update_processed_pages(&self.store, &job.job_id, count)
            .map_err(|e| e.to_string())?
        {
            report.jobs_progressed += 1;
            log::debug!(
                "Job {}: {}/{} pages processed",
                job.job_id,
                count.min(job.total_pages),
                job.total_pages
            );
        }

        let processed = job.processed_pages.max(count.min(job.total_pages));
        if processed >= job.total_pages {
            let trigger = AggregationTrigger {
                job_id: job.job_id.clone(),
                model: job.model.clone(),
                total_pages: job.total_pages,
            };
            publish_json(
                self.broker.as_ref(),
                Topic::AggregationTrigger,
                &job.job_id,
                &trigger,
            )
            .map_err(|e| e.to_string())?;
            report.triggers_published += 1;
            log::info!("Job {} complete; aggregation triggered", job.job_id);
        } else if self.is_stale(job, now) {
            report.stalled += 1;
            log::warn!(
                "Job {} appears stalled at {}/{} pages (last progress {})",
                job.job_id,
                processed,
                job.total_pages,
                job.updated_at
            );
        }

        Ok(())
    }

    fn is_stale(&self, job: &JobRow, now: DateTime<Utc>) -> bool {
        let Some(threshold) = self.stale_after else {
            return false;
        };
        let Ok(updated_at) = DateTime::parse_from_rfc3339(&job.updated_at) else {
            return false;
        };
        let idle = now.signed_duration_since(updated_at.with_timezone(&Utc));
        idle.to_std().map(|idle| idle >= threshold).unwrap_or(false)
    }
}

/// Runs [`CompletionMonitor::tick`] on an interval, or on demand through
/// the trigger channel.
pub struct MonitorScheduler {
    monitor: Arc<CompletionMonitor>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
}

impl MonitorScheduler {
    pub fn new(monitor: Arc<CompletionMonitor>, interval: Duration) -> Self {
        Self {
            monitor,
            interval,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the monitor loop in a background thread. The first tick runs
    /// immediately so jobs left over from a previous run are picked up.
    pub fn start(&self, mut trigger_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let monitor = Arc::clone(&self.monitor);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.interval;

        std::thread::spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    log::error!("Failed to start completion monitor runtime: {}", e);
                    return;
                }
            };

            rt.block_on(async {
                let mut interval_timer = tokio::time::interval(interval);
                interval_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

                loop {
                    if shutdown.load(Ordering::Acquire) {
                        break;
                    }

                    tokio::select! {
                        _ = interval_timer.tick() => {},
                        Ok(()) = trigger_rx.recv() => {
                            log::info!("Manual completion check triggered");
                        },
                    }

                    if shutdown.load(Ordering::Acquire) {
                        break;
                    }

                    if let Err(e) = monitor.tick() {
                        log::error!("Completion monitor tick failed: {}", e);
                    }
                }
            });

            log::debug!("Completion monitor stopped");
        })
    }

    /// Signals the scheduler to stop.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerSettings, SqliteBroker};
    use crate::db::page_result_repo::PageResult;
    use crate::db::test_support::{insert_job, store};
    use crate::job::PageStatus;

    fn setup() -> (Database, Arc<SqliteBroker>, CompletionMonitor) {
        let db = store();
        let broker = Arc::new(SqliteBroker::open_in_memory(BrokerSettings::default()).unwrap());
        broker.ensure_topics(&Topic::ALL).unwrap();
        let monitor = CompletionMonitor::new(db.clone(), broker.clone());
        (db, broker, monitor)
    }

    fn add_result(db: &Database, job_id: &str, page_number: u32) {
        page_result_repo::upsert(
            db,
            &PageResult {
                job_id: job_id.to_string(),
                page_number,
                extracted_text: format!("page {}", page_number),
                confidence_score: 0.9,
                status: PageStatus::Completed,
                model: "m1".to_string(),
            },
        )
        .unwrap();
    }

    fn drain_triggers(broker: &SqliteBroker) -> Vec<AggregationTrigger> {
        let mut out = Vec::new();
        while let Some(d) = broker.receive(Topic::AggregationTrigger, "agg", "c").unwrap() {
            out.push(d.decode().unwrap());
            broker.ack(&d).unwrap();
        }
        out
    }

    #[test]
    fn test_tick_updates_processed_pages() {
        let (db, broker, monitor) = setup();
        insert_job(&db, "j", 3);
        add_result(&db, "j", 3);
        add_result(&db, "j", 1);

        let report = monitor.tick().unwrap();
        assert_eq!(report.jobs_scanned, 1);
        assert_eq!(report.jobs_progressed, 1);
        assert_eq!(report.triggers_published, 0);

        let job = job_repo::find_by_id(&db, "j").unwrap().unwrap();
        assert_eq!(job.processed_pages, 2);
        assert_eq!(job.status, JobStatus::Processing);
        assert!(drain_triggers(&broker).is_empty());
    }

    #[test]
    fn test_complete_job_is_triggered_every_tick() {
        let (db, broker, monitor) = setup();
        insert_job(&db, "j", 2);
        add_result(&db, "j", 1);
        add_result(&db, "j", 2);

        assert_eq!(monitor.tick().unwrap().triggers_published, 1);
        assert_eq!(monitor.tick().unwrap().triggers_published, 1);

        let triggers = drain_triggers(&broker);
        assert_eq!(triggers.len(), 2);
        assert_eq!(
            triggers[0],
            AggregationTrigger {
                job_id: "j".to_string(),
                model: "m1".to_string(),
                total_pages: 2,
            }
        );

        // The monitor never completes jobs itself.
        let job = job_repo::find_by_id(&db, "j").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.processed_pages, 2);
    }

    #[test]
    fn test_four_of_five_never_triggers() {
        let (db, broker, monitor) = setup();
        insert_job(&db, "j", 5);
        for page in 1..=4 {
            add_result(&db, "j", page);
        }

        for _ in 0..3 {
            monitor.tick().unwrap();
        }
        assert!(drain_triggers(&broker).is_empty());
        let job = job_repo::find_by_id(&db, "j").unwrap().unwrap();
        assert_eq!(job.processed_pages, 4);
        assert_eq!(job.status, JobStatus::Processing);
    }

    #[test]
    fn test_terminal_jobs_are_ignored() {
        let (db, broker, monitor) = setup();
        insert_job(&db, "j", 1);
        add_result(&db, "j", 1);
        job_repo::mark_error(&db, "j", "boom").unwrap();

        let report = monitor.tick().unwrap();
        assert_eq!(report.jobs_scanned, 0);
        assert!(drain_triggers(&broker).is_empty());
    }

    #[test]
    fn test_tick_compacts_acked_messages() {
        let (db, broker, monitor) = setup();
        let monitor = monitor
            .with_compaction(Topic::PageProcessing, vec!["workers".to_string()])
            .with_compaction(Topic::AggregationTrigger, vec!["agg".to_string()]);
        insert_job(&db, "j", 1);
        add_result(&db, "j", 1);

        broker.publish(Topic::PageProcessing, "j:1", "{}").unwrap();
        let d = broker.receive(Topic::PageProcessing, "workers", "w").unwrap().unwrap();
        broker.ack(&d).unwrap();
        broker.publish(Topic::PageProcessing, "j:2", "{}").unwrap();

        // Unconsumed messages, the fresh trigger included, are kept.
        let report = monitor.tick().unwrap();
        assert_eq!(report.triggers_published, 1);
        assert_eq!(report.messages_compacted, 1);
        assert_eq!(broker.pending_count(Topic::PageProcessing, "workers").unwrap(), 1);

        assert_eq!(drain_triggers(&broker).len(), 1);
        assert_eq!(monitor.tick().unwrap().messages_compacted, 1);
    }

    #[test]
    fn test_stalled_jobs_are_reported() {
        let (db, _broker, monitor) = setup();
        let monitor = monitor.with_stale_after(Some(Duration::from_secs(60)));
        insert_job(&db, "old", 2);
        insert_job(&db, "fresh", 2);
        db.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET updated_at = '2020-01-01T00:00:00+00:00' WHERE job_id = 'old'",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        let report = monitor.tick().unwrap();
        assert_eq!(report.stalled, 1);
        // Detection only.
        assert_eq!(
            job_repo::find_by_id(&db, "old").unwrap().unwrap().status,
            JobStatus::Processing
        );
    }

    #[test]
    fn test_scheduler_ticks_and_stops() {
        let (db, broker, monitor) = setup();
        insert_job(&db, "j", 1);
        add_result(&db, "j", 1);

        let scheduler = MonitorScheduler::new(Arc::new(monitor), Duration::from_secs(3600));
        let (trigger_tx, trigger_rx) = broadcast::channel(16);
        let handle = scheduler.start(trigger_rx);

        // Immediate first tick publishes the trigger.
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while broker.pending_count(Topic::AggregationTrigger, "agg").unwrap() == 0 {
            assert!(std::time::Instant::now() < deadline, "monitor never ticked");
            std::thread::sleep(Duration::from_millis(10));
        }

        scheduler.stop();
        // Send a trigger to wake up the select loop so it sees the shutdown
        let _ = trigger_tx.send(());
        handle.join().expect("monitor thread panicked");
    }
}
