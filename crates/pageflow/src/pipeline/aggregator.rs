//! Aggregation trigger consumer: merge a finished job's pages and complete it.

use std::sync::Arc;

use crate::broker::{AggregationTrigger, Delivery, Topic};
use crate::db::final_result_repo::{self, FinalResult};
use crate::db::job_repo;
use crate::db::page_result_repo::{self, PageResult};
use crate::db::{now_timestamp, Database, DatabaseError};
use crate::job::JobStatus;
use crate::summarize::Summarizer;
use crate::worker::{MessageHandler, Outcome};

enum Persisted {
    Completed,
    /// The job left `processing` between the checks and the transaction.
    NotProcessing,
}

pub struct Aggregator {
    store: Database,
    summarizer: Arc<dyn Summarizer>,
}

impl Aggregator {
    pub fn new(store: Database, summarizer: Arc<dyn Summarizer>) -> Self {
        Self { store, summarizer }
    }

    /// Writes the final result and completes the job atomically.
    fn persist(&self, result: &FinalResult) -> Result<Persisted, DatabaseError> {
        self.store.with_transaction(|tx| {
            if !job_repo::mark_completed_with_conn(tx, &result.job_id, &result.created_at)? {
                return Ok(Persisted::NotProcessing);
            }
            if !final_result_repo::insert_once_with_conn(tx, result)? {
                log::debug!("Final result for job {} already present", result.job_id);
            }
            Ok(Persisted::Completed)
        })
    }

    fn fail(&self, job_id: &str, message: &str) -> Outcome {
        log::error!("Aggregation failed for job {}: {}", job_id, message);
        match job_repo::mark_error(&self.store, job_id, message) {
            Ok(_) => Outcome::Ack,
            Err(e) => Outcome::Retry(format!(
                "Failed to record aggregation error for job {}: {}",
                job_id, e
            )),
        }
    }
}

impl MessageHandler for Aggregator {
    fn name(&self) -> &str {
        "aggregator"
    }

    fn topic(&self) -> Topic {
        Topic::AggregationTrigger
    }

    fn handle(&self, delivery: &Delivery) -> Outcome {
        let trigger: AggregationTrigger = match delivery.decode() {
            Ok(trigger) => trigger,
            Err(e) => return Outcome::Reject(format!("Malformed aggregation trigger: {}", e)),
        };
        let job_id = trigger.job_id.as_str();

        match final_result_repo::exists(&self.store, job_id) {
            Ok(true) => {
                log::debug!("Job {} already aggregated; ignoring trigger", job_id);
                return Outcome::Ack;
            }
            Ok(false) => {}
            Err(e) => return Outcome::Retry(format!("Failed to check job {}: {}", job_id, e)),
        }

        let job = match job_repo::find_by_id(&self.store, job_id) {
            Ok(Some(job)) => job,
            Ok(None) => return Outcome::Reject(format!("Unknown job {}", job_id)),
            Err(e) => return Outcome::Retry(format!("Failed to load job {}: {}", job_id, e)),
        };
        if job.status.is_terminal() {
            log::debug!("Job {} already {}; ignoring trigger", job_id, job.status);
            return Outcome::Ack;
        }

        let pages: Vec<PageResult> = match page_result_repo::list_for_job(&self.store, job_id) {
            Ok(rows) => rows.into_iter().map(|row| row.result).collect(),
            Err(e) => {
                return Outcome::Retry(format!("Failed to load pages of job {}: {}", job_id, e))
            }
        };
        if pages.len() != trigger.total_pages as usize {
            log::debug!(
                "Job {} has {}/{} pages; deferring aggregation",
                job_id,
                pages.len(),
                trigger.total_pages
            );
            return Outcome::Ack;
        }

        let summary = match self.summarizer.summarize(&pages, &trigger.model) {
            Ok(summary) => summary,
            Err(e) => return self.fail(job_id, &e.to_string()),
        };

        let result = FinalResult {
            job_id: job_id.to_string(),
            document_overview: summary.document_overview,
            markdown_content: summary.markdown_content,
            status: JobStatus::Completed,
            model: trigger.model.clone(),
            created_at: now_timestamp(),
        };

        match self.persist(&result) {
            Ok(Persisted::Completed) => {
                log::info!("Job {} completed ({} pages)", job_id, pages.len());
                Outcome::Ack
            }
            Ok(Persisted::NotProcessing) => {
                log::debug!("Job {} left processing during aggregation", job_id);
                Outcome::Ack
            }
            Err(e) => self.fail(job_id, &format!("Failed to store final result: {}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerSettings, MessageBroker, SqliteBroker};
    use crate::db::test_support::{insert_job, store};
    use crate::error::SummarizeError;
    use crate::job::PageStatus;
    use crate::summarize::{PageMergeSummarizer, Summary};

    struct FailingSummarizer;

    impl Summarizer for FailingSummarizer {
        fn summarize(&self, _: &[PageResult], _: &str) -> Result<Summary, SummarizeError> {
            Err(SummarizeError::Failed("model overloaded".to_string()))
        }
    }

    fn add_result(db: &Database, job_id: &str, page_number: u32, text: &str) {
        page_result_repo::upsert(
            db,
            &PageResult {
                job_id: job_id.to_string(),
                page_number,
                extracted_text: text.to_string(),
                confidence_score: 0.9,
                status: PageStatus::Completed,
                model: "m1".to_string(),
            },
        )
        .unwrap();
    }

    /// Publishes a trigger and takes it back off the broker as a delivery.
    fn trigger_delivery(job_id: &str, total_pages: u32) -> Delivery {
        let broker = SqliteBroker::open_in_memory(BrokerSettings::default()).unwrap();
        broker.ensure_topics(&Topic::ALL).unwrap();
        let payload = serde_json::to_string(&AggregationTrigger {
            job_id: job_id.to_string(),
            model: "m1".to_string(),
            total_pages,
        })
        .unwrap();
        broker
            .publish(Topic::AggregationTrigger, job_id, &payload)
            .unwrap();
        broker
            .receive(Topic::AggregationTrigger, "agg", "c")
            .unwrap()
            .unwrap()
    }

    fn aggregator(db: &Database) -> Aggregator {
        Aggregator::new(db.clone(), Arc::new(PageMergeSummarizer::default()))
    }

    #[test]
    fn test_completes_job_with_pages_in_order() {
        let db = store();
        insert_job(&db, "j", 3);
        add_result(&db, "j", 3, "third");
        add_result(&db, "j", 1, "first");
        add_result(&db, "j", 2, "second");

        let outcome = aggregator(&db).handle(&trigger_delivery("j", 3));
        assert_eq!(outcome, Outcome::Ack);

        let job = job_repo::find_by_id(&db, "j").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());

        let result = final_result_repo::find(&db, "j").unwrap().unwrap();
        assert_eq!(result.status, JobStatus::Completed);
        let first = result.markdown_content.find("first").unwrap();
        let second = result.markdown_content.find("second").unwrap();
        let third = result.markdown_content.find("third").unwrap();
        assert!(first < second && second < third);
    }

    #[test]
    fn test_duplicate_trigger_is_noop() {
        let db = store();
        insert_job(&db, "j", 1);
        add_result(&db, "j", 1, "only");

        let agg = aggregator(&db);
        assert_eq!(agg.handle(&trigger_delivery("j", 1)), Outcome::Ack);
        let first = final_result_repo::find(&db, "j").unwrap().unwrap();

        assert_eq!(agg.handle(&trigger_delivery("j", 1)), Outcome::Ack);
        let second = final_result_repo::find(&db, "j").unwrap().unwrap();
        assert_eq!(first, second);

        let rows: u32 = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM final_results", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_missing_pages_defer() {
        let db = store();
        insert_job(&db, "j", 3);
        add_result(&db, "j", 1, "a");
        add_result(&db, "j", 2, "b");

        assert_eq!(aggregator(&db).handle(&trigger_delivery("j", 3)), Outcome::Ack);

        let job = job_repo::find_by_id(&db, "j").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert!(final_result_repo::find(&db, "j").unwrap().is_none());
    }

    #[test]
    fn test_summarizer_failure_marks_error() {
        let db = store();
        insert_job(&db, "j", 1);
        add_result(&db, "j", 1, "a");

        let agg = Aggregator::new(db.clone(), Arc::new(FailingSummarizer));
        assert_eq!(agg.handle(&trigger_delivery("j", 1)), Outcome::Ack);

        let job = job_repo::find_by_id(&db, "j").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert!(job.error_message.unwrap().contains("model overloaded"));
        assert!(final_result_repo::find(&db, "j").unwrap().is_none());
    }

    fn reject_writes(db: &Database, trigger_sql: &str) {
        db.with_conn(|conn| Ok(conn.execute_batch(trigger_sql)?)).unwrap();
    }

    #[test]
    fn test_unrecordable_failure_is_retried() {
        let db = store();
        insert_job(&db, "j", 1);
        add_result(&db, "j", 1, "a");
        reject_writes(
            &db,
            "CREATE TRIGGER reject_job_updates BEFORE UPDATE ON jobs
             BEGIN SELECT RAISE(ABORT, 'database is read-only'); END;",
        );

        let agg = Aggregator::new(db.clone(), Arc::new(FailingSummarizer));
        match agg.handle(&trigger_delivery("j", 1)) {
            Outcome::Retry(reason) => {
                assert!(reason.contains("Failed to record aggregation error for job j"));
                assert!(reason.contains("database is read-only"));
            }
            other => panic!("expected retry, got {:?}", other),
        }

        let job = job_repo::find_by_id(&db, "j").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.error_message.is_none());
        assert!(final_result_repo::find(&db, "j").unwrap().is_none());
    }

    #[test]
    fn test_final_result_write_failure_marks_error() {
        let db = store();
        insert_job(&db, "j", 1);
        add_result(&db, "j", 1, "a");
        reject_writes(
            &db,
            "CREATE TRIGGER reject_final_results BEFORE INSERT ON final_results
             BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
        );

        assert_eq!(aggregator(&db).handle(&trigger_delivery("j", 1)), Outcome::Ack);

        // The completion in the same transaction was rolled back.
        let job = job_repo::find_by_id(&db, "j").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert!(job.completed_at.is_none());
        let message = job.error_message.unwrap();
        assert!(message.contains("Failed to store final result"));
        assert!(message.contains("disk full"));
    }

    #[test]
    fn test_terminal_job_is_left_alone() {
        let db = store();
        insert_job(&db, "j", 1);
        add_result(&db, "j", 1, "a");
        job_repo::mark_error(&db, "j", "earlier failure").unwrap();

        assert_eq!(aggregator(&db).handle(&trigger_delivery("j", 1)), Outcome::Ack);
        assert!(final_result_repo::find(&db, "j").unwrap().is_none());
        assert_eq!(
            job_repo::find_by_id(&db, "j").unwrap().unwrap().status,
            JobStatus::Error
        );
    }

    #[test]
    fn test_unknown_job_is_rejected() {
        let db = store();
        let outcome = aggregator(&db).handle(&trigger_delivery("ghost", 1));
        assert!(matches!(outcome, Outcome::Reject(_)));
    }
}
