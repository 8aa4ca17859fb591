//! Page task consumer: extract one page, record its outcome.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::broker::{publish_json, AggregationTrigger, Delivery, MessageBroker, PageTask, Topic};
use crate::db::job_repo::{self, JobRow};
use crate::db::page_result_repo::{self, PageResult};
use crate::db::Database;
use crate::extract::{Extraction, ExtractorRegistry};
use crate::job::PageStatus;
use crate::models::ModelRegistry;
use crate::worker::{MessageHandler, Outcome};

pub struct PageWorker {
    store: Database,
    broker: Arc<dyn MessageBroker>,
    models: Arc<ModelRegistry>,
    extractors: Arc<ExtractorRegistry>,
    push_on_completion: bool,
}

impl PageWorker {
    pub fn new(
        store: Database,
        broker: Arc<dyn MessageBroker>,
        models: Arc<ModelRegistry>,
        extractors: Arc<ExtractorRegistry>,
    ) -> Self {
        Self {
            store,
            broker,
            models,
            extractors,
            push_on_completion: false,
        }
    }

    /// Publish an aggregation trigger as soon as a job's last page lands.
    pub fn with_push_on_completion(mut self, enabled: bool) -> Self {
        self.push_on_completion = enabled;
        self
    }

    fn extract(&self, task: &PageTask) -> Result<Extraction, String> {
        let engine = self.models.resolve(&task.model).map_err(|e| e.to_string())?;
        let image = STANDARD
            .decode(task.image_data.trim())
            .map_err(|e| format!("Invalid image data: {}", e))?;
        self.extractors
            .extract(&image, engine)
            .map_err(|e| e.to_string())
    }

    fn publish_if_complete(&self, job: &JobRow) {
        let count = match page_result_repo::count_for_job(&self.store, &job.job_id) {
            Ok(count) => count,
            Err(e) => {
                log::warn!("Could not count results for job {}: {}", job.job_id, e);
                return;
            }
        };
        if count < job.total_pages {
            return;
        }

        let trigger = AggregationTrigger {
            job_id: job.job_id.clone(),
            model: job.model.clone(),
            total_pages: job.total_pages,
        };
        match publish_json(
            self.broker.as_ref(),
            Topic::AggregationTrigger,
            &job.job_id,
            &trigger,
        ) {
            Ok(_) => log::info!("Job {} complete; aggregation triggered", job.job_id),
            // The monitor publishes on its next tick.
            Err(e) => log::warn!("Failed to trigger aggregation for job {}: {}", job.job_id, e),
        }
    }
}

impl MessageHandler for PageWorker {
    fn name(&self) -> &str {
        "page-worker"
    }

    fn topic(&self) -> Topic {
        Topic::PageProcessing
    }

    fn handle(&self, delivery: &Delivery) -> Outcome {
        let task: PageTask = match delivery.decode() {
            Ok(task) => task,
            Err(e) => return Outcome::Reject(format!("Malformed page task: {}", e)),
        };

        let job = match job_repo::find_by_id(&self.store, &task.job_id) {
            Ok(Some(job)) => job,
            Ok(None) => return Outcome::Reject(format!("Unknown job {}", task.job_id)),
            Err(e) => return Outcome::Retry(format!("Failed to load job {}: {}", task.job_id, e)),
        };

        if task.page_number == 0 || task.page_number > job.total_pages {
            return Outcome::Reject(format!(
                "Page {} out of range for job {} ({} pages)",
                task.page_number, task.job_id, job.total_pages
            ));
        }

        if job.status.is_terminal() {
            log::debug!(
                "Skipping page {} of job {}: job already {}",
                task.page_number,
                task.job_id,
                job.status
            );
            return Outcome::Ack;
        }

        let result = match self.extract(&task) {
            Ok(extraction) => {
                log::info!(
                    "Extracted page {} of job {} ({} chars)",
                    task.page_number,
                    task.job_id,
                    extraction.text.chars().count()
                );
                PageResult {
                    job_id: task.job_id.clone(),
                    page_number: task.page_number,
                    extracted_text: extraction.text,
                    confidence_score: extraction.confidence,
                    status: PageStatus::Completed,
                    model: task.model.clone(),
                }
            }
            Err(reason) => {
                log::warn!(
                    "Extraction failed for page {} of job {}: {}",
                    task.page_number,
                    task.job_id,
                    reason
                );
                PageResult {
                    job_id: task.job_id.clone(),
                    page_number: task.page_number,
                    extracted_text: format!("Error: {}", reason),
                    confidence_score: 0.0,
                    status: PageStatus::Error,
                    model: task.model.clone(),
                }
            }
        };

        match page_result_repo::upsert(&self.store, &result) {
            Ok(true) => {}
            Ok(false) => {
                log::debug!(
                    "Discarding page {} of job {}: job left processing during extraction",
                    task.page_number,
                    task.job_id
                );
                return Outcome::Ack;
            }
            Err(e) => {
                return Outcome::Retry(format!(
                    "Failed to store page {} of job {}: {}",
                    task.page_number, task.job_id, e
                ))
            }
        }

        if self.push_on_completion {
            self.publish_if_complete(&job);
        }

        Outcome::Ack
    }
}
