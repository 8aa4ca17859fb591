//! Job creation and page fan-out.

use std::collections::BTreeSet;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;

use crate::broker::{publish_json, MessageBroker, PageTask, Topic};
use crate::db::job_repo::{self, NewJob};
use crate::db::Database;
use crate::error::DispatchError;
use crate::job::FileType;
use crate::models::{Backend, ModelRegistry};
use crate::raster::RasterizedDocument;

/// A document ready to be processed: one image per page, in page order.
#[derive(Debug, Clone)]
pub struct Submission {
    pub pages: Vec<Vec<u8>>,
    pub model: String,
    pub filename: String,
    pub file_type: FileType,
}

impl Submission {
    pub fn from_document(document: RasterizedDocument, model: impl Into<String>) -> Self {
        Self {
            pages: document.pages,
            model: model.into(),
            filename: document.filename,
            file_type: document.file_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmissionReceipt {
    pub job_id: String,
    pub total_pages: u32,
    /// Page tasks that reached the broker.
    pub published: u32,
    /// Page tasks that could not be published. The job stays `processing`
    /// and will not complete on its own when this is non-zero.
    pub failed: u32,
}

impl SubmissionReceipt {
    pub fn is_partial(&self) -> bool {
        self.failed > 0
    }
}

pub struct Dispatcher {
    store: Database,
    broker: Arc<dyn MessageBroker>,
    models: Arc<ModelRegistry>,
    /// When set, models served by any other backend are rejected.
    backends: Option<BTreeSet<Backend>>,
}

impl Dispatcher {
    pub fn new(store: Database, broker: Arc<dyn MessageBroker>, models: Arc<ModelRegistry>) -> Self {
        Self {
            store,
            broker,
            models,
            backends: None,
        }
    }

    /// Only accept models whose backend is one of `backends`.
    pub fn with_backends(mut self, backends: impl IntoIterator<Item = Backend>) -> Self {
        self.backends = Some(backends.into_iter().collect());
        self
    }

    fn check_model(&self, model: &str) -> Result<(), DispatchError> {
        let spec = self.models.resolve(model)?;
        let Some(backends) = &self.backends else {
            return Ok(());
        };
        if backends.contains(&spec.backend) {
            return Ok(());
        }
        let available = self
            .models
            .iter()
            .filter(|(_, spec)| backends.contains(&spec.backend))
            .map(|(name, _)| name)
            .collect::<Vec<_>>()
            .join(", ");
        Err(DispatchError::UnsupportedModel {
            model: model.to_string(),
            available,
        })
    }

    /// Creates the job record, then publishes one page task per page.
    ///
    /// Nothing is written when validation fails. Once the job exists, publish
    /// failures are logged and reported in the receipt but never roll the job
    /// back.
    pub fn submit(&self, submission: Submission) -> Result<SubmissionReceipt, DispatchError> {
        let _span = tracing::info_span!("dispatcher.submit", filename = %submission.filename)
            .entered();

        if submission.pages.is_empty() {
            return Err(DispatchError::InvalidInput(
                "document has no pages".to_string(),
            ));
        }
        if submission.filename.trim().is_empty() {
            return Err(DispatchError::InvalidInput(
                "filename must not be empty".to_string(),
            ));
        }
        let total_pages = u32::try_from(submission.pages.len()).map_err(|_| {
            DispatchError::InvalidInput(format!("too many pages: {}", submission.pages.len()))
        })?;
        self.check_model(&submission.model)?;

        let job_id = uuid::Uuid::new_v4().to_string();
        job_repo::insert(
            &self.store,
            &NewJob {
                job_id: job_id.clone(),
                filename: submission.filename.clone(),
                file_type: submission.file_type,
                total_pages,
                model: submission.model.clone(),
            },
        )?;

        log::info!(
            "Created job {} for {} ({} pages, model {})",
            job_id,
            submission.filename,
            total_pages,
            submission.model
        );

        let mut published = 0;
        let mut failed = 0;
        for (index, image) in submission.pages.iter().enumerate() {
            let task = PageTask {
                job_id: job_id.clone(),
                page_number: index as u32 + 1,
                image_data: STANDARD.encode(image),
                model: submission.model.clone(),
            };

            match publish_json(self.broker.as_ref(), Topic::PageProcessing, &task.key(), &task) {
                Ok(_) => published += 1,
                Err(e) => {
                    failed += 1;
                    log::error!(
                        "Failed to publish page {} of job {}: {}",
                        task.page_number,
                        job_id,
                        e
                    );
                }
            }
        }

        if failed > 0 {
            log::warn!(
                "Job {} dispatched partially: {}/{} page tasks published",
                job_id,
                published,
                total_pages
            );
        }

        Ok(SubmissionReceipt {
            job_id,
            total_pages,
            published,
            failed,
        })
    }
}
