//! Test harness for running the whole pipeline in-process.
//!
//! The `PipelineHarness` owns a temp directory holding the store and broker
//! databases and a running `Service` wired with stub collaborators.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use pageflow::config::Config;
use pageflow::extract::ExtractorRegistry;
use pageflow::job::FileType;
use pageflow::pipeline::{get_status, JobStatusView, Submission, SubmissionReceipt};
use pageflow::retry::RetryPolicy;
use pageflow::service::{open_broker, open_store, Service};
use pageflow::summarize::PageMergeSummarizer;
use pageflow::{Backend, DispatchError, EngineSpec, JobStatus};

use super::stubs::{pages, TextExtractor};

pub const MODEL: &str = "m1";

pub struct PipelineHarness {
    /// Kept alive for the databases inside it.
    _temp_dir: TempDir,
    pub config: Config,
    pub service: Option<Service>,
}

impl PipelineHarness {
    /// Starts a service with two page workers and a one-second monitor.
    pub fn start() -> Self {
        Self::start_with(|_| {})
    }

    /// Like [`start`](Self::start), with a hook to adjust the config first.
    pub fn start_with(adjust: impl FnOnce(&mut Config)) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let config = test_config(&temp_dir, adjust);

        let store = open_store(&config).expect("open store");
        let broker = open_broker(&config).expect("open broker");
        let extractors = ExtractorRegistry::new().with(Arc::new(TextExtractor));
        let service = Service::start_with(
            &config,
            store,
            broker,
            extractors,
            Arc::new(PageMergeSummarizer::default()),
        )
        .expect("start service");

        Self {
            _temp_dir: temp_dir,
            config,
            service: Some(service),
        }
    }

    pub fn service(&self) -> &Service {
        self.service.as_ref().expect("service already stopped")
    }

    pub fn submit(&self, texts: &[&str]) -> Result<SubmissionReceipt, DispatchError> {
        self.service().dispatcher().submit(Submission {
            pages: pages(texts),
            model: MODEL.to_string(),
            filename: "scan.pdf".to_string(),
            file_type: FileType::Pdf,
        })
    }

    pub fn status(&self, job_id: &str) -> JobStatusView {
        get_status(self.service().store(), job_id).expect("job status")
    }

    /// Polls until the job leaves `processing`, nudging the monitor along.
    pub fn wait_until_terminal(&self, job_id: &str) -> JobStatusView {
        let deadline = Instant::now() + Duration::from_secs(20);
        loop {
            let status = self.status(job_id);
            if status.status != JobStatus::Processing {
                return status;
            }
            assert!(
                Instant::now() < deadline,
                "job {} did not finish: {:?}",
                job_id,
                status
            );
            self.service().trigger_monitor();
            thread::sleep(Duration::from_millis(50));
        }
    }

    pub fn stop(&mut self) {
        if let Some(service) = self.service.take() {
            service.shutdown();
        }
    }
}

impl Drop for PipelineHarness {
    fn drop(&mut self) {
        self.stop();
    }
}

fn test_config(temp_dir: &TempDir, adjust: impl FnOnce(&mut Config)) -> Config {
    let mut config = Config::default();
    config.data_dir = Some(temp_dir.path().to_path_buf());
    config.connection = RetryPolicy::none();
    config.workers.count = 2;
    config.broker.poll_interval_ms = 10;
    config.broker.redelivery_delay_secs = 0;
    config.monitor.interval_secs = 1;

    let mut models = BTreeMap::new();
    models.insert(MODEL.to_string(), EngineSpec::new(Backend::Vision, "engine-1"));
    config.models = models;

    adjust(&mut config);
    config
}
