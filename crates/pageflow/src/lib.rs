pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod job;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod raster;
pub mod retry;
pub mod service;
pub mod summarize;
pub mod worker;

pub use broker::{MessageBroker, SqliteBroker, Topic};
pub use config::{load_config, load_effective_config, Config};
pub use db::Database;
pub use error::{
    ConfigError, DispatchError, ExtractionError, PageflowError, QueryError, RasterError, Result,
    SummarizeError, WorkerError,
};
pub use job::{FileType, JobStatus, PageStatus};
pub use models::{Backend, EngineSpec, ModelRegistry};
pub use pipeline::{get_result, get_status, Dispatcher, Submission, SubmissionReceipt};
pub use service::Service;
