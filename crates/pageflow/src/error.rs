use std::path::PathBuf;
use thiserror::Error;

use crate::broker::BrokerError;
use crate::db::DatabaseError;

#[derive(Error, Debug)]
pub enum PageflowError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    #[error("Rasterization error: {0}")]
    Raster(#[from] RasterError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },

    #[error("Invalid model '{name}': {reason}")]
    InvalidModel { name: String, reason: String },

    #[error("Invalid value '{value}' for environment variable {var}")]
    InvalidEnv { var: String, value: String },
}

/// Errors returned by a text extraction backend.
///
/// The page worker never propagates these; they become error-status page results.
#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("Failed to load image: {0}")]
    InvalidImage(String),

    #[error("No extractor available for backend '{0}'")]
    BackendUnavailable(String),

    #[error("Request to extraction service failed: {0}")]
    Request(String),

    #[error("No content generated. Reason: {0}")]
    NoContent(String),

    #[error("Generation finished unexpectedly. Reason: {0}")]
    UnexpectedFinish(String),

    #[error("OCR failed: {0}")]
    OcrFailed(String),
}

#[derive(Error, Debug)]
pub enum SummarizeError {
    #[error("Cannot summarize a document without pages")]
    NoPages,

    #[error("Summarization failed: {0}")]
    Failed(String),
}

#[derive(Error, Debug)]
pub enum RasterError {
    #[error("Unsupported document type: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to read document '{path}': {source}")]
    ReadDocument {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Received empty document: {0}")]
    EmptyDocument(PathBuf),

    #[error("Failed to process image: {0}")]
    ImageProcessing(String),

    #[error("Failed to process PDF: {0}")]
    PdfProcessing(String),
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Invalid submission: {0}")]
    InvalidInput(String),

    #[error("Unsupported model '{model}'. Available models: {available}")]
    UnsupportedModel { model: String, available: String },

    #[error("Failed to create job record: {0}")]
    Store(#[from] DatabaseError),
}

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Job {job_id} is not ready (status: {status})")]
    NotReady { job_id: String, status: String },

    #[error("Store error: {0}")]
    Store(#[from] DatabaseError),
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),
}

pub type Result<T> = std::result::Result<T, PageflowError>;
