use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::broker::BrokerSettings;
use crate::models::{self, EngineSpec};
use crate::retry::RetryPolicy;

pub const CONFIG_VERSION: &str = "1.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    /// Base directory for the store and broker databases when their paths
    /// are not set explicitly. Defaults to `~/.pageflow/data`.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    /// Startup retry policy for opening the store and the broker.
    #[serde(default)]
    pub connection: RetryPolicy,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default = "models::default_models")]
    pub models: BTreeMap<String, EngineSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION.to_string(),
            data_dir: None,
            store: StoreConfig::default(),
            broker: BrokerConfig::default(),
            workers: WorkersConfig::default(),
            monitor: MonitorConfig::default(),
            aggregation: AggregationConfig::default(),
            connection: RetryPolicy::default(),
            extraction: ExtractionConfig::default(),
            models: models::default_models(),
        }
    }
}

impl Config {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .or_else(crate::db::default_data_dir)
            .unwrap_or_else(|| PathBuf::from(".pageflow").join("data"))
    }

    pub fn store_path(&self) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(|| self.data_dir().join("store.db"))
    }

    pub fn broker_path(&self) -> PathBuf {
        self.broker
            .path
            .clone()
            .unwrap_or_else(|| self.data_dir().join("broker.db"))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    #[serde(default = "default_redelivery_delay_secs")]
    pub redelivery_delay_secs: u64,
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,
    /// How long an idle consumer waits before polling again.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_visibility_timeout_secs() -> u64 {
    600
}

fn default_redelivery_delay_secs() -> u64 {
    5
}

fn default_max_deliveries() -> u32 {
    5
}

fn default_poll_interval_ms() -> u64 {
    250
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            path: None,
            visibility_timeout_secs: default_visibility_timeout_secs(),
            redelivery_delay_secs: default_redelivery_delay_secs(),
            max_deliveries: default_max_deliveries(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl BrokerConfig {
    pub fn settings(&self) -> BrokerSettings {
        BrokerSettings {
            visibility_timeout: Duration::from_secs(self.visibility_timeout_secs),
            redelivery_delay: Duration::from_secs(self.redelivery_delay_secs),
            max_deliveries: self.max_deliveries,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    #[serde(default = "default_worker_count")]
    pub count: usize,
    #[serde(default = "default_worker_group")]
    pub consumer_group: String,
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

fn default_worker_group() -> String {
    "pageflow-page-workers".to_string()
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            consumer_group: default_worker_group(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_interval_secs")]
    pub interval_secs: u64,
    /// Page workers also publish an aggregation trigger as soon as the last
    /// page of a job lands, instead of waiting for the next monitor tick.
    #[serde(default)]
    pub push_on_page_completion: bool,
    /// Processing jobs untouched for this long are reported as stalled.
    #[serde(default)]
    pub stale_after_secs: Option<u64>,
}

fn default_monitor_interval_secs() -> u64 {
    5
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_monitor_interval_secs(),
            push_on_page_completion: false,
            stale_after_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    #[serde(default = "default_aggregation_group")]
    pub consumer_group: String,
    #[serde(default = "default_max_content_chars")]
    pub max_content_chars: usize,
}

fn default_aggregation_group() -> String {
    "pageflow-aggregators".to_string()
}

fn default_max_content_chars() -> usize {
    50_000
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            consumer_group: default_aggregation_group(),
            max_content_chars: default_max_content_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    #[serde(default)]
    pub vision: VisionConfig,
    #[serde(default)]
    pub tesseract: TesseractConfig,
    /// Resolution used when rendering PDF pages.
    #[serde(default = "default_dpi")]
    pub dpi: u32,
}

fn default_dpi() -> u32 {
    300
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            vision: VisionConfig::default(),
            tesseract: TesseractConfig::default(),
            dpi: default_dpi(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionConfig {
    /// Base URL of an OpenAI-compatible API; `/chat/completions` is appended.
    #[serde(default = "default_vision_base_url")]
    pub base_url: String,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_prompt")]
    pub prompt: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
    /// Confidence recorded for successful pages; vision models report none.
    #[serde(default = "default_assumed_confidence")]
    pub assumed_confidence: f64,
    #[serde(default = "default_vision_retry")]
    pub retry: RetryPolicy,
}

fn default_vision_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta/openai".to_string()
}

fn default_api_key_env() -> String {
    "GEMINI_API_KEY".to_string()
}

fn default_prompt() -> String {
    "Extract all text from this image. Provide only the extracted text.".to_string()
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_assumed_confidence() -> f64 {
    0.95
}

fn default_vision_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_delay_ms: 500,
        max_delay_ms: 8_000,
    }
}

impl VisionConfig {
    /// Longest a single page extraction can take: every attempt timing out,
    /// plus the backoff between attempts.
    pub fn worst_case_duration(&self) -> Duration {
        let attempts = self.retry.max_attempts.max(1);
        let requests = Duration::from_secs(self.timeout_secs).saturating_mul(attempts);
        (1..attempts).fold(requests, |total, retry| {
            total.saturating_add(self.retry.delay_for(retry))
        })
    }
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            base_url: default_vision_base_url(),
            api_key_env: default_api_key_env(),
            prompt: default_prompt(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_request_timeout_secs(),
            assumed_confidence: default_assumed_confidence(),
            retry: default_vision_retry(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TesseractConfig {
    /// Directory containing `*.traineddata`; the system default when unset.
    #[serde(default)]
    pub data_path: Option<String>,
}
