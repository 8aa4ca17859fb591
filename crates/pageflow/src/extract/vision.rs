//! Extraction through a multimodal model behind an OpenAI-compatible
//! `/chat/completions` endpoint.
//!
//! Transport failures, 429 and 5xx responses are retried with exponential
//! backoff. A response without content, or one that stopped for any reason
//! other than `stop`, fails the page immediately.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;

use super::{Extraction, PageExtractor};
use crate::config::VisionConfig;
use crate::error::ExtractionError;
use crate::models::{Backend, EngineSpec};

/// Maximum length of a response body quoted in an error.
const MAX_ERROR_BODY_LENGTH: usize = 200;

pub struct VisionExtractor {
    client: Client,
    config: VisionConfig,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<ChoiceMessage>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Whether a failed attempt is worth repeating.
enum Failure {
    Transient(ExtractionError),
    Permanent(ExtractionError),
}

impl VisionExtractor {
    pub fn new(config: VisionConfig) -> Result<Self, ExtractionError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ExtractionError::Request(format!("Failed to create HTTP client: {}", e)))?;

        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty());
        if api_key.is_none() {
            log::warn!(
                "{} is not set; vision requests will be sent without credentials",
                config.api_key_env
            );
        }

        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }

    fn request_body(&self, image: &[u8], model: &str) -> serde_json::Value {
        let mime = image::guess_format(image)
            .map(|f| f.to_mime_type())
            .unwrap_or("image/png");
        let data_uri = format!("data:{};base64,{}", mime, STANDARD.encode(image));

        json!({
            "model": model,
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": self.config.prompt },
                    { "type": "image_url", "image_url": { "url": data_uri } }
                ]
            }]
        })
    }

    fn attempt(&self, body: &serde_json::Value) -> Result<String, Failure> {
        let mut request = self.client.post(self.endpoint()).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .map_err(|e| Failure::Transient(ExtractionError::Request(e.to_string())))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            let err = ExtractionError::Request(format!(
                "HTTP {}: {}",
                status,
                truncate(&text, MAX_ERROR_BODY_LENGTH)
            ));
            return Err(if is_retryable(status) {
                Failure::Transient(err)
            } else {
                Failure::Permanent(err)
            });
        }

        let completion: ChatCompletion = response.json().map_err(|e| {
            Failure::Permanent(ExtractionError::Request(format!(
                "Invalid completion response: {}",
                e
            )))
        })?;

        completion_text(completion).map_err(Failure::Permanent)
    }
}

impl PageExtractor for VisionExtractor {
    fn backend(&self) -> Backend {
        Backend::Vision
    }

    fn extract(&self, image: &[u8], engine: &EngineSpec) -> Result<Extraction, ExtractionError> {
        let _span = tracing::info_span!("extract.vision", model = %engine.engine).entered();

        if image.is_empty() {
            return Err(ExtractionError::InvalidImage("empty image".to_string()));
        }

        let body = self.request_body(image, &engine.engine);
        let attempts = self.config.retry.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.attempt(&body) {
                Ok(text) => return Ok(Extraction::new(text, self.config.assumed_confidence)),
                Err(Failure::Permanent(e)) => return Err(e),
                Err(Failure::Transient(e)) if attempt < attempts => {
                    let delay = self.config.retry.delay_for(attempt);
                    log::warn!(
                        "Vision request failed (attempt {}/{}): {}. Retrying in {:?}",
                        attempt,
                        attempts,
                        e,
                        delay
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(Failure::Transient(e)) => return Err(e),
            }
        }
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let cut: String = text.chars().take(max).collect();
        format!("{}... (truncated)", cut)
    } else {
        text.to_string()
    }
}

fn completion_text(completion: ChatCompletion) -> Result<String, ExtractionError> {
    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ExtractionError::NoContent("no choices returned".to_string()))?;

    let reason = choice
        .finish_reason
        .unwrap_or_else(|| "unspecified".to_string());
    let content = choice.message.and_then(|m| m.content);

    match content {
        Some(text) if reason == "stop" => Ok(text),
        Some(_) => Err(ExtractionError::UnexpectedFinish(reason)),
        None => Err(ExtractionError::NoContent(reason)),
    }
}
