//! Registry of logical model names.
//!
//! Submissions name a logical model ("gemini-2.5-flash"); the registry maps it
//! to the extraction backend that serves it and the engine identifier that
//! backend expects (a provider model id, a tesseract language, ...).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DispatchError;

/// Extraction backend family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Multimodal model behind an OpenAI-compatible chat completions API.
    Vision,
    /// Local Tesseract OCR.
    Tesseract,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Vision => "vision",
            Backend::Tesseract => "tesseract",
        }
    }

    /// Backends built into this binary.
    pub fn compiled() -> Vec<Backend> {
        #[allow(unused_mut)]
        let mut backends = vec![Backend::Vision];
        #[cfg(feature = "tesseract")]
        backends.push(Backend::Tesseract);
        backends
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vision" => Ok(Backend::Vision),
            "tesseract" => Ok(Backend::Tesseract),
            other => Err(format!("unknown backend '{}'", other)),
        }
    }
}

/// What a logical model name resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSpec {
    pub backend: Backend,
    pub engine: String,
}

impl EngineSpec {
    pub fn new(backend: Backend, engine: impl Into<String>) -> Self {
        Self {
            backend,
            engine: engine.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRegistry {
    models: BTreeMap<String, EngineSpec>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::from_map(default_models())
    }
}

/// Built-in models, used when the config does not list any.
pub fn default_models() -> BTreeMap<String, EngineSpec> {
    [
        (
            "gemini-2.5-flash",
            EngineSpec::new(Backend::Vision, "gemini-2.5-flash-preview-05-20"),
        ),
        (
            "gemini-2.0-flash-lite",
            EngineSpec::new(Backend::Vision, "gemini-2.0-flash-lite-001"),
        ),
        (
            "gemini-2.5-pro",
            EngineSpec::new(Backend::Vision, "gemini-2.5-pro-001"),
        ),
        ("tesseract", EngineSpec::new(Backend::Tesseract, "eng")),
    ]
    .into_iter()
    .map(|(name, spec)| (name.to_string(), spec))
    .collect()
}

impl ModelRegistry {
    pub fn from_map(models: BTreeMap<String, EngineSpec>) -> Self {
        Self { models }
    }

    /// Looks up a logical model name.
    pub fn resolve(&self, name: &str) -> Result<&EngineSpec, DispatchError> {
        self.models
            .get(name)
            .ok_or_else(|| DispatchError::UnsupportedModel {
                model: name.to_string(),
                available: self.names().join(", "),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    /// Logical names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.models.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &EngineSpec)> {
        self.models.iter().map(|(name, spec)| (name.as_str(), spec))
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
