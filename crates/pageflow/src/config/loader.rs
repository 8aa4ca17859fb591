use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::schema::{Config, CONFIG_VERSION};
use crate::error::ConfigError;
use crate::models::Backend;

const SCHEMA_JSON: &str = include_str!("../../../../schema/config-v1.json");

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

/// Loads the config file if one is given, otherwise the defaults, then
/// applies `PAGEFLOW_*` environment overrides and re-validates.
pub fn load_effective_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };
    apply_env_overrides(&mut config, |var| std::env::var(var).ok())?;
    validate_config(&config)?;
    Ok(config)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != CONFIG_VERSION {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    if config.workers.count == 0 {
        return Err(ConfigError::Validation {
            message: "workers.count must be at least 1".to_string(),
        });
    }

    if config.monitor.interval_secs == 0 {
        return Err(ConfigError::Validation {
            message: "monitor.interval_secs must be at least 1".to_string(),
        });
    }

    if config.broker.max_deliveries == 0 {
        return Err(ConfigError::Validation {
            message: "broker.max_deliveries must be at least 1".to_string(),
        });
    }

    if config.broker.visibility_timeout_secs == 0 {
        return Err(ConfigError::Validation {
            message: "broker.visibility_timeout_secs must be at least 1".to_string(),
        });
    }

    if config.store_path() == config.broker_path() {
        return Err(ConfigError::Validation {
            message: format!(
                "store and broker must use different database files (both are {})",
                config.store_path().display()
            ),
        });
    }

    // A lease that expires mid-request hands the page to a second consumer.
    let uses_vision = config.models.values().any(|m| m.backend == Backend::Vision);
    let worst_case = config.extraction.vision.worst_case_duration();
    if uses_vision && Duration::from_secs(config.broker.visibility_timeout_secs) < worst_case {
        return Err(ConfigError::Validation {
            message: format!(
                "broker.visibility_timeout_secs ({}s) is shorter than the worst-case vision request ({:.1}s)",
                config.broker.visibility_timeout_secs,
                worst_case.as_secs_f64()
            ),
        });
    }

    if config.workers.consumer_group == config.aggregation.consumer_group {
        return Err(ConfigError::Validation {
            message: "workers and aggregation must use different consumer groups".to_string(),
        });
    }

    if config.models.is_empty() {
        return Err(ConfigError::Validation {
            message: "At least one model must be configured".to_string(),
        });
    }

    for (name, spec) in &config.models {
        if name.trim().is_empty() {
            return Err(ConfigError::InvalidModel {
                name: name.clone(),
                reason: "Model name must not be blank".to_string(),
            });
        }
        if spec.engine.trim().is_empty() {
            return Err(ConfigError::InvalidModel {
                name: name.clone(),
                reason: "Engine identifier must not be blank".to_string(),
            });
        }
    }

    Ok(())
}

/// Applies `PAGEFLOW_*` overrides read through `lookup`.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(dir) = lookup("PAGEFLOW_DATA_DIR") {
        config.data_dir = Some(PathBuf::from(dir));
    }
    if let Some(path) = lookup("PAGEFLOW_STORE_PATH") {
        config.store.path = Some(PathBuf::from(path));
    }
    if let Some(path) = lookup("PAGEFLOW_BROKER_PATH") {
        config.broker.path = Some(PathBuf::from(path));
    }
    if let Some(count) = lookup("PAGEFLOW_WORKER_COUNT") {
        config.workers.count = parse_env("PAGEFLOW_WORKER_COUNT", &count)?;
    }
    if let Some(secs) = lookup("PAGEFLOW_MONITOR_INTERVAL_SECS") {
        config.monitor.interval_secs = parse_env("PAGEFLOW_MONITOR_INTERVAL_SECS", &secs)?;
    }
    if let Some(url) = lookup("PAGEFLOW_VISION_BASE_URL") {
        config.extraction.vision.base_url = url;
    }
    Ok(())
}

fn parse_env<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var: var.to_string(),
        value: value.to_string(),
    })
}
