//! Configuration Loader
//!
//! Environment-aware loading. Sources are layered lowest to highest:
//! built-in defaults, `config/eventflow.toml`, `config/eventflow.{env}.toml`
//! and finally `EVENTFLOW__SECTION__KEY` environment variables.

use config::{Config, Environment, File, FileFormat};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::EventflowConfig;
use crate::error::Result;

const ENV_PREFIX: &str = "EVENTFLOW";
const ENV_SEPARATOR: &str = "__";
const BASE_FILE_STEM: &str = "eventflow";

pub struct ConfigManager {
    config: EventflowConfig,
    environment: String,
    config_directory: PathBuf,
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigManager")
            .field("environment", &self.environment)
            .field("config_directory", &self.config_directory)
            .field("config", &self.debug_config())
            .finish()
    }
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> Result<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    pub fn load_from_directory(config_dir: Option<PathBuf>) -> Result<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load with an explicit environment name. Environment variables from
    /// the process still apply.
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> Result<Arc<ConfigManager>> {
        Self::build(config_dir, environment, None)
    }

    /// Load with an explicit environment name and an explicit set of
    /// `EVENTFLOW__*` variables in place of the process environment.
    pub fn load_with_overrides(
        config_dir: Option<PathBuf>,
        environment: &str,
        overrides: HashMap<String, String>,
    ) -> Result<Arc<ConfigManager>> {
        Self::build(config_dir, environment, Some(overrides))
    }

    fn build(
        config_dir: Option<PathBuf>,
        environment: &str,
        overrides: Option<HashMap<String, String>>,
    ) -> Result<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(Self::default_config_directory);
        let environment = environment.to_lowercase();

        debug!(
            "Loading configuration for environment '{}' from directory: {}",
            environment,
            config_directory.display()
        );

        let mut config = Self::load_and_merge_config(&config_directory, &environment, overrides)?;
        config.clamp();
        config.validate()?;

        let manager = ConfigManager {
            config,
            environment,
            config_directory,
        };

        debug!(
            "Configuration loaded successfully: {}",
            serde_json::to_string_pretty(&manager.debug_config())
                .unwrap_or_else(|_| "[serialization error]".to_string())
        );
        info!(
            environment = %manager.environment,
            concurrent_handlers = manager.config.queue.concurrent_handlers,
            namespace = %manager.config.substrate.default_namespace,
            "⚙️ Configuration loaded"
        );

        Ok(Arc::new(manager))
    }

    /// Builds a manager around an already assembled configuration.
    pub fn from_config(mut config: EventflowConfig, environment: &str) -> Result<Arc<ConfigManager>> {
        config.clamp();
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_lowercase(),
            config_directory: Self::default_config_directory(),
        }))
    }

    pub fn config(&self) -> &EventflowConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    /// Configuration as JSON with secrets masked, safe to log.
    pub fn debug_config(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(&self.config).unwrap_or(serde_json::Value::Null);
        let sensitive_patterns = ["password", "secret", "key", "token", "credential", "auth"];
        sanitize_json_recursive(&mut value, &sensitive_patterns);
        mask_url_credentials(&mut value);
        value
    }

    /// EVENTFLOW_ENV, then APP_ENV, then "development".
    pub fn detect_environment() -> String {
        env::var("EVENTFLOW_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
            .to_lowercase()
    }

    fn default_config_directory() -> PathBuf {
        env::var("EVENTFLOW_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config"))
    }

    fn load_and_merge_config(
        config_directory: &Path,
        environment: &str,
        overrides: Option<HashMap<String, String>>,
    ) -> Result<EventflowConfig> {
        let base = config_directory.join(format!("{BASE_FILE_STEM}.toml"));
        let env_file = config_directory.join(format!("{BASE_FILE_STEM}.{environment}.toml"));

        let environment_source = Environment::with_prefix(ENV_PREFIX)
            .prefix_separator(ENV_SEPARATOR)
            .separator(ENV_SEPARATOR)
            .try_parsing(true)
            .source(overrides);

        let config = Config::builder()
            .add_source(Config::try_from(&EventflowConfig::default())?)
            .add_source(File::from(base).format(FileFormat::Toml).required(false))
            .add_source(File::from(env_file).format(FileFormat::Toml).required(false))
            .add_source(environment_source)
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

/// Recursively mask values whose field name looks sensitive.
fn sanitize_json_recursive(value: &mut serde_json::Value, sensitive_patterns: &[&str]) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, val) in map.iter_mut() {
                let key_lower = key.to_lowercase();
                let is_sensitive = sensitive_patterns
                    .iter()
                    .any(|pattern| key_lower.contains(pattern));

                if is_sensitive {
                    *val = mask_value(val);
                } else {
                    sanitize_json_recursive(val, sensitive_patterns);
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items.iter_mut() {
                sanitize_json_recursive(item, sensitive_patterns);
            }
        }
        _ => {}
    }
}

fn mask_value(value: &serde_json::Value) -> serde_json::Value {
    let masked = match value {
        serde_json::Value::String(s) if s.is_empty() => "[EMPTY]".to_string(),
        serde_json::Value::String(s) => {
            let chars: Vec<char> = s.chars().collect();
            if chars.len() > 4 {
                let head: String = chars[..2].iter().collect();
                let tail: String = chars[chars.len() - 2..].iter().collect();
                format!("[MASKED: {head}***{tail}]")
            } else {
                "[MASKED: ***]".to_string()
            }
        }
        serde_json::Value::Number(n) => format!("[MASKED: {n}]"),
        _ => "[MASKED]".to_string(),
    };
    serde_json::Value::String(masked)
}

/// Connection URLs carry passwords under a non-sensitive key name.
fn mask_url_credentials(value: &mut serde_json::Value) {
    for section in ["database", "redis"] {
        if let Some(serde_json::Value::String(url)) = value.pointer_mut(&format!("/{section}/url")) {
            *url = redact_url_password(url);
        }
    }
}

fn redact_url_password(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let Some((userinfo, host)) = rest.rsplit_once('@') else {
        return url.to_string();
    };
    match userinfo.split_once(':') {
        Some((user, _)) => format!("{scheme}://{user}:***@{host}"),
        None => url.to_string(),
    }
}
