//! Runtime configuration loader.

use relay_queue::{ConsumerOptions, RetryPolicy};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const ENV_NAMESPACE_API_KEY: &str = "RELAY_NAMESPACE_API_KEY";
pub const ENV_AMQP_URL: &str = "RELAY_AMQP_URL";
pub const ENV_RUNTIME_ENDPOINT: &str = "RELAY_RUNTIME_ENDPOINT";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Config file is empty")]
    Empty,

    #[error("Invalid YAML: {0}")]
    Invalid(String),

    #[error("Config missing required field: {0}")]
    MissingField(&'static str),

    #[error("Config field {0} must be greater than zero")]
    Zero(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AmqpConfig {
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Defaults to `runtime_endpoint` when unset.
    pub url: Option<String>,
    pub reconnection: bool,
    pub reconnection_attempts: u32,
    pub reconnection_delay_secs: u64,
    pub reconnection_delay_max_secs: u64,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            url: None,
            reconnection: true,
            reconnection_attempts: 10,
            reconnection_delay_secs: 1,
            reconnection_delay_max_secs: 5,
        }
    }
}

/// Runtime configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RuntimeConfig {
    pub namespace: String,
    #[serde(default)]
    pub namespace_api_key: String,
    #[serde(default)]
    pub runtime_endpoint: String,
    #[serde(default = "default_workers")]
    pub max_concurrent_workers: usize,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_client_response_timeout")]
    pub client_response_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_amqp")]
    pub amqp: AmqpConfig,
    #[serde(default)]
    pub socket: SocketConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub debug: bool,
}

fn default_workers() -> usize {
    2
}

fn default_history_limit() -> usize {
    30
}

fn default_client_response_timeout() -> u64 {
    30
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_amqp() -> AmqpConfig {
    AmqpConfig { url: String::new() }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl RuntimeConfig {
    /// Minimal configuration with every optional field at its default.
    pub fn new(
        namespace: impl Into<String>,
        namespace_api_key: impl Into<String>,
        runtime_endpoint: impl Into<String>,
        amqp_url: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            namespace_api_key: namespace_api_key.into(),
            runtime_endpoint: runtime_endpoint.into(),
            max_concurrent_workers: default_workers(),
            history_limit: default_history_limit(),
            client_response_timeout_secs: default_client_response_timeout(),
            retry: RetryConfig::default(),
            shutdown_grace_secs: default_shutdown_grace(),
            connect_timeout_secs: default_connect_timeout(),
            amqp: AmqpConfig {
                url: amqp_url.into(),
            },
            socket: SocketConfig::default(),
            log_level: default_log_level(),
            debug: false,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.trim().is_empty() {
            return Err(ConfigError::MissingField("namespace"));
        }
        if self.namespace_api_key.trim().is_empty() {
            return Err(ConfigError::MissingField("namespace_api_key"));
        }
        if self.runtime_endpoint.trim().is_empty() {
            return Err(ConfigError::MissingField("runtime_endpoint"));
        }
        if self.amqp.url.trim().is_empty() {
            return Err(ConfigError::MissingField("amqp.url"));
        }
        if self.max_concurrent_workers == 0 {
            return Err(ConfigError::Zero("max_concurrent_workers"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Zero("retry.max_attempts"));
        }
        Ok(())
    }

    /// Replace secrets and endpoints with values from the environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(key) = lookup(ENV_NAMESPACE_API_KEY) {
            self.namespace_api_key = key;
        }
        if let Some(url) = lookup(ENV_AMQP_URL) {
            self.amqp.url = url;
        }
        if let Some(endpoint) = lookup(ENV_RUNTIME_ENDPOINT) {
            self.runtime_endpoint = endpoint;
        }
    }

    pub fn queue_name(&self) -> String {
        format!("tasks_queue:{}", self.namespace)
    }

    /// Payload announcing this runtime to its namespace space.
    pub fn join_payload(&self) -> Value {
        json!({
            "name": self.namespace,
            "api_key": self.namespace_api_key,
        })
    }

    pub fn socket_url(&self) -> &str {
        self.socket.url.as_deref().unwrap_or(&self.runtime_endpoint)
    }

    pub fn client_response_timeout(&self) -> Duration {
        Duration::from_secs(self.client_response_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.backoff_ms),
        )
    }

    pub fn consumer_options(&self) -> ConsumerOptions {
        ConsumerOptions {
            max_concurrent_workers: self.max_concurrent_workers,
            retry: self.retry_policy(),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }

    /// Fallback log filter when `RUST_LOG` is unset.
    pub fn log_filter(&self) -> &str {
        if self.debug {
            "debug"
        } else {
            &self.log_level
        }
    }
}

/// Load runtime configuration from a YAML file.
///
/// Environment overrides are applied before validation, so secrets may be
/// left out of the file.
pub fn load_config(config_path: impl AsRef<Path>) -> Result<RuntimeConfig, ConfigError> {
    let config_file = config_path.as_ref();

    if !config_file.exists() {
        return Err(ConfigError::NotFound(config_file.display().to_string()));
    }

    let content = std::fs::read_to_string(config_file)?;
    let mut config = parse_config(&content)?;
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

fn parse_config(content: &str) -> Result<RuntimeConfig, ConfigError> {
    if content.trim().is_empty() {
        return Err(ConfigError::Empty);
    }
    serde_yaml::from_str(content).map_err(|e| ConfigError::Invalid(e.to_string()))
}
