//! Configuration for sessions, backend servers and decoupled models
//!
//! Every struct deserializes with defaults for missing fields, so a config
//! file only has to name what it changes. Files are parsed as JSON, TOML or
//! YAML depending on their extension.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::data::DataType;
use crate::{Error, Result};

/// Retry policy for establishing a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Base backoff, doubled after every failed attempt
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 100,
        }
    }
}

impl RetryConfig {
    /// Single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff_ms: 0,
        }
    }
}

/// Client-side stream session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Default timeout for `drain`/`collect` when the caller passes none
    pub request_timeout_ms: Option<u64>,
    /// Bound of the response queue; `None` = unbounded
    ///
    /// When the queue is full the delivery task stops reading from the
    /// transport until the dispatcher catches up.
    pub queue_capacity: Option<usize>,
    /// Connection retry policy used by `open`
    pub connect_retry: RetryConfig,
    /// How long `close` waits for the background tasks to wind down
    pub close_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: None,
            queue_capacity: None,
            connect_retry: RetryConfig::default(),
            close_timeout_ms: 1000,
        }
    }
}

impl SessionConfig {
    /// Default drain timeout as a `Duration`
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    /// Builder pattern: set the default request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Builder pattern: bound the response queue
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    /// Builder pattern: set the connection retry policy
    pub fn with_connect_retry(mut self, retry: RetryConfig) -> Self {
        self.connect_retry = retry;
        self
    }

    /// Reject nonsensical values
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == Some(0) {
            return Err(Error::ConfigError(
                "queue_capacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Backend server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Requests executed concurrently per connection
    pub max_concurrent_requests: usize,
    /// Capacity of the per-connection response channel
    ///
    /// Producers wait when it is full, so a slow client slows the backend
    /// down instead of growing its memory.
    pub response_channel_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 64,
            response_channel_capacity: 32,
        }
    }
}

impl ServerConfig {
    /// Reject nonsensical values
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_requests == 0 {
            return Err(Error::ConfigError(
                "max_concurrent_requests must be greater than zero".into(),
            ));
        }
        if self.response_channel_capacity == 0 {
            return Err(Error::ConfigError(
                "response_channel_capacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Transaction policy of a model
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionPolicy {
    /// Any number of responses (including zero) per request
    pub decoupled: bool,
}

/// Declared input or output of a model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorConfig {
    /// Tensor name
    pub name: String,
    /// Element type
    pub data_type: DataType,
    /// Dimensions, `-1` for variable
    #[serde(default)]
    pub dims: Vec<i64>,
}

impl TensorConfig {
    /// Create a tensor declaration
    pub fn new(name: impl Into<String>, data_type: DataType, dims: Vec<i64>) -> Self {
        Self {
            name: name.into(),
            data_type,
            dims,
        }
    }
}

/// Model configuration consumed by the decoupled responder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Model name requests must address
    pub name: String,
    /// Largest batch the model accepts; the responder refuses anything above 1
    pub max_batch_size: usize,
    /// Transaction policy; must be decoupled
    pub model_transaction_policy: TransactionPolicy,
    /// Declared inputs
    pub input: Vec<TensorConfig>,
    /// Declared outputs
    pub output: Vec<TensorConfig>,
    /// Put the final flag on the last chunk instead of a separate marker
    pub attach_final_to_last_chunk: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            max_batch_size: 0,
            model_transaction_policy: TransactionPolicy::default(),
            input: Vec::new(),
            output: Vec::new(),
            attach_final_to_last_chunk: false,
        }
    }
}

impl ModelConfig {
    /// Decoupled model with one UINT8 input and one UINT8 output
    pub fn decoupled(
        name: impl Into<String>,
        input: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            model_transaction_policy: TransactionPolicy { decoupled: true },
            input: vec![TensorConfig::new(input, DataType::Uint8, vec![-1])],
            output: vec![TensorConfig::new(output, DataType::Uint8, vec![-1])],
            ..Self::default()
        }
    }

    /// Whether the decoupled transaction policy is declared
    pub fn is_decoupled(&self) -> bool {
        self.model_transaction_policy.decoupled
    }

    /// Look up a declared output
    pub fn output_config(&self, name: &str) -> Option<&TensorConfig> {
        self.output.iter().find(|o| o.name == name)
    }

    /// Look up a declared input
    pub fn input_config(&self, name: &str) -> Option<&TensorConfig> {
        self.input.iter().find(|i| i.name == name)
    }

    /// Parse from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Parse from a TOML string
    pub fn from_toml(source: &str) -> Result<Self> {
        parse_toml(source)
    }

    /// Load from a `.json`, `.toml`, `.yaml` or `.yml` file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        load_file(path.as_ref())
    }
}

/// Everything a deployment needs, grouped for a single config file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    /// Endpoint the backend binds and the client connects to
    pub endpoint: Option<String>,
    /// Client session settings
    pub session: SessionConfig,
    /// Backend server settings
    pub server: ServerConfig,
    /// Served model
    pub model: ModelConfig,
}

impl DeploymentConfig {
    /// Load from a `.json`, `.toml`, `.yaml` or `.yml` file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        load_file(path.as_ref())
    }

    /// Validate all sections
    pub fn validate(&self) -> Result<()> {
        self.session.validate()?;
        self.server.validate()
    }
}

fn parse_toml<T: DeserializeOwned>(source: &str) -> Result<T> {
    toml::from_str(source).map_err(|e| Error::ConfigError(format!("TOML parse error: {}", e)))
}

fn parse_yaml<T: DeserializeOwned>(source: &str) -> Result<T> {
    serde_yaml::from_str(source)
        .map_err(|e| Error::ConfigError(format!("YAML parse error: {}", e)))
}

fn load_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let source = std::fs::read_to_string(path)?;
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    tracing::debug!("Loading config from {}", path.display());

    match extension.as_deref() {
        Some("json") => Ok(serde_json::from_str(&source)?),
        Some("toml") => parse_toml(&source),
        Some("yaml") | Some("yml") => parse_yaml(&source),
        other => Err(Error::ConfigError(format!(
            "unsupported config format {:?} for {}",
            other,
            path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_model_config_json() {
        let config = ModelConfig::from_json(
            r#"{
                "name": "torch_nvdec",
                "model_transaction_policy": { "decoupled": true },
                "input": [{ "name": "PYTHON_INPUT_0", "data_type": "UINT8", "dims": [-1] }],
                "output": [{ "name": "PYTHON_OUTPUT_0", "data_type": "UINT8", "dims": [-1, -1] }]
            }"#,
        )
        .unwrap();

        assert!(config.is_decoupled());
        assert_eq!(config.max_batch_size, 0);
        assert!(config.output_config("PYTHON_OUTPUT_0").is_some());
        assert!(config.output_config("missing").is_none());
        assert!(!config.attach_final_to_last_chunk);
    }

    #[test]
    fn test_policy_defaults_to_not_decoupled() {
        let config = ModelConfig::from_toml("name = \"plain\"").unwrap();
        assert!(!config.is_decoupled());
    }

    #[test]
    fn test_deployment_config_from_files() {
        let mut toml_file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            toml_file,
            r#"
endpoint = "local://decoder"

[session]
request_timeout_ms = 5000
queue_capacity = 16

[server]
max_concurrent_requests = 4

[model]
name = "decoder"

[model.model_transaction_policy]
decoupled = true
"#
        )
        .unwrap();

        let config = DeploymentConfig::from_path(toml_file.path()).unwrap();
        assert_eq!(config.endpoint.as_deref(), Some("local://decoder"));
        assert_eq!(config.session.queue_capacity, Some(16));
        assert_eq!(config.session.connect_retry, RetryConfig::default());
        assert_eq!(config.server.max_concurrent_requests, 4);
        assert_eq!(config.server.response_channel_capacity, 32);
        assert!(config.model.is_decoupled());
        assert!(config.validate().is_ok());

        let mut yaml_file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(yaml_file, "session:\n  queue_capacity: 0\n").unwrap();
        let config = DeploymentConfig::from_path(yaml_file.path()).unwrap();
        assert!(matches!(config.validate(), Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_request_timeout_saturates() {
        let config = SessionConfig::default().with_request_timeout(Duration::MAX);
        assert_eq!(config.request_timeout_ms, Some(u64::MAX));

        let config = SessionConfig::default().with_request_timeout(Duration::from_millis(250));
        assert_eq!(config.request_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        let err = ModelConfig::from_path(file.path()).unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }
}
