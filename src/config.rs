//! Node link configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{NodeLinkError, Result};

/// Identifier reserved for throwaway nodes that never carry a secret token
pub const TEMPORARY_NODE_ID: &str = "tmp";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub timing: TimingConfig,

    /// One entry per remote node endpoint
    #[serde(default, rename = "service")]
    pub services: Vec<ServiceConfig>,
}

impl Config {
    /// Load a config file, falling back to defaults when it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| NodeLinkError::Config(format!("{}: {}", path.display(), e)))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| NodeLinkError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Find a service by identifier
    pub fn service(&self, id: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.id == id)
    }

    fn validate(&self) -> Result<()> {
        for (i, service) in self.services.iter().enumerate() {
            if service.id.is_empty() {
                return Err(NodeLinkError::Config(format!("service #{} has an empty id", i)));
            }
            if service.host.is_empty() {
                return Err(NodeLinkError::Config(format!(
                    "service {} has an empty host",
                    service.id
                )));
            }
            if self.services[..i].iter().any(|s| s.id == service.id) {
                return Err(NodeLinkError::Config(format!(
                    "duplicate service id {}",
                    service.id
                )));
            }
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default `tracing` filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
        }
    }
}

/// Deadlines and delays applied around a connection attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Deadline for the readiness probe
    #[serde(default = "default_ready_deadline")]
    pub ready_deadline_secs: u64,

    /// Ceiling for waiting on the secret token file to appear
    #[serde(default = "default_secret_wait")]
    pub secret_wait_secs: u64,

    /// How often the secret token file is polled
    #[serde(default = "default_secret_poll")]
    pub secret_poll_ms: u64,

    /// Delay between a completed connect and stream registration
    #[serde(default = "default_settle_delay")]
    pub settle_delay_secs: u64,
}

impl TimingConfig {
    pub fn ready_deadline(&self) -> Duration {
        Duration::from_secs(self.ready_deadline_secs)
    }

    pub fn secret_wait(&self) -> Duration {
        Duration::from_secs(self.secret_wait_secs)
    }

    pub fn secret_poll(&self) -> Duration {
        Duration::from_millis(self.secret_poll_ms.max(1))
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            ready_deadline_secs: default_ready_deadline(),
            secret_wait_secs: default_secret_wait(),
            secret_poll_ms: default_secret_poll(),
            settle_delay_secs: default_settle_delay(),
        }
    }
}

/// Where the node's TLS certificate comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CertSource {
    /// PEM file on disk
    Path(PathBuf),
    /// Inline PEM contents
    Pem { pem: String },
}

/// Deployment tag of a node. Any tag other than `local` and `remote` is kept
/// as written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Environment {
    /// Node runs next to us and may still be writing its secret token
    Local,
    Remote,
    Other(String),
}

impl Environment {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::Other(tag) => tag,
        }
    }
}

impl From<String> for Environment {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "local" => Self::Local,
            "remote" => Self::Remote,
            _ => Self::Other(tag),
        }
    }
}

impl From<Environment> for String {
    fn from(environment: Environment) -> Self {
        match environment {
            Environment::Other(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

/// One remote node endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Unique service identifier
    pub id: String,

    /// `host:port` of the node's RPC listener
    pub host: String,

    /// TLS certificate
    pub cert: CertSource,

    /// Shared-secret token file
    pub secret_path: PathBuf,

    /// Directory holding versioned schema descriptors
    pub schema_dir: PathBuf,

    pub environment: Environment,

    /// Service name within the schema descriptor
    #[serde(default = "default_rpc_service")]
    pub rpc_service: String,

    /// Pin a schema version instead of using the latest
    #[serde(default)]
    pub schema_version: Option<String>,

    /// TLS server name override
    #[serde(default)]
    pub tls_domain: Option<String>,

    /// Metadata key carrying the secret token
    #[serde(default = "default_secret_header")]
    pub secret_header: String,

    /// Streams opened once connected
    #[serde(default)]
    pub streams: Vec<StreamConfig>,
}

/// A named server-streaming call to open after connecting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Subscription name, unique within the service
    pub name: String,

    /// Server-streaming method of the service
    pub method: String,

    /// Hex-encoded request message (empty sends the default message)
    #[serde(default)]
    pub request_hex: String,
}

/// Per-attempt connection settings derived from a [`ServiceConfig`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub use_secret_token: bool,
    pub wait_for_secret_token: bool,
}

impl ServiceConfig {
    /// Derive connection settings for the next connect attempt.
    ///
    /// The temporary identifier never uses a secret token, whatever the
    /// environment; only local nodes are waited on for their token file.
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            use_secret_token: self.id != TEMPORARY_NODE_ID,
            wait_for_secret_token: self.environment == Environment::Local,
        }
    }
}

// Defaults
fn default_filter() -> String { "nodelink=info".to_string() }
fn default_ready_deadline() -> u64 { 10 }
fn default_secret_wait() -> u64 { 20 }
fn default_secret_poll() -> u64 { 250 }
fn default_settle_delay() -> u64 { 2 }
fn default_rpc_service() -> String { "lnrpc.Lightning".to_string() }
fn default_secret_header() -> String { "macaroon".to_string() }
