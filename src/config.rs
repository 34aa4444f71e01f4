//! Subscription configuration
//!
//! Loaded once at startup from a TOML file (plus CLI overrides) and treated as
//! immutable afterwards. `SubscriptionConfig::validate` must pass before any
//! delivery loop is started.

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub subscription: SubscriptionConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub report: ReportConfig,
}

/// How new files are discovered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Periodic polling
    Pull,
    /// Listener-driven notifications
    Push,
    /// Query subscription fan-in across file types
    Query,
}

impl std::fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeliveryMode::Pull => "pull",
            DeliveryMode::Push => "push",
            DeliveryMode::Query => "query",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    /// Delivery strategy
    pub mode: DeliveryMode,

    /// Server group hosting the file types
    pub server_group: String,

    /// File type to follow (optional under query mode)
    #[serde(default)]
    pub file_type: Option<String>,

    /// Local directory files are delivered into
    pub output_dir: PathBuf,

    /// Pull cycle length in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// strftime format used for timestamps in logs and invocations
    #[serde(default = "default_date_format")]
    pub date_format: String,

    /// Ask the remote to resume from its persisted position
    #[serde(default)]
    pub restart: bool,

    /// Bookmark for the first pull request
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,

    /// Query mode: group deliveries by file type before fetching
    #[serde(default = "default_true")]
    pub bundle: bool,

    /// Query mode: file types to subscribe to (empty = every type in the group)
    #[serde(default)]
    pub query_types: Vec<String>,

    #[serde(default)]
    pub options: BehaviorOptions,

    #[serde(default)]
    pub invoke: Option<InvokeConfig>,
}

/// Transfer behavior flags applied to every session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BehaviorOptions {
    /// Overwrite an existing local file
    #[serde(default)]
    pub replace: bool,

    /// Keep the existing local file as a numbered version
    #[serde(default)]
    pub version: bool,

    /// Write to a temporary name and rename on completion
    #[serde(default)]
    pub safe_read: bool,

    /// Request a delivery receipt
    #[serde(default)]
    pub receipt: bool,

    /// Mirror the remote layout under `replicate_root`
    #[serde(default)]
    pub replicate: bool,

    #[serde(default)]
    pub replicate_root: Option<PathBuf>,

    /// Skip files whose content matches the local copy
    #[serde(default)]
    pub diff: bool,

    /// Compute and verify content checksums
    #[serde(default)]
    pub checksum: bool,
}

/// External command run for each delivered file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeConfig {
    /// Command template, e.g. `process.sh $filepath $filetype`
    pub command: String,

    /// Stop the subscription when the command fails
    #[serde(default)]
    pub exit_on_error: bool,

    /// Spawn without waiting for the exit status
    #[serde(default)]
    pub asynchronous: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Root of the spool directory acting as the remote channel
    #[serde(default = "default_spool_root")]
    pub spool_root: PathBuf,

    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    /// Fixed pause enforced before each reconnect attempt
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,

    /// Bounded wait used while a consumer has nothing to do
    #[serde(default = "default_tick")]
    pub tick_ms: u64,

    /// Maximum number of entries held in the pending set
    #[serde(default = "default_pending_capacity")]
    pub pending_capacity: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Summary report period in seconds (0 = disabled)
    #[serde(default)]
    pub interval_secs: u64,
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("replace and version options are mutually exclusive")]
    ReplaceWithVersion,

    #[error("invoke exit_on_error and asynchronous are mutually exclusive")]
    ExitOnErrorWithAsync,

    #[error("a file type is required in {0} mode")]
    MissingFileType(DeliveryMode),

    #[error("server group must not be empty")]
    EmptyServerGroup,

    #[error("output directory must not be empty")]
    EmptyOutputDir,

    #[error("replicate requires replicate_root")]
    MissingReplicateRoot,

    #[error("invalid date format: {0}")]
    InvalidDateFormat(String),

    #[error("poll interval must be greater than zero")]
    ZeroPollInterval,

    #[error("invoke command must not be empty")]
    EmptyInvocation,

    #[error("subscription is configured for {configured} mode but a {supplied} source was supplied")]
    SourceMismatch {
        configured: DeliveryMode,
        supplied: DeliveryMode,
    },

    #[error("failed to read config: {0}")]
    Io(String),

    #[error("failed to parse config: {0}")]
    Parse(String),
}

// Defaults
fn default_poll_interval() -> u64 { 60_000 }
fn default_date_format() -> String { "%Y-%m-%dT%H:%M:%S%.3f".to_string() }
fn default_true() -> bool { true }
fn default_spool_root() -> PathBuf { PathBuf::from("/var/spool/filefeed") }
fn default_user() -> String { "filefeed".to_string() }
fn default_reconnect_delay() -> u64 { 5_000 }
fn default_tick() -> u64 { 250 }
fn default_pending_capacity() -> usize { 4096 }

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            spool_root: default_spool_root(),
            user: default_user(),
            password: None,
            reconnect_delay_ms: default_reconnect_delay(),
            tick_ms: default_tick(),
            pending_capacity: default_pending_capacity(),
        }
    }
}

impl Config {
    /// Load a config file from disk
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

impl SubscriptionConfig {
    /// Minimal config for a mode; everything else takes its default
    pub fn new(mode: DeliveryMode, server_group: &str, file_type: Option<&str>, output_dir: PathBuf) -> Self {
        Self {
            mode,
            server_group: server_group.to_string(),
            file_type: file_type.map(str::to_string),
            output_dir,
            poll_interval_ms: default_poll_interval(),
            date_format: default_date_format(),
            restart: false,
            since: None,
            bundle: true,
            query_types: Vec::new(),
            options: BehaviorOptions::default(),
            invoke: None,
        }
    }

    /// Reject option combinations no loop can honor
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_group.trim().is_empty() {
            return Err(ConfigError::EmptyServerGroup);
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(ConfigError::EmptyOutputDir);
        }
        if self.mode != DeliveryMode::Query && self.file_type.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::MissingFileType(self.mode));
        }
        if self.options.replace && self.options.version {
            return Err(ConfigError::ReplaceWithVersion);
        }
        if self.options.replicate && self.options.replicate_root.is_none() {
            return Err(ConfigError::MissingReplicateRoot);
        }
        if let Some(invoke) = &self.invoke {
            if invoke.exit_on_error && invoke.asynchronous {
                return Err(ConfigError::ExitOnErrorWithAsync);
            }
            if invoke.command.trim().is_empty() {
                return Err(ConfigError::EmptyInvocation);
            }
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::ZeroPollInterval);
        }
        if StrftimeItems::new(&self.date_format).any(|item| matches!(item, Item::Error)) {
            return Err(ConfigError::InvalidDateFormat(self.date_format.clone()));
        }
        Ok(())
    }

    pub fn exit_on_error(&self) -> bool {
        self.invoke.as_ref().map_or(false, |i| i.exit_on_error)
    }

    /// Format a timestamp with the configured date format
    pub fn format_time(&self, time: &DateTime<Utc>) -> String {
        time.format(&self.date_format).to_string()
    }
}
