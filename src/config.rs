use crate::persistence::subscribers::{Subscriber, SubscriberKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const DB_FILE_NAME: &str = "loginwatch.db";

/// Configuration for the loginwatch daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name of this host, used in notifications
    pub server: String,
    /// Directory holding the session store
    pub data_dir: PathBuf,
    /// Default log level when RUST_LOG is not set
    pub log_level: String,
    /// Input source configuration
    pub input: InputConfig,
    /// Session tracking configuration
    pub tracking: TrackingConfig,
    /// Output configuration
    pub output: OutputConfig,
    /// Notification configuration
    pub alerting: AlertConfig,
}

/// Input source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// Type of input source: "file" or "syslog"
    pub source_type: String,
    /// Path to the auth log (if source_type is "file")
    pub file_path: Option<PathBuf>,
    /// Syslog bind address (if source_type is "syslog")
    pub syslog_address: Option<String>,
    /// Replay the whole file on startup instead of only new lines
    pub from_start: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Drop failed attempts before they reach the store
    pub ignore_fails: bool,
}

/// Output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Output format: "json", "jsonl", or "console"
    pub format: String,
    /// Output file path (if format is not "console")
    pub file_path: Option<PathBuf>,
}

/// Notification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub enabled: bool,
    /// Pending notifications kept before new ones are dropped
    pub queue_size: usize,
    /// HTTP timeout per webhook call
    pub timeout_secs: u64,
    /// Webhooks registered as subscribers on startup
    pub webhooks: Vec<WebhookConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub kind: SubscriberKind,
}

impl WebhookConfig {
    pub fn to_subscriber(&self) -> Subscriber {
        Subscriber::new(self.name.clone(), self.url.clone(), self.kind)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            data_dir: PathBuf::from("/var/lib/loginwatch"),
            log_level: "info".to_string(),
            input: InputConfig::default(),
            tracking: TrackingConfig::default(),
            output: OutputConfig::default(),
            alerting: AlertConfig::default(),
        }
    }
}

impl Default for InputConfig {
    fn default() -> Self {
        InputConfig {
            source_type: "file".to_string(),
            file_path: Some(PathBuf::from("/var/log/auth.log")),
            syslog_address: None,
            from_start: false,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            format: "console".to_string(),
            file_path: None,
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        AlertConfig {
            enabled: false,
            queue_size: 100,
            timeout_secs: 30,
            webhooks: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn to_file(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Location of the session store
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE_NAME)
    }

    /// Parsed default log level, falling back to info
    pub fn log_filter(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }
}
