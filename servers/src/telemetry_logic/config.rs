use anyhow::{Context, Result};
use clap::Parser;
use lib_telemetry::ConnectionDescriptor;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "server_telemetry.conf";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_CONSUMER_GROUP: &str = "$Default";
pub const DEFAULT_REDIRECT_TIMEOUT_SECONDS: u64 = 30;
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;
pub const DEFAULT_STATIC_DIR: &str = "./public";

#[derive(Parser, Deserialize, Serialize, Clone, Default, PartialEq, Eq)]
#[clap(about = "IoT Hub telemetry to WebSocket relay", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "PORT", help = "Port to listen on for browser connections.")]
    pub port: Option<u16>,

    #[clap(long, env = "TELEMETRY_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "TELEMETRY_STATIC_DIR", help = "Directory holding the dashboard page and its assets.")]
    pub static_dir: Option<PathBuf>,

    #[clap(long, env = "TELEMETRY_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "TELEMETRY_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "IotHubConnectionString", help = "IoT Hub service connection string.")]
    pub iot_hub_connection_string: Option<String>,

    #[clap(long, env = "EventHubConsumerGroup", help = "Consumer group used to read the built-in endpoint.")]
    pub consumer_group: Option<String>,

    #[clap(long, env = "TELEMETRY_REDIRECT_TIMEOUT_SECONDS", help = "Seconds to wait for the IoT Hub link redirect.")]
    pub redirect_timeout_seconds: Option<u64>,

    #[clap(long, env = "TELEMETRY_MAX_BATCH_SIZE", help = "Maximum events handed over per batch by the AMQP consumer.")]
    pub max_batch_size: Option<usize>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("config_path", &self.config_path)
            .field("static_dir", &self.static_dir)
            .field("log_dir", &self.log_dir)
            .field("log_level", &self.log_level)
            .field(
                "iot_hub_connection_string",
                &self.iot_hub_connection_string.as_ref().map(|_| "<redacted>"),
            )
            .field("consumer_group", &self.consumer_group)
            .field("redirect_timeout_seconds", &self.redirect_timeout_seconds)
            .field("max_batch_size", &self.max_batch_size)
            .finish()
    }
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            static_dir: other.static_dir.or(self.static_dir),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            iot_hub_connection_string: other.iot_hub_connection_string.or(self.iot_hub_connection_string),
            consumer_group: other.consumer_group.or(self.consumer_group),
            redirect_timeout_seconds: other.redirect_timeout_seconds.or(self.redirect_timeout_seconds),
            max_batch_size: other.max_batch_size.or(self.max_batch_size),
        }
    }

    pub fn defaults() -> Config {
        Config {
            port: Some(DEFAULT_PORT),
            static_dir: Some(PathBuf::from(DEFAULT_STATIC_DIR)),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            consumer_group: Some(DEFAULT_CONSUMER_GROUP.to_string()),
            redirect_timeout_seconds: Some(DEFAULT_REDIRECT_TIMEOUT_SECONDS),
            max_batch_size: Some(DEFAULT_MAX_BATCH_SIZE),
            ..Default::default()
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn static_dir(&self) -> &Path {
        self.static_dir.as_deref().unwrap_or_else(|| Path::new(DEFAULT_STATIC_DIR))
    }

    pub fn log_dir(&self) -> &Path {
        self.log_dir.as_deref().unwrap_or_else(|| Path::new("./logs"))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    pub fn consumer_group(&self) -> &str {
        self.consumer_group.as_deref().unwrap_or(DEFAULT_CONSUMER_GROUP)
    }

    pub fn redirect_timeout(&self) -> Duration {
        Duration::from_secs(self.redirect_timeout_seconds.unwrap_or(DEFAULT_REDIRECT_TIMEOUT_SECONDS))
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size.unwrap_or(DEFAULT_MAX_BATCH_SIZE)
    }

    /// Parses and validates the IoT Hub connection string.
    pub fn descriptor(&self) -> Result<ConnectionDescriptor> {
        let raw = self
            .iot_hub_connection_string
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .context("No IoT Hub connection string configured. Set IotHubConnectionString.")?;
        Ok(raw.parse::<ConnectionDescriptor>()?)
    }
}

/// Reads a JSON config file. A missing or unreadable file is not an error; the
/// caller falls back to the other sources.
pub fn read_config_file(path: &Path) -> Option<Config> {
    if !path.exists() {
        log::info!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display());
        return None;
    }
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            log::warn!("Failed to read config file: {} ({}). Falling back to other sources.", path.display(), e);
            return None;
        }
    };
    match serde_json::from_str::<Config>(&text) {
        Ok(config) => Some(config),
        Err(e) => {
            log::warn!("Failed to parse config file: {} ({}). Falling back to other sources.", path.display(), e);
            None
        }
    }
}

/// Layers defaults, the config file and `cli` (which already carries the environment).
pub fn resolve(cli: Config) -> Config {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current_config = Config::defaults();
    if let Some(file_config) = read_config_file(&config_file_path) {
        current_config = current_config.merge(file_config);
    }
    current_config.merge(cli)
}

pub fn load_config() -> Config {
    resolve(Config::parse())
}
