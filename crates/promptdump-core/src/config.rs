//! Configuration system for promptdump
//!
//! Provides:
//! - Config file discovery (CLI flag, env var, standard paths)
//! - TOML parsing with serde
//! - Environment variable overrides
//! - Capture source selection (live interface XOR offline file)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("you must specify either an interface (-i) or a pcap file (-r)")]
    MissingSource,

    #[error("both an interface ({device}) and a pcap file ({}) were specified; choose one", .pcap_file.display())]
    ConflictingSources { device: String, pcap_file: PathBuf },
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Complete configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptdumpConfig {
    /// General settings
    pub sensor: SensorSettings,

    /// Packet capture settings
    pub capture: CaptureSettings,

    /// TCP reassembly settings
    pub reassembly: ReassemblySettings,

    /// Request/response correlation settings
    pub correlation: CorrelationSettings,
}

/// General settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorSettings {
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Where packets come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureSource {
    /// Live capture on a network interface
    Live(String),
    /// Offline capture file
    Offline(PathBuf),
}

/// Capture settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Network interface to capture on (e.g. en0, eth0, lo0)
    pub device: Option<String>,

    /// Capture file to read instead of a live interface
    pub pcap_file: Option<PathBuf>,

    /// BPF filter expression
    pub bpf_filter: String,

    /// Put the interface into promiscuous mode
    pub promiscuous: bool,

    /// Maximum bytes captured per packet; must cover full segments or
    /// HTTP bodies get cut
    pub snaplen: i32,

    /// Read timeout for live captures, lets the reader notice shutdown
    pub read_timeout_ms: u64,

    /// Packets buffered between the capture thread and the control loop
    pub channel_capacity: usize,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            device: None,
            pcap_file: None,
            bpf_filter: "tcp".to_string(),
            promiscuous: false,
            snaplen: 65535,
            read_timeout_ms: 1000,
            channel_capacity: 4096,
        }
    }
}

impl CaptureSettings {
    /// Resolve the capture source. Exactly one of `device` and
    /// `pcap_file` must be set.
    pub fn source(&self) -> ConfigResult<CaptureSource> {
        match (&self.device, &self.pcap_file) {
            (Some(device), Some(pcap_file)) => Err(ConfigError::ConflictingSources {
                device: device.clone(),
                pcap_file: pcap_file.clone(),
            }),
            (Some(device), None) => Ok(CaptureSource::Live(device.clone())),
            (None, Some(pcap_file)) => Ok(CaptureSource::Offline(pcap_file.clone())),
            (None, None) => Err(ConfigError::MissingSource),
        }
    }
}

/// TCP reassembly settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReassemblySettings {
    /// How often idle connections are flushed (seconds)
    pub flush_interval_secs: u64,

    /// Connections without traffic for this long are closed (seconds)
    pub idle_timeout_secs: u64,

    /// Out-of-order segments buffered per direction before the gap is skipped
    pub max_buffered_segments: usize,
}

impl Default for ReassemblySettings {
    fn default() -> Self {
        Self {
            flush_interval_secs: 60,
            idle_timeout_secs: 120,
            max_buffered_segments: 1024,
        }
    }
}

impl ReassemblySettings {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Request/response correlation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationSettings {
    /// How long a response waits for its request's body (ms)
    pub pairing_timeout_ms: u64,

    /// Reassembled chunks buffered per half-stream
    pub stream_buffer: usize,

    /// Larger bodies are consumed but truncated to this size
    pub max_body_bytes: usize,

    /// Largest accepted request/status line plus headers
    pub max_head_bytes: usize,
}

impl Default for CorrelationSettings {
    fn default() -> Self {
        Self {
            pairing_timeout_ms: 1000,
            stream_buffer: 64,
            max_body_bytes: 64 * 1024 * 1024,
            max_head_bytes: 64 * 1024,
        }
    }
}

impl CorrelationSettings {
    pub fn pairing_timeout(&self) -> Duration {
        Duration::from_millis(self.pairing_timeout_ms)
    }
}

/// Configuration loader
pub struct ConfigLoader {
    /// Path to config file (if specified via CLI)
    cli_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader
    pub fn new() -> Self {
        Self { cli_path: None }
    }

    /// Set the config path from CLI argument
    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    /// Load configuration with the following precedence:
    /// 1. CLI --config flag
    /// 2. PROMPTDUMP_CONFIG environment variable
    /// 3. ~/.config/promptdump/config.toml
    /// 4. /etc/promptdump/config.toml
    /// 5. Default values
    pub fn load(&self) -> ConfigResult<PromptdumpConfig> {
        let config_path = self.find_config_file();

        let mut config = if let Some(path) = config_path {
            info!("Loading configuration from: {}", path.display());
            self.load_from_file(&path)?
        } else {
            debug!("No config file found, using defaults");
            PromptdumpConfig::default()
        };

        self.apply_env_overrides(&mut config);
        self.validate(&config)?;

        Ok(config)
    }

    /// Find the config file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.cli_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!("CLI config path does not exist: {}", path.display());
        }

        if let Ok(env_path) = std::env::var("PROMPTDUMP_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
            warn!("PROMPTDUMP_CONFIG path does not exist: {}", env_path);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let path = config_dir.join("promptdump").join("config.toml");
            if path.exists() {
                return Some(path);
            }
        }

        #[cfg(unix)]
        {
            let path = PathBuf::from("/etc/promptdump/config.toml");
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Load configuration from a TOML file
    fn load_from_file(&self, path: &Path) -> ConfigResult<PromptdumpConfig> {
        let content = std::fs::read_to_string(path)?;
        let config: PromptdumpConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut PromptdumpConfig) {
        if let Ok(val) = std::env::var("PROMPTDUMP_LOG_LEVEL") {
            config.sensor.log_level = val;
        }

        if let Ok(val) = std::env::var("PROMPTDUMP_INTERFACE") {
            config.capture.device = Some(val);
        }
        if let Ok(val) = std::env::var("PROMPTDUMP_PCAP_FILE") {
            config.capture.pcap_file = Some(PathBuf::from(val));
        }
        if let Ok(val) = std::env::var("PROMPTDUMP_BPF_FILTER") {
            config.capture.bpf_filter = val;
        }

        if let Ok(val) = std::env::var("PROMPTDUMP_PAIRING_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                config.correlation.pairing_timeout_ms = ms;
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self, config: &PromptdumpConfig) -> ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.sensor.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                config.sensor.log_level, valid_levels
            )));
        }

        if config.reassembly.flush_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "reassembly.flush_interval_secs cannot be 0".to_string(),
            ));
        }
        if config.reassembly.idle_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "reassembly.idle_timeout_secs cannot be 0".to_string(),
            ));
        }
        if config.correlation.pairing_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "correlation.pairing_timeout_ms cannot be 0".to_string(),
            ));
        }
        if config.correlation.stream_buffer == 0 || config.capture.channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "channel buffers cannot be 0".to_string(),
            ));
        }
        if config.capture.snaplen <= 0 {
            return Err(ConfigError::ValidationError(format!(
                "Invalid snaplen: {}",
                config.capture.snaplen
            )));
        }

        Ok(())
    }

    /// Get the default config file path for the current platform
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("promptdump").join("config.toml"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper module for platform-specific directories
mod dirs {
    use std::path::PathBuf;

    /// Get the user's config directory
    pub fn config_dir() -> Option<PathBuf> {
        #[cfg(target_os = "macos")]
        {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".config"))
        }

        #[cfg(target_os = "linux")]
        {
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".config"))
                })
        }

        #[cfg(target_os = "windows")]
        {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        }

        #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
        {
            None
        }
    }
}
