//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use crate::conversion::Retention;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub import: ImportConfig,

    #[serde(default = "default_retentions")]
    pub retentions: Vec<RetentionConfig>,

    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Import behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct ImportConfig {
    /// Keep the newest, still-growing chunk of every series
    #[serde(default)]
    pub write_unfinished_chunks: bool,

    /// Number of files converted in parallel
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Organisation the imported metrics belong to
    #[serde(default = "default_org_id")]
    pub org_id: u32,

    /// Prepended to every metric name derived from a file path
    #[serde(default)]
    pub name_prefix: String,

    /// Regex a metric name must match to be imported; empty imports all
    #[serde(default)]
    pub name_filter: String,

    /// Reference "now" in seconds; defaults to the wall clock
    #[serde(default)]
    pub now: Option<u32>,
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_org_id() -> u32 {
    1
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            write_unfinished_chunks: false,
            concurrency: default_concurrency(),
            org_id: default_org_id(),
            name_prefix: String::new(),
            name_filter: String::new(),
            now: None,
        }
    }
}

/// One destination retention level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RetentionConfig {
    pub seconds_per_point: u32,
    pub number_of_points: u32,
    /// Duration of one chunk, in seconds
    pub chunk_span: u32,
}

impl RetentionConfig {
    pub fn new(seconds_per_point: u32, number_of_points: u32, chunk_span: u32) -> Self {
        Self {
            seconds_per_point,
            number_of_points,
            chunk_span,
        }
    }

    pub fn retention(&self) -> Retention {
        Retention::new(self.seconds_per_point, self.number_of_points)
    }

    /// Parse the compact `spp:points:span,...` form
    pub fn parse_list(s: &str) -> Result<Vec<Self>, ConfigError> {
        s.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                let fields: Vec<&str> = part.split(':').collect();
                let parse = |idx: usize| -> Result<u32, ConfigError> {
                    fields
                        .get(idx)
                        .and_then(|f| f.trim().parse().ok())
                        .ok_or_else(|| {
                            ConfigError::Invalid(format!(
                                "retention {:?} is not of the form spp:points:span",
                                part
                            ))
                        })
                };
                if fields.len() != 3 {
                    return Err(ConfigError::Invalid(format!(
                        "retention {:?} is not of the form spp:points:span",
                        part
                    )));
                }
                Ok(Self::new(parse(0)?, parse(1)?, parse(2)?))
            })
            .collect()
    }
}

fn default_retentions() -> Vec<RetentionConfig> {
    vec![
        // 1 day of 10s in 1h chunks
        RetentionConfig::new(10, 8640, 3600),
        // 30 days of 1m in 6h chunks
        RetentionConfig::new(60, 43_200, 21_600),
        // 2 years of 1h in 1d chunks
        RetentionConfig::new(3600, 17_520, 86_400),
    ]
}

/// Where imported chunks are written
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

fn default_data_dir() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("tsmigrate").to_string_lossy().to_string())
        .unwrap_or_else(|| "./tsmigrate_data".to_string())
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Parse { error, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                error,
            },
            other => other,
        })
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            error: e.to_string(),
        })
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("tsmigrate").join("config.toml")),
            Some(PathBuf::from("/etc/tsmigrate/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        if let Ok(data_dir) = std::env::var("TSMIGRATE_DATA_DIR") {
            self.output.data_dir = data_dir;
        }

        if let Ok(flag) = std::env::var("TSMIGRATE_WRITE_UNFINISHED") {
            if let Ok(b) = flag.parse() {
                self.import.write_unfinished_chunks = b;
            }
        }
        if let Ok(concurrency) = std::env::var("TSMIGRATE_CONCURRENCY") {
            if let Ok(n) = concurrency.parse() {
                self.import.concurrency = n;
            }
        }

        if let Ok(level) = std::env::var("TSMIGRATE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("TSMIGRATE_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Check the settings the importer relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retentions.is_empty() {
            return Err(ConfigError::Invalid("no retentions configured".into()));
        }

        for (idx, ret) in self.retentions.iter().enumerate() {
            if ret.seconds_per_point == 0 || ret.number_of_points == 0 || ret.chunk_span == 0 {
                return Err(ConfigError::Invalid(format!(
                    "retention {} has a zero field: {:?}",
                    idx, ret
                )));
            }
            if ret.chunk_span % ret.seconds_per_point != 0 {
                return Err(ConfigError::Invalid(format!(
                    "retention {}: chunk span {}s is not a multiple of {}s",
                    idx, ret.chunk_span, ret.seconds_per_point
                )));
            }
        }

        if let Some(idx) = self
            .retentions
            .windows(2)
            .position(|pair| pair[0].seconds_per_point >= pair[1].seconds_per_point)
        {
            return Err(ConfigError::Invalid(format!(
                "retentions must be ordered finest to coarsest (retention {} vs {})",
                idx,
                idx + 1
            )));
        }

        if self.import.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be at least 1".into()));
        }

        if !self.import.name_filter.is_empty() {
            regex::Regex::new(&self.import.name_filter).map_err(|e| {
                ConfigError::Invalid(format!("name filter {:?}: {}", self.import.name_filter, e))
            })?;
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            import: ImportConfig::default(),
            retentions: default_retentions(),
            output: OutputConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# tsmigrate configuration
#
# Environment variables override these settings:
# - TSMIGRATE_DATA_DIR
# - TSMIGRATE_WRITE_UNFINISHED
# - TSMIGRATE_CONCURRENCY
# - TSMIGRATE_LOG_LEVEL
# - TSMIGRATE_LOG_FORMAT

[import]
# Also write the newest chunk of every series, which a later import may still extend
write_unfinished_chunks = false

# Number of whisper files converted in parallel
concurrency = 4

# Organisation id prepended to metric ids
org_id = 1

# Prefix added to metric names derived from file paths
name_prefix = ""

# Only import metrics whose name matches this regex (empty = all)
name_filter = ""

# Reference time in unix seconds (default: now)
# now = 1700000000

# Destination retentions, finest first. chunk_span must be a multiple of seconds_per_point.
[[retentions]]
seconds_per_point = 10
number_of_points = 8640
chunk_span = 3600

[[retentions]]
seconds_per_point = 60
number_of_points = 43200
chunk_span = 21600

[[retentions]]
seconds_per_point = 3600
number_of_points = 17520
chunk_span = 86400

[output]
# Directory segment files are written to
data_dir = "./tsmigrate_data"

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}
