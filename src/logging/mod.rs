//! Logging setup for tuneforge
//!
//! Every policy override and every recoverable stage failure in the pipeline
//! is reported as a `tracing::warn!` event. This module wires those events to
//! a `tracing-subscriber` registry, either human-readable or JSON.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Standard tracing filter, takes precedence (e.g. "tuneforge=debug")
//! - `TUNEFORGE_LOG_LEVEL`: Simple log level (error, warn, info, debug, trace)
//! - `TUNEFORGE_LOG_FORMAT`: Output format ("human" or "json")
//! - `TUNEFORGE_LOG_FILE`: Optional file path; the file always receives JSON

use once_cell::sync::OnceCell;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

const LOG_LEVEL_ENV: &str = "TUNEFORGE_LOG_LEVEL";
const LOG_FORMAT_ENV: &str = "TUNEFORGE_LOG_FORMAT";
const LOG_FILE_ENV: &str = "TUNEFORGE_LOG_FILE";

/// Errors that can occur during logging initialization
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter: {0}")]
    InvalidFilter(String),

    #[error("failed to create log directory: {0}")]
    DirectoryCreationFailed(String),

    #[error("failed to open log file: {0}")]
    FileOpenFailed(String),

    #[error("a global subscriber is already installed: {0}")]
    AlreadyInstalled(String),
}

/// Log level enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    /// Policy overrides are emitted at this level
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Convert to tracing Level
    pub fn as_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }

    /// Parse from string (case-insensitive)
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "error" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Log format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

impl LogFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "human" | "pretty" | "console" => Some(LogFormat::Human),
            "json" | "structured" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Include file/line in console output
    pub with_file_info: bool,
    /// Emit span close events (useful to time pipeline stages)
    pub with_span_events: bool,
    pub log_file: Option<PathBuf>,
}

impl LoggingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file_info(mut self, with_file_info: bool) -> Self {
        self.with_file_info = with_file_info;
        self
    }

    pub fn with_span_events(mut self, with_span_events: bool) -> Self {
        self.with_span_events = with_span_events;
        self
    }

    pub fn with_log_file(mut self, path: PathBuf) -> Self {
        self.log_file = Some(path);
        self
    }

    /// Build a config from the `TUNEFORGE_LOG_*` environment variables.
    pub fn from_env() -> Self {
        let level = std::env::var(LOG_LEVEL_ENV)
            .ok()
            .and_then(|s| LogLevel::parse(&s))
            .unwrap_or_default();
        let format = std::env::var(LOG_FORMAT_ENV)
            .ok()
            .and_then(|s| LogFormat::parse(&s))
            .unwrap_or_default();

        let mut config = LoggingConfig::new().with_level(level).with_format(format);
        if let Ok(path) = std::env::var(LOG_FILE_ENV) {
            config = config.with_log_file(PathBuf::from(path));
        }
        config
    }
}

/// Initialize logging from environment variables. Idempotent; errors are dropped.
pub fn init_logging_default() {
    init_with_config(&LoggingConfig::from_env());
}

/// Initialize logging with a custom configuration. Idempotent.
///
/// Only the first call installs a subscriber; later calls are no-ops even if
/// their configuration differs.
pub fn init_with_config(config: &LoggingConfig) {
    TRACING_INITIALIZED.get_or_init(|| {
        if let Err(e) = try_init(config) {
            eprintln!("tuneforge: logging disabled: {}", e);
        }
    });
}

/// Check if tracing has been initialized by this module
pub fn is_initialized() -> bool {
    TRACING_INITIALIZED.get().is_some()
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn try_init(config: &LoggingConfig) -> Result<(), LoggingError> {
    let env_filter = build_env_filter(config.level)?;

    let mut layers: Vec<BoxedLayer> = vec![console_layer(config)];
    if let Some(path) = &config.log_file {
        layers.push(file_layer(config, path)?);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .map_err(|e| LoggingError::AlreadyInstalled(e.to_string()))
}

fn console_layer(config: &LoggingConfig) -> BoxedLayer {
    match config.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(false)
            .with_file(config.with_file_info)
            .with_line_number(config.with_file_info)
            .with_span_events(span_events(config.with_span_events))
            .boxed(),
        LogFormat::Human => fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(config.with_file_info)
            .with_line_number(config.with_file_info)
            .with_span_events(span_events(config.with_span_events))
            .boxed(),
    }
}

fn file_layer(config: &LoggingConfig, log_path: &Path) -> Result<BoxedLayer, LoggingError> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| LoggingError::DirectoryCreationFailed(e.to_string()))?;
    }

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(|e| LoggingError::FileOpenFailed(e.to_string()))?;

    Ok(fmt::layer()
        .json()
        .with_writer(std::sync::Mutex::new(file))
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_span_events(span_events(config.with_span_events))
        .boxed())
}

fn span_events(enabled: bool) -> FmtSpan {
    if enabled {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

/// RUST_LOG wins over TUNEFORGE_LOG_LEVEL, which wins over the config level.
fn build_env_filter(default_level: LogLevel) -> Result<EnvFilter, LoggingError> {
    if let Ok(rust_log) = std::env::var("RUST_LOG") {
        return EnvFilter::try_new(rust_log).map_err(|e| LoggingError::InvalidFilter(e.to_string()));
    }

    let level = std::env::var(LOG_LEVEL_ENV)
        .ok()
        .and_then(|s| LogLevel::parse(&s))
        .unwrap_or(default_level);

    Ok(EnvFilter::new(level.as_filter_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_default_idempotent() {
        init_logging_default();
        init_logging_default();
        assert!(is_initialized());
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!(LogLevel::parse("error"), Some(LogLevel::Error));
        assert_eq!(LogLevel::parse("WARNING"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("debug"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("loud"), None);
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("pretty"), Some(LogFormat::Human));
        assert_eq!(LogFormat::parse("json"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse("xml"), None);
    }

    #[test]
    fn test_default_level_is_warn() {
        assert_eq!(LoggingConfig::default().level, LogLevel::Warn);
        assert_eq!(LogLevel::Warn.as_tracing_level(), tracing::Level::WARN);
    }

    #[test]
    fn test_logging_config_builder() {
        let path = PathBuf::from("/tmp/tuneforge-test.log");
        let config = LoggingConfig::new()
            .with_level(LogLevel::Debug)
            .with_format(LogFormat::Json)
            .with_file_info(true)
            .with_span_events(true)
            .with_log_file(path.clone());

        assert_eq!(config.level, LogLevel::Debug);
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.with_file_info);
        assert!(config.with_span_events);
        assert_eq!(config.log_file, Some(path));
    }

    #[test]
    fn test_file_layer_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("forge.log");
        let config = LoggingConfig::new().with_log_file(path.clone());

        assert!(file_layer(&config, &path).is_ok());
        assert!(path.exists());
    }
}
