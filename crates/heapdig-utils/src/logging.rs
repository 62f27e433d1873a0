//! # Logging Utilities
//!
//! Logging setup for heapdig using `tracing`.
//!
//! Analysis output goes to stdout, so every log line is written to stderr
//! (and optionally a file). This keeps `heapdig census > out.txt` clean.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use heapdig_utils::init_logging;
//!
//! // Keep the guard alive until exit so buffered file output is flushed
//! let _guard = init_logging().expect("Failed to initialize logging");
//! tracing::info!("analysis started");
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Level filter (e.g. `RUST_LOG=debug`, `RUST_LOG=heapdig_core::graph=trace`)
//! - `HEAPDIG_LOG_FORMAT`: `pretty` or `json` (default: `pretty`)
//! - `HEAPDIG_LOG_FILE`: Optional log file path; rotated daily

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, io};

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::{self};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

const FORMAT_VAR: &str = "HEAPDIG_LOG_FORMAT";
const FILE_VAR: &str = "HEAPDIG_LOG_FILE";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat
{
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err(LoggingError::InvalidFormat(s.to_string())),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel
{
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel
{
    /// Level for `count` repetitions of a `-v` flag, starting from `Warn`
    pub fn from_verbosity(count: u8) -> Self
    {
        match count {
            0 => LogLevel::Warn,
            1 => LogLevel::Info,
            2 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

impl From<LogLevel> for Level
{
    fn from(level: LogLevel) -> Self
    {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

impl FromStr for LogLevel
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "error" | "err" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" | "dbg" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(LoggingError::InvalidLevel(s.to_string())),
        }
    }
}

/// Resolved logging settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig
{
    pub format: LogFormat,
    /// Used when `RUST_LOG` is unset or unparsable
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig
{
    fn default() -> Self
    {
        Self {
            format: LogFormat::Pretty,
            level: LogLevel::Warn,
            file: None,
        }
    }
}

impl LoggingConfig
{
    /// Read `HEAPDIG_LOG_FORMAT` and `HEAPDIG_LOG_FILE`
    ///
    /// ## Errors
    ///
    /// Returns `InvalidFormat` when `HEAPDIG_LOG_FORMAT` is set to an
    /// unknown value.
    pub fn from_env() -> Result<Self, LoggingError>
    {
        let format = match env::var(FORMAT_VAR) {
            Ok(value) => value.parse()?,
            Err(_) => LogFormat::default(),
        };
        let file = env::var_os(FILE_VAR).filter(|value| !value.is_empty()).map(PathBuf::from);
        Ok(Self {
            format,
            file,
            ..Self::default()
        })
    }

    pub fn with_level(mut self, level: LogLevel) -> Self
    {
        self.level = level;
        self
    }

    fn filter(&self) -> EnvFilter
    {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(Level::from(self.level).to_string()))
    }
}

/// Keeps the background file writer alive
///
/// Dropping it flushes and stops file logging.
#[derive(Debug)]
#[must_use = "dropping the guard stops file logging"]
pub struct LogGuard
{
    _file: Option<WorkerGuard>,
}

/// Initialize logging from the environment
///
/// ## Errors
///
/// Returns an error if a variable is invalid, the log file cannot be
/// created, or a global subscriber is already installed.
pub fn init_logging() -> Result<LogGuard, LoggingError>
{
    init_logging_with(&LoggingConfig::from_env()?)
}

/// Initialize logging with explicit settings
///
/// ## Errors
///
/// Returns an error if the log file cannot be created or a global subscriber
/// is already installed.
pub fn init_logging_with(config: &LoggingConfig) -> Result<LogGuard, LoggingError>
{
    let mut layers = vec![console_layer(config.format, config.filter())];
    let mut guard = None;
    if let Some(path) = &config.file {
        let (layer, file_guard) = file_layer(path, config.format, config.filter())?;
        layers.push(layer);
        guard = Some(file_guard);
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|err| LoggingError::InitializationFailed(err.to_string()))?;
    Ok(LogGuard { _file: guard })
}

fn console_layer(format: LogFormat, filter: EnvFilter) -> BoxedLayer
{
    let layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_timer(ChronoUtc::rfc_3339())
        .with_writer(io::stderr);
    match format {
        LogFormat::Pretty => layer.with_ansi(true).with_filter(filter).boxed(),
        LogFormat::Json => layer.json().with_current_span(true).with_filter(filter).boxed(),
    }
}

fn file_layer(path: &Path, format: LogFormat, filter: EnvFilter) -> Result<(BoxedLayer, WorkerGuard), LoggingError>
{
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let Some(name) = path.file_name() else {
        return Err(LoggingError::FileError(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} does not name a file", path.display()),
        )));
    };
    std::fs::create_dir_all(&directory)?;

    let appender = tracing_appender::rolling::daily(directory, name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let layer = fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_timer(ChronoUtc::rfc_3339())
        .with_ansi(false);
    let layer = match format {
        LogFormat::Pretty => layer.with_filter(filter).boxed(),
        LogFormat::Json => layer.json().with_span_list(true).with_filter(filter).boxed(),
    };
    Ok((layer, guard))
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError
{
    #[error("Invalid log format: {0}. Use 'pretty' or 'json'")]
    InvalidFormat(String),

    #[error("Invalid log level: {0}. Use 'error', 'warn', 'info', 'debug', or 'trace'")]
    InvalidLevel(String),

    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),

    #[error("File logging error: {0}")]
    FileError(#[from] io::Error),
}
