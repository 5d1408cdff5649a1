//! Logging configuration and setup.

use thiserror::Error;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Crates whose spans and events follow the configured level.
const WORKER_TARGETS: &[&str] = &["offline_sw", "offline_net", "offline_common"];

/// HTTP client internals, kept at `warn` unless a custom filter says otherwise.
const NOISY_TARGETS: &[&str] = &["reqwest", "hyper", "hyper_util", "rustls"];

/// Errors raised while installing the global subscriber.
#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Subscriber already installed: {0}")]
    AlreadyInstalled(#[from] tracing_subscriber::util::TryInitError),
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format.
    #[default]
    Pretty,
    /// Compact single-line format.
    Compact,
    /// JSON format for structured logging.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Level applied to the worker crates.
    pub level: Level,
    /// Output format.
    pub format: LogFormat,
    /// Include source file location.
    pub include_location: bool,
    /// Include span events (enter, exit).
    pub include_span_events: bool,
    /// Custom filter string (e.g., "offline_sw=trace,reqwest=debug").
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            include_location: false,
            include_span_events: false,
            filter: None,
        }
    }
}

impl LogConfig {
    /// Per-request routing decisions and cache writes become visible.
    pub fn debug() -> Self {
        Self {
            level: Level::DEBUG,
            include_location: true,
            ..Default::default()
        }
    }

    /// Cache hits and misses, plus span enter/exit for each strategy run.
    pub fn trace() -> Self {
        Self {
            level: Level::TRACE,
            include_location: true,
            include_span_events: true,
            ..Default::default()
        }
    }

    /// Line-delimited JSON for hosts that ship logs elsewhere.
    pub fn production() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Json,
            ..Default::default()
        }
    }

    /// Compact output for test runs.
    pub fn test() -> Self {
        Self {
            level: Level::DEBUG,
            format: LogFormat::Compact,
            ..Default::default()
        }
    }

    /// Set a custom filter.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Filter directives derived from the configured level.
    pub fn default_directives(&self) -> String {
        let level = self.level.to_string().to_lowercase();
        WORKER_TARGETS
            .iter()
            .map(|target| format!("{target}={level}"))
            .chain(NOISY_TARGETS.iter().map(|target| format!("{target}=warn")))
            .collect::<Vec<_>>()
            .join(",")
    }

    fn env_filter(&self) -> EnvFilter {
        match self.filter {
            Some(ref custom) => {
                EnvFilter::try_new(custom).unwrap_or_else(|_| EnvFilter::new(self.default_directives()))
            }
            None => EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(self.default_directives())),
        }
    }

    fn fmt_layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let span_events = if self.include_span_events {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        match self.format {
            LogFormat::Pretty => fmt::layer()
                .with_target(true)
                .with_file(self.include_location)
                .with_line_number(self.include_location)
                .with_span_events(span_events)
                .boxed(),
            LogFormat::Compact => fmt::layer()
                .compact()
                .with_target(true)
                .with_test_writer()
                .with_span_events(span_events)
                .boxed(),
            LogFormat::Json => fmt::layer().json().with_span_events(span_events).boxed(),
        }
    }
}

/// Initialize logging, failing if a global subscriber is already set.
pub fn try_init_logging(config: LogConfig) -> Result<(), LoggingError> {
    let filter = config.env_filter();
    tracing_subscriber::registry()
        .with(config.fmt_layer())
        .with(filter)
        .try_init()?;
    Ok(())
}

/// Initialize logging with the given configuration.
///
/// A second call is ignored; test binaries routinely race to install it.
pub fn init_logging(config: LogConfig) {
    if let Err(e) = try_init_logging(config) {
        tracing::debug!(error = %e, "Logging already initialized");
    }
}
