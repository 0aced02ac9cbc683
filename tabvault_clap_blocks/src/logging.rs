//! CLI config for logging.

use std::str::FromStr;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid log filter '{filter}': {source}")]
    InvalidFilter {
        filter: String,
        source: tracing_subscriber::filter::ParseError,
    },

    #[error("could not install the log subscriber: {0}")]
    Install(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogDestination {
    Stdout,
    Stderr,
}

impl FromStr for LogDestination {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stdout" => Ok(Self::Stdout),
            "stderr" => Ok(Self::Stderr),
            _ => Err(format!(
                "Invalid log destination '{s}'. Valid options: stdout, stderr"
            )),
        }
    }
}

impl std::fmt::Display for LogDestination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// CLI config for the logging related subset of options.
#[derive(Debug, Clone, clap::Parser)]
pub struct LoggingConfig {
    /// Logs: filter directive
    ///
    /// Configures log severity level filter, by target.
    ///
    /// Simplest options: error, warn, info, debug, trace
    ///
    /// Levels for different modules can be specified. For example
    /// `debug,tabvault_backend=info` specifies debug logging for everything except the storage
    /// backends, which only log at info level.
    ///
    /// Overridden by `-v`.
    #[clap(long = "log-filter", env = "LOG_FILTER")]
    pub log_filter: Option<String>,

    /// Logs: filter short-hand
    ///
    /// Convenient way to set log severity level filter.
    /// Overrides `--log-filter`.
    ///
    /// -v   'info'
    ///
    /// -vv  'debug'
    ///
    /// -vvv 'trace'
    #[clap(
        short = 'v',
        long = "verbose",
        action = clap::ArgAction::Count,
    )]
    pub log_verbose_count: u8,

    /// Logs: destination
    ///
    /// Can be one of: stdout, stderr
    #[clap(
        long = "log-destination",
        env = "LOG_DESTINATION",
        default_value = "stderr"
    )]
    pub log_destination: LogDestination,
}

impl LoggingConfig {
    pub const DEFAULT_LOG_FILTER: &'static str = "warn";

    /// The filter directive in effect, after `-v` and the default are applied
    pub fn filter(&self) -> String {
        match self.log_verbose_count {
            0 => self
                .log_filter
                .clone()
                .unwrap_or_else(|| Self::DEFAULT_LOG_FILTER.to_string()),
            1 => "info".to_string(),
            2 => "debug".to_string(),
            _ => "trace".to_string(),
        }
    }

    pub fn env_filter(&self) -> Result<EnvFilter> {
        let filter = self.filter();
        EnvFilter::try_new(&filter).map_err(|source| Error::InvalidFilter { filter, source })
    }

    /// Install a global fmt subscriber. Fails if one is already installed.
    pub fn install(&self) -> Result<()> {
        let writer = match self.log_destination {
            LogDestination::Stdout => BoxMakeWriter::new(std::io::stdout),
            LogDestination::Stderr => BoxMakeWriter::new(std::io::stderr),
        };
        tracing_subscriber::fmt()
            .with_env_filter(self.env_filter()?)
            .with_writer(writer)
            .try_init()
            .map_err(|e| Error::Install(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn parse(args: &[&str]) -> LoggingConfig {
        LoggingConfig::try_parse_from(std::iter::once("tabvault").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn verbosity_overrides_filter() {
        assert_eq!(parse(&[]).filter(), LoggingConfig::DEFAULT_LOG_FILTER);
        assert_eq!(
            parse(&["--log-filter", "debug,tabvault_engine=trace"]).filter(),
            "debug,tabvault_engine=trace"
        );
        assert_eq!(parse(&["-v"]).filter(), "info");
        assert_eq!(parse(&["--log-filter", "error", "-vv"]).filter(), "debug");
        assert_eq!(parse(&["-vvvv"]).filter(), "trace");
    }

    #[test]
    fn destinations() {
        assert_eq!(parse(&[]).log_destination, LogDestination::Stderr);
        assert_eq!(
            parse(&["--log-destination", "STDOUT"]).log_destination,
            LogDestination::Stdout
        );
        assert!(
            LoggingConfig::try_parse_from(["tabvault", "--log-destination", "syslog"]).is_err()
        );
    }

    #[test]
    fn invalid_filter_is_reported() {
        let err = parse(&["--log-filter", "tabvault=notalevel"])
            .env_filter()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidFilter { .. }), "{err}");
    }
}
