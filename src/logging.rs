use std::str::FromStr as _;

use anyhow::{Context as _, anyhow};
use tracing_subscriber::filter::LevelFilter;

use crate::config::{Config, LogFormat};

// Test suites are the main host process, so stay quiet unless asked.
const DEFAULT_LOG_LEVEL: &str = "warn";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LogSettings {
    level: LevelFilter,
    format: LogFormat,
}

impl LogSettings {
    /// A level given on the command line beats `[logging] level`.
    fn resolve(config: &Config, cli_level_override: Option<&str>) -> anyhow::Result<Self> {
        let logging = config.logging.as_ref();
        let requested = cli_level_override
            .or_else(|| logging.and_then(|logging| logging.level.as_deref()))
            .unwrap_or(DEFAULT_LOG_LEVEL);
        let level = LevelFilter::from_str(&requested.trim().to_ascii_lowercase())
            .map_err(|_| anyhow!("invalid log level `{requested}`"))
            .context("expected one of trace, debug, info, warn, error, off")?;

        Ok(Self {
            level,
            format: logging
                .and_then(|logging| logging.format)
                .unwrap_or(LogFormat::Pretty),
        })
    }
}

/// Installs the global subscriber on stderr; stdout is left to the command output.
pub fn init(config: &Config, cli_level_override: Option<&str>) -> anyhow::Result<()> {
    let settings = LogSettings::resolve(config, cli_level_override)?;
    let builder = tracing_subscriber::fmt()
        .with_max_level(settings.level)
        .with_target(true)
        .with_writer(std::io::stderr);

    let installed = match settings.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
    installed.map_err(|err| anyhow!("initialize logging subscriber: {err}"))
}
