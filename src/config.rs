use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::Context as _;
use serde::Deserialize;

pub const DEFAULT_ARCHIVE_PATH: &str = "testdata/archive.dvr";
pub const PROJECT_CONFIG_FILENAME: &str = "httpdvr.toml";

pub const ENV_RECORD: &str = "HTTPDVR_RECORD";
pub const ENV_REPLAY: &str = "HTTPDVR_REPLAY";
pub const ENV_PASSTHROUGH: &str = "HTTPDVR_PASSTHROUGH";
pub const ENV_DEFAULT_REPLAY: &str = "HTTPDVR_DEFAULT_REPLAY";
pub const ENV_FILE: &str = "HTTPDVR_FILE";

#[derive(Debug, Default, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub mode: ModeConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&toml).with_context(|| format!("load config {}", path.display()))
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }

    /// Loads the effective configuration.
    ///
    /// An explicit path wins; otherwise `./httpdvr.toml` is used when present, and the
    /// built-in defaults when it is not. Environment overrides are applied last.
    pub fn load(explicit: Option<&Path>, cwd: &Path) -> anyhow::Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::from_path(path)?,
            None => {
                let project = cwd.join(PROJECT_CONFIG_FILENAME);
                if project.is_file() {
                    Self::from_path(&project)
                        .with_context(|| format!("project ./{PROJECT_CONFIG_FILENAME}"))?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let flags = [
            (ENV_RECORD, &mut self.mode.record),
            (ENV_REPLAY, &mut self.mode.replay),
            (ENV_PASSTHROUGH, &mut self.mode.passthrough),
            (ENV_DEFAULT_REPLAY, &mut self.mode.default_replay),
        ];
        for (name, slot) in flags {
            if let Some(raw) = lookup(name) {
                *slot = parse_env_bool(name, &raw)?;
            }
        }

        if let Some(path) = lookup(ENV_FILE)
            && !path.trim().is_empty()
        {
            self.archive.path = PathBuf::from(path);
        }

        Ok(())
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).context("parse config TOML")
    }
}

/// The four independent switches the mode is resolved from.
#[derive(Debug, Default, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ModeConfig {
    #[serde(default)]
    pub record: bool,
    #[serde(default)]
    pub replay: bool,
    #[serde(default)]
    pub passthrough: bool,
    #[serde(default)]
    pub default_replay: bool,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ArchiveConfig {
    #[serde(default = "default_archive_path")]
    pub path: PathBuf,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            path: default_archive_path(),
        }
    }
}

fn default_archive_path() -> PathBuf {
    PathBuf::from(DEFAULT_ARCHIVE_PATH)
}

#[derive(Debug, Default, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub format: Option<LogFormat>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    Pretty,
}

fn parse_env_bool(name: &str, raw: &str) -> anyhow::Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        _ => anyhow::bail!("invalid boolean `{raw}` in {name}; expected true or false"),
    }
}
