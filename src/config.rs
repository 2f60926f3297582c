use crate::debugger::{ExceptionPolicy, SoftwareTrap};
use crate::{muted_error, weak_error};
use log::warn;
use nix::sys::signal::Signal;
use serde::Deserialize;
use std::fs::read_to_string;
use std::path::Path;
use std::str::FromStr;

/// Configuration file layout, every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    breakpoint_type: Option<SoftwareTrap>,
    exception_policy: Option<ExceptionPolicy>,
    quiet_signals: Vec<String>,
    kill_on_stop: Option<bool>,
}

/// Debugger settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Trap used by software breakpoints without an explicit type.
    pub breakpoint_type: SoftwareTrap,
    pub exception_policy: ExceptionPolicy,
    /// Signals passed to debugee without a stop.
    pub quiet_signals: Vec<Signal>,
    /// Kill debugee on exit, detach from it otherwise.
    pub kill_on_stop: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            breakpoint_type: SoftwareTrap::default(),
            exception_policy: ExceptionPolicy::default(),
            quiet_signals: vec![],
            kill_on_stop: true,
        }
    }
}

impl From<ConfigFile> for Config {
    fn from(file: ConfigFile) -> Self {
        let default = Config::default();
        let quiet_signals = file
            .quiet_signals
            .iter()
            .filter_map(|name| {
                let name = name.to_uppercase();
                let name = if name.starts_with("SIG") {
                    name
                } else {
                    format!("SIG{name}")
                };
                weak_error!(Signal::from_str(&name), "unknown signal in quiet_signals:")
            })
            .collect();

        Self {
            breakpoint_type: file.breakpoint_type.unwrap_or(default.breakpoint_type),
            exception_policy: file.exception_policy.unwrap_or(default.exception_policy),
            quiet_signals,
            kill_on_stop: file.kill_on_stop.unwrap_or(default.kill_on_stop),
        }
    }
}

impl FromStr for Config {
    type Err = toml::de::Error;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let file: ConfigFile = toml::de::from_str(data)?;
        Ok(file.into())
    }
}

impl Config {
    const DEFAULT_PATH: &'static str = ".config/trapctl/config.toml";

    /// Load configuration from file, the default location is used if `path` is `None`.
    /// Falls back to defaults on any error.
    pub fn load(path: Option<&Path>) -> Self {
        Self::from_file(path).unwrap_or_default()
    }

    fn from_file(path: Option<&Path>) -> Option<Self> {
        let data = match path {
            None => {
                let path = home::home_dir()?.join(Self::DEFAULT_PATH);
                muted_error!(read_to_string(path))?
            }
            Some(path) => match read_to_string(path) {
                Ok(data) => data,
                Err(err) => {
                    warn!(target: "debugger", "error while load config file: {err}");
                    return None;
                }
            },
        };

        weak_error!(Config::from_str(&data), "invalid config file, use defaults:")
    }
}
