//! Server options.
//!
//! Every field has a default, so an empty `arachne.toml` (or no file at all)
//! yields a working server. The binary layers CLI flags on top.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::frame::DEFAULT_MAX_PAYLOAD;

/// Minimum severity the binary logs at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!(
                "unknown log level '{}' (expected debug, info, warn or error)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Options {
    pub verbose: LogLevel,
    /// Time every `handle_data` call and log it.
    pub benchmarks: bool,
    /// Run the decoder warm-up when the server is constructed.
    pub do_warmup: bool,
    pub warmup_runs: u32,
    /// Payload size of the synthetic warm-up frame, in bytes.
    pub warmup_data_size: usize,
    /// Largest payload accepted from a client, in bytes.
    pub max_message_size: u64,
    /// Drop client frames that arrive without a mask.
    pub require_masked: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            verbose: LogLevel::Info,
            benchmarks: false,
            do_warmup: true,
            warmup_runs: 150,
            warmup_data_size: 1024 * 1024,
            max_message_size: DEFAULT_MAX_PAYLOAD,
            require_masked: true,
        }
    }
}

impl Options {
    /// Read and parse options from a TOML file.
    pub fn from_file(path: &Path) -> Result<Options, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_str(&content)
    }

    /// Parse options from a TOML string.
    pub fn from_str(content: &str) -> Result<Options, ConfigError> {
        Ok(toml::from_str(content)?)
    }
}
