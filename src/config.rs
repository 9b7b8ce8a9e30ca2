//! Launch and shutdown configuration.
//!
//! This module provides:
//! - [`LaunchConfig`]: what to run, where, with which environment and size
//! - [`ShutdownPolicy`]: how long `close` waits before and after forcing
//! - [`ConfigFile`]: TOML loading from `~/.xpty/config.toml`
//!
//! # Configuration File
//!
//! ```toml
//! [command]
//! argv = ["bash", "-i"]
//! dir = "/tmp"
//!
//! [command.env_inject]
//! LANG = "C.UTF-8"
//!
//! [command.size]
//! rows = 40
//! cols = 120
//!
//! [shutdown]
//! close_timeout_ms = 3000
//! force_kill_delay_ms = 1000
//! force_kill_signal = "SIGKILL"   # Unix only
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[cfg(unix)]
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Rows used when the configured size has a zero dimension.
pub const DEFAULT_ROWS: u16 = 24;
/// Columns used when the configured size has a zero dimension.
pub const DEFAULT_COLS: u16 = 80;

/// Terminal size in cells, plus optional pixel dimensions (Unix only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TermSize {
    pub rows: u16,
    pub cols: u16,
    pub pixel_width: u16,
    pub pixel_height: u16,
}

impl TermSize {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }

    pub fn with_pixels(rows: u16, cols: u16, pixel_width: u16, pixel_height: u16) -> Self {
        Self {
            rows,
            cols,
            pixel_width,
            pixel_height,
        }
    }

    /// True when either cell dimension is zero.
    pub fn is_unset(&self) -> bool {
        self.rows == 0 || self.cols == 0
    }
}

/// What to launch inside the pseudo terminal.
///
/// Every `None` is filled in by [`normalize`](crate::normalize):
///
/// - `argv[0]` without a path separator is looked up in `PATH`; a relative
///   path is resolved against `dir`.
/// - `dir` defaults to the current directory.
/// - `env` defaults to the inherited environment. `Some(vec![])` is an
///   explicitly empty environment.
/// - `env_fallback` defaults to `TERM=vt100` (and the inherited `SYSTEMROOT`
///   on Windows). Entries are only added when the key is absent.
/// - `env_inject` overwrites keys; an empty value deletes the key. On Unix
///   `PWD` is injected unless already present in the map.
///
/// Arguments and environment are UTF-8 strings. Inherited variables that
/// are not UTF-8 are dropped, a non-UTF-8 `dir` gets no `PWD`, and a program
/// that only resolves to a non-UTF-8 path is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    pub argv: Vec<String>,
    pub dir: Option<PathBuf>,
    pub env: Option<Vec<String>>,
    pub env_fallback: Option<BTreeMap<String, String>>,
    pub env_inject: Option<BTreeMap<String, String>>,
    pub size: TermSize,
}

impl LaunchConfig {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn env<I, S>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.env = Some(env.into_iter().map(Into::into).collect());
        self
    }

    pub fn fallback(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_fallback
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn inject(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_inject
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn size(mut self, size: TermSize) -> Self {
        self.size = size;
        self
    }
}

/// How `close` escalates from graceful to forceful termination.
///
/// `close_timeout` is the whole budget; after `force_kill_delay` the process
/// is killed. The timeout must exceed the delay by at least one second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownPolicy {
    #[serde(rename = "close_timeout_ms", with = "millis")]
    pub close_timeout: Duration,
    #[serde(rename = "force_kill_delay_ms", with = "millis")]
    pub force_kill_delay: Duration,
    #[cfg(unix)]
    #[serde(with = "signal_name")]
    pub force_kill_signal: Signal,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            close_timeout: Duration::from_secs(10),
            force_kill_delay: Duration::from_secs(5),
            #[cfg(unix)]
            force_kill_signal: Signal::SIGKILL,
        }
    }
}

impl ShutdownPolicy {
    /// Minimum gap between the force-kill delay and the total timeout.
    pub const MIN_KILL_GRACE: Duration = Duration::from_secs(1);

    pub fn new(close_timeout: Duration, force_kill_delay: Duration) -> Self {
        Self {
            close_timeout,
            force_kill_delay,
            ..Self::default()
        }
    }

    #[cfg(unix)]
    pub fn with_signal(mut self, signal: Signal) -> Self {
        self.force_kill_signal = signal;
        self
    }

    pub fn validate(&self) -> Result<()> {
        match self.close_timeout.checked_sub(self.force_kill_delay) {
            Some(grace) if grace >= Self::MIN_KILL_GRACE => Ok(()),
            _ => Err(Error::UnacceptableTimeout),
        }
    }

    /// Budget left for the process to die after it was forcefully killed.
    pub(crate) fn kill_grace(&self) -> Duration {
        self.close_timeout.saturating_sub(self.force_kill_delay)
    }
}

/// Contents of `~/.xpty/config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub command: LaunchConfig,
    pub shutdown: ShutdownPolicy,
}

impl ConfigFile {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.shutdown.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Load the default config file, or defaults if it does not exist.
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(path),
            _ => Ok(Self::default()),
        }
    }

    pub fn default_path() -> Option<PathBuf> {
        home_dir().map(|home| home.join(".xpty").join("config.toml"))
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("USERPROFILE")
        .or_else(|| std::env::var_os("HOME"))
        .map(PathBuf::from)
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(unix)]
mod signal_name {
    use std::str::FromStr;

    use nix::sys::signal::Signal;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Signal, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(value.as_str())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Signal, D::Error> {
        let name = String::deserialize(deserializer)?;
        Signal::from_str(&name).map_err(|_| D::Error::custom(format!("unknown signal `{name}`")))
    }
}
