//! xpty - run child processes attached to a pseudo terminal
//!
//! One API over Unix pseudo terminals and the Windows pseudo console
//! (ConPTY). A session is started from a [`LaunchConfig`], streams bytes in
//! both directions, can be resized, and is torn down with a bounded
//! close-then-kill escalation governed by a [`ShutdownPolicy`].
//!
//! ```no_run
//! use std::io::Read;
//!
//! let pty = xpty::start(xpty::LaunchConfig::new(["uname", "-a"]))?;
//! let mut output = String::new();
//! (&*pty).read_to_string(&mut output)?;
//! println!("{output} exited with {}", pty.wait());
//! pty.close()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
mod core;
mod error;

pub use crate::config::{ConfigFile, LaunchConfig, ShutdownPolicy, TermSize};
pub use crate::core::cmdline::{escape_arg, make_cmdline};
pub use crate::core::env_block::{build_env_block, dedup_env_case_insensitive, parse_env_block};
pub use crate::core::normalize::{apply_env_fallback_and_inject, normalize, normalize_in, HostContext};
pub use crate::core::session::{oneshot, start, Pty};
pub use crate::error::{Error, ErrorKind, Result};

#[cfg(unix)]
pub use crate::core::unix::UnixPty;
#[cfg(unix)]
pub use nix::sys::signal::Signal;

#[cfg(windows)]
pub use crate::core::process::{default_env_for_token, WindowsOptions};
#[cfg(windows)]
pub use crate::core::pty::{probe_conpty, ConPty};
#[cfg(windows)]
pub use crate::core::session::start_with_options;
