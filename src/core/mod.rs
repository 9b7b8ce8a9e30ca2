//! Session machinery.
//!
//! - **normalize**: launch configuration validation and environment assembly
//! - **session**: the `Pty` contract and the platform dispatch
//! - **unix**: pty(7) backend
//! - **pty** / **process**: Windows ConPTY backend
//! - **env_block** / **cmdline**: Windows process creation encodings
//!
//! # Architecture
//!
//! ```text
//! start(LaunchConfig)
//! ├── normalize (argv[0], dir, env, size)
//! ├── UnixPty   (openpty + fork/exec, SIGHUP -> kill escalation)
//! └── ConPty    (pipes + HPCON + CreateProcess, close event -> terminate)
//!     └── ExitLatch (fired once by the exit watcher thread)
//! ```

pub mod cmdline;
pub mod env_block;
mod latch;
pub mod normalize;
pub mod session;

#[cfg(unix)]
pub mod unix;

#[cfg(windows)]
pub mod process;
#[cfg(windows)]
pub mod pty;
