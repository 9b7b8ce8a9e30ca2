//! Session contract shared by the platform backends.
//!
//! [`start`] picks the backend for the target OS; callers only ever see a
//! `Box<dyn Pty>`.

use std::io::{self, Read, Write};

use crate::config::{LaunchConfig, ShutdownPolicy, TermSize};
use crate::error::Result;

/// A process attached to a pseudo terminal.
///
/// # Concurrency
///
/// `read` and `write` may run concurrently with each other and with
/// themselves. `resize` is best-effort thread-safe. `set_shutdown_policy`
/// must not race with itself and should be called before `close`.
/// `close` may be called any number of times from any thread; only the first
/// call tears down and every call returns the same result. Nothing but
/// `close`, `wait`, `try_wait` and `pid` may be used after `close`.
///
/// # Encoding
///
/// On Unix the byte stream is whatever the child writes, usually UTF-8.
/// ConPTY always speaks UTF-8 and emits VT sequences.
pub trait Pty: Send + Sync {
    /// Read output from the child.
    ///
    /// Returns `Ok(0)` once the child is gone and all buffered output has been
    /// read.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write input to the child.
    ///
    /// After the child exits this may fail but never panics. It can block if
    /// the child stops reading and the buffer fills.
    ///
    /// On Windows the child often has line input enabled and needs `\r\n`.
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Change the terminal size. Pixel dimensions are ignored on Windows,
    /// where ConPTY also repaints the whole screen.
    fn resize(&self, size: TermSize) -> Result<()>;

    /// Replace the shutdown policy used by `close`.
    fn set_shutdown_policy(&self, policy: ShutdownPolicy) -> Result<()>;

    /// Terminate the child and release every OS resource.
    ///
    /// The terminal handle is closed first so the child gets a hangup (Unix)
    /// or close event (Windows). If it is still alive after
    /// `force_kill_delay` it is killed, and if it does not die within the
    /// rest of `close_timeout` this returns [`Error::KillTimeout`].
    /// Resources are released either way.
    ///
    /// [`Error::KillTimeout`]: crate::Error::KillTimeout
    fn close(&self) -> Result<()>;

    /// Block until the child exits and return its exit code.
    ///
    /// `-1` means no code is available (killed by a signal, or the code could
    /// not be queried). Repeatable from any number of threads. The child may
    /// never exit if nobody reads its output.
    fn wait(&self) -> i32;

    /// The exit code if the child has already exited.
    fn try_wait(&self) -> Option<i32>;

    /// OS process id of the child.
    fn pid(&self) -> u32;
}

/// Normalize `config` and start it in a new pseudo terminal.
#[cfg(unix)]
pub fn start(config: LaunchConfig) -> Result<Box<dyn Pty>> {
    Ok(Box::new(super::unix::UnixPty::start(config)?))
}

/// Normalize `config` and start it in a new pseudo console.
#[cfg(windows)]
pub fn start(config: LaunchConfig) -> Result<Box<dyn Pty>> {
    start_with_options(config, &super::process::WindowsOptions::default())
}

/// Like [`start`], with Windows process creation options.
///
/// When `options.token` is set and `config.env` is `None`, the default
/// environment is the token user's profile environment rather than the
/// caller's.
#[cfg(windows)]
pub fn start_with_options(
    config: LaunchConfig,
    options: &super::process::WindowsOptions,
) -> Result<Box<dyn Pty>> {
    Ok(Box::new(super::pty::ConPty::start(config, options)?))
}

/// Start `config`, collect everything it prints and close the session.
///
/// Errors from `close` are ignored.
pub fn oneshot(config: LaunchConfig) -> Result<Vec<u8>> {
    let pty = start(config)?;
    let mut output = Vec::new();
    let result = (&*pty).read_to_end(&mut output);
    let _ = pty.close();
    result?;
    Ok(output)
}

impl Read for &dyn Pty {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Pty::read(*self, buf)
    }
}

impl Write for &dyn Pty {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Pty::write(*self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for dyn Pty {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Pty::read(self, buf)
    }
}

impl Write for dyn Pty {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Pty::write(self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
