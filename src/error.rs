//! Error types for PTY sessions

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Broad classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad launch configuration or shutdown policy. Never retried.
    Config,
    /// The host OS lacks a required feature (ConPTY).
    Unsupported,
    /// An OS resource (pty, pipe, pseudo console, process) could not be
    /// allocated or manipulated.
    Resource,
    /// Neither graceful nor forceful termination finished in time.
    ShutdownTimeout,
    /// Forceful termination was refused and the process did not exit anyway.
    PermissionDenied,
    /// Plain I/O failure.
    Io,
}

/// PTY error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("command needs at least one argument")]
    EmptyArgv,

    #[error("executable `{name}` not found in search path: {source}")]
    ExecutableNotFound {
        name: String,
        #[source]
        source: which::Error,
    },

    #[error("unable to resolve working directory: {0}")]
    WorkingDirectory(#[source] io::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("close timeout must exceed force-kill delay by at least one second")]
    UnacceptableTimeout,

    #[error("failed to read config file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("ConPTY is not supported on this version of Windows")]
    ConPtyNotSupported,

    #[error("failed to allocate pty: {0}")]
    PtyAllocation(#[source] io::Error),

    #[error("failed to create pipe: {0}")]
    PipeCreation(#[source] io::Error),

    #[error("failed to create pseudo console: {0}")]
    ConPtyCreation(#[source] io::Error),

    #[error("failed to spawn process: {0}")]
    ProcessSpawn(#[source] io::Error),

    #[error("failed to resize terminal: {0}")]
    Resize(#[source] io::Error),

    #[error("failed to make pseudo console close with its client: {0}")]
    AutoClose(#[source] io::Error),

    #[error("failed to terminate process: {0}")]
    Terminate(#[source] io::Error),

    #[error("failed to signal process group: {0}")]
    Signal(#[source] io::Error),

    #[error("kill process timeout")]
    KillTimeout,

    #[error("permission denied while killing process: {0}")]
    KillPermissionDenied(#[source] io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::EmptyArgv
            | Error::ExecutableNotFound { .. }
            | Error::WorkingDirectory(_)
            | Error::InvalidArgument(_)
            | Error::UnacceptableTimeout
            | Error::ConfigRead { .. }
            | Error::ConfigParse(_) => ErrorKind::Config,
            Error::ConPtyNotSupported => ErrorKind::Unsupported,
            Error::PtyAllocation(_)
            | Error::PipeCreation(_)
            | Error::ConPtyCreation(_)
            | Error::ProcessSpawn(_)
            | Error::Resize(_)
            | Error::AutoClose(_)
            | Error::Terminate(_)
            | Error::Signal(_) => ErrorKind::Resource,
            Error::KillTimeout => ErrorKind::ShutdownTimeout,
            Error::KillPermissionDenied(_) => ErrorKind::PermissionDenied,
            Error::Io(_) => ErrorKind::Io,
        }
    }
}

/// Result type for PTY operations
pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of a failed close, kept by value so every caller of `close` can be
/// handed an equivalent [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseFailure {
    KillTimeout,
    #[cfg_attr(windows, allow(dead_code))]
    PermissionDenied(i32),
    #[cfg_attr(windows, allow(dead_code))]
    Signal(i32),
    #[cfg_attr(unix, allow(dead_code))]
    Terminate(i32),
}

impl From<CloseFailure> for Error {
    fn from(failure: CloseFailure) -> Self {
        match failure {
            CloseFailure::KillTimeout => Error::KillTimeout,
            CloseFailure::PermissionDenied(code) => {
                Error::KillPermissionDenied(io::Error::from_raw_os_error(code))
            }
            CloseFailure::Signal(code) => Error::Signal(io::Error::from_raw_os_error(code)),
            CloseFailure::Terminate(code) => Error::Terminate(io::Error::from_raw_os_error(code)),
        }
    }
}
