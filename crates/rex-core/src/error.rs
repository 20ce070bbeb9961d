use thiserror::Error;

use crate::signal::Signal;

/// Errors produced by rex.
#[derive(Debug, Error)]
pub enum RexError {
    #[error("unable to dial {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("host key rejected for {host}: {reason}")]
    HostKey { host: String, reason: String },

    #[error("{op} cancelled")]
    Cancelled { op: String },

    #[error("cancelled by target {target}")]
    CancelledByTarget { target: String },

    #[error("process exited with status {code}{}", .message.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
    ExitStatus { code: i32, message: Option<String> },

    #[error("command `{command}`: {source}")]
    Command {
        command: String,
        #[source]
        source: Box<RexError>,
    },

    #[error("target {target}: {source}")]
    Target {
        target: String,
        #[source]
        source: Box<RexError>,
    },

    #[error("short write: only {written} bytes written, but expected {expected}")]
    ShortWrite { written: usize, expected: usize },

    #[error("invalid speed multiplier: {0}")]
    InvalidMultiplier(f64),

    #[error("no command started")]
    NotStarted,

    #[error("command already started")]
    AlreadyStarted,

    #[error("command result already collected")]
    AlreadyWaited,

    #[error("command not running")]
    NotRunning,

    #[error("unsupported signal: {0}")]
    SignalUnsupported(Signal),

    #[error("unable to allocate PTY: {0}")]
    PtyUnavailable(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("target already exists: {0}")]
    TargetExists(String),

    #[error("target not found: {0}")]
    TargetNotFound(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("signal handlers already set")]
    HandlersAlreadySet,

    #[error("signal handlers not set")]
    HandlersNotSet,

    /// Failure reported by a transport backend.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RexError {
    pub fn cancelled(op: impl Into<String>) -> Self {
        RexError::Cancelled { op: op.into() }
    }

    /// Wrap `source` with the command line it came from.
    pub fn command(command: impl Into<String>, source: RexError) -> Self {
        RexError::Command {
            command: command.into(),
            source: Box::new(source),
        }
    }

    /// Wrap `source` with the name of the target it came from.
    pub fn target(target: impl Into<String>, source: RexError) -> Self {
        RexError::Target {
            target: target.into(),
            source: Box::new(source),
        }
    }

    /// Whether this error, or any error it wraps, was caused by cancellation
    /// rather than a transport or remote failure.
    pub fn is_cancelled(&self) -> bool {
        match self {
            RexError::Cancelled { .. } | RexError::CancelledByTarget { .. } => true,
            RexError::Command { source, .. } | RexError::Target { source, .. } => {
                source.is_cancelled()
            }
            _ => false,
        }
    }

    /// The remote exit code, if this error (or a wrapped one) is a non-zero
    /// exit status.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            RexError::ExitStatus { code, .. } => Some(*code),
            RexError::Command { source, .. } | RexError::Target { source, .. } => {
                source.exit_code()
            }
            _ => None,
        }
    }
}

pub type RexResult<T> = Result<T, RexError>;
