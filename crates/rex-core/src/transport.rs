//! Abstract collaborators for reaching a remote host.
//!
//! rex does not implement a wire protocol itself. A [`Dialer`] produces a raw
//! byte connection, a [`Connector`] turns it into an authenticated
//! [`RemoteClient`], and the client opens one [`RemoteSession`] per command.
//! An SSH backend, or an in-memory stub in tests, plugs in behind these
//! traits.

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::error::{RexError, RexResult};
use crate::hostkey::HostKeyPolicy;
use crate::signal::Signal;

/// A bidirectional byte connection (TCP socket, in-memory pipe, ...).
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Conn for T {}

pub type BoxConn = Box<dyn Conn>;

/// Opens raw connections to `host:port` addresses.
pub trait Dialer: Send + Sync {
    /// Connect to `address`, giving up when `cancel` fires.
    fn dial<'a>(
        &'a self,
        address: &'a str,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, RexResult<BoxConn>>;
}

/// A way to authenticate the client user.
#[derive(Clone, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum Authorizer {
    Password { password: String },
}

impl Authorizer {
    pub fn password(password: impl Into<String>) -> Self {
        Authorizer::Password {
            password: password.into(),
        }
    }
}

impl fmt::Debug for Authorizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Authorizer::Password { .. } => f.write_str("Password(****)"),
        }
    }
}

/// Everything a [`Connector`] needs to complete a handshake.
#[derive(Debug, Clone)]
pub struct HandshakeParams {
    /// The `host:port` the connection was dialed to.
    pub address: String,
    pub username: String,
    pub auths: Vec<Authorizer>,
    pub host_key: HostKeyPolicy,
}

/// Runs the protocol handshake over a dialed connection.
pub trait Connector: Send + Sync {
    fn handshake<'a>(
        &'a self,
        conn: BoxConn,
        params: &'a HandshakeParams,
    ) -> BoxFuture<'a, RexResult<Arc<dyn RemoteClient>>>;
}

/// An authenticated connection able to host sessions.
pub trait RemoteClient: Send + Sync {
    fn open_session(&self) -> BoxFuture<'_, RexResult<Arc<dyn RemoteSession>>>;

    /// Close the connection. Open sessions end with it.
    fn close(&self) -> BoxFuture<'_, RexResult<()>>;
}

/// A single encoded terminal mode (opcode, value).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalMode {
    pub opcode: u8,
    pub value: u32,
}

pub const TTY_OP_ECHO: u8 = 53;
pub const TTY_OP_ISPEED: u8 = 128;
pub const TTY_OP_OSPEED: u8 = 129;

/// Echo on, 14.4 kbaud in both directions.
pub const DEFAULT_TERMINAL_MODES: [TerminalMode; 3] = [
    TerminalMode {
        opcode: TTY_OP_ECHO,
        value: 1,
    },
    TerminalMode {
        opcode: TTY_OP_ISPEED,
        value: 14400,
    },
    TerminalMode {
        opcode: TTY_OP_OSPEED,
        value: 14400,
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub rows: u32,
    pub cols: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    pub term: String,
    pub size: WindowSize,
    pub modes: Vec<TerminalMode>,
}

impl PtyRequest {
    pub fn xterm(rows: u32, cols: u32) -> Self {
        Self {
            term: "xterm".to_string(),
            size: WindowSize { rows, cols },
            modes: DEFAULT_TERMINAL_MODES.to_vec(),
        }
    }
}

/// Destination for one output stream of a remote command.
pub trait OutputSink: Send + Sync {
    fn write<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, RexResult<()>>;
}

/// The local ends attached to a remote command.
pub struct SessionIo {
    pub stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub stdout: Arc<dyn OutputSink>,
    pub stderr: Arc<dyn OutputSink>,
}

/// One command execution on a [`RemoteClient`].
///
/// Methods take `&self` so a running command can be signalled or resized
/// from another task.
pub trait RemoteSession: Send + Sync {
    fn set_env<'a>(&'a self, key: &'a str, value: &'a str) -> BoxFuture<'a, RexResult<()>>;

    fn request_pty<'a>(&'a self, request: &'a PtyRequest) -> BoxFuture<'a, RexResult<()>>;

    fn window_change(&self, size: WindowSize) -> BoxFuture<'_, RexResult<()>>;

    fn signal(&self, signal: Signal) -> BoxFuture<'_, RexResult<()>> {
        Box::pin(async move { Err(RexError::SignalUnsupported(signal)) })
    }

    /// Run `command` to completion. A non-zero exit is
    /// [`RexError::ExitStatus`].
    fn run<'a>(&'a self, command: &'a str, io: SessionIo) -> BoxFuture<'a, RexResult<()>>;

    /// Start a login shell and wait for it to exit.
    fn shell(&self, io: SessionIo) -> BoxFuture<'_, RexResult<()>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorizer_debug_hides_password() {
        let auth = Authorizer::password("hunter2");
        assert!(!format!("{auth:?}").contains("hunter2"));
    }

    #[test]
    fn authorizer_from_config() {
        let auth: Authorizer =
            serde_json::from_str(r#"{"method":"password","password":"pw"}"#).unwrap();
        let Authorizer::Password { password } = auth;
        assert_eq!(password, "pw");
    }

    #[test]
    fn xterm_request_uses_default_modes() {
        let req = PtyRequest::xterm(40, 80);
        assert_eq!(req.term, "xterm");
        assert_eq!(req.size, WindowSize { rows: 40, cols: 80 });
        assert_eq!(req.modes.len(), 3);
        assert!(req
            .modes
            .contains(&TerminalMode { opcode: TTY_OP_ECHO, value: 1 }));
    }
}
