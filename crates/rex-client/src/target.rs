//! Targets: authenticated connections that run commands.
//!
//! [`ConnectionManager`] owns one connection made through a [`Dialer`] and a
//! [`Connector`]. Every [`SessionHandle`] it creates shares the connection and
//! its connection-wide cancellation token. [`Target::close`] cancels that
//! token, waits for every in-flight command to finish, then closes the
//! connection exactly once.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use rex_core::error::{RexError, RexResult};
use rex_core::recorder::Recorder;
use rex_core::transport::{Connector, Dialer, HandshakeParams, RemoteClient};

use crate::config::TargetConfig;
use crate::session::{Binding, SessionHandle};

/// A system commands can be run on.
pub trait Target: Send + Sync {
    fn name(&self) -> &str;

    /// Prepare `command` with `args` for execution. Nothing runs until the
    /// returned handle is run or started.
    fn command(&self, command: &str, args: &[&str]) -> SessionHandle;

    /// Cancel all commands, wait for them, and close the connection.
    ///
    /// Calls after the first return `Ok(())` without doing anything.
    fn close(&self) -> BoxFuture<'_, RexResult<()>>;
}

pub struct ConnectionManager {
    name: String,
    address: String,
    client: Arc<dyn RemoteClient>,
    /// Parent of every session; cancelled on close.
    sessions: CancellationToken,
    /// Tracks commands that have been run or started.
    tracker: TaskTracker,
    closed: tokio::sync::Mutex<bool>,
}

impl ConnectionManager {
    /// Dial `config`'s address and authenticate.
    ///
    /// If `cancel` fires before the handshake completes, the connection is
    /// dropped and a cancellation error returned.
    ///
    /// # Panics
    ///
    /// Panics if `config` has no authorizers.
    pub async fn connect(
        cancel: &CancellationToken,
        dialer: &dyn Dialer,
        connector: &dyn Connector,
        config: &TargetConfig,
    ) -> RexResult<Self> {
        let auths = config.authorizers();
        assert!(!auths.is_empty(), "no authorizers given for target {}", config.name);
        let host_key = config.host_key.clone().ok_or_else(|| {
            RexError::Config(format!("no host key policy for target {}", config.name))
        })?;

        let address = config.address();
        debug!(
            name = %config.name,
            %address,
            user = %config.user,
            "connecting to target"
        );

        let conn = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RexError::cancelled("dial")),
            result = dialer.dial(&address, cancel) => result?,
        };

        let params = HandshakeParams {
            address: address.clone(),
            username: config.user.clone(),
            auths,
            host_key,
        };
        let client = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(%address, "handshake cancelled, closing connection");
                return Err(RexError::cancelled("handshake"));
            }
            result = connector.handshake(conn, &params) => result?,
        };

        debug!(name = %config.name, %address, "connected");
        Ok(Self {
            name: config.name.clone(),
            address,
            client,
            sessions: CancellationToken::new(),
            tracker: TaskTracker::new(),
            closed: tokio::sync::Mutex::new(false),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Number of commands currently running.
    pub fn running(&self) -> usize {
        self.tracker.len()
    }

    async fn shutdown(&self) -> RexResult<()> {
        let mut closed = self.closed.lock().await;
        if *closed {
            return Ok(());
        }

        debug!(name = %self.name, address = %self.address, "closing target");
        self.sessions.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        *closed = true;
        match self.client.close().await {
            Ok(()) => {
                debug!(name = %self.name, "target closed");
                Ok(())
            }
            Err(e) => {
                warn!(name = %self.name, "error closing connection: {}", e);
                Err(RexError::target(&self.name, e))
            }
        }
    }
}

impl Target for ConnectionManager {
    fn name(&self) -> &str {
        &self.name
    }

    fn command(&self, command: &str, args: &[&str]) -> SessionHandle {
        let recorder = Arc::new(Recorder::new());
        recorder.set_command(command, args.iter().copied());
        SessionHandle::new(
            Binding {
                target: self.name.clone(),
                client: self.client.clone(),
                sessions: self.sessions.clone(),
                tracker: self.tracker.clone(),
            },
            recorder,
        )
    }

    fn close(&self) -> BoxFuture<'_, RexResult<()>> {
        Box::pin(self.shutdown())
    }
}
