//! In-memory transport used by the tests in this crate.
//!
//! `StubDialer` hands out `tokio::io::duplex` pipes and `StubConnector`
//! authenticates user `test` with password `Password123`, then serves a small
//! table of canned commands. `disconnect` fails the way a dropped connection
//! does.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use rex_core::error::{RexError, RexResult};
use rex_core::hostkey::HostKeyPolicy;
use rex_core::signal::Signal;
use rex_core::transport::{
    Authorizer, BoxConn, Connector, Dialer, HandshakeParams, PtyRequest, RemoteClient,
    RemoteSession, SessionIo, WindowSize,
};

use crate::config::TargetConfig;
use crate::target::ConnectionManager;

pub const USER: &str = "test";
pub const PASSWORD: &str = "Password123";
pub const HOST_KEY: &[u8] = b"stub-host-key";

/// User whose handshake never completes.
pub const HANGING_USER: &str = "hang";

/// Observable state shared by every piece of the stub.
#[derive(Default)]
pub struct StubState {
    pub dials: AtomicUsize,
    pub close_calls: AtomicUsize,
    pub sessions_opened: AtomicUsize,
    pub deny_pty: AtomicBool,
    pub support_signals: AtomicBool,
    /// Remote ends of every dialed connection.
    pub peers: Mutex<Vec<DuplexStream>>,
    pub last_session: Mutex<Option<Arc<StubSession>>>,
}

#[derive(Clone, Default)]
pub struct StubDialer {
    pub state: Arc<StubState>,
}

impl Dialer for StubDialer {
    fn dial<'a>(
        &'a self,
        _address: &'a str,
        _cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, RexResult<BoxConn>> {
        Box::pin(async move {
            self.state.dials.fetch_add(1, Ordering::SeqCst);
            let (local, remote) = tokio::io::duplex(1024);
            self.state.peers.lock().push(remote);
            Ok(Box::new(local) as BoxConn)
        })
    }
}

#[derive(Clone, Default)]
pub struct StubConnector {
    pub state: Arc<StubState>,
}

impl Connector for StubConnector {
    fn handshake<'a>(
        &'a self,
        mut conn: BoxConn,
        params: &'a HandshakeParams,
    ) -> BoxFuture<'a, RexResult<Arc<dyn RemoteClient>>> {
        Box::pin(async move {
            if params.username == HANGING_USER {
                // Wait for bytes the peer never sends.
                let mut buf = [0u8; 1];
                let _ = conn.read(&mut buf).await;
                return Err(RexError::Handshake("connection closed".into()));
            }

            params.host_key.verify(&params.address, HOST_KEY)?;

            let password_ok = params
                .auths
                .iter()
                .any(|Authorizer::Password { password }| password == PASSWORD);
            if params.username != USER || !password_ok {
                return Err(RexError::AuthFailed(format!(
                    "no supported methods remain for {}",
                    params.username
                )));
            }

            Ok(Arc::new(StubClient {
                state: self.state.clone(),
                conn: Mutex::new(Some(conn)),
            }) as Arc<dyn RemoteClient>)
        })
    }
}

struct StubClient {
    state: Arc<StubState>,
    conn: Mutex<Option<BoxConn>>,
}

impl RemoteClient for StubClient {
    fn open_session(&self) -> BoxFuture<'_, RexResult<Arc<dyn RemoteSession>>> {
        Box::pin(async move {
            self.state.sessions_opened.fetch_add(1, Ordering::SeqCst);
            let session = Arc::new(StubSession {
                deny_pty: self.state.deny_pty.load(Ordering::SeqCst),
                support_signals: self.state.support_signals.load(Ordering::SeqCst),
                ..StubSession::default()
            });
            *self.state.last_session.lock() = Some(session.clone());
            Ok(session as Arc<dyn RemoteSession>)
        })
    }

    fn close(&self) -> BoxFuture<'_, RexResult<()>> {
        Box::pin(async move {
            self.state.close_calls.fetch_add(1, Ordering::SeqCst);
            self.conn.lock().take();
            Ok(())
        })
    }
}

#[derive(Default)]
pub struct StubSession {
    pub env: Mutex<BTreeMap<String, String>>,
    pub pty: Mutex<Option<PtyRequest>>,
    pub window_sizes: Mutex<Vec<WindowSize>>,
    pub signals: Mutex<Vec<Signal>>,
    pub shell_started: AtomicBool,
    signalled: Notify,
    deny_pty: bool,
    support_signals: bool,
}

impl RemoteSession for StubSession {
    fn set_env<'a>(&'a self, key: &'a str, value: &'a str) -> BoxFuture<'a, RexResult<()>> {
        Box::pin(async move {
            self.env.lock().insert(key.to_string(), value.to_string());
            Ok(())
        })
    }

    fn request_pty<'a>(&'a self, request: &'a PtyRequest) -> BoxFuture<'a, RexResult<()>> {
        Box::pin(async move {
            if self.deny_pty {
                return Err(RexError::Session("pty request denied".into()));
            }
            *self.pty.lock() = Some(request.clone());
            Ok(())
        })
    }

    fn window_change(&self, size: WindowSize) -> BoxFuture<'_, RexResult<()>> {
        Box::pin(async move {
            if size.rows == 0 {
                return Err(RexError::Session("zero rows".into()));
            }
            self.window_sizes.lock().push(size);
            Ok(())
        })
    }

    fn signal(&self, signal: Signal) -> BoxFuture<'_, RexResult<()>> {
        Box::pin(async move {
            if !self.support_signals {
                return Err(RexError::SignalUnsupported(signal));
            }
            self.signals.lock().push(signal);
            self.signalled.notify_one();
            Ok(())
        })
    }

    fn run<'a>(&'a self, command: &'a str, io: SessionIo) -> BoxFuture<'a, RexResult<()>> {
        Box::pin(async move {
            let mut words = command.split_whitespace();
            match words.next().unwrap_or_default() {
                "whoami" => io.stdout.write(b"test\n").await,
                "env" => {
                    let listing: String = self
                        .env
                        .lock()
                        .iter()
                        .map(|(k, v)| format!("{k}={v}\n"))
                        .collect();
                    io.stdout.write(listing.as_bytes()).await
                }
                "cat" => {
                    if let Some(mut stdin) = io.stdin {
                        let mut buf = [0u8; 256];
                        loop {
                            let n = stdin.read(&mut buf).await?;
                            if n == 0 {
                                break;
                            }
                            io.stdout.write(&buf[..n]).await?;
                        }
                    }
                    Ok(())
                }
                "sleep" => std::future::pending().await,
                "wait-signal" => {
                    self.signalled.notified().await;
                    let last = self.signals.lock().last().copied();
                    if let Some(signal) = last {
                        io.stdout.write(format!("got {signal}\n").as_bytes()).await?;
                    }
                    Ok(())
                }
                "disconnect" => {
                    io.stdout.write(b"bye\n").await?;
                    Err(RexError::Transport("connection reset by peer".into()))
                }
                "fail" => {
                    io.stdout.write(b"partial\n").await?;
                    io.stderr.write(b"boom\n").await?;
                    Err(RexError::ExitStatus {
                        code: 1,
                        message: None,
                    })
                }
                _ => {
                    io.stderr.write(b"cmd not found\n").await?;
                    Err(RexError::ExitStatus {
                        code: 127,
                        message: None,
                    })
                }
            }
        })
    }

    fn shell(&self, io: SessionIo) -> BoxFuture<'_, RexResult<()>> {
        Box::pin(async move {
            self.shell_started.store(true, Ordering::SeqCst);
            io.stdout.write(b"$ ").await
        })
    }
}

pub fn target_config(name: &str) -> TargetConfig {
    TargetConfig {
        name: name.to_string(),
        host: "stub.local".to_string(),
        port: 22,
        user: USER.to_string(),
        password: Some(PASSWORD.to_string()),
        auth: Vec::new(),
        host_key: Some(HostKeyPolicy::fixed_key(HOST_KEY)),
    }
}

/// Connect a fresh stub target.
pub async fn connect(name: &str) -> (ConnectionManager, Arc<StubState>) {
    let state = Arc::new(StubState::default());
    let dialer = StubDialer {
        state: state.clone(),
    };
    let connector = StubConnector {
        state: state.clone(),
    };
    let manager = ConnectionManager::connect(
        &CancellationToken::new(),
        &dialer,
        &connector,
        &target_config(name),
    )
    .await
    .expect("stub connect");
    (manager, state)
}
