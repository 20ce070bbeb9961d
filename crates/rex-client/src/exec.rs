//! Bridge from a prepared command configuration to one remote session.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use rex_core::error::{RexError, RexResult};
use rex_core::transport::{OutputSink, PtyRequest, RemoteClient, RemoteSession, SessionIo, WindowSize};

/// Receives failures from background work that has no caller to return to,
/// such as window-change forwarding.
pub type AsyncErrorSink = Arc<dyn Fn(RexError) + Send + Sync>;

/// Sink that logs the error against `command`.
pub fn log_async_errors(command: String) -> AsyncErrorSink {
    Arc::new(move |err| error!(command = %command, "error in remote session: {}", err))
}

/// Slot holding the remote session while a command runs.
pub(crate) type ActiveSession = Arc<Mutex<Option<Arc<dyn RemoteSession>>>>;

pub(crate) type Hook = Box<dyn FnOnce() + Send>;

/// Everything needed to run one command.
pub(crate) struct RunConfig {
    /// Command line to run; empty requests an interactive shell.
    pub command: String,
    pub stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub stdout: Arc<dyn OutputSink>,
    pub stderr: Arc<dyn OutputSink>,
    pub pty: Option<PtyRequest>,
    pub window_changes: Option<mpsc::Receiver<WindowSize>>,
    pub env: BTreeMap<String, String>,
    pub async_error: AsyncErrorSink,
    pub pre_run: Option<Hook>,
    pub post_run: Option<Hook>,
}

struct OnDrop<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Drop for OnDrop<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

/// Open a session on `client` and run `config` to completion.
///
/// Dropping the returned future abandons the remote session. The post-run
/// hook, clearing of `active` and the window-change forwarder shutdown happen
/// on every exit path, including that one.
pub(crate) async fn run_command(
    client: &dyn RemoteClient,
    mut config: RunConfig,
    active: &ActiveSession,
) -> RexResult<()> {
    let session = client.open_session().await?;

    for (key, value) in &config.env {
        session.set_env(key, value).await?;
    }

    if let Some(pty) = &config.pty {
        session
            .request_pty(pty)
            .await
            .map_err(|e| RexError::PtyUnavailable(e.to_string()))?;
    }

    *active.lock() = Some(session.clone());
    let _clear_active = OnDrop(Some(|| *active.lock() = None));

    let done = CancellationToken::new();
    let _stop_forwarder = done.clone().drop_guard();
    if let Some(rx) = config.window_changes.take() {
        tokio::spawn(forward_window_changes(
            session.clone(),
            rx,
            done,
            config.async_error.clone(),
        ));
    }

    if let Some(pre_run) = config.pre_run.take() {
        pre_run();
    }
    let _post_run = OnDrop(config.post_run.take());

    let io = SessionIo {
        stdin: config.stdin.take(),
        stdout: config.stdout.clone(),
        stderr: config.stderr.clone(),
    };
    if config.command.is_empty() {
        debug!("starting interactive shell");
        session.shell(io).await
    } else {
        debug!(command = %config.command, "running command");
        session.run(&config.command, io).await
    }
}

async fn forward_window_changes(
    session: Arc<dyn RemoteSession>,
    mut sizes: mpsc::Receiver<WindowSize>,
    done: CancellationToken,
    on_error: AsyncErrorSink,
) {
    loop {
        tokio::select! {
            _ = done.cancelled() => break,
            size = sizes.recv() => match size {
                Some(size) => {
                    if let Err(e) = session.window_change(size).await {
                        on_error(RexError::Session(format!("unable to update window dimensions: {e}")));
                    }
                }
                None => break,
            },
        }
    }
}
