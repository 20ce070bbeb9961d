//! One-shot execution of a command on a target.
//!
//! A [`SessionHandle`] is created by [`Target::command`](crate::Target::command),
//! configured with the `set_*` methods, then executed exactly once with
//! either [`run`](SessionHandle::run) or [`start`](SessionHandle::start) +
//! [`wait`](SessionHandle::wait). Output is captured by the handle's
//! [`Recorder`] whatever the outcome.
//!
//! Execution observes two cancellation sources: the token passed by the
//! caller and the target's connection-wide token, cancelled by
//! [`Target::close`](crate::Target::close). Whichever fires first ends the
//! command.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use rex_core::cancel::{link, LinkedCancel};
use rex_core::error::{RexError, RexResult};
use rex_core::escape::{EscapeReader, EscapeSequences};
use rex_core::recorder::{BoxWriter, OutputStream, Recorder, ESCAPE_EVENT};
use rex_core::signal::Signal;
use rex_core::transport::{PtyRequest, RemoteClient, WindowSize};

use crate::exec::{self, ActiveSession, AsyncErrorSink, RunConfig};

/// The state of a session handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Configured but not yet executed.
    Created,
    Running,
    Completed,
    /// The command failed or exited non-zero.
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_done(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Cancelled
        )
    }
}

/// Settings collected before execution.
#[derive(Default)]
struct Pending {
    stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
    env: BTreeMap<String, String>,
    pty: Option<PtyRequest>,
    window_changes: Option<mpsc::Receiver<WindowSize>>,
    async_error: Option<AsyncErrorSink>,
}

enum Launch {
    Idle,
    Ran,
    Started(oneshot::Receiver<RexResult<()>>),
    Waited,
}

/// What the owning connection hands to each handle.
#[derive(Clone)]
pub(crate) struct Binding {
    pub target: String,
    pub client: Arc<dyn RemoteClient>,
    /// Cancelled when the connection closes.
    pub sessions: CancellationToken,
    pub tracker: TaskTracker,
}

pub struct SessionHandle {
    binding: Binding,
    recorder: Arc<Recorder>,
    pending: Mutex<Pending>,
    launch: Mutex<Launch>,
    state: Arc<Mutex<SessionState>>,
    active: ActiveSession,
}

impl SessionHandle {
    pub(crate) fn new(binding: Binding, recorder: Arc<Recorder>) -> Self {
        Self {
            binding,
            recorder,
            pending: Mutex::new(Pending::default()),
            launch: Mutex::new(Launch::Idle),
            state: Arc::new(Mutex::new(SessionState::Created)),
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// The recorder capturing this command's output.
    ///
    /// After [`start`](Self::start), only read it once
    /// [`wait`](Self::wait) has returned.
    pub fn recorder(&self) -> Arc<Recorder> {
        self.recorder.clone()
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// The command line sent to the remote side.
    pub fn command_line(&self) -> String {
        self.recorder.command_line()
    }

    pub fn set_input<R>(&self, stdin: R)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        self.pending.lock().stdin = Some(Box::new(stdin));
    }

    /// Set the input, watching it for escape sequences.
    ///
    /// Input is forwarded unchanged. Each time a sequence is seen, an
    /// [`ESCAPE_EVENT`] is logged to the recorder before its callback runs.
    pub fn set_input_with_escapes<R>(&self, stdin: R, sequences: EscapeSequences)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let logged = sequences.with_hook({
            let recorder = self.recorder.clone();
            move |sequence: &[u8]| {
                recorder.add_special_event(
                    ESCAPE_EVENT,
                    String::from_utf8_lossy(sequence).into_owned(),
                );
            }
        });
        self.set_input(EscapeReader::new(stdin, logged));
    }

    /// Forward output live to `stdout` and `stderr` as well as recording it.
    pub fn set_output(&self, stdout: Option<BoxWriter>, stderr: Option<BoxWriter>) {
        self.recorder.set_passthrough(stdout, stderr);
    }

    pub fn set_env<I, K, V>(&self, vars: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.pending.lock().env = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
    }

    /// Request a PTY of the given size. A zero dimension clears the request.
    pub fn set_term(&self, rows: u32, cols: u32) {
        self.pending.lock().pty = if rows == 0 || cols == 0 {
            None
        } else {
            Some(PtyRequest::xterm(rows, cols))
        };
    }

    /// Forward terminal size updates received on `sizes` while the command
    /// runs.
    pub fn set_window_change(&self, sizes: mpsc::Receiver<WindowSize>) {
        self.pending.lock().window_changes = Some(sizes);
    }

    /// Replace the default error sink, which logs, for failures that happen
    /// in the background.
    pub fn set_async_error_sink<F>(&self, sink: F)
    where
        F: Fn(RexError) + Send + Sync + 'static,
    {
        self.pending.lock().async_error = Some(Arc::new(sink));
    }

    /// Record an out-of-band event alongside the output.
    pub fn log_event(&self, event_type: &str, details: impl Into<serde_json::Value>) {
        self.recorder.add_special_event(event_type, details);
    }

    /// Deliver `signal` to the running remote command.
    pub async fn signal(&self, signal: Signal) -> RexResult<()> {
        let session = self.active.lock().clone().ok_or(RexError::NotRunning)?;
        session.signal(signal).await
    }

    /// Run the command and wait for it to finish.
    ///
    /// On failure the error is wrapped with the command line; the recorder
    /// still holds whatever output arrived and is available from
    /// [`recorder`](Self::recorder).
    pub async fn run(&self, cancel: &CancellationToken) -> RexResult<Arc<Recorder>> {
        let config = self.begin(Launch::Ran)?;
        let linked = self.link(cancel);
        let result = execute(config, &linked, cancel, &self.binding, &self.active).await;
        // Final state is visible before the connection stops tracking us.
        settle(&self.state, &result);
        linked.finish().await;
        debug!(name = %self.binding.target, command = %self.command_line(), "finished run of command");

        result
            .map(|()| self.recorder.clone())
            .map_err(|e| RexError::command(self.command_line(), e))
    }

    /// Start the command in the background and return its recorder.
    ///
    /// Use [`wait`](Self::wait) to collect the result. Must be called from
    /// within a tokio runtime.
    pub fn start(&self, cancel: &CancellationToken) -> RexResult<Arc<Recorder>> {
        let (tx, rx) = oneshot::channel();
        let config = self.begin(Launch::Started(rx))?;
        let linked = self.link(cancel);

        let cancel = cancel.clone();
        let binding = self.binding.clone();
        let active = self.active.clone();
        let state = self.state.clone();
        let command = self.command_line();

        tokio::spawn(async move {
            let result = execute(config, &linked, &cancel, &binding, &active).await;
            settle(&state, &result);
            linked.finish().await;
            debug!(name = %binding.target, command = %command, "finished started command");
            let _ = tx.send(result.map_err(|e| RexError::command(command, e)));
        });

        Ok(self.recorder.clone())
    }

    /// Wait for a command launched with [`start`](Self::start).
    pub async fn wait(&self) -> RexResult<()> {
        let rx = {
            let mut launch = self.launch.lock();
            match std::mem::replace(&mut *launch, Launch::Waited) {
                Launch::Started(rx) => rx,
                Launch::Waited => return Err(RexError::AlreadyWaited),
                other => {
                    *launch = other;
                    return Err(RexError::NotStarted);
                }
            }
        };
        rx.await
            .unwrap_or_else(|_| Err(RexError::Session("command task ended without a result".into())))
    }

    /// Claim the one execution this handle allows, leaving `claimed` as the
    /// launch state, and build the run configuration.
    fn begin(&self, claimed: Launch) -> RexResult<RunConfig> {
        {
            let mut launch = self.launch.lock();
            if !matches!(*launch, Launch::Idle) {
                return Err(RexError::AlreadyStarted);
            }
            *launch = claimed;
        }
        *self.state.lock() = SessionState::Running;

        let pending = std::mem::take(&mut *self.pending.lock());
        let command = self.recorder.command_line();
        let (recorder, timed) = (self.recorder.clone(), self.recorder.clone());
        let finished = command.clone();
        Ok(RunConfig {
            async_error: pending
                .async_error
                .unwrap_or_else(|| exec::log_async_errors(command.clone())),
            command,
            stdin: pending.stdin,
            stdout: self.recorder.sink(OutputStream::Stdout),
            stderr: self.recorder.sink(OutputStream::Stderr),
            pty: pending.pty,
            window_changes: pending.window_changes,
            env: pending.env,
            pre_run: Some(Box::new(move || recorder.begin_timing())),
            post_run: Some(Box::new(move || {
                if let Some(start) = timed.baseline() {
                    debug!(command = %finished, elapsed = ?start.elapsed(), "remote command returned");
                }
            })),
        })
    }

    /// Derive the execution token from the caller's and the connection's,
    /// holding the connection open until the watcher exits.
    fn link(&self, cancel: &CancellationToken) -> LinkedCancel {
        let in_flight = self.binding.tracker.token();
        let target = self.binding.target.clone();
        let command = self.command_line();
        link(&[cancel, &self.binding.sessions], move || {
            debug!(name = %target, command = %command, "finishing up command");
            drop(in_flight);
        })
    }
}

async fn execute(
    config: RunConfig,
    linked: &LinkedCancel,
    caller: &CancellationToken,
    binding: &Binding,
    active: &ActiveSession,
) -> RexResult<()> {
    let cancelled = || {
        if !caller.is_cancelled() && binding.sessions.is_cancelled() {
            RexError::CancelledByTarget {
                target: binding.target.clone(),
            }
        } else {
            RexError::cancelled("command")
        }
    };

    if linked.is_cancelled() {
        return Err(cancelled());
    }
    tokio::select! {
        biased;
        _ = linked.token().cancelled() => Err(cancelled()),
        result = exec::run_command(binding.client.as_ref(), config, active) => result,
    }
}

fn settle(state: &Mutex<SessionState>, result: &RexResult<()>) {
    *state.lock() = match result {
        Ok(()) => SessionState::Completed,
        Err(e) if e.is_cancelled() => SessionState::Cancelled,
        Err(_) => SessionState::Failed,
    };
}
