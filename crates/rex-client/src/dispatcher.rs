//! Process signal handling.
//!
//! A [`SignalDispatcher`] routes both OS signals and virtual ones injected
//! with [`SignalDispatcher::send`] to handlers registered per [`Signal`].
//! Handlers run one at a time on the dispatcher's task, so a slow handler
//! delays the ones after it. A panicking handler is logged and dispatch
//! carries on.
//!
//! Signals that cannot be caught (`KILL`, and the synchronous faults `FPE`,
//! `ILL`, `SEGV`) can still be delivered virtually.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use rex_core::callback::invoke_guarded;
use rex_core::error::{RexError, RexResult};
use rex_core::signal::Signal;

pub type SignalHandler = Arc<dyn Fn(Signal) + Send + Sync>;

/// Handlers keyed by signal, plus a fallback for the rest.
#[derive(Default, Clone)]
pub struct SignalHandlers {
    handlers: HashMap<Signal, SignalHandler>,
    fallback: Option<SignalHandler>,
}

impl SignalHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F>(mut self, signal: Signal, handler: F) -> Self
    where
        F: Fn(Signal) + Send + Sync + 'static,
    {
        self.handlers.insert(signal, Arc::new(handler));
        self
    }

    /// Handler for every signal without one of its own.
    pub fn default_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(Signal) + Send + Sync + 'static,
    {
        self.fallback = Some(Arc::new(handler));
        self
    }

    fn handler_for(&self, signal: Signal) -> Option<&SignalHandler> {
        self.handlers.get(&signal).or(self.fallback.as_ref())
    }
}

struct Running {
    virtual_tx: mpsc::UnboundedSender<Signal>,
    stop: CancellationToken,
    tasks: TaskTracker,
}

/// Owner of this process's signal handling.
///
/// Create one per process and share it by reference.
#[derive(Default)]
pub struct SignalDispatcher {
    running: Mutex<Option<Running>>,
}

impl SignalDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_handling(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Start dispatching signals to `handlers`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn begin(&self, handlers: SignalHandlers) -> RexResult<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(RexError::HandlersAlreadySet);
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Signal>();
        let stop = CancellationToken::new();
        let tasks = TaskTracker::new();
        forward_os_signals(&tasks, &tx, &stop)?;

        let dispatch_stop = stop.clone();
        tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = dispatch_stop.cancelled() => break,
                    received = rx.recv() => match received {
                        Some(signal) => {
                            if let Some(handler) = handlers.handler_for(signal) {
                                let what = format!("handler for {signal}");
                                invoke_guarded(&what, || handler(signal));
                            }
                        }
                        None => break,
                    },
                }
            }
            debug!("stopping signal handling loop");
        });
        tasks.close();

        *running = Some(Running {
            virtual_tx: tx,
            stop,
            tasks,
        });
        debug!("signal handling started");
        Ok(())
    }

    /// Deliver `signal` to its handler as if the OS had raised it.
    pub fn send(&self, signal: Signal) -> RexResult<()> {
        let running = self.running.lock();
        let running = running.as_ref().ok_or(RexError::HandlersNotSet)?;
        debug!(%signal, "sending virtual signal");
        running
            .virtual_tx
            .send(signal)
            .map_err(|_| RexError::HandlersNotSet)
    }

    /// Stop dispatching and wait for the dispatcher's tasks to exit.
    ///
    /// Signals still queued are dropped. Handling can be started again
    /// afterwards.
    pub async fn stop(&self) -> RexResult<()> {
        let running = self.running.lock().take().ok_or(RexError::HandlersNotSet)?;
        running.stop.cancel();
        running.tasks.wait().await;
        debug!("signal handling stopped");
        Ok(())
    }
}

/// Spawn one task per catchable OS signal, feeding `tx` until `stop` fires.
#[cfg(unix)]
fn forward_os_signals(
    tasks: &TaskTracker,
    tx: &mpsc::UnboundedSender<Signal>,
    stop: &CancellationToken,
) -> RexResult<()> {
    use tokio::signal::unix::{signal as os_signal, SignalKind};

    // Register everything before spawning so a failure leaves nothing behind.
    let streams = Signal::ALL
        .into_iter()
        .filter(|s| s.is_catchable())
        .map(|s| -> RexResult<_> { Ok((s, os_signal(SignalKind::from_raw(s.as_raw()))?)) })
        .collect::<RexResult<Vec<_>>>()?;

    for (signal, mut stream) in streams {
        let (tx, stop) = (tx.clone(), stop.clone());
        tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    received = stream.recv() => match received {
                        Some(()) => {
                            debug!(%signal, "handling OS signal");
                            if tx.send(signal).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn forward_os_signals(
    _tasks: &TaskTracker,
    _tx: &mpsc::UnboundedSender<Signal>,
    _stop: &CancellationToken,
) -> RexResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    type Seen = Arc<Mutex<Vec<(&'static str, Signal)>>>;

    fn recording(seen: &Seen, label: &'static str) -> impl Fn(Signal) + Send + Sync + 'static {
        let seen = seen.clone();
        move |signal| seen.lock().push((label, signal))
    }

    async fn wait_for(seen: &Seen, entry: (&'static str, Signal)) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !seen.lock().contains(&entry) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("handler never saw {entry:?}"));
    }

    #[tokio::test]
    async fn virtual_signals_reach_handlers() {
        let seen: Seen = Default::default();
        let dispatcher = SignalDispatcher::new();
        dispatcher
            .begin(
                SignalHandlers::new()
                    .add(Signal::Kill, recording(&seen, "kill"))
                    .default_handler(recording(&seen, "default")),
            )
            .unwrap();
        assert!(dispatcher.is_handling());

        dispatcher.send(Signal::Kill).unwrap();
        dispatcher.send(Signal::Segv).unwrap();
        wait_for(&seen, ("kill", Signal::Kill)).await;
        wait_for(&seen, ("default", Signal::Segv)).await;

        dispatcher.stop().await.unwrap();
        assert!(!dispatcher.is_handling());
    }

    #[tokio::test]
    async fn begin_twice_is_rejected() {
        let dispatcher = SignalDispatcher::new();
        dispatcher.begin(SignalHandlers::new()).unwrap();
        assert!(matches!(
            dispatcher.begin(SignalHandlers::new()),
            Err(RexError::HandlersAlreadySet)
        ));
        dispatcher.stop().await.unwrap();

        // Can be restarted once stopped.
        dispatcher.begin(SignalHandlers::new()).unwrap();
        dispatcher.stop().await.unwrap();
    }

    #[tokio::test]
    async fn idle_dispatcher_rejects_send_and_stop() {
        let dispatcher = SignalDispatcher::new();
        assert!(matches!(
            dispatcher.send(Signal::Int),
            Err(RexError::HandlersNotSet)
        ));
        assert!(matches!(
            dispatcher.stop().await,
            Err(RexError::HandlersNotSet)
        ));
    }

    #[tokio::test]
    async fn panicking_handler_does_not_stop_dispatch() {
        let seen: Seen = Default::default();
        let dispatcher = SignalDispatcher::new();
        dispatcher
            .begin(
                SignalHandlers::new()
                    .add(Signal::Abrt, |_| panic!("handler failure"))
                    .add(Signal::Alrm, recording(&seen, "alrm")),
            )
            .unwrap();

        dispatcher.send(Signal::Abrt).unwrap();
        dispatcher.send(Signal::Alrm).unwrap();
        wait_for(&seen, ("alrm", Signal::Alrm)).await;
        dispatcher.stop().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn os_signals_reach_handlers() {
        let seen: Seen = Default::default();
        let dispatcher = SignalDispatcher::new();
        dispatcher
            .begin(SignalHandlers::new().add(Signal::Usr2, recording(&seen, "usr2")))
            .unwrap();

        // SAFETY: raising a signal that has a handler installed.
        let rc = unsafe { libc::raise(libc::SIGUSR2) };
        assert_eq!(rc, 0);
        wait_for(&seen, ("usr2", Signal::Usr2)).await;
        dispatcher.stop().await.unwrap();
    }
}
