//! Layered cancellation: one derived token that fires when any of several
//! parents fires.
//!
//! Every command runs under at least two independent cancellation sources,
//! the caller's token and the connection-wide one. [`link`] spawns a single
//! watcher task that races them and cancels the derived token on the first
//! to fire. The watcher always exits, either because a parent fired or
//! because the derived token was cancelled by [`LinkedCancel::finish`] or by
//! dropping the handle, and runs its finish hook exactly once on the way out.

use futures_util::future::select_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct FinishGuard<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Drop for FinishGuard<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

/// A derived cancellation token plus the watcher feeding it.
pub struct LinkedCancel {
    token: CancellationToken,
    watcher: Option<JoinHandle<()>>,
}

/// Derive a token cancelled as soon as any of `parents` is.
///
/// `on_finish` runs once when the watcher exits. Must be called from within
/// a tokio runtime.
pub fn link<F>(parents: &[&CancellationToken], on_finish: F) -> LinkedCancel
where
    F: FnOnce() + Send + 'static,
{
    let token = CancellationToken::new();
    if parents.iter().any(|parent| parent.is_cancelled()) {
        token.cancel();
    }
    let child = token.clone();
    let waits: Vec<_> = parents
        .iter()
        .map(|parent| Box::pin((*parent).clone().cancelled_owned()))
        .collect();

    let watcher = tokio::spawn(async move {
        let _finish = FinishGuard(Some(on_finish));
        let any_parent = async move {
            if waits.is_empty() {
                std::future::pending::<()>().await;
            } else {
                select_all(waits).await;
            }
        };
        tokio::select! {
            _ = any_parent => child.cancel(),
            _ = child.cancelled() => {}
        }
    });

    LinkedCancel {
        token,
        watcher: Some(watcher),
    }
}

impl LinkedCancel {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stop the watcher and wait for it, so the finish hook has run by the
    /// time this returns.
    pub async fn finish(mut self) {
        self.token.cancel();
        if let Some(watcher) = self.watcher.take() {
            let _ = watcher.await;
        }
    }
}

impl Drop for LinkedCancel {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
