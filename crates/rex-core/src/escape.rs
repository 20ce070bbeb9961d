//! Escape-sequence detection on a live input stream.
//!
//! An escape sequence is a fixed run of bytes (e.g. `"\n~."`) typed into the
//! input of a remote command that should trigger a local action instead of
//! only being forwarded. [`EscapeMatcher`] tracks every registered sequence
//! independently and fires its callback once per disjoint occurrence.
//!
//! Matching is greedy and not overlap-aware: the byte that completes a match
//! is consumed by that match and cannot also start the next one, even if it
//! equals the first byte of another sequence.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, ReadBuf};

use crate::callback::invoke_guarded;

/// Action run when a sequence is detected.
pub type EscapeCallback = Arc<dyn Fn() + Send + Sync>;

/// An ordered set of `(sequence, callback)` pairs to register at once.
#[derive(Default, Clone)]
pub struct EscapeSequences {
    entries: Vec<(Vec<u8>, EscapeCallback)>,
}

impl EscapeSequences {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sequence and the action to run when it is seen.
    pub fn add<F>(mut self, sequence: impl Into<Vec<u8>>, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.entries.push((sequence.into(), Arc::new(callback)));
        self
    }

    /// Run `hook` with the matched sequence before each callback.
    pub fn with_hook<H>(self, hook: H) -> Self
    where
        H: Fn(&[u8]) + Send + Sync + 'static,
    {
        let hook = Arc::new(hook);
        let entries = self
            .entries
            .into_iter()
            .map(|(sequence, callback)| {
                let hook = hook.clone();
                let seen = sequence.clone();
                let wrapped: EscapeCallback = Arc::new(move || {
                    hook(&seen);
                    callback();
                });
                (sequence, wrapped)
            })
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for EscapeSequences {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(seq, _)| seq))
            .finish()
    }
}

struct Tracked {
    sequence: Vec<u8>,
    /// Bytes of `sequence` matched so far, in `0..sequence.len()`.
    progress: usize,
    callback: EscapeCallback,
}

/// Streaming multi-pattern matcher.
///
/// Callbacks run synchronously on the thread delivering bytes, after the
/// progress table has been updated and unlocked, so a callback may safely
/// register further sequences.
#[derive(Default)]
pub struct EscapeMatcher {
    table: Mutex<Vec<Tracked>>,
}

impl EscapeMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sequences(sequences: EscapeSequences) -> Self {
        let matcher = Self::new();
        matcher.register_all(sequences);
        matcher
    }

    /// Register `sequence`, replacing the callback if it is already known.
    ///
    /// Re-registering keeps the sequence's current match progress.
    ///
    /// # Panics
    ///
    /// Panics if `sequence` is empty.
    pub fn register<F>(&self, sequence: impl Into<Vec<u8>>, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.insert(sequence.into(), Arc::new(callback));
    }

    pub fn register_all(&self, sequences: EscapeSequences) {
        for (sequence, callback) in sequences.entries {
            self.insert(sequence, callback);
        }
    }

    fn insert(&self, sequence: Vec<u8>, callback: EscapeCallback) {
        assert!(!sequence.is_empty(), "empty escape sequence");
        let mut table = self.table.lock();
        match table.iter_mut().find(|t| t.sequence == sequence) {
            Some(existing) => existing.callback = callback,
            None => table.push(Tracked {
                sequence,
                progress: 0,
                callback,
            }),
        }
    }

    /// Feed one input byte. Returns the number of sequences it completed.
    pub fn process_byte(&self, byte: u8) -> usize {
        let fired: Vec<EscapeCallback> = {
            let mut table = self.table.lock();
            let mut fired = Vec::new();
            for tracked in table.iter_mut() {
                if tracked.sequence[tracked.progress] == byte {
                    tracked.progress += 1;
                    if tracked.progress == tracked.sequence.len() {
                        tracked.progress = 0;
                        fired.push(tracked.callback.clone());
                    }
                } else if tracked.sequence[0] == byte {
                    tracked.progress = 1;
                } else {
                    tracked.progress = 0;
                }
            }
            fired
        };

        for callback in &fired {
            invoke_guarded("escape sequence", || callback());
        }
        fired.len()
    }

    /// Feed a run of bytes in order. Returns the total number of matches.
    pub fn process(&self, bytes: &[u8]) -> usize {
        bytes.iter().map(|&b| self.process_byte(b)).sum()
    }
}

/// Reader adapter that passes every byte it yields through an
/// [`EscapeMatcher`] before handing it to the caller.
///
/// Data and errors from the source are returned unchanged.
pub struct EscapeReader<R> {
    source: R,
    matcher: Arc<EscapeMatcher>,
}

impl<R> EscapeReader<R> {
    pub fn new(source: R, sequences: EscapeSequences) -> Self {
        Self::with_matcher(source, Arc::new(EscapeMatcher::with_sequences(sequences)))
    }

    pub fn with_matcher(source: R, matcher: Arc<EscapeMatcher>) -> Self {
        Self { source, matcher }
    }

    pub fn matcher(&self) -> &Arc<EscapeMatcher> {
        &self.matcher
    }

    pub fn into_inner(self) -> R {
        self.source
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for EscapeReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.source).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            this.matcher.process(&buf.filled()[before..]);
        }
        poll
    }
}
