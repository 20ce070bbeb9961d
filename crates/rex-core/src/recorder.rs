//! Timestamped capture of a command's output, with speed-scaled replay.
//!
//! A [`Recorder`] keeps one ordered log of output events shared by stdout and
//! stderr, so the interleaving of the two streams reflects the order in which
//! data actually arrived. Each event carries its offset from the recording
//! baseline, which is what [`Recorder::replay`] uses to reproduce the
//! original pacing.
//!
//! Out-of-band "special" events (escape actions, user annotations) are kept in
//! a separate list and never replayed as output.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep_until, Instant};

use crate::error::{RexError, RexResult};
use crate::transport::OutputSink;

/// Special event type recorded when an escape sequence triggers.
pub const ESCAPE_EVENT: &str = "Escape";

/// A passthrough writer receiving output as it is recorded.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

type SharedWriter = Arc<tokio::sync::Mutex<BoxWriter>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One chunk of output as it was received.
#[derive(Debug, Clone)]
pub struct OutputEvent {
    /// Time since the recording baseline.
    pub offset: Duration,
    pub stream: OutputStream,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpecialEvent {
    pub event_type: String,
    pub timestamp: SystemTime,
    pub details: serde_json::Value,
}

/// Fields configured before execution starts.
#[derive(Default)]
struct SessionFields {
    command: String,
    args: Vec<String>,
    baseline: Option<Instant>,
    passthrough_out: Option<SharedWriter>,
    passthrough_err: Option<SharedWriter>,
}

#[derive(Default)]
struct EventLog {
    entries: Vec<OutputEvent>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

#[derive(Default)]
pub struct Recorder {
    session: Mutex<SessionFields>,
    log: Mutex<EventLog>,
    specials: Mutex<Vec<SpecialEvent>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the command this recording belongs to.
    pub fn set_command<I, S>(&self, command: &str, args: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut session = self.session.lock();
        session.command = command.to_string();
        session.args = args.into_iter().map(Into::into).collect();
    }

    /// The command line as sent to the remote side: words joined by spaces.
    pub fn command_line(&self) -> String {
        let session = self.session.lock();
        std::iter::once(session.command.as_str())
            .chain(session.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// The command line quoted for a POSIX shell, suitable for scripts.
    pub fn command_escaped(&self) -> String {
        let session = self.session.lock();
        shell_words::join(std::iter::once(&session.command).chain(session.args.iter()))
    }

    /// Set the writers that receive output live, alongside recording.
    ///
    /// Each chunk is written out in full, then flushed, before the command's
    /// next output is read. Must be called before execution starts.
    pub fn set_passthrough(&self, out: Option<BoxWriter>, err: Option<BoxWriter>) {
        let mut session = self.session.lock();
        session.passthrough_out = out.map(|w| Arc::new(tokio::sync::Mutex::new(w)));
        session.passthrough_err = err.map(|w| Arc::new(tokio::sync::Mutex::new(w)));
    }

    /// Set the baseline that event offsets are measured from.
    ///
    /// Only the first call has an effect.
    pub fn begin_timing(&self) {
        self.session.lock().baseline.get_or_insert_with(Instant::now);
    }

    pub fn baseline(&self) -> Option<Instant> {
        self.session.lock().baseline
    }

    /// Record a chunk of output, then forward it to the stream's passthrough
    /// writer if one is set.
    ///
    /// Starts timing if [`begin_timing`](Self::begin_timing) was never called.
    /// Partial writes to the passthrough writer are continued; a writer that
    /// stops accepting bytes before the chunk is complete is a
    /// [`RexError::ShortWrite`].
    pub async fn record(&self, stream: OutputStream, data: &[u8]) -> RexResult<()> {
        if data.is_empty() {
            return Ok(());
        }

        let (baseline, passthrough) = {
            let mut session = self.session.lock();
            let baseline = *session.baseline.get_or_insert_with(Instant::now);
            let passthrough = match stream {
                OutputStream::Stdout => session.passthrough_out.clone(),
                OutputStream::Stderr => session.passthrough_err.clone(),
            };
            (baseline, passthrough)
        };

        {
            let mut log = self.log.lock();
            let offset = baseline.elapsed();
            match stream {
                OutputStream::Stdout => log.stdout.extend_from_slice(data),
                OutputStream::Stderr => log.stderr.extend_from_slice(data),
            }
            log.entries.push(OutputEvent {
                offset,
                stream,
                data: data.to_vec(),
            });
        }

        if let Some(writer) = passthrough {
            let mut writer = writer.lock().await;
            let mut written = 0;
            while written < data.len() {
                match writer.write(&data[written..]).await? {
                    0 => {
                        return Err(RexError::ShortWrite {
                            written,
                            expected: data.len(),
                        })
                    }
                    n => written += n,
                }
            }
            writer.flush().await?;
        }
        Ok(())
    }

    /// An [`OutputSink`] that records into this recorder under `stream`.
    pub fn sink(self: &Arc<Self>, stream: OutputStream) -> Arc<dyn OutputSink> {
        Arc::new(RecorderSink {
            recorder: self.clone(),
            stream,
        })
    }

    /// Snapshot of the ordered output log.
    pub fn events(&self) -> Vec<OutputEvent> {
        self.log.lock().entries.clone()
    }

    /// Everything recorded on stdout, concatenated.
    pub fn stdout(&self) -> Vec<u8> {
        self.log.lock().stdout.clone()
    }

    /// Everything recorded on stderr, concatenated.
    pub fn stderr(&self) -> Vec<u8> {
        self.log.lock().stderr.clone()
    }

    pub fn add_special_event(&self, event_type: impl Into<String>, details: impl Into<serde_json::Value>) {
        self.specials.lock().push(SpecialEvent {
            event_type: event_type.into(),
            timestamp: SystemTime::now(),
            details: details.into(),
        });
    }

    pub fn special_events(&self) -> Vec<SpecialEvent> {
        self.specials.lock().clone()
    }

    /// Replay recorded output to `out` and `err`.
    ///
    /// Events are written in their recorded order to the writer matching
    /// their stream. If only one writer is given it receives both streams.
    ///
    /// `speed` scales the original pacing: `1.0` is real time, `2.0` twice as
    /// fast, and `0.0` writes everything without delay. Negative, infinite or
    /// NaN multipliers are rejected before anything is written, as are
    /// multipliers so small that a scaled offset cannot be represented. The first
    /// write error stops the replay.
    ///
    /// # Panics
    ///
    /// Panics if both writers are `None`.
    pub async fn replay<O, E>(&self, out: Option<&mut O>, err: Option<&mut E>, speed: f64) -> RexResult<()>
    where
        O: AsyncWrite + Unpin + Send,
        E: AsyncWrite + Unpin + Send,
    {
        assert!(
            out.is_some() || err.is_some(),
            "replay requires at least one writer"
        );
        if !(speed >= 0.0) || speed.is_infinite() {
            return Err(RexError::InvalidMultiplier(speed));
        }

        let mut out = out.map(|w| w as &mut (dyn AsyncWrite + Unpin + Send));
        let mut err = err.map(|w| w as &mut (dyn AsyncWrite + Unpin + Send));

        let entries = self.events();
        let start = Instant::now();
        // Deadlines are absolute from `start`. All are computed before the
        // first write so a multiplier too small to represent fails cleanly.
        let deadlines = entries
            .iter()
            .map(|entry| {
                if speed == 0.0 {
                    return Ok(None);
                }
                Duration::try_from_secs_f64(entry.offset.as_secs_f64() / speed)
                    .ok()
                    .and_then(|offset| start.checked_add(offset))
                    .map(Some)
                    .ok_or(RexError::InvalidMultiplier(speed))
            })
            .collect::<RexResult<Vec<_>>>()?;

        for (entry, due) in entries.iter().zip(deadlines) {
            if let Some(due) = due {
                sleep_until(due).await;
            }

            let writer = match entry.stream {
                OutputStream::Stdout => out.as_deref_mut().or(err.as_deref_mut()),
                OutputStream::Stderr => err.as_deref_mut().or(out.as_deref_mut()),
            };
            if let Some(writer) = writer {
                writer.write_all(&entry.data).await?;
                writer.flush().await?;
            }
        }
        Ok(())
    }

    /// Replay both streams into a single writer.
    pub async fn replay_combined<W>(&self, writer: &mut W, speed: f64) -> RexResult<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.replay(Some(writer), None::<&mut W>, speed).await
    }
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("command", &self.command_line())
            .field("events", &self.log.lock().entries.len())
            .field("special_events", &self.specials.lock().len())
            .finish_non_exhaustive()
    }
}

struct RecorderSink {
    recorder: Arc<Recorder>,
    stream: OutputStream,
}

impl OutputSink for RecorderSink {
    fn write<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, RexResult<()>> {
        Box::pin(self.recorder.record(self.stream, data))
    }
}
