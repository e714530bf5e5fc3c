//! Stream Pipe
//!
//! Connects a source stream to a sink stream. Each `Readable` event on the
//! source reads one bounded chunk and forwards it through the
//! [`BackpressureWriter`]; `EndOfStream` tears both streams down.
//!
//! # Architecture
//!
//! ```text
//!   source ──Readable──▶ read(chunk_size) ──▶ writer ──▶ sink
//!                                               │ suspended
//!                                               ▼
//!                         deregister Readable ─▶ (write completes) ─▶ register Readable
//!
//!   source ──EndOfStream──▶ close sink ─▶ unschedule sink ─▶ close source
//!                           ─▶ unschedule source ─▶ on_end ─▶ completion
//! ```
//!
//! # Backpressure
//!
//! At most one chunk per pipe is in flight. While a write waits on the sink,
//! the pipe's `Readable` handler is deregistered, so unread bytes stay in the
//! source and the native subscription stops asking for them. The handler
//! comes back under the same ID once the write completes. Memory stays
//! bounded by one chunk, the sink receives bytes in source order, and a
//! source only reaches its end after the sink has taken everything before it.
//!
//! # End of Stream
//!
//! Bytes the sink has accepted are kept. If the source ends, or fails with
//! `teardown_on_error`, while a write still waits on backpressure, the rest
//! of that chunk is abandoned: closing the sink drops the suspended write,
//! and the abandoned count is recorded in the [`PipeSummary`].

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::event::EventType;
use crate::registry::HandlerId;
use crate::stream::{
    RawSink, RawSource, RunMode, Stream, StreamError, StreamId, StreamState, WeakStream,
};
use crate::writer::{BackpressureWriter, WriteOutcome, WriterConfig};

/// Default number of bytes read per `Readable` event
pub const DEFAULT_CHUNK_SIZE: usize = 512;

/// Configuration for a pipe
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeConfig {
    /// Maximum bytes read from the source per `Readable` event
    pub chunk_size: usize,
    /// Tear down on a source error or an abandoned sink write
    pub teardown_on_error: bool,
    /// Mode both streams are scheduled in
    pub run_mode: RunMode,
    /// Writer settings for the sink side
    pub writer: WriterConfig,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            teardown_on_error: false,
            run_mode: RunMode::Default,
            writer: WriterConfig::default(),
        }
    }
}

/// How a pipe finished
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipeOutcome {
    /// Still relaying
    Running,
    /// The source reached its end
    Ended,
    /// Torn down after an error
    Failed,
}

/// Byte accounting for a pipe
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeSummary {
    /// Source stream
    pub source: StreamId,
    /// Sink stream
    pub sink: StreamId,
    /// Bytes read from the source
    pub bytes_read: u64,
    /// Bytes accepted by the sink
    pub bytes_written: u64,
    /// Non-empty chunks read from the source
    pub chunks: u64,
    /// Bytes read but never accepted by the sink
    pub bytes_abandoned: u64,
    /// Source read failures
    pub read_errors: u64,
    /// Current outcome
    pub outcome: PipeOutcome,
}

struct PipeState {
    summary: PipeSummary,
    in_flight: usize,
}

struct PipeShared {
    config: PipeConfig,
    readable_id: HandlerId,
    writer: BackpressureWriter,
    state: RefCell<PipeState>,
    finished: Cell<bool>,
    on_end: RefCell<Option<Box<dyn FnOnce()>>>,
    completion: RefCell<Option<oneshot::Sender<PipeSummary>>>,
}

/// Handle to a running pipe
///
/// Dropping the handle does not stop the pipe; the pipe lives as long as
/// its streams do.
pub struct PipeHandle {
    shared: Rc<PipeShared>,
    completion: Option<oneshot::Receiver<PipeSummary>>,
}

impl PipeHandle {
    /// Check if the pipe has been torn down
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.shared.finished.get()
    }

    /// Current byte accounting
    #[must_use]
    pub fn summary(&self) -> PipeSummary {
        self.shared.state.borrow().summary.clone()
    }

    /// Receiver resolved with the final summary at teardown
    ///
    /// Returns `None` after the first call.
    pub fn completion(&mut self) -> Option<oneshot::Receiver<PipeSummary>> {
        self.completion.take()
    }
}

/// Builds pipes between sources and sinks
#[derive(Clone, Debug, Default)]
pub struct StreamPipe {
    config: PipeConfig,
}

impl StreamPipe {
    /// Create a pipe builder with the given configuration
    #[must_use]
    pub fn new(config: PipeConfig) -> Self {
        Self { config }
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &PipeConfig {
        &self.config
    }

    /// Relay bytes from `source` to `sink` until the source ends
    ///
    /// Registers the source handlers, schedules source then sink, and opens
    /// source then sink. `on_end` runs once, after both streams are closed.
    ///
    /// # Errors
    ///
    /// Returns a `StreamError` if either stream is closed or fails to open.
    /// The pipe's handlers are removed and both streams unscheduled; a source
    /// that did open is closed again.
    pub fn pipe<R, W>(
        &self,
        source: &Stream<R>,
        sink: &Stream<W>,
        on_end: Option<Box<dyn FnOnce()>>,
    ) -> Result<PipeHandle, StreamError>
    where
        R: RawSource + 'static,
        W: RawSink + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let shared = Rc::new(PipeShared {
            config: self.config.clone(),
            readable_id: HandlerId::new(),
            writer: BackpressureWriter::new(self.config.writer.clone()),
            state: RefCell::new(PipeState {
                summary: PipeSummary {
                    source: source.id(),
                    sink: sink.id(),
                    bytes_read: 0,
                    bytes_written: 0,
                    chunks: 0,
                    bytes_abandoned: 0,
                    read_errors: 0,
                    outcome: PipeOutcome::Running,
                },
                in_flight: 0,
            }),
            finished: Cell::new(false),
            on_end: RefCell::new(on_end),
            completion: RefCell::new(Some(tx)),
        });

        let link = PipeLink {
            shared: Rc::clone(&shared),
            source: source.downgrade(),
            sink: sink.downgrade(),
        };

        link.watch_readable(source);

        let on_end_of_stream = link.clone();
        let end_id = source.on(EventType::EndOfStream, move || {
            on_end_of_stream.teardown(PipeOutcome::Ended);
        });

        let error_id = self.config.teardown_on_error.then(|| {
            let on_error = link.clone();
            let source_id = source.id();
            source.on(EventType::ErrorOccurred, move || {
                tracing::warn!(stream = %source_id, "Source reported an error; tearing pipe down");
                on_error.teardown(PipeOutcome::Failed);
            })
        });

        let mode = self.config.run_mode;
        source.schedule(mode);
        sink.schedule(mode);

        let opened = source.open().and_then(|()| sink.open());
        if let Err(e) = opened {
            source.off(EventType::Readable, &shared.readable_id);
            source.off(EventType::EndOfStream, &end_id);
            if let Some(error_id) = &error_id {
                source.off(EventType::ErrorOccurred, error_id);
            }
            sink.unschedule(mode);
            source.unschedule(mode);
            if source.state() == StreamState::Opened {
                source.close();
            }
            tracing::warn!(
                source = %source.id(),
                sink = %sink.id(),
                error = %e,
                "Pipe failed to start"
            );
            return Err(e);
        }

        tracing::info!(
            source = %source.id(),
            sink = %sink.id(),
            chunk_size = self.config.chunk_size,
            "Pipe started"
        );

        Ok(PipeHandle {
            shared,
            completion: Some(rx),
        })
    }
}

/// What a pipe handler captures: shared state plus weak stream handles
struct PipeLink<R, W> {
    shared: Rc<PipeShared>,
    source: WeakStream<R>,
    sink: WeakStream<W>,
}

impl<R, W> Clone for PipeLink<R, W> {
    fn clone(&self) -> Self {
        Self {
            shared: Rc::clone(&self.shared),
            source: self.source.clone(),
            sink: self.sink.clone(),
        }
    }
}

impl<R, W> PipeLink<R, W>
where
    R: RawSource + 'static,
    W: RawSink + 'static,
{
    fn watch_readable(&self, source: &Stream<R>) {
        let link = self.clone();
        source.on_with_id(EventType::Readable, self.shared.readable_id, move || {
            link.forward_chunk();
        });
    }

    fn forward_chunk(&self) {
        if self.shared.finished.get() || self.shared.state.borrow().in_flight > 0 {
            return;
        }
        let Some(source) = self.source.upgrade() else {
            return;
        };

        let mut buf = vec![0u8; self.shared.config.chunk_size];
        let n = match source.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(e) => {
                self.shared.state.borrow_mut().summary.read_errors += 1;
                tracing::warn!(stream = %source.id(), error = %e, "Source read failed");
                return;
            }
        };
        buf.truncate(n);

        {
            let mut state = self.shared.state.borrow_mut();
            state.summary.bytes_read += n as u64;
            state.summary.chunks += 1;
        }
        self.start_write(&source, buf);
    }

    fn start_write(&self, source: &Stream<R>, payload: Vec<u8>) {
        let len = payload.len();
        let Some(sink) = self.sink.upgrade() else {
            self.shared.state.borrow_mut().summary.bytes_abandoned += len as u64;
            return;
        };
        self.shared.state.borrow_mut().in_flight = len;

        let link = self.clone();
        self.shared.writer.write_with_outcome(&sink, payload, move |outcome| {
            link.write_finished(len, outcome);
        });

        // Still in flight: the sink is full, so stop reading until it drains.
        if !self.shared.finished.get() && self.shared.state.borrow().in_flight > 0 {
            source.off(EventType::Readable, &self.shared.readable_id);
            tracing::debug!(stream = %source.id(), "Sink backpressure; source paused");
        }
    }

    fn write_finished(&self, len: usize, outcome: WriteOutcome) {
        // Also reached from teardown, when closing the sink drops a suspended write.
        let finished = self.shared.finished.get();
        let teardown_on_error = self.shared.config.teardown_on_error;

        {
            let mut state = self.shared.state.borrow_mut();
            state.in_flight = 0;
            match &outcome {
                WriteOutcome::Completed => state.summary.bytes_written += len as u64,
                WriteOutcome::Abandoned { written, .. } => {
                    let written = (*written).min(len);
                    state.summary.bytes_written += written as u64;
                    state.summary.bytes_abandoned += (len - written) as u64;
                }
            }
        }

        if finished {
            return;
        }
        if let WriteOutcome::Abandoned { error, .. } = outcome {
            if teardown_on_error {
                tracing::warn!(error = %error, "Sink write abandoned; tearing pipe down");
                self.teardown(PipeOutcome::Failed);
                return;
            }
        }

        // A write that completed after suspending resumes reading.
        let Some(source) = self.source.upgrade() else {
            return;
        };
        if !source.has_handler(EventType::Readable, &self.shared.readable_id) {
            self.watch_readable(&source);
            tracing::debug!(stream = %source.id(), "Sink drained; source resumed");
        }
    }

    fn teardown(&self, outcome: PipeOutcome) {
        if self.shared.finished.replace(true) {
            return;
        }

        let sink = self.sink.upgrade();
        let source = self.source.upgrade();
        let mode = self.shared.config.run_mode;

        if let Some(sink) = &sink {
            sink.close();
            sink.unschedule(mode);
        }
        if let Some(source) = &source {
            source.close();
            source.unschedule(mode);
        }

        let summary = {
            let mut state = self.shared.state.borrow_mut();
            let stranded = state.in_flight;
            state.in_flight = 0;
            state.summary.bytes_abandoned += stranded as u64;
            state.summary.outcome = outcome;
            if stranded > 0 {
                tracing::warn!(
                    source = %state.summary.source,
                    sink = %state.summary.sink,
                    bytes = stranded,
                    "Bytes waiting on sink backpressure abandoned at teardown"
                );
            }
            state.summary.clone()
        };

        tracing::info!(
            source = %summary.source,
            sink = %summary.sink,
            bytes_read = summary.bytes_read,
            bytes_written = summary.bytes_written,
            outcome = ?summary.outcome,
            "Pipe finished"
        );

        let on_end = self.shared.on_end.borrow_mut().take();
        if let Some(on_end) = on_end {
            on_end();
        }
        let completion = self.shared.completion.borrow_mut().take();
        if let Some(tx) = completion {
            // The receiver may have been dropped; nobody is waiting then.
            let _ = tx.send(summary);
        }
    }
}
