//! Backpressure Writer
//!
//! Writes a whole payload to a sink without blocking. When the sink has no
//! space the writer registers a one-shot `Writable` handler and returns; the
//! handler removes itself and resumes the same write from where it stopped.
//!
//! ```text
//!   write() ──▶ space? ──yes──▶ sink.write(rest) ──▶ done? ──yes──▶ on_complete
//!                 │                   │ no progress      │ no
//!                 no                  ▼                  └──────▶ loop
//!                 └──────────▶ suspend on Writable (same handler id)
//!                                     │
//!                              Writable fires ──▶ deregister ──▶ resume
//! ```
//!
//! # No-Progress Writes
//!
//! A write attempt that accepts zero bytes (or reports `WouldBlock`) while the
//! sink claims space is not retried in place. The writer suspends until the
//! next `Writable` event, exactly as if the sink had reported no space.
//! After [`WriterConfig::max_stalled_writes`] consecutive attempts without
//! progress the write is abandoned with [`WriteError::Stalled`].
//!
//! # Abandonment
//!
//! An abandoned write never calls its completion. The failure is logged and
//! `ErrorOccurred` is dispatched to the sink's handlers. A write suspended on
//! a sink that gets closed or dropped is abandoned quietly: its handler is
//! gone and never fires. Callers using `write_with_outcome` still hear about
//! it as [`WriteError::Closed`], with the bytes accepted so far.

use std::cell::Cell;
use std::io;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::EventType;
use crate::registry::HandlerId;
use crate::stream::{RawSink, Stream, StreamId};

/// Configuration for the backpressure writer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterConfig {
    /// Consecutive no-progress write attempts tolerated before abandoning
    pub max_stalled_writes: u32,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_stalled_writes: 16,
        }
    }
}

/// Why a write was abandoned
#[derive(Debug, Error)]
pub enum WriteError {
    /// The sink kept accepting zero bytes while claiming space
    #[error("{stream} made no progress after {attempts} attempts")]
    Stalled {
        /// The sink
        stream: StreamId,
        /// Consecutive attempts without progress
        attempts: u32,
    },

    /// The sink's write primitive failed
    #[error("write to {stream} failed: {source}")]
    Io {
        /// The sink
        stream: StreamId,
        /// The underlying IO error
        source: io::Error,
    },

    /// The sink was closed or dropped before the payload was written
    #[error("{0} is closed")]
    Closed(StreamId),
}

/// Final result of a write, reported to `write_with_outcome` callers
#[derive(Debug)]
pub enum WriteOutcome {
    /// Every byte was accepted by the sink
    Completed,
    /// The write gave up; the remaining bytes were never accepted
    Abandoned {
        /// Bytes accepted before giving up
        written: usize,
        /// Why it gave up
        error: WriteError,
    },
}

/// Where a write stands when control returns to the caller
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteStatus {
    /// Every byte was accepted; completion has already run
    Completed,
    /// Waiting for the sink to become writable
    Suspended {
        /// Bytes still to write
        remaining: usize,
    },
    /// The write gave up
    Abandoned,
}

type OutcomeFn = Box<dyn FnOnce(WriteOutcome)>;

struct PendingWrite {
    sink: StreamId,
    payload: Vec<u8>,
    offset: usize,
    stalls: u32,
    handler_id: HandlerId,
    on_outcome: Option<OutcomeFn>,
}

impl PendingWrite {
    fn remaining(&self) -> usize {
        self.payload.len() - self.offset
    }

    fn finish(&mut self, outcome: WriteOutcome) {
        if let Some(on_outcome) = self.on_outcome.take() {
            on_outcome(outcome);
        }
    }
}

impl Drop for PendingWrite {
    fn drop(&mut self) {
        if self.on_outcome.is_some() {
            tracing::debug!(
                stream = %self.sink,
                written = self.offset,
                remaining = self.remaining(),
                "Suspended write dropped with its sink"
            );
            let written = self.offset;
            let error = WriteError::Closed(self.sink);
            self.finish(WriteOutcome::Abandoned { written, error });
        }
    }
}

/// Writes payloads to sinks, suspending on backpressure
#[derive(Clone, Debug, Default)]
pub struct BackpressureWriter {
    config: WriterConfig,
}

impl BackpressureWriter {
    /// Create a writer with the given configuration
    #[must_use]
    pub fn new(config: WriterConfig) -> Self {
        Self { config }
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    /// Write every byte of `payload` to `sink`
    ///
    /// `on_complete` runs exactly once, after the last byte is accepted, and
    /// never if the write is abandoned. An empty payload completes
    /// immediately without touching the sink.
    pub fn write<S: RawSink + 'static>(
        &self,
        sink: &Stream<S>,
        payload: impl Into<Vec<u8>>,
        on_complete: impl FnOnce() + 'static,
    ) -> WriteStatus {
        self.write_with_outcome(sink, payload, move |outcome| {
            if matches!(outcome, WriteOutcome::Completed) {
                on_complete();
            }
        })
    }

    /// Write every byte of `payload` to `sink`, reporting success or abandonment
    ///
    /// `on_outcome` runs exactly once, including when the write is dropped
    /// while suspended on a sink that gets closed or dropped.
    pub fn write_with_outcome<S: RawSink + 'static>(
        &self,
        sink: &Stream<S>,
        payload: impl Into<Vec<u8>>,
        on_outcome: impl FnOnce(WriteOutcome) + 'static,
    ) -> WriteStatus {
        let pending = PendingWrite {
            sink: sink.id(),
            payload: payload.into(),
            offset: 0,
            stalls: 0,
            handler_id: HandlerId::new(),
            on_outcome: Some(Box::new(on_outcome)),
        };
        drive(sink, pending, &self.config)
    }
}

impl<S: RawSink + 'static> Stream<S> {
    /// Write every byte of `payload` with the default writer configuration
    pub fn write_payload(
        &self,
        payload: impl Into<Vec<u8>>,
        on_complete: impl FnOnce() + 'static,
    ) -> WriteStatus {
        BackpressureWriter::default().write(self, payload, on_complete)
    }
}

fn drive<S: RawSink + 'static>(
    sink: &Stream<S>,
    mut pending: PendingWrite,
    config: &WriterConfig,
) -> WriteStatus {
    while pending.remaining() > 0 {
        if sink.is_closed() {
            let error = WriteError::Closed(sink.id());
            return abandon(sink, pending, error);
        }
        if !sink.has_space_available() {
            return suspend(sink, pending, config);
        }

        match sink.write(&pending.payload[pending.offset..]) {
            Ok(0) => return stalled(sink, pending, config),
            Ok(n) => {
                // A sink claiming more than it was offered is clamped.
                pending.offset += n.min(pending.remaining());
                pending.stalls = 0;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return stalled(sink, pending, config);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(source) => {
                let error = WriteError::Io {
                    stream: sink.id(),
                    source,
                };
                return abandon(sink, pending, error);
            }
        }
    }

    tracing::trace!(stream = %sink.id(), bytes = pending.payload.len(), "Write completed");
    pending.finish(WriteOutcome::Completed);
    WriteStatus::Completed
}

fn stalled<S: RawSink + 'static>(
    sink: &Stream<S>,
    mut pending: PendingWrite,
    config: &WriterConfig,
) -> WriteStatus {
    pending.stalls += 1;
    if pending.stalls >= config.max_stalled_writes {
        let error = WriteError::Stalled {
            stream: sink.id(),
            attempts: pending.stalls,
        };
        return abandon(sink, pending, error);
    }

    tracing::debug!(
        stream = %sink.id(),
        attempts = pending.stalls,
        "Sink accepted no bytes; waiting for the next writable event"
    );
    suspend(sink, pending, config)
}

fn suspend<S: RawSink + 'static>(
    sink: &Stream<S>,
    pending: PendingWrite,
    config: &WriterConfig,
) -> WriteStatus {
    let remaining = pending.remaining();
    let id = pending.handler_id;
    let slot = Cell::new(Some(pending));
    let weak = sink.downgrade();
    let config = config.clone();

    sink.on_with_id(EventType::Writable, id, move || {
        let Some(sink) = weak.upgrade() else {
            return;
        };
        sink.off(EventType::Writable, &id);
        if let Some(pending) = slot.take() {
            drive(&sink, pending, &config);
        }
    });

    tracing::debug!(
        stream = %sink.id(),
        handler_id = %id,
        remaining,
        "Write suspended until sink is writable"
    );
    WriteStatus::Suspended { remaining }
}

fn abandon<S: RawSink + 'static>(
    sink: &Stream<S>,
    mut pending: PendingWrite,
    error: WriteError,
) -> WriteStatus {
    tracing::warn!(
        stream = %sink.id(),
        written = pending.offset,
        remaining = pending.remaining(),
        error = %error,
        "Write abandoned"
    );

    let written = pending.offset;
    pending.finish(WriteOutcome::Abandoned { written, error });
    drop(pending);
    sink.dispatch(EventType::ErrorOccurred);
    WriteStatus::Abandoned
}
