//! Streams
//!
//! [`Stream`] wraps a raw byte channel together with the handler registry and
//! native binding that belong to it. The registry is a field of the stream
//! itself; there is no side table keyed by stream.
//!
//! # Collaborators
//!
//! - [`RawSource`] / [`RawSink`]: the physical read and write primitives
//! - [`Notifier`]: the native readiness mechanism (one client per stream)
//! - [`Scheduler`]: the loop a stream must be scheduled on before it is opened
//!
//! # Ownership
//!
//! `Stream` is a cheap `Rc` handle. Handlers that need to reach a stream from
//! inside its own registry capture a [`WeakStream`] so no reference cycle
//! keeps a dropped stream alive.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::fmt;
use std::io;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bridge::{Notifier, NotificationBridge};
use crate::event::{EventFlags, EventType};
use crate::registry::{DispatchReport, HandlerId};

// ============================================================================
// Identity
// ============================================================================

/// Unique identifier for a stream
///
/// Stable for the lifetime of the stream; used as the key by notifiers and
/// schedulers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(u64);

impl StreamId {
    /// Create a new unique stream ID
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw numeric value
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

// ============================================================================
// External Collaborators
// ============================================================================

/// Lifecycle half of a raw byte channel
pub trait RawStream {
    /// Open the channel
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if the channel cannot be opened.
    fn open(&mut self) -> io::Result<()>;

    /// Close the channel
    fn close(&mut self);
}

/// A raw channel bytes are read from
pub trait RawSource: RawStream {
    /// Read up to `buf.len()` bytes
    ///
    /// # Errors
    ///
    /// `WouldBlock` means nothing is available right now; anything else is a
    /// read failure.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// A raw channel bytes are written to
pub trait RawSink: RawStream {
    /// Whether a write right now would accept at least one byte
    fn has_space_available(&self) -> bool;

    /// Write up to `buf.len()` bytes, returning how many were accepted
    ///
    /// # Errors
    ///
    /// `WouldBlock` means no space right now; anything else is a write
    /// failure.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
}

/// Run loop mode a stream is scheduled in
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunMode {
    /// The loop's default mode
    #[default]
    Default,
    /// Every common mode of the loop
    Common,
}

/// The scheduling loop that pumps native notifications
pub trait Scheduler {
    /// Start delivering notifications for `stream` in `mode`
    fn schedule(&self, stream: StreamId, mode: RunMode);

    /// Stop delivering notifications for `stream` in `mode`
    fn unschedule(&self, stream: StreamId, mode: RunMode);
}

// ============================================================================
// Errors & State
// ============================================================================

/// Errors raised by stream lifecycle operations
#[derive(Debug, Error)]
pub enum StreamError {
    /// The stream was already closed
    #[error("{0} is closed")]
    Closed(StreamId),

    /// The raw channel failed to open
    #[error("failed to open {stream}: {source}")]
    Open {
        /// The stream that failed
        stream: StreamId,
        /// The underlying IO error
        source: io::Error,
    },
}

/// Lifecycle state of a stream
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamState {
    /// Created, not yet opened
    Created,
    /// Opened and usable
    Opened,
    /// Closed; no further events are delivered
    Closed,
}

// ============================================================================
// Stream
// ============================================================================

struct StreamCore<S> {
    id: StreamId,
    raw: RefCell<S>,
    bridge: NotificationBridge,
    scheduler: Rc<dyn Scheduler>,
    state: Cell<StreamState>,
}

/// A raw byte channel with its own handler registry
pub struct Stream<S> {
    core: Rc<StreamCore<S>>,
}

impl<S> Clone for Stream<S> {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
        }
    }
}

impl<S> fmt::Debug for Stream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.core.id)
            .field("state", &self.core.state.get())
            .field("installed", &self.core.bridge.installed_flags())
            .finish_non_exhaustive()
    }
}

impl<S: RawStream> Stream<S> {
    /// Wrap a raw channel
    pub fn new(raw: S, notifier: Rc<dyn Notifier>, scheduler: Rc<dyn Scheduler>) -> Self {
        Self::with_id(StreamId::new(), raw, notifier, scheduler)
    }

    /// Wrap a raw channel under a pre-allocated ID
    pub fn with_id(
        id: StreamId,
        raw: S,
        notifier: Rc<dyn Notifier>,
        scheduler: Rc<dyn Scheduler>,
    ) -> Self {
        Self {
            core: Rc::new(StreamCore {
                id,
                raw: RefCell::new(raw),
                bridge: NotificationBridge::new(id, notifier),
                scheduler,
                state: Cell::new(StreamState::Created),
            }),
        }
    }

    /// Get the stream ID
    #[must_use]
    pub fn id(&self) -> StreamId {
        self.core.id
    }

    /// Get the lifecycle state
    #[must_use]
    pub fn state(&self) -> StreamState {
        self.core.state.get()
    }

    /// Check if the stream has been closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == StreamState::Closed
    }

    /// Register a handler for `event` under a fresh ID
    pub fn on(&self, event: EventType, handler: impl Fn() + 'static) -> HandlerId {
        self.on_with_id(event, HandlerId::new(), handler)
    }

    /// Register (or replace) a handler for `event` under `id`
    ///
    /// A closed stream never fires again, so the handler is discarded.
    pub fn on_with_id(
        &self,
        event: EventType,
        id: HandlerId,
        handler: impl Fn() + 'static,
    ) -> HandlerId {
        if self.is_closed() {
            tracing::debug!(
                stream = %self.core.id,
                event = %event,
                "Ignoring handler for closed stream"
            );
            return id;
        }
        self.core.bridge.register(event, Some(id), Rc::new(handler))
    }

    /// Deregister a handler
    ///
    /// Unknown IDs are ignored. Returns true when no handler is left for
    /// `event`.
    pub fn off(&self, event: EventType, id: &HandlerId) -> bool {
        self.core.bridge.deregister(event, id)
    }

    /// Check if a handler is registered under `id` for `event`
    #[must_use]
    pub fn has_handler(&self, event: EventType, id: &HandlerId) -> bool {
        self.core.bridge.contains(event, id)
    }

    /// Number of handlers registered for `event`
    #[must_use]
    pub fn handler_count(&self, event: EventType) -> usize {
        self.core.bridge.handler_count(event)
    }

    /// Flags currently installed with the native mechanism
    #[must_use]
    pub fn installed_flags(&self) -> EventFlags {
        self.core.bridge.installed_flags()
    }

    /// Run the handlers for `event` without a native notification
    pub fn dispatch(&self, event: EventType) -> DispatchReport {
        if self.is_closed() {
            return DispatchReport::default();
        }
        self.core.bridge.dispatch(event)
    }

    /// Schedule the stream on its loop
    ///
    /// Call before [`open`](Self::open) so no early readiness event is missed.
    pub fn schedule(&self, mode: RunMode) {
        self.core.scheduler.schedule(self.core.id, mode);
        tracing::debug!(stream = %self.core.id, mode = ?mode, "Stream scheduled");
    }

    /// Remove the stream from its loop
    pub fn unschedule(&self, mode: RunMode) {
        self.core.scheduler.unschedule(self.core.id, mode);
        tracing::debug!(stream = %self.core.id, mode = ?mode, "Stream unscheduled");
    }

    /// Open the raw channel
    ///
    /// Opening an already opened stream does nothing.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::Closed` if the stream was closed, or
    /// `StreamError::Open` if the raw channel fails to open.
    pub fn open(&self) -> Result<(), StreamError> {
        match self.state() {
            StreamState::Opened => return Ok(()),
            StreamState::Closed => return Err(StreamError::Closed(self.core.id)),
            StreamState::Created => {}
        }

        self.core
            .raw
            .borrow_mut()
            .open()
            .map_err(|source| StreamError::Open {
                stream: self.core.id,
                source,
            })?;
        self.core.state.set(StreamState::Opened);
        tracing::debug!(stream = %self.core.id, "Stream opened");
        Ok(())
    }

    /// Close the raw channel and drop every handler
    ///
    /// Idempotent. Handlers waiting on this stream never fire afterwards; a
    /// suspended write is dropped and reports itself abandoned.
    pub fn close(&self) {
        if self.is_closed() {
            return;
        }
        self.core.state.set(StreamState::Closed);
        self.core.raw.borrow_mut().close();
        self.core.bridge.clear();
        tracing::debug!(stream = %self.core.id, "Stream closed");
    }

    /// Borrow the raw channel
    ///
    /// # Panics
    ///
    /// Panics if the raw channel is currently mutably borrowed.
    #[must_use]
    pub fn raw(&self) -> Ref<'_, S> {
        self.core.raw.borrow()
    }

    /// Mutably borrow the raw channel
    ///
    /// # Panics
    ///
    /// Panics if the raw channel is currently borrowed.
    #[must_use]
    pub fn raw_mut(&self) -> RefMut<'_, S> {
        self.core.raw.borrow_mut()
    }

    /// Create a weak handle that does not keep the stream alive
    #[must_use]
    pub fn downgrade(&self) -> WeakStream<S> {
        WeakStream {
            core: Rc::downgrade(&self.core),
        }
    }
}

impl<S: RawSource> Stream<S> {
    /// Read up to `buf.len()` bytes from the raw channel
    ///
    /// # Errors
    ///
    /// Returns the raw channel's I/O error.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.core.raw.borrow_mut().read(buf)
    }
}

impl<S: RawSink> Stream<S> {
    /// Whether the raw channel can accept bytes right now
    #[must_use]
    pub fn has_space_available(&self) -> bool {
        !self.is_closed() && self.core.raw.borrow().has_space_available()
    }

    /// Write up to `buf.len()` bytes to the raw channel
    ///
    /// # Errors
    ///
    /// Returns the raw channel's I/O error.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.core.raw.borrow_mut().write(buf)
    }
}

/// Non-owning handle to a [`Stream`]
pub struct WeakStream<S> {
    core: Weak<StreamCore<S>>,
}

impl<S> Clone for WeakStream<S> {
    fn clone(&self) -> Self {
        Self {
            core: Weak::clone(&self.core),
        }
    }
}

impl<S> WeakStream<S> {
    /// Get the stream back if it is still alive
    #[must_use]
    pub fn upgrade(&self) -> Option<Stream<S>> {
        self.core.upgrade().map(|core| Stream { core })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NativeEvent;
    use crate::memory::{ManualRunLoop, MemorySink, MemorySource};

    #[test]
    fn test_stream_id_display() {
        let id = StreamId(7);
        assert_eq!(format!("{id}"), "stream-7");
    }

    #[test]
    fn test_stream_id_unique() {
        assert_ne!(StreamId::new(), StreamId::new());
    }

    #[test]
    fn test_open_close_lifecycle() {
        let run_loop = Rc::new(ManualRunLoop::new());
        let stream = run_loop.stream(MemorySource::new(Vec::<Vec<u8>>::new()));
        assert_eq!(stream.state(), StreamState::Created);

        stream.open().unwrap();
        stream.open().unwrap();
        assert_eq!(stream.state(), StreamState::Opened);
        assert!(stream.raw().is_open());

        stream.close();
        stream.close();
        assert!(stream.is_closed());
        assert!(!stream.raw().is_open());
        assert!(matches!(stream.open(), Err(StreamError::Closed(id)) if id == stream.id()));
    }

    #[test]
    fn test_open_failure_is_reported() {
        let run_loop = Rc::new(ManualRunLoop::new());
        let stream = run_loop.stream(MemorySink::new().with_open_error(io::ErrorKind::NotFound));

        let err = stream.open().unwrap_err();
        assert!(matches!(err, StreamError::Open { .. }));
        assert_eq!(stream.state(), StreamState::Created);
    }

    #[test]
    fn test_close_drops_handlers_and_subscription() {
        let run_loop = Rc::new(ManualRunLoop::new());
        let stream = run_loop.stream(MemorySource::new(vec![b"x".to_vec()]));
        stream.schedule(RunMode::Default);
        stream.on(EventType::Readable, || {});
        assert!(run_loop.installed_flags(stream.id()).is_some());

        stream.close();
        assert_eq!(stream.handler_count(EventType::Readable), 0);
        assert_eq!(run_loop.installed_flags(stream.id()), None);
        assert!(!run_loop.fire(stream.id(), NativeEvent::HAS_BYTES_AVAILABLE));
    }

    #[test]
    fn test_dispatch_on_closed_stream_runs_nothing() {
        let run_loop = Rc::new(ManualRunLoop::new());
        let stream = run_loop.stream(MemorySink::new());
        let hits = Rc::new(Cell::new(0));
        let counter = Rc::clone(&hits);
        stream.on(EventType::ErrorOccurred, move || counter.set(counter.get() + 1));

        assert_eq!(stream.dispatch(EventType::ErrorOccurred).invoked, 1);
        stream.close();
        assert_eq!(stream.dispatch(EventType::ErrorOccurred).invoked, 0);
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn test_handlers_on_closed_stream_are_discarded() {
        let run_loop = Rc::new(ManualRunLoop::new());
        let stream = run_loop.stream(MemorySink::new());
        stream.close();

        let id = stream.on(EventType::Writable, || {});
        assert!(!stream.has_handler(EventType::Writable, &id));
        assert_eq!(run_loop.client_count(), 0);
    }

    #[test]
    fn test_schedule_reaches_scheduler() {
        let run_loop = Rc::new(ManualRunLoop::new());
        let stream = run_loop.stream(MemorySink::new());
        assert!(!run_loop.is_scheduled(stream.id()));

        stream.schedule(RunMode::Default);
        assert!(run_loop.is_scheduled(stream.id()));

        stream.unschedule(RunMode::Default);
        assert!(!run_loop.is_scheduled(stream.id()));
    }

    #[test]
    fn test_weak_stream_does_not_keep_alive() {
        let run_loop = Rc::new(ManualRunLoop::new());
        let stream = run_loop.stream(MemorySink::new());
        let weak = stream.downgrade();
        assert!(weak.upgrade().is_some());

        drop(stream);
        assert!(weak.upgrade().is_none());
    }
}
