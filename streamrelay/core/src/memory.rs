//! In-Memory Collaborators
//!
//! A manually pumped run loop and scripted byte channels. Used by tests and by
//! callers that embed the relay without an OS notification mechanism.
//!
//! # Usage
//!
//! ```ignore
//! let run_loop = Rc::new(ManualRunLoop::new());
//! let source = run_loop.stream(MemorySource::new(vec![b"AB".to_vec()]));
//! let sink = run_loop.stream(MemorySink::new());
//!
//! let handle = StreamPipe::default().pipe(&source, &sink, None)?;
//! run_loop.fire(source.id(), NativeEvent::HAS_BYTES_AVAILABLE);
//! run_loop.fire(source.id(), NativeEvent::END_ENCOUNTERED);
//! assert!(handle.is_finished());
//! ```

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::rc::Rc;

use crate::bridge::{NativeCallback, Notifier};
use crate::event::{EventFlags, NativeEvent};
use crate::stream::{RawSink, RawSource, RawStream, RunMode, Scheduler, Stream, StreamId};

// ============================================================================
// Manual Run Loop
// ============================================================================

struct Client {
    flags: EventFlags,
    callback: NativeCallback,
}

/// Run loop whose notifications are fired explicitly
///
/// Holds at most one client per stream, like a real native mechanism.
/// Callbacks run on the caller's stack with no internal borrow held, so
/// handlers may re-enter the loop.
#[derive(Default)]
pub struct ManualRunLoop {
    clients: RefCell<HashMap<StreamId, Client>>,
    scheduled: RefCell<HashSet<(StreamId, RunMode)>>,
    installs: RefCell<HashMap<StreamId, usize>>,
}

impl ManualRunLoop {
    /// Create a new empty loop
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap `raw` in a stream bound to this loop
    pub fn stream<S: RawStream>(self: &Rc<Self>, raw: S) -> Stream<S> {
        let notifier: Rc<dyn Notifier> = self.clone();
        let scheduler: Rc<dyn Scheduler> = self.clone();
        Stream::new(raw, notifier, scheduler)
    }

    /// Deliver `event` to the client of `stream`
    ///
    /// Delivered only when the stream is scheduled and `event` is in the
    /// installed flags. Returns whether the callback ran.
    pub fn fire(&self, stream: StreamId, event: NativeEvent) -> bool {
        let callback = {
            let clients = self.clients.borrow();
            match clients.get(&stream) {
                Some(client) if client.flags.includes(event) => Rc::clone(&client.callback),
                _ => return false,
            }
        };
        if !self.is_scheduled(stream) {
            return false;
        }

        callback(event);
        true
    }

    /// Deliver `event` without checking installed flags
    ///
    /// Simulates a native mechanism reporting codes nobody subscribed to.
    pub fn deliver_raw(&self, stream: StreamId, event: NativeEvent) -> bool {
        let callback = match self.clients.borrow().get(&stream) {
            Some(client) => Rc::clone(&client.callback),
            None => return false,
        };

        callback(event);
        true
    }

    /// Flags installed for `stream`, if a client is installed
    #[must_use]
    pub fn installed_flags(&self, stream: StreamId) -> Option<EventFlags> {
        self.clients.borrow().get(&stream).map(|client| client.flags)
    }

    /// Number of streams with an installed client
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.borrow().len()
    }

    /// Number of times a client was installed for `stream`
    #[must_use]
    pub fn install_count(&self, stream: StreamId) -> usize {
        self.installs.borrow().get(&stream).copied().unwrap_or(0)
    }

    /// Check if `stream` is scheduled in any mode
    #[must_use]
    pub fn is_scheduled(&self, stream: StreamId) -> bool {
        self.scheduled.borrow().iter().any(|(id, _)| *id == stream)
    }
}

impl Notifier for ManualRunLoop {
    fn install_client(&self, stream: StreamId, flags: EventFlags, callback: NativeCallback) {
        self.clients
            .borrow_mut()
            .insert(stream, Client { flags, callback });
        *self.installs.borrow_mut().entry(stream).or_default() += 1;
    }

    fn uninstall_client(&self, stream: StreamId) {
        self.clients.borrow_mut().remove(&stream);
    }
}

impl Scheduler for ManualRunLoop {
    fn schedule(&self, stream: StreamId, mode: RunMode) {
        self.scheduled.borrow_mut().insert((stream, mode));
    }

    fn unschedule(&self, stream: StreamId, mode: RunMode) {
        self.scheduled.borrow_mut().remove(&(stream, mode));
    }
}

// ============================================================================
// Memory Source
// ============================================================================

/// Source that yields scripted chunks
///
/// A read returns at most one chunk; a partial read keeps the rest of the
/// chunk for the next read. Reads after the script is exhausted return 0.
#[derive(Debug, Default)]
pub struct MemorySource {
    chunks: VecDeque<Vec<u8>>,
    open: bool,
    read_calls: usize,
    bytes_read: usize,
    read_error: Option<io::ErrorKind>,
    open_error: Option<io::ErrorKind>,
}

impl MemorySource {
    /// Create a source yielding `chunks` in order
    pub fn new(chunks: impl IntoIterator<Item = Vec<u8>>) -> Self {
        Self {
            chunks: chunks.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Fail the next read with `kind`
    #[must_use]
    pub fn with_read_error(mut self, kind: io::ErrorKind) -> Self {
        self.read_error = Some(kind);
        self
    }

    /// Fail `open` with `kind`
    #[must_use]
    pub fn with_open_error(mut self, kind: io::ErrorKind) -> Self {
        self.open_error = Some(kind);
        self
    }

    /// Append another chunk to the script
    pub fn push_chunk(&mut self, chunk: impl Into<Vec<u8>>) {
        self.chunks.push_back(chunk.into());
    }

    /// Check if every scripted byte has been read
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Check if the source is open
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Number of `read` calls made
    #[must_use]
    pub fn read_calls(&self) -> usize {
        self.read_calls
    }

    /// Total bytes handed out
    #[must_use]
    pub fn bytes_read(&self) -> usize {
        self.bytes_read
    }
}

impl RawStream for MemorySource {
    fn open(&mut self) -> io::Result<()> {
        if let Some(kind) = self.open_error {
            return Err(io::Error::new(kind, "scripted open failure"));
        }
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }
}

impl RawSource for MemorySource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_calls += 1;
        if let Some(kind) = self.read_error.take() {
            return Err(io::Error::new(kind, "scripted read failure"));
        }

        let Some(chunk) = self.chunks.front_mut() else {
            return Ok(0);
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        chunk.drain(..n);
        if chunk.is_empty() {
            self.chunks.pop_front();
        }

        self.bytes_read += n;
        Ok(n)
    }
}

// ============================================================================
// Memory Sink
// ============================================================================

/// Sink that records what it accepts
///
/// Acceptance is shaped by a per-call limit, a manual space switch, an
/// optional stall point, a zero-progress mode and an injected write error.
#[derive(Debug)]
pub struct MemorySink {
    received: Vec<u8>,
    open: bool,
    space_available: bool,
    max_per_write: Option<usize>,
    stall_after: Option<usize>,
    zero_progress: bool,
    write_calls: usize,
    write_error: Option<io::ErrorKind>,
    open_error: Option<io::ErrorKind>,
}

impl Default for MemorySink {
    fn default() -> Self {
        Self {
            received: Vec::new(),
            open: false,
            space_available: true,
            max_per_write: None,
            stall_after: None,
            zero_progress: false,
            write_calls: 0,
            write_error: None,
            open_error: None,
        }
    }
}

impl MemorySink {
    /// Create a sink that accepts everything
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept at most `limit` bytes per write call
    #[must_use]
    pub fn with_max_per_write(mut self, limit: usize) -> Self {
        self.max_per_write = Some(limit);
        self
    }

    /// Report no space once `bytes` in total have been accepted
    ///
    /// Space comes back with [`set_space_available`](Self::set_space_available).
    #[must_use]
    pub fn with_stall_after(mut self, bytes: usize) -> Self {
        self.stall_after = Some(bytes);
        self
    }

    /// Claim space but accept zero bytes on every write
    #[must_use]
    pub fn with_zero_progress(mut self) -> Self {
        self.zero_progress = true;
        self
    }

    /// Fail the next write with `kind`
    #[must_use]
    pub fn with_write_error(mut self, kind: io::ErrorKind) -> Self {
        self.write_error = Some(kind);
        self
    }

    /// Fail `open` with `kind`
    #[must_use]
    pub fn with_open_error(mut self, kind: io::ErrorKind) -> Self {
        self.open_error = Some(kind);
        self
    }

    /// Switch reported space on or off
    ///
    /// Switching on also clears a reached stall point.
    pub fn set_space_available(&mut self, available: bool) {
        self.space_available = available;
        if available {
            self.stall_after = None;
        }
    }

    /// Stop or resume the zero-progress mode
    pub fn set_zero_progress(&mut self, zero: bool) {
        self.zero_progress = zero;
    }

    /// Every byte accepted so far, in order
    #[must_use]
    pub fn received(&self) -> &[u8] {
        &self.received
    }

    /// Number of `write` calls made
    #[must_use]
    pub fn write_calls(&self) -> usize {
        self.write_calls
    }

    /// Check if the sink is open
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open
    }
}

impl RawStream for MemorySink {
    fn open(&mut self) -> io::Result<()> {
        if let Some(kind) = self.open_error {
            return Err(io::Error::new(kind, "scripted open failure"));
        }
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }
}

impl RawSink for MemorySink {
    fn has_space_available(&self) -> bool {
        if !self.space_available {
            return false;
        }
        self.stall_after
            .map_or(true, |limit| self.received.len() < limit)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_calls += 1;
        if let Some(kind) = self.write_error.take() {
            return Err(io::Error::new(kind, "scripted write failure"));
        }
        if self.zero_progress || !self.has_space_available() {
            return Ok(0);
        }

        let mut n = buf.len();
        if let Some(limit) = self.max_per_write {
            n = n.min(limit);
        }
        if let Some(stall) = self.stall_after {
            n = n.min(stall.saturating_sub(self.received.len()));
        }

        self.received.extend_from_slice(&buf[..n]);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_partial_reads_keep_remainder() {
        let mut source = MemorySource::new(vec![b"ABCDE".to_vec(), b"F".to_vec()]);
        let mut buf = [0u8; 3];

        assert_eq!(source.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"ABC");
        assert_eq!(source.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"DE");
        assert_eq!(source.read(&mut buf).unwrap(), 1);
        assert!(source.is_exhausted());
        assert_eq!(source.read(&mut buf).unwrap(), 0);
        assert_eq!(source.bytes_read(), 6);
    }

    #[test]
    fn test_source_read_error_is_one_shot() {
        let mut source =
            MemorySource::new(vec![b"A".to_vec()]).with_read_error(io::ErrorKind::Other);
        let mut buf = [0u8; 4];
        assert!(source.read(&mut buf).is_err());
        assert_eq!(source.read(&mut buf).unwrap(), 1);
    }

    #[test]
    fn test_sink_limits_and_stall() {
        let mut sink = MemorySink::new().with_max_per_write(2).with_stall_after(3);
        assert_eq!(sink.write(b"ABCD").unwrap(), 2);
        assert_eq!(sink.write(b"CD").unwrap(), 1);
        assert!(!sink.has_space_available());
        assert_eq!(sink.write(b"D").unwrap(), 0);

        sink.set_space_available(true);
        assert_eq!(sink.write(b"D").unwrap(), 1);
        assert_eq!(sink.received(), b"ABCD");
        assert_eq!(sink.write_calls(), 4);
    }

    #[test]
    fn test_run_loop_single_client_per_stream() {
        let run_loop = ManualRunLoop::new();
        let stream = StreamId::new();
        let noop: NativeCallback = Rc::new(|_| {});

        run_loop.install_client(stream, EventFlags::HAS_BYTES_AVAILABLE, Rc::clone(&noop));
        run_loop.install_client(stream, EventFlags::END_ENCOUNTERED, noop);
        assert_eq!(run_loop.client_count(), 1);
        assert_eq!(run_loop.install_count(stream), 2);
        assert_eq!(
            run_loop.installed_flags(stream),
            Some(EventFlags::END_ENCOUNTERED)
        );
    }

    #[test]
    fn test_fire_requires_schedule() {
        let run_loop = ManualRunLoop::new();
        let stream = StreamId::new();
        run_loop.install_client(stream, EventFlags::OPEN_COMPLETED, Rc::new(|_| {}));

        assert!(!run_loop.fire(stream, NativeEvent::OPEN_COMPLETED));
        run_loop.schedule(stream, RunMode::Common);
        assert!(run_loop.fire(stream, NativeEvent::OPEN_COMPLETED));
        run_loop.unschedule(stream, RunMode::Common);
        assert!(!run_loop.fire(stream, NativeEvent::OPEN_COMPLETED));
    }
}
