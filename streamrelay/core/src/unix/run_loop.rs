//! Poll Run Loop
//!
//! Drives file-descriptor streams with `poll(2)`. Each turn first reports
//! lifecycle events the descriptors cannot signal themselves, then polls.
//!
//! ```text
//!   turn ──▶ prune dead entries
//!        ──▶ OPEN_COMPLETED (once, after open)
//!        ──▶ END_ENCOUNTERED (once, after a zero read or a hangup)
//!        ──▶ poll(fds, interval)
//!              POLLIN  ──▶ HAS_BYTES_AVAILABLE
//!              POLLOUT ──▶ CAN_ACCEPT_BYTES
//!              POLLERR / POLLNVAL ──▶ ERROR_OCCURRED
//!              POLLHUP (nothing left to read) ──▶ END_ENCOUNTERED
//! ```
//!
//! Only events in a stream's installed flags are delivered, and each is
//! re-checked right before delivery, so a handler that closes a stream stops
//! the rest of that turn's events for it. A source is polled only while
//! `HAS_BYTES_AVAILABLE` is installed; a source whose reader has paused is
//! not watched, so its hangup waits until reading resumes.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io;
use std::os::fd::AsFd;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use super::fd_stream::{FdSink, FdSource, FdStatus};
use crate::bridge::{NativeCallback, Notifier};
use crate::config::RunLoopConfig;
use crate::event::{EventFlags, NativeEvent};
use crate::stream::{RawStream, RunMode, Scheduler, Stream, StreamId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    Read,
    Write,
}

struct Binding {
    file: Weak<File>,
    direction: Direction,
    status: Rc<FdStatus>,
}

struct Client {
    flags: EventFlags,
    callback: NativeCallback,
}

#[derive(Default)]
struct Entry {
    binding: Option<Binding>,
    client: Option<Client>,
    modes: HashSet<RunMode>,
}

impl Entry {
    fn is_dead(&self) -> bool {
        self.binding
            .as_ref()
            .is_some_and(|binding| binding.file.strong_count() == 0)
    }
}

/// One descriptor to poll this turn
struct Watch {
    stream: StreamId,
    file: Rc<File>,
    direction: Direction,
    status: Rc<FdStatus>,
    interest: PollFlags,
}

/// `poll(2)` based run loop for file-descriptor streams
pub struct PollRunLoop {
    config: RunLoopConfig,
    entries: RefCell<HashMap<StreamId, Entry>>,
}

impl PollRunLoop {
    /// Create a loop with the given configuration
    #[must_use]
    pub fn new(config: RunLoopConfig) -> Self {
        Self {
            config,
            entries: RefCell::new(HashMap::new()),
        }
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &RunLoopConfig {
        &self.config
    }

    /// Wrap a readable file in a stream driven by this loop
    pub fn source(self: &Rc<Self>, file: File) -> Stream<FdSource> {
        let (file, status) = (Rc::new(file), Rc::new(FdStatus::default()));
        let stream = self.stream(FdSource::new(Rc::clone(&file), Rc::clone(&status)));
        self.bind(stream.id(), &file, Direction::Read, status);
        stream
    }

    /// Wrap a writable file in a stream driven by this loop
    pub fn sink(self: &Rc<Self>, file: File) -> Stream<FdSink> {
        let (file, status) = (Rc::new(file), Rc::new(FdStatus::default()));
        let stream = self.stream(FdSink::new(Rc::clone(&file), Rc::clone(&status)));
        self.bind(stream.id(), &file, Direction::Write, status);
        stream
    }

    fn stream<S: RawStream>(self: &Rc<Self>, raw: S) -> Stream<S> {
        let notifier: Rc<dyn Notifier> = self.clone();
        let scheduler: Rc<dyn Scheduler> = self.clone();
        Stream::new(raw, notifier, scheduler)
    }

    fn bind(&self, stream: StreamId, file: &Rc<File>, direction: Direction, status: Rc<FdStatus>) {
        self.entries.borrow_mut().entry(stream).or_default().binding = Some(Binding {
            file: Rc::downgrade(file),
            direction,
            status,
        });
    }

    /// Check if any stream is scheduled
    #[must_use]
    pub fn has_scheduled(&self) -> bool {
        self.entries
            .borrow()
            .values()
            .any(|entry| !entry.modes.is_empty() && !entry.is_dead())
    }

    /// Turn until nothing is scheduled or `stop` is set
    ///
    /// # Errors
    ///
    /// Returns the `poll` error, other than `EINTR`, that ended the loop.
    pub fn run(&self, stop: &AtomicBool) -> io::Result<()> {
        tracing::debug!(interval = ?self.config.poll_interval, "Run loop started");
        while !stop.load(Ordering::Relaxed) && self.has_scheduled() {
            self.turn(self.config.poll_interval)?;
        }
        tracing::debug!(stopped = stop.load(Ordering::Relaxed), "Run loop finished");
        Ok(())
    }

    /// Deliver lifecycle events, then poll for at most `timeout`
    ///
    /// Returns the number of events delivered.
    ///
    /// # Errors
    ///
    /// Returns the `poll` error. An interrupted poll delivers nothing and
    /// is not an error.
    pub fn turn(&self, timeout: Duration) -> io::Result<usize> {
        self.entries.borrow_mut().retain(|_, entry| !entry.is_dead());

        let mut due: Vec<(StreamId, NativeEvent)> = Vec::new();
        let watches = self.collect_watches(&mut due);

        // Lifecycle events pending: don't block in poll.
        let wait = if due.is_empty() { timeout } else { Duration::ZERO };
        self.poll_watches(&watches, wait, &mut due)?;

        let mut delivered = 0;
        for (stream, event) in due {
            if let Some(callback) = self.callback_for(stream, event) {
                callback(event);
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    fn collect_watches(&self, due: &mut Vec<(StreamId, NativeEvent)>) -> Vec<Watch> {
        let entries = self.entries.borrow();
        let mut watches = Vec::new();

        for (&stream, entry) in entries.iter() {
            let (Some(binding), Some(client)) = (&entry.binding, &entry.client) else {
                continue;
            };
            let status = &binding.status;
            if entry.modes.is_empty() || !status.opened.get() || status.closed.get() {
                continue;
            }
            let Some(file) = binding.file.upgrade() else {
                continue;
            };

            if !status.open_reported.replace(true) {
                due.push((stream, NativeEvent::OPEN_COMPLETED));
            }
            if status.at_end.get() {
                if !status.end_reported.replace(true) {
                    due.push((stream, NativeEvent::END_ENCOUNTERED));
                }
                continue;
            }

            // A source nobody reads from is left alone: its end can only be
            // seen once the bytes before it have been read.
            let interest = match binding.direction {
                Direction::Read if client.flags.contains(EventFlags::HAS_BYTES_AVAILABLE) => {
                    PollFlags::POLLIN
                }
                Direction::Read => continue,
                Direction::Write if client.flags.contains(EventFlags::CAN_ACCEPT_BYTES) => {
                    PollFlags::POLLOUT
                }
                Direction::Write => PollFlags::empty(),
            };
            watches.push(Watch {
                stream,
                file,
                direction: binding.direction,
                status: Rc::clone(status),
                interest,
            });
        }

        watches
    }

    fn poll_watches(
        &self,
        watches: &[Watch],
        wait: Duration,
        due: &mut Vec<(StreamId, NativeEvent)>,
    ) -> io::Result<()> {
        let mut fds: Vec<PollFd<'_>> = watches
            .iter()
            .map(|watch| PollFd::new(watch.file.as_fd(), watch.interest))
            .collect();

        let millis = u16::try_from(wait.as_millis()).unwrap_or(u16::MAX);
        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(0) => return Ok(()),
            Ok(_) => {}
            Err(Errno::EINTR) => {
                tracing::trace!("Poll interrupted");
                return Ok(());
            }
            Err(e) => return Err(io::Error::from(e)),
        }

        for (watch, fd) in watches.iter().zip(&fds) {
            let Some(revents) = fd.revents() else {
                continue;
            };
            if revents.contains(PollFlags::POLLIN) {
                due.push((watch.stream, NativeEvent::HAS_BYTES_AVAILABLE));
            }
            if revents.contains(PollFlags::POLLOUT) {
                due.push((watch.stream, NativeEvent::CAN_ACCEPT_BYTES));
            }
            if revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
                due.push((watch.stream, NativeEvent::ERROR_OCCURRED));
            }
            // A hangup with data still buffered is reported once the reads drain it.
            let drained =
                watch.direction == Direction::Write || !revents.contains(PollFlags::POLLIN);
            if revents.contains(PollFlags::POLLHUP) && drained {
                watch.status.at_end.set(true);
                if !watch.status.end_reported.replace(true) {
                    due.push((watch.stream, NativeEvent::END_ENCOUNTERED));
                }
            }
        }
        Ok(())
    }

    fn callback_for(&self, stream: StreamId, event: NativeEvent) -> Option<NativeCallback> {
        let entries = self.entries.borrow();
        let entry = entries.get(&stream)?;
        if entry.modes.is_empty() {
            return None;
        }
        let client = entry.client.as_ref()?;
        client
            .flags
            .includes(event)
            .then(|| Rc::clone(&client.callback))
    }
}

impl Default for PollRunLoop {
    fn default() -> Self {
        Self::new(RunLoopConfig::default())
    }
}

impl Notifier for PollRunLoop {
    fn install_client(&self, stream: StreamId, flags: EventFlags, callback: NativeCallback) {
        self.entries.borrow_mut().entry(stream).or_default().client =
            Some(Client { flags, callback });
    }

    fn uninstall_client(&self, stream: StreamId) {
        if let Some(entry) = self.entries.borrow_mut().get_mut(&stream) {
            entry.client = None;
        }
    }
}

impl Scheduler for PollRunLoop {
    fn schedule(&self, stream: StreamId, mode: RunMode) {
        self.entries
            .borrow_mut()
            .entry(stream)
            .or_default()
            .modes
            .insert(mode);
    }

    fn unschedule(&self, stream: StreamId, mode: RunMode) {
        if let Some(entry) = self.entries.borrow_mut().get_mut(&stream) {
            entry.modes.remove(&mode);
        }
    }
}
