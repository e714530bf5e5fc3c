//! File-descriptor backed raw streams
//!
//! Both sides switch their descriptor to `O_NONBLOCK` on open and restore the
//! original flags on close.

use std::cell::Cell;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd};
use std::rc::Rc;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::stream::{RawSink, RawSource, RawStream};

/// Lifecycle facts shared between a raw stream and its run loop entry
#[derive(Debug, Default)]
pub(crate) struct FdStatus {
    pub(crate) opened: Cell<bool>,
    pub(crate) open_reported: Cell<bool>,
    pub(crate) at_end: Cell<bool>,
    pub(crate) end_reported: Cell<bool>,
    pub(crate) closed: Cell<bool>,
}

fn set_nonblocking(file: &File) -> io::Result<OFlag> {
    let fd = file.as_raw_fd();
    let original = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(original | OFlag::O_NONBLOCK))?;
    Ok(original)
}

fn restore_flags(file: &File, original: OFlag) {
    if let Err(e) = fcntl(file.as_raw_fd(), FcntlArg::F_SETFL(original)) {
        tracing::debug!(fd = file.as_raw_fd(), error = %e, "Failed to restore descriptor flags");
    }
}

/// Shared open/close handling for both directions
#[derive(Debug)]
struct FdChannel {
    file: Rc<File>,
    status: Rc<FdStatus>,
    original_flags: Option<OFlag>,
}

impl FdChannel {
    fn open(&mut self) -> io::Result<()> {
        if self.original_flags.is_none() {
            self.original_flags = Some(set_nonblocking(&self.file)?);
        }
        self.status.opened.set(true);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(original) = self.original_flags.take() {
            restore_flags(&self.file, original);
        }
        self.status.closed.set(true);
    }
}

/// Readable side of a file descriptor
#[derive(Debug)]
pub struct FdSource {
    channel: FdChannel,
}

impl FdSource {
    pub(crate) fn new(file: Rc<File>, status: Rc<FdStatus>) -> Self {
        Self {
            channel: FdChannel {
                file,
                status,
                original_flags: None,
            },
        }
    }

    /// Check if a read has returned zero bytes
    #[must_use]
    pub fn at_end(&self) -> bool {
        self.channel.status.at_end.get()
    }
}

impl RawStream for FdSource {
    fn open(&mut self) -> io::Result<()> {
        self.channel.open()
    }

    fn close(&mut self) {
        self.channel.close();
    }
}

impl RawSource for FdSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = (&*self.channel.file).read(buf)?;
        if n == 0 && !buf.is_empty() {
            self.channel.status.at_end.set(true);
        }
        Ok(n)
    }
}

/// Writable side of a file descriptor
#[derive(Debug)]
pub struct FdSink {
    channel: FdChannel,
}

impl FdSink {
    pub(crate) fn new(file: Rc<File>, status: Rc<FdStatus>) -> Self {
        Self {
            channel: FdChannel {
                file,
                status,
                original_flags: None,
            },
        }
    }
}

impl RawStream for FdSink {
    fn open(&mut self) -> io::Result<()> {
        self.channel.open()
    }

    fn close(&mut self) {
        if let Err(e) = (&*self.channel.file).flush() {
            tracing::debug!(error = %e, "Flush on close failed");
        }
        self.channel.close();
    }
}

impl RawSink for FdSink {
    fn has_space_available(&self) -> bool {
        let mut fds = [PollFd::new(self.channel.file.as_fd(), PollFlags::POLLOUT)];
        match poll(&mut fds, PollTimeout::ZERO) {
            // Errors and hangups count as "space": the write reports the real failure.
            Ok(n) if n > 0 => fds[0].revents().is_some_and(|revents| {
                revents.intersects(PollFlags::POLLOUT | PollFlags::POLLERR | PollFlags::POLLHUP)
            }),
            _ => false,
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&*self.channel.file).write(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom};

    fn status() -> Rc<FdStatus> {
        Rc::new(FdStatus::default())
    }

    #[test]
    fn test_open_sets_and_close_restores_nonblocking() {
        let file = Rc::new(tempfile::tempfile().unwrap());
        let mut source = FdSource::new(Rc::clone(&file), status());
        let before = fcntl(file.as_raw_fd(), FcntlArg::F_GETFL).unwrap();

        source.open().unwrap();
        let during = OFlag::from_bits_truncate(fcntl(file.as_raw_fd(), FcntlArg::F_GETFL).unwrap());
        assert!(during.contains(OFlag::O_NONBLOCK));

        source.close();
        assert_eq!(fcntl(file.as_raw_fd(), FcntlArg::F_GETFL).unwrap(), before);
    }

    #[test]
    fn test_zero_read_marks_end() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"xy").unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();

        let shared = status();
        let mut source = FdSource::new(Rc::new(file), Rc::clone(&shared));
        source.open().unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(source.read(&mut buf).unwrap(), 2);
        assert!(!source.at_end());
        assert_eq!(source.read(&mut buf).unwrap(), 0);
        assert!(source.at_end());
        assert!(shared.at_end.get());
    }

    #[test]
    fn test_sink_writes_to_file() {
        let file = tempfile::tempfile().unwrap();
        let mut check = file.try_clone().unwrap();
        let mut sink = FdSink::new(Rc::new(file), status());
        sink.open().unwrap();

        assert!(sink.has_space_available());
        assert_eq!(sink.write(b"abc").unwrap(), 3);
        sink.close();

        check.seek(SeekFrom::Start(0)).unwrap();
        let mut contents = String::new();
        check.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "abc");
    }
}
