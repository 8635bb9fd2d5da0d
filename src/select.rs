//! Interruptible `select()` for worker threads.
//!
//! The read end of a process-wide pipe is added to every read set. Writing a
//! byte to the other end from any thread makes an in-progress `select()`
//! return. The pipe is drained completely on every wake, so a stale
//! cancellation byte never cuts the next call short.

use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::select::{select, FdSet, FD_SETSIZE};
use nix::sys::time::{TimeVal, TimeValLike};

use crate::errors::{IoError, IoResult};
use crate::time::Duration;

/// Result of [`SelectPipe::select`]. The cancellation fd never appears here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectOutcome {
    pub readable: Vec<RawFd>,
    pub writable: Vec<RawFd>,
    /// Another thread called [`SelectPipe::cancel`].
    pub cancelled: bool,
}

impl SelectOutcome {
    pub fn ready_count(&self) -> usize {
        self.readable.len() + self.writable.len()
    }
}

pub struct SelectPipe {
    read: File,
    write: File,
}

impl SelectPipe {
    pub fn new() -> IoResult<Self> {
        let (read, write) = nix::unistd::pipe().map_err(|e| IoError::Os(e as i32))?;
        set_nonblocking(&read)?;
        set_nonblocking(&write)?;
        Ok(Self {
            read: File::from(read),
            write: File::from(write),
        })
    }

    /// Make any in-progress or next `select()` return promptly.
    pub fn cancel(&self) -> IoResult<()> {
        match (&self.write).write(&[1]) {
            Ok(_) => Ok(()),
            // pipe full: a cancellation is already pending
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            match (&self.read).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    }

    /// Wait until one of the given fds is ready, `timeout` passes, or the
    /// call is cancelled. `None` waits forever.
    pub fn select(
        &self,
        read_fds: &[BorrowedFd<'_>],
        write_fds: &[BorrowedFd<'_>],
        timeout: Option<Duration>,
    ) -> IoResult<SelectOutcome> {
        let out_of_range = read_fds
            .iter()
            .chain(write_fds)
            .map(|fd| fd.as_raw_fd())
            .find(|fd| !selectable(*fd));
        if let Some(fd) = out_of_range {
            return Err(IoError::bad_parameter(format!(
                "fd {} is outside the select() range",
                fd
            )));
        }
        let cancel_fd = self.read.as_fd();

        let mut read_set = FdSet::new();
        read_set.insert(cancel_fd);
        for fd in read_fds {
            read_set.insert(*fd);
        }
        let mut write_set = FdSet::new();
        for fd in write_fds {
            write_set.insert(*fd);
        }
        let mut timeval = timeout.map(|t| TimeVal::microseconds(t.as_micros().min(i64::MAX as u64) as i64));

        select(None, &mut read_set, &mut write_set, None, timeval.as_mut())
            .map_err(|e| IoError::Os(e as i32))?;

        let cancelled = read_set.contains(cancel_fd);
        if cancelled {
            self.drain();
        }

        Ok(SelectOutcome {
            readable: read_fds
                .iter()
                .filter(|fd| read_set.contains(**fd))
                .map(|fd| fd.as_raw_fd())
                .collect(),
            writable: write_fds
                .iter()
                .filter(|fd| write_set.contains(**fd))
                .map(|fd| fd.as_raw_fd())
                .collect(),
            cancelled,
        })
    }

    /// Raw fd of the cancellation read end.
    pub fn cancel_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }
}

/// `select()` only watches fds below `FD_SETSIZE`.
pub fn selectable(fd: RawFd) -> bool {
    usize::try_from(fd).map_or(false, |fd| fd < FD_SETSIZE as usize)
}

fn set_nonblocking(fd: &OwnedFd) -> IoResult<()> {
    let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL).map_err(|e| IoError::Os(e as i32))?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags)).map_err(|e| IoError::Os(e as i32))?;
    Ok(())
}
