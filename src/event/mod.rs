//! Event numbers and asynchronous request records.
//!
//! An event number correlates a request the interpreter issued with its later
//! completion. Numbers are positive, never 0 (the "no event" sentinel), and
//! unique among all requests that have not been consumed yet.

use core::fmt;
use core::num::NonZeroI32;
use portable_atomic::{AtomicI32, AtomicUsize, Ordering};

use crate::errors::{IoError, IoResult};

#[cfg(feature = "std")]
pub mod queue;

#[cfg(feature = "std")]
pub use queue::{Completion, EventQueue, PendingList};

/// Positive handle identifying an outstanding request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventNumber(NonZeroI32);

impl EventNumber {
    /// Interpret a raw channel value. Returns `None` for 0 and negatives.
    pub fn new(raw: i32) -> Option<Self> {
        if raw > 0 {
            NonZeroI32::new(raw).map(Self)
        } else {
            None
        }
    }

    pub fn get(self) -> i32 {
        self.0.get()
    }
}

impl fmt::Display for EventNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Raw channel value for an optional event; 0 means "no event".
pub fn event_or_zero(event: Option<EventNumber>) -> i32 {
    event.map_or(0, EventNumber::get)
}

/// Progress of a request. `Done` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventStatus {
    /// Created, not yet picked up
    Starting = 0,
    /// Dequeued by a worker, not yet completed
    Running = 1,
    Done = 2,
    Error = 3,
}

impl EventStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, EventStatus::Done | EventStatus::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Freed as soon as its completion is consumed
    Plain,
    /// Kept alive after consumption so the result can be read
    NativeTask,
}

/// An asynchronous request waiting for completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRequest {
    pub number: EventNumber,
    pub status: EventStatus,
    pub kind: EventKind,
}

impl EventRequest {
    pub fn new(number: EventNumber, kind: EventKind) -> Self {
        Self {
            number,
            status: EventStatus::Starting,
            kind,
        }
    }
}

/// Allocator for event numbers with outstanding-request accounting.
///
/// Numbers increase monotonically and are never reused, which keeps them
/// unique while any Java-level code could still hold one. Running past
/// `i32::MAX` means some caller leaks requests and is fatal.
#[derive(Debug)]
pub struct EventNumbers {
    next: AtomicI32,
    live: AtomicUsize,
    limit: usize,
}

impl EventNumbers {
    pub const fn new(limit: usize) -> Self {
        Self {
            next: AtomicI32::new(1),
            live: AtomicUsize::new(0),
            limit,
        }
    }

    #[cfg(test)]
    pub(crate) const fn starting_at(first: i32, limit: usize) -> Self {
        Self {
            next: AtomicI32::new(first),
            live: AtomicUsize::new(0),
            limit,
        }
    }

    /// Hand out a fresh event number.
    ///
    /// Fails with `OutOfMemory` when the outstanding-request limit is reached.
    pub fn allocate(&self) -> IoResult<EventNumber> {
        let reserved = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.limit).then_some(live + 1)
            });
        if reserved.is_err() {
            log::warn!("event limit of {} outstanding requests reached", self.limit);
            return Err(IoError::OutOfMemory);
        }

        let raw = self
            .next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_add(1))
            .unwrap_or(i32::MAX);
        match EventNumber::new(raw) {
            Some(number) if raw < i32::MAX => Ok(number),
            _ => {
                log::error!("event number counter overflowed at {}", raw);
                panic!("event number counter overflowed");
            }
        }
    }

    /// Return a consumed number's slot to the outstanding-request budget.
    pub fn release(&self, _number: EventNumber) {
        let prev = self.live.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            log::error!("event number released with no outstanding requests");
            panic!("event number released twice");
        }
    }

    /// Number of allocated, not yet released event numbers.
    pub fn outstanding(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}
