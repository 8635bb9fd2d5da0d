//! Interrupt handler entry point.
//!
//! Runs in interrupt (or, on hosted targets, signal) context: only atomics,
//! no allocation, no logging.

use portable_atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use super::{irq_bit, IrqBridge, IRQ_SOURCES};
use crate::arch::{without_interrupts, Arch};
use crate::time::Instant;

/// Bookkeeping for one interrupt source.
///
/// At most one notification per source is outstanding. Occurrences arriving
/// while the previous one is unacknowledged are counted and dropped.
#[derive(Debug, Default)]
pub struct InterruptSlot {
    in_use: AtomicBool,
    caught: AtomicU32,
    ignored: AtomicU32,
    last_caught: AtomicU64,
    callback: spin::Mutex<Option<fn(u32)>>,
}

impl InterruptSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a notification is waiting to be acknowledged.
    pub fn in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn caught_count(&self) -> u32 {
        self.caught.load(Ordering::Acquire)
    }

    pub fn ignored_count(&self) -> u32 {
        self.ignored.load(Ordering::Acquire)
    }

    pub fn last_caught(&self) -> Instant {
        Instant::from_nanos(self.last_caught.load(Ordering::Acquire))
    }

    pub(super) fn release(&self) {
        self.in_use.store(false, Ordering::Release);
    }
}

impl<A: Arch> IrqBridge<A> {
    /// Install a callback run in interrupt context for every accepted
    /// occurrence of `irq`.
    pub fn register_callback(&self, irq: u32, callback: Option<fn(u32)>) -> bool {
        match self.slots.get(irq as usize) {
            Some(slot) => {
                without_interrupts::<A, _>(|| *slot.callback.lock() = callback);
                true
            }
            None => false,
        }
    }

    /// Handler entry for interrupt `irq`.
    ///
    /// Returns `true` if a notification was posted, `false` if it was
    /// coalesced into the previous one or `irq` is out of range.
    pub fn handle_interrupt(&self, irq: u32, now: Instant) -> bool {
        if irq as usize >= IRQ_SOURCES {
            return false;
        }
        let depth = self.depth.fetch_add(1, Ordering::AcqRel) + 1;
        self.max_depth.fetch_max(depth, Ordering::AcqRel);

        let slot = &self.slots[irq as usize];
        let posted = !slot.in_use.swap(true, Ordering::AcqRel);
        if posted {
            slot.caught.fetch_add(1, Ordering::AcqRel);
            slot.last_caught.store(now.as_nanos(), Ordering::Release);
            self.last_interrupt.store(now.as_nanos(), Ordering::Release);
            let callback = *slot.callback.lock();
            if let Some(callback) = callback {
                callback(irq);
            }
            self.status.raise(irq_bit(irq));
        } else {
            slot.ignored.fetch_add(1, Ordering::AcqRel);
        }

        if depth == 1 {
            let continuation = *self.continuation.lock();
            if let Some(continuation) = continuation {
                continuation();
            }
        }
        self.depth.fetch_sub(1, Ordering::AcqRel);
        posted
    }
}
