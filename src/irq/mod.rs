//! Bridge between hardware interrupts and interpreter-level waits.
//!
//! Interrupt handlers only set bits in a status word. The VM thread registers
//! "wait for any of these lines" requests and polls them with
//! [`IrqBridge::get_event`]. Every read-modify-write of the status word from
//! the polling side happens with interrupts masked.

use core::marker::PhantomData;
use alloc::collections::VecDeque;
use portable_atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::arch::{without_interrupts, Arch};
use crate::errors::IoResult;
use crate::event::{EventNumber, EventNumbers};
use crate::time::Instant;

mod signal;

pub use signal::InterruptSlot;

/// Number of distinct interrupt sources, one status bit each.
pub const IRQ_SOURCES: usize = 32;

/// Bit for interrupt source `irq`.
pub const fn irq_bit(irq: u32) -> u32 {
    1 << irq
}

/// The shared interrupt status word, one bit per source.
#[derive(Debug, Default)]
pub struct IrqStatus {
    bits: AtomicU32,
}

impl IrqStatus {
    pub const fn new() -> Self {
        Self {
            bits: AtomicU32::new(0),
        }
    }

    /// Set bits. Safe from interrupt context.
    pub fn raise(&self, mask: u32) {
        self.bits.fetch_or(mask, Ordering::AcqRel);
    }

    pub fn pending(&self) -> u32 {
        self.bits.load(Ordering::Acquire)
    }

    /// Test `mask` against the word and optionally clear the bits that hit.
    /// Returns the bits that were set. Caller holds the critical section.
    fn test_and_clear(&self, mask: u32, clear: bool) -> u32 {
        let hit = self.bits.load(Ordering::Acquire) & mask;
        if hit != 0 && clear {
            self.bits.fetch_and(!hit, Ordering::AcqRel);
        }
        hit
    }
}

/// An outstanding wait for any interrupt in `mask`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqRequest {
    pub number: EventNumber,
    pub mask: u32,
}

struct DeepSleepWake {
    number: EventNumber,
    ready: bool,
}

/// Interrupt status, per-source slots and the list of waiting requests.
pub struct IrqBridge<A: Arch> {
    status: IrqStatus,
    slots: [InterruptSlot; IRQ_SOURCES],
    requests: spin::Mutex<VecDeque<IrqRequest>>,
    serial_request: spin::Mutex<Option<EventNumber>>,
    serial_available: AtomicBool,
    deep_sleep_wake: spin::Mutex<Option<DeepSleepWake>>,
    fiq_mask: u32,
    depth: AtomicU32,
    max_depth: AtomicU32,
    continuation: spin::Mutex<Option<fn()>>,
    last_interrupt: AtomicU64,
    _arch: PhantomData<A>,
}

impl<A: Arch> IrqBridge<A> {
    /// `fiq_mask` selects the sources that may wake a sleep manager waiting
    /// for permission to deep sleep.
    pub fn new(fiq_mask: u32) -> Self {
        Self {
            status: IrqStatus::new(),
            slots: core::array::from_fn(|_| InterruptSlot::new()),
            requests: spin::Mutex::new(VecDeque::new()),
            serial_request: spin::Mutex::new(None),
            serial_available: AtomicBool::new(false),
            deep_sleep_wake: spin::Mutex::new(None),
            fiq_mask,
            depth: AtomicU32::new(0),
            max_depth: AtomicU32::new(0),
            continuation: spin::Mutex::new(None),
            last_interrupt: AtomicU64::new(0),
            _arch: PhantomData,
        }
    }

    /// Hook run when the outermost interrupt handler finishes, giving newly
    /// runnable interpreter threads a chance to run.
    pub fn with_continuation(self, continuation: fn()) -> Self {
        self.set_continuation(Some(continuation));
        self
    }

    /// Install or remove the continuation on a bridge that is already shared.
    pub fn set_continuation(&self, continuation: Option<fn()>) {
        without_interrupts::<A, _>(|| *self.continuation.lock() = continuation);
    }

    pub fn status(&self) -> &IrqStatus {
        &self.status
    }

    pub fn slot(&self, irq: u32) -> Option<&InterruptSlot> {
        self.slots.get(irq as usize)
    }

    /// Register a wait for any interrupt in `mask`.
    pub fn store_irq_request(&self, numbers: &EventNumbers, mask: u32) -> IoResult<EventNumber> {
        let number = numbers.allocate()?;
        let mut requests = self.requests.lock();
        if let Err(e) = requests.try_reserve(1) {
            drop(requests);
            numbers.release(number);
            return Err(e.into());
        }
        requests.push_back(IrqRequest { number, mask });
        Ok(number)
    }

    /// Whether any bit of `mask` is pending, clearing those bits if `clear`.
    pub fn check_irq(&self, mask: u32, clear: bool) -> bool {
        let hit = without_interrupts::<A, _>(|| self.status.test_and_clear(mask, clear));
        if hit != 0 && clear {
            self.release_slots(hit);
        }
        hit != 0
    }

    fn release_slots(&self, bits: u32) {
        for (irq, slot) in self.slots.iter().enumerate() {
            if bits & irq_bit(irq as u32) != 0 {
                slot.release();
            }
        }
    }

    /// Find the first satisfied request.
    ///
    /// With `remove` the request is unlinked and its bits cleared. With
    /// `fiq_only` only requests touching the sleep-manager mask are looked at
    /// and the serial and deep-sleep fall-throughs are skipped.
    pub fn get_event(&self, remove: bool, fiq_only: bool) -> Option<EventNumber> {
        {
            let mut requests = self.requests.lock();
            let found = requests.iter().position(|request| {
                (!fiq_only || request.mask & self.fiq_mask != 0) && self.check_irq(request.mask, remove)
            });
            if let Some(index) = found {
                let request = requests[index];
                if remove {
                    requests.remove(index);
                }
                return Some(request.number);
            }
        }
        if fiq_only {
            return None;
        }

        if self.serial_available.load(Ordering::Acquire) {
            let mut serial = self.serial_request.lock();
            if let Some(number) = *serial {
                if remove {
                    *serial = None;
                }
                return Some(number);
            }
        }

        let mut wake = self.deep_sleep_wake.lock();
        match wake.as_ref() {
            Some(w) if w.ready => {
                let number = w.number;
                if remove {
                    *wake = None;
                }
                Some(number)
            }
            _ => None,
        }
    }

    /// Whether `get_event` would currently find something.
    pub fn has_event(&self, fiq_only: bool) -> bool {
        self.get_event(false, fiq_only).is_some()
    }

    pub fn outstanding_requests(&self) -> usize {
        self.requests.lock().len()
    }

    /// Record whether the serial port has characters to read.
    pub fn set_serial_available(&self, available: bool) {
        self.serial_available.store(available, Ordering::Release);
    }

    /// Event number for a wait on serial input, reusing a pending one.
    pub fn wait_for_serial(&self, numbers: &EventNumbers) -> IoResult<EventNumber> {
        let mut serial = self.serial_request.lock();
        match *serial {
            Some(number) => Ok(number),
            None => {
                let number = numbers.allocate()?;
                *serial = Some(number);
                Ok(number)
            }
        }
    }

    /// Event number completed when the next deep sleep ends.
    pub fn arm_deep_sleep_wake(&self, numbers: &EventNumbers) -> IoResult<EventNumber> {
        let mut wake = self.deep_sleep_wake.lock();
        match wake.as_ref() {
            Some(w) => Ok(w.number),
            None => {
                let number = numbers.allocate()?;
                *wake = Some(DeepSleepWake {
                    number,
                    ready: false,
                });
                Ok(number)
            }
        }
    }

    /// Mark the armed deep-sleep wake event as completed.
    pub fn fire_deep_sleep_wake(&self) -> bool {
        match self.deep_sleep_wake.lock().as_mut() {
            Some(w) => {
                w.ready = true;
                true
            }
            None => false,
        }
    }

    /// Fold interrupts that arrived while powered down into the status word.
    pub fn fold_pending(&self, mask: u32) {
        if mask != 0 {
            without_interrupts::<A, _>(|| self.status.raise(mask));
        }
    }

    /// Timestamp of the most recent accepted interrupt.
    pub fn last_interrupt(&self) -> Instant {
        Instant::from_nanos(self.last_interrupt.load(Ordering::Acquire))
    }

    /// Deepest interrupt nesting observed.
    pub fn max_nesting(&self) -> u32 {
        self.max_depth.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::NoOpArch;

    fn bridge() -> (IrqBridge<NoOpArch>, EventNumbers) {
        (IrqBridge::new(0x4), EventNumbers::new(64))
    }

    #[test]
    fn test_matching_request_is_returned_and_removed() {
        let (bridge, numbers) = bridge();
        let first = bridge.store_irq_request(&numbers, 0x1).unwrap();
        let second = bridge.store_irq_request(&numbers, 0x2).unwrap();
        assert_ne!(first, second);

        bridge.handle_interrupt(1, Instant::from_millis(5));
        assert_eq!(bridge.get_event(true, false), Some(second));
        assert_eq!(bridge.get_event(true, false), None);
        assert_eq!(bridge.status().pending(), 0);
        assert_eq!(bridge.outstanding_requests(), 1);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let (bridge, numbers) = bridge();
        let number = bridge.store_irq_request(&numbers, 0x8).unwrap();
        bridge.handle_interrupt(3, Instant::from_millis(1));
        assert_eq!(bridge.get_event(false, false), Some(number));
        assert_eq!(bridge.get_event(false, false), Some(number));
        assert_eq!(bridge.status().pending(), 0x8);
        assert_eq!(bridge.get_event(true, false), Some(number));
        assert!(!bridge.has_event(false));
    }

    #[test]
    fn test_fiq_only_filters_requests() {
        let (bridge, numbers) = bridge();
        let plain = bridge.store_irq_request(&numbers, 0x1).unwrap();
        let fiq = bridge.store_irq_request(&numbers, 0x4).unwrap();
        bridge.handle_interrupt(0, Instant::from_millis(1));
        assert_eq!(bridge.get_event(true, true), None);

        bridge.handle_interrupt(2, Instant::from_millis(2));
        assert_eq!(bridge.get_event(true, true), Some(fiq));
        assert_eq!(bridge.get_event(true, false), Some(plain));
    }

    #[test]
    fn test_check_irq_clears_only_when_asked() {
        let (bridge, _) = bridge();
        bridge.status().raise(0x6);
        assert!(bridge.check_irq(0x2, false));
        assert_eq!(bridge.status().pending(), 0x6);
        assert!(bridge.check_irq(0x3, true));
        assert_eq!(bridge.status().pending(), 0x4);
        assert!(!bridge.check_irq(0x1, true));
    }

    #[test]
    fn test_serial_fall_through() {
        let (bridge, numbers) = bridge();
        let number = bridge.wait_for_serial(&numbers).unwrap();
        assert_eq!(bridge.wait_for_serial(&numbers).unwrap(), number);
        assert_eq!(bridge.get_event(true, false), None);
        bridge.set_serial_available(true);
        assert_eq!(bridge.get_event(true, true), None);
        assert_eq!(bridge.get_event(true, false), Some(number));
        assert_eq!(bridge.get_event(true, false), None);
    }

    #[test]
    fn test_deep_sleep_wake_fall_through() {
        let (bridge, numbers) = bridge();
        assert!(!bridge.fire_deep_sleep_wake());
        let number = bridge.arm_deep_sleep_wake(&numbers).unwrap();
        assert_eq!(bridge.get_event(true, false), None);
        assert!(bridge.fire_deep_sleep_wake());
        assert_eq!(bridge.get_event(true, false), Some(number));
        assert_eq!(bridge.get_event(true, false), None);
    }

    #[test]
    fn test_fold_pending_wakes_waiters() {
        let (bridge, numbers) = bridge();
        let number = bridge.store_irq_request(&numbers, 0x10).unwrap();
        bridge.fold_pending(0x10);
        assert_eq!(bridge.get_event(true, false), Some(number));
    }

    #[test]
    fn test_request_allocation_failure_is_reported() {
        let bridge: IrqBridge<NoOpArch> = IrqBridge::new(0);
        let numbers = EventNumbers::new(1);
        bridge.store_irq_request(&numbers, 0x1).unwrap();
        assert_eq!(
            bridge.store_irq_request(&numbers, 0x2),
            Err(crate::errors::IoError::OutOfMemory)
        );
    }
}
