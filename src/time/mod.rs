//! Monotonic time and clock sources.

use portable_atomic::{AtomicU64, Ordering};

#[cfg(feature = "std")]
mod system;

#[cfg(feature = "std")]
pub use system::SystemClock;

/// A monotonic time source.
pub trait Clock: Send + Sync {
    /// Current monotonic time.
    fn now(&self) -> Instant;
}

/// Nanoseconds since some arbitrary epoch.
///
/// The epoch is defined by the clock that produced the instant; instants from
/// different clocks must not be compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant(u64);

impl Instant {
    /// Create a new instant from nanoseconds since epoch.
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Create a new instant from milliseconds since epoch.
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis * 1_000_000)
    }

    /// Get nanoseconds since epoch.
    pub fn as_nanos(self) -> u64 {
        self.0
    }

    /// Get milliseconds since epoch.
    pub fn as_millis(self) -> u64 {
        self.0 / 1_000_000
    }

    /// Get microseconds since epoch.
    pub fn as_micros(self) -> u64 {
        self.0 / 1_000
    }

    /// Calculate duration since another instant.
    ///
    /// # Panics
    ///
    /// Panics if `earlier` is after `self`.
    pub fn duration_since(self, earlier: Instant) -> Duration {
        Duration::from_nanos(self.0 - earlier.0)
    }

    /// Duration since `earlier`, or zero if `earlier` is later.
    pub fn saturating_duration_since(self, earlier: Instant) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl core::ops::Add<Duration> for Instant {
    type Output = Self;

    fn add(self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.as_nanos()))
    }
}

/// A duration of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Duration(u64);

impl Duration {
    pub const ZERO: Duration = Duration(0);
    /// Longest representable duration, used for "wait forever".
    pub const MAX: Duration = Duration(u64::MAX);

    /// Create a duration from nanoseconds.
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Create a duration from microseconds.
    pub const fn from_micros(micros: u64) -> Self {
        Self(micros.saturating_mul(1_000))
    }

    /// Create a duration from milliseconds.
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis.saturating_mul(1_000_000))
    }

    /// Get nanoseconds in this duration.
    pub fn as_nanos(self) -> u64 {
        self.0
    }

    /// Get microseconds in this duration.
    pub fn as_micros(self) -> u64 {
        self.0 / 1_000
    }

    /// Get milliseconds in this duration.
    pub fn as_millis(self) -> u64 {
        self.0 / 1_000_000
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn saturating_sub(self, other: Duration) -> Duration {
        Duration(self.0.saturating_sub(other.0))
    }

    pub fn saturating_add(self, other: Duration) -> Duration {
        Duration(self.0.saturating_add(other.0))
    }
}

impl From<Duration> for core::time::Duration {
    fn from(duration: Duration) -> Self {
        core::time::Duration::from_nanos(duration.0)
    }
}

impl From<core::time::Duration> for Duration {
    fn from(duration: core::time::Duration) -> Self {
        Duration(u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX))
    }
}

/// Clock that only moves when told to.
///
/// Used by simulators and tests to drive the sleep scheduler deterministically.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    pub const fn new() -> Self {
        Self {
            nanos: AtomicU64::new(0),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.nanos.fetch_add(duration.as_nanos(), Ordering::AcqRel);
    }

    pub fn set(&self, instant: Instant) {
        self.nanos.store(instant.as_nanos(), Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        Instant::from_nanos(self.nanos.load(Ordering::Acquire))
    }
}

/// ARM Generic Timer (`cntpct_el0` / `cntfrq_el0`).
#[cfg(target_arch = "aarch64")]
#[derive(Debug, Default, Clone, Copy)]
pub struct GenericTimerClock;

#[cfg(target_arch = "aarch64")]
impl Clock for GenericTimerClock {
    fn now(&self) -> Instant {
        let cnt: u64;
        let freq: u64;
        unsafe {
            core::arch::asm!(
                "mrs {}, cntpct_el0",
                out(reg) cnt,
                options(nostack, nomem, preserves_flags)
            );
            core::arch::asm!(
                "mrs {}, cntfrq_el0",
                out(reg) freq,
                options(nostack, nomem, preserves_flags)
            );
        }
        // u128 to avoid overflow in ticks * 1e9
        let nanos = if freq > 0 {
            ((cnt as u128 * 1_000_000_000) / freq as u128) as u64
        } else {
            0
        };
        Instant::from_nanos(nanos)
    }
}
