//! Architecture abstraction for interrupt masking.
//!
//! On bare metal there is no OS mutex below the interrupt handlers, so the
//! critical section protecting interrupt-shared state is "interrupts masked".
//! This is a different primitive from [`crate::sync::SimpleMonitor`] and the
//! two are never mixed on the same data.

use core::marker::PhantomData;

/// Architecture abstraction trait.
///
/// Implemented once per supported CPU architecture.
pub trait Arch {
    /// Enable interrupts on the current CPU.
    fn enable_interrupts();

    /// Disable interrupts on the current CPU.
    fn disable_interrupts();

    /// Check if interrupts are currently enabled.
    fn interrupts_enabled() -> bool;

    /// Halt the CPU until the next interrupt arrives.
    fn wait_for_interrupt();
}

/// A no-op architecture implementation for hosted builds and tests.
///
/// Hosted "interrupts" are simulated by other threads calling the signal
/// handler entry points, which only touch atomics.
pub struct NoOpArch;

impl Arch for NoOpArch {
    fn enable_interrupts() {}

    fn disable_interrupts() {}

    fn interrupts_enabled() -> bool {
        true
    }

    fn wait_for_interrupt() {
        core::hint::spin_loop();
    }
}

/// Critical section that keeps interrupts masked while alive.
///
/// Restores the mask state that was in effect when it was created, so guards
/// nest correctly.
pub struct InterruptGuard<A: Arch> {
    were_enabled: bool,
    _arch: PhantomData<A>,
}

impl<A: Arch> InterruptGuard<A> {
    pub fn new() -> Self {
        let were_enabled = A::interrupts_enabled();
        A::disable_interrupts();
        Self {
            were_enabled,
            _arch: PhantomData,
        }
    }
}

impl<A: Arch> Default for InterruptGuard<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Arch> Drop for InterruptGuard<A> {
    fn drop(&mut self) {
        if self.were_enabled {
            A::enable_interrupts();
        }
    }
}

/// Run `f` with interrupts masked.
pub fn without_interrupts<A: Arch, R>(f: impl FnOnce() -> R) -> R {
    let _guard = InterruptGuard::<A>::new();
    f()
}

#[cfg(target_arch = "aarch64")]
pub mod aarch64;

#[cfg(all(target_arch = "aarch64", feature = "bare-metal"))]
pub use aarch64::Aarch64Arch as DefaultArch;

#[cfg(not(all(target_arch = "aarch64", feature = "bare-metal")))]
pub use NoOpArch as DefaultArch;
