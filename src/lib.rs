#![cfg_attr(not(feature = "std"), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

//! Native I/O and event execution core for an embedded bytecode VM.
//!
//! The interpreter runs cooperatively on a single "VM thread". Whenever it
//! needs an OS or device service it fills an [`IoRequest`] and calls
//! [`IoContext::execute`]. Short operations are answered on the spot; blocking
//! ones are handed to a [`TaskExecutor`] worker thread or to the interrupt
//! bridge and answered later through an event number that the interpreter
//! polls with `GetEvent` / `WaitForEvent`.
//!
//! # Features
//!
//! - `std` (default): OS threads, the monitor, the event queue, task
//!   executors, the select pipe, the hosted platform and the dispatcher.
//! - `bare-metal`: use the AArch64 interrupt mask as [`DefaultArch`].
//!
//! Without `std` only the portable pieces are built: event numbering, the
//! interrupt bridge, the sleep scheduler, time, interrupt masking,
//! configuration and errors.
//!
//! # Quick Start
//!
//! ```ignore
//! use vm_event_bridge::{ChannelOp, IoConfig, IoContext, IoRequest};
//!
//! let mut io = IoContext::hosted(IoConfig::default())?;
//! let executor = io
//!     .execute(&IoRequest::new(ChannelOp::CreateTaskExecutor).send("worker"))
//!     .result as i32;
//! let sleep = IoRequest::new(ChannelOp::RunBlockingFunctionOn)
//!     .params(&[executor, vm_event_bridge::natives::SLEEP_MILLIS, 1])
//!     .send(50i32.to_le_bytes().to_vec());
//! let task = io.execute(&sleep).result;
//!
//! let done = io.execute(&IoRequest::new(ChannelOp::WaitForEvent).params(&[-1]));
//! assert_eq!(done.result, task);
//! ```

extern crate alloc;

#[cfg(all(test, not(feature = "std")))]
extern crate std;

// Core modules
pub mod arch;
pub mod config;
pub mod errors;
pub mod event;
pub mod irq;
pub mod platform;
pub mod sleep;
pub mod time;

// Hosted modules
#[cfg(feature = "std")]
pub mod dispatch;
#[cfg(feature = "std")]
pub mod natives;
#[cfg(all(feature = "std", unix))]
pub mod select;
#[cfg(feature = "std")]
pub mod sync;
#[cfg(feature = "std")]
pub mod task;

#[cfg(all(not(test), not(feature = "std"), feature = "bare-metal"))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    use arch::Arch;

    DefaultArch::disable_interrupts();
    loop {
        DefaultArch::wait_for_interrupt();
    }
}

// ============================================================================
// Public API
// ============================================================================

// Architecture abstraction
pub use arch::{without_interrupts, Arch, DefaultArch, InterruptGuard};

// Configuration
pub use config::{IoConfig, IoConfigBuilder};

// Errors
pub use errors::{IoError, IoResult};

// Events
pub use event::{EventNumber, EventNumbers, EventStatus};
#[cfg(feature = "std")]
pub use event::{Completion, EventQueue};

// Interrupts
pub use irq::{irq_bit, IrqBridge, IrqStatus};

// Sleep
pub use sleep::{PowerSleepController, SleepOutcome, SleepPlan, SleepScheduler, SleepStats};

// Platform
pub use platform::{FlashDevice, Platform, SerialPort};
#[cfg(feature = "std")]
pub use platform::HostedPlatform;

// Time
pub use time::{Clock, Duration, Instant, ManualClock};

// Dispatcher and workers
#[cfg(feature = "std")]
pub use dispatch::{ChannelOp, ExtendedOps, IoContext, IoReply, IoRequest};
#[cfg(all(feature = "std", unix))]
pub use select::{SelectOutcome, SelectPipe};
#[cfg(feature = "std")]
pub use sync::{MonitorGuard, SimpleMonitor};
#[cfg(feature = "std")]
pub use task::{ExecutorBuilder, ExecutorStatus, NativeFn, NativeTask, TaskArgs, TaskExecutor};
