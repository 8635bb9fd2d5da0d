//! Per-target capabilities the I/O core is written against.
//!
//! A [`Platform`] only names types; the concrete device instances are handed
//! to [`crate::IoContext::new`].

use crate::arch::Arch;
use crate::errors::{IoError, IoResult};
use crate::sleep::PowerSleepController;
use crate::time::Clock;

#[cfg(feature = "std")]
pub mod hosted;

#[cfg(feature = "std")]
pub use hosted::{HostPower, HostedPlatform, LoopbackSerial, RamFlash, SerialRemote};

/// Character device used by the serial channel operations.
pub trait SerialPort: Send {
    /// Characters that can be read without blocking.
    fn available(&self) -> usize;

    /// Read up to `buf.len()` characters without blocking.
    fn read(&mut self, buf: &mut [u8]) -> IoResult<usize>;

    /// Queue `data` for transmission. Returns how much was accepted.
    fn write(&mut self, data: &[u8]) -> IoResult<usize>;
}

/// Byte-addressed flash memory.
pub trait FlashDevice: Send {
    /// Size in bytes.
    fn capacity(&self) -> usize;

    /// Reset `len` bytes starting at `address` to the erased state.
    fn erase(&mut self, address: u32, len: usize) -> IoResult<()>;

    fn write(&mut self, address: u32, data: &[u8]) -> IoResult<()>;

    fn read(&self, address: u32, buf: &mut [u8]) -> IoResult<()>;
}

/// Check that `[address, address + len)` lies inside a device of
/// `capacity` bytes and return it as a byte range.
pub fn flash_range(capacity: usize, address: u32, len: usize) -> IoResult<core::ops::Range<usize>> {
    let start = address as usize;
    match start.checked_add(len) {
        Some(end) if end <= capacity => Ok(start..end),
        _ => Err(IoError::bad_parameter(alloc::format!(
            "flash range {:#x}+{} outside {} byte device",
            address,
            len,
            capacity
        ))),
    }
}

/// The set of device types an [`crate::IoContext`] is built from.
pub trait Platform {
    type Arch: Arch + Send + Sync + 'static;
    type Clock: Clock;
    type Power: PowerSleepController;
    type Serial: SerialPort;
    type Flash: FlashDevice;
}
