//! Platform for running the I/O core as an ordinary process.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;

use super::{flash_range, FlashDevice, Platform, SerialPort};
use crate::arch::DefaultArch;
use crate::errors::{IoError, IoResult};
use crate::sleep::PowerSleepController;
use crate::time::{Duration, SystemClock};

/// Longest single halt in a shallow sleep, so pending events are noticed
/// promptly.
const HOST_HALT_SLICE: Duration = Duration::from_millis(1);

/// Hosted device set: system clock, thread-sleep power control, an in-memory
/// serial line and RAM-backed flash.
pub struct HostedPlatform;

impl Platform for HostedPlatform {
    type Arch = DefaultArch;
    type Clock = SystemClock;
    type Power = HostPower;
    type Serial = LoopbackSerial;
    type Flash = RamFlash;
}

/// "Halts" by sleeping the calling thread. There is no real power state, so
/// a deep sleep is a plain sleep that reports no interrupts.
#[derive(Debug, Default)]
pub struct HostPower;

impl PowerSleepController for HostPower {
    fn stop_processor(&self, max: Duration) {
        thread::sleep(max.min(HOST_HALT_SLICE).into());
    }

    fn deep_sleep(&self, duration: Duration) -> u32 {
        thread::sleep(duration.into());
        0
    }
}

#[derive(Default)]
struct SerialLine {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
}

/// In-memory serial port. The far end is reached through a
/// [`SerialRemote`].
#[derive(Default)]
pub struct LoopbackSerial {
    line: Arc<spin::Mutex<SerialLine>>,
}

impl LoopbackSerial {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remote(&self) -> SerialRemote {
        SerialRemote {
            line: self.line.clone(),
        }
    }
}

impl SerialPort for LoopbackSerial {
    fn available(&self) -> usize {
        self.line.lock().rx.len()
    }

    fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        let mut line = self.line.lock();
        let count = buf.len().min(line.rx.len());
        for (dst, src) in buf.iter_mut().zip(line.rx.drain(..count)) {
            *dst = src;
        }
        Ok(count)
    }

    fn write(&mut self, data: &[u8]) -> IoResult<usize> {
        let mut line = self.line.lock();
        line.tx.try_reserve(data.len())?;
        line.tx.extend_from_slice(data);
        Ok(data.len())
    }
}

/// The other end of a [`LoopbackSerial`].
#[derive(Clone)]
pub struct SerialRemote {
    line: Arc<spin::Mutex<SerialLine>>,
}

impl SerialRemote {
    /// Make `data` readable on the port.
    pub fn send(&self, data: &[u8]) {
        self.line.lock().rx.extend(data.iter().copied());
    }

    /// Take everything the port has written so far.
    pub fn take_output(&self) -> Vec<u8> {
        core::mem::take(&mut self.line.lock().tx)
    }
}

/// NOR-style flash backed by a byte vector. Erased bytes read `0xFF`; a write
/// can only clear bits.
pub struct RamFlash {
    cells: Vec<u8>,
}

impl RamFlash {
    pub const ERASED: u8 = 0xFF;

    pub fn new(capacity: usize) -> Self {
        Self {
            cells: vec![Self::ERASED; capacity],
        }
    }
}

impl FlashDevice for RamFlash {
    fn capacity(&self) -> usize {
        self.cells.len()
    }

    fn erase(&mut self, address: u32, len: usize) -> IoResult<()> {
        let range = flash_range(self.cells.len(), address, len)?;
        self.cells[range].fill(Self::ERASED);
        Ok(())
    }

    fn write(&mut self, address: u32, data: &[u8]) -> IoResult<()> {
        let range = flash_range(self.cells.len(), address, data.len())?;
        let cells = &mut self.cells[range];
        if cells.iter().zip(data).any(|(cell, byte)| cell & byte != *byte) {
            return Err(IoError::device(format!(
                "write at {:#x} needs an erase first",
                address
            )));
        }
        cells.copy_from_slice(data);
        Ok(())
    }

    fn read(&self, address: u32, buf: &mut [u8]) -> IoResult<()> {
        let range = flash_range(self.cells.len(), address, buf.len())?;
        buf.copy_from_slice(&self.cells[range]);
        Ok(())
    }
}
