//! Synchronization primitives for hosted targets.

pub mod monitor;

pub use monitor::{MonitorGuard, SimpleMonitor};
