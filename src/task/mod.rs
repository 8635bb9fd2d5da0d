//! Blocking native calls run off the VM thread.
//!
//! A [`NativeTask`] is created by the dispatching thread, executed by exactly
//! one [`TaskExecutor`] worker, and consumed by the dispatching thread after
//! its completion has been observed. Ownership moves along that path; no two
//! threads ever touch a task at the same time.

use core::fmt;
use std::sync::Arc;

use crate::event::{EventKind, EventNumber, EventRequest, EventStatus};

pub mod executor;

pub use executor::{ExecutorBuilder, ExecutorStatus, TaskExecutor};

/// Maximum number of integer arguments a registered native function takes.
pub const MAX_TASK_ARGS: usize = 10;

/// Argument block passed to a registered native function.
pub type TaskArgs = [i64; MAX_TASK_ARGS];

/// A native function callable through `RunBlockingFunctionOn`.
pub type NativeFn = Arc<dyn Fn(&TaskArgs) -> i64 + Send + Sync>;

type BlockingCall = Box<dyn FnOnce() -> i64 + Send>;

/// One blocking call and, once it has run, its results.
pub struct NativeTask {
    request: EventRequest,
    handler: Option<BlockingCall>,
    result: i64,
    nt_errno: i32,
}

impl NativeTask {
    /// Wrap a blocking closure under a freshly allocated event number.
    pub fn new<F>(number: EventNumber, call: F) -> Box<Self>
    where
        F: FnOnce() -> i64 + Send + 'static,
    {
        Box::new(Self {
            request: EventRequest::new(number, EventKind::NativeTask),
            handler: Some(Box::new(call)),
            result: 0,
            nt_errno: 0,
        })
    }

    /// Bind a registered native function to its arguments.
    pub fn from_native(number: EventNumber, function: &NativeFn, args: TaskArgs) -> Box<Self> {
        let function = function.clone();
        Self::new(number, move || function(&args))
    }

    pub fn number(&self) -> EventNumber {
        self.request.number
    }

    pub fn status(&self) -> EventStatus {
        self.request.status
    }

    /// Full return value of the native call.
    pub fn result(&self) -> i64 {
        self.result
    }

    /// Low 32 bits of the return value.
    pub fn low_result(&self) -> i32 {
        self.result as i32
    }

    /// OS error number captured right after the call returned.
    pub fn errno(&self) -> i32 {
        self.nt_errno
    }

    pub(crate) fn set_status(&mut self, status: EventStatus) {
        self.request.status = status;
    }

    /// Run the stored call. Must be called without holding any monitor.
    pub(crate) fn run(&mut self) {
        let Some(call) = self.handler.take() else {
            log::warn!("native task {} has already run", self.request.number);
            return;
        };
        errno::clear();
        self.result = call();
        self.nt_errno = errno::last();
    }

    /// Mark the task failed without running it.
    pub(crate) fn reject(&mut self, errno: i32) {
        self.handler = None;
        self.nt_errno = errno;
        self.request.status = EventStatus::Error;
    }
}

impl fmt::Debug for NativeTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeTask")
            .field("number", &self.request.number)
            .field("status", &self.request.status)
            .field("result", &self.result)
            .field("errno", &self.nt_errno)
            .finish()
    }
}

pub(crate) mod errno {
    #[cfg(unix)]
    pub(crate) fn clear() {
        nix::errno::Errno::clear();
    }

    #[cfg(not(unix))]
    pub(crate) fn clear() {}

    pub(crate) fn last() -> i32 {
        std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
    }

    /// Reported for tasks refused by a stopping executor.
    #[cfg(unix)]
    pub(crate) const SHUTDOWN: i32 = nix::errno::Errno::ESHUTDOWN as i32;

    #[cfg(not(unix))]
    pub(crate) const SHUTDOWN: i32 = -1;
}
