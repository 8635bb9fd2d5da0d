//! Built-in native functions for `RunBlockingFunctionOn`.
//!
//! Every function takes the fixed [`TaskArgs`] block and returns one integer;
//! failures are reported through the return value and the captured errno.

use std::sync::Arc;
use std::thread;

use crate::task::{NativeFn, TaskArgs};
use crate::time::Duration;

/// `args[0]`: milliseconds to sleep. Returns 0.
pub const SLEEP_MILLIS: i32 = 1;

/// `args[0]`: fd, `args[1]`: timeout in ms (negative waits forever).
/// Returns 1 when readable, 0 on timeout, -1 when cancelled through
/// `CancelSelect`, -2 on error.
#[cfg(unix)]
pub const SELECT_READ: i32 = 2;

pub fn sleep_millis() -> NativeFn {
    Arc::new(|args: &TaskArgs| {
        let millis = args[0].max(0) as u64;
        thread::sleep(Duration::from_millis(millis).into());
        0
    })
}

#[cfg(unix)]
pub fn select_read(pipe: Arc<crate::select::SelectPipe>) -> NativeFn {
    use nix::fcntl::{fcntl, FcntlArg};
    use std::os::fd::{AsRawFd, BorrowedFd};

    Arc::new(move |args: &TaskArgs| {
        let Ok(fd) = i32::try_from(args[0]) else {
            return -2;
        };
        // the fd must be open for as long as the borrow below lives
        if !crate::select::selectable(fd) || fcntl(fd, FcntlArg::F_GETFD).is_err() {
            return -2;
        }
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        let timeout = (args[1] >= 0).then(|| Duration::from_millis(args[1] as u64));

        match pipe.select(&[fd], &[], timeout) {
            Ok(outcome) if !outcome.readable.is_empty() => 1,
            Ok(outcome) if outcome.cancelled => -1,
            Ok(_) => 0,
            Err(e) => {
                log::debug!("select on fd {} failed: {}", fd.as_raw_fd(), e);
                -2
            }
        }
    })
}
