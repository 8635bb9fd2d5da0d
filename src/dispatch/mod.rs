//! The channel-operation protocol between the interpreter and the I/O core.
//!
//! The interpreter fills an [`IoRequest`], calls
//! [`IoContext::execute`](context::IoContext::execute) and reads back a fresh
//! [`IoReply`]. Nothing is reported out of band: every failure becomes one of
//! the negative result codes in [`crate::errors`].

use crate::errors::{IoResult, RESULT_OK};

pub mod context;

pub use context::IoContext;

/// Number of integer parameters carried by a request.
pub const IO_PARAMS: usize = 6;

macro_rules! channel_ops {
    ($($(#[$doc:meta])* $name:ident = $code:literal,)*) => {
        /// Operation codes understood by [`IoContext::execute`].
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum ChannelOp {
            $($(#[$doc])* $name = $code,)*
        }

        impl ChannelOp {
            pub fn from_code(code: u32) -> Option<Self> {
                match code {
                    $($code => Some(ChannelOp::$name),)*
                    _ => None,
                }
            }

            pub fn code(self) -> u32 {
                self as u32
            }
        }
    };
}

channel_ops! {
    PrintChar = 1,
    PrintInt = 2,
    /// p0 high word, p1 low word
    PrintLong = 3,
    PrintString = 4,
    GetTimeMillis = 5,
    GetTimeMicros = 6,
    /// Next character of the last error message, -1 at the end
    GetErrorChar = 7,
    CancelSelect = 8,

    GetEvent = 10,
    /// p0 timeout in ms, negative waits forever
    WaitForEvent = 11,
    Sleep = 12,

    /// p0 priority, p1 stack size (0 = default), send = name
    CreateTaskExecutor = 20,
    CancelTaskExecutor = 21,
    DeleteTaskExecutor = 22,
    /// p0 executor, p1 function id, p2 argc, send = argc little-endian i32
    RunBlockingFunctionOn = 23,
    TaskStatus = 24,
    TaskResult = 25,
    TaskLowResult = 26,
    TaskErrno = 27,
    DeleteNativeTask = 28,
    ExecutorStatus = 29,

    WaitForIrq = 30,
    /// p0 mask, p1 clear
    CheckIrq = 31,
    InterruptCaughtCount = 32,
    InterruptIgnoredCount = 33,

    /// p0 minimum ms the sleep manager accepts
    WaitForDeepSleep = 40,
    SetDeepSleepEnabled = 41,
    SetMinimumDeepSleepTime = 42,
    TotalShallowSleepTime = 43,
    TotalDeepSleepTime = 44,
    DeepSleepCount = 45,
    SleepManagerRunning = 46,

    AvailableSerialChars = 50,
    ReadSerialChars = 51,
    WaitForSerialChars = 52,
    WriteSerialChars = 53,

    /// p0 address, p1 length
    FlashErase = 60,
    FlashWrite = 61,
    FlashRead = 62,
}

/// One call into the dispatcher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IoRequest {
    pub op: u32,
    pub params: [i32; IO_PARAMS],
    /// Buffer passed in by the interpreter
    pub send: Vec<u8>,
    /// Size of the buffer the interpreter expects back
    pub recv_len: usize,
}

impl IoRequest {
    pub fn new(op: ChannelOp) -> Self {
        Self::raw(op.code())
    }

    /// A request with an arbitrary operation code.
    pub fn raw(op: u32) -> Self {
        Self {
            op,
            ..Self::default()
        }
    }

    /// Set the leading parameters.
    pub fn params(mut self, params: &[i32]) -> Self {
        let count = params.len().min(IO_PARAMS);
        self.params[..count].copy_from_slice(&params[..count]);
        self
    }

    pub fn send<T: Into<Vec<u8>>>(mut self, data: T) -> Self {
        self.send = data.into();
        self
    }

    pub fn recv_len(mut self, len: usize) -> Self {
        self.recv_len = len;
        self
    }
}

/// Result of one call. Always built fresh, never reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoReply {
    pub result: i64,
    pub buffer: Option<Vec<u8>>,
}

impl IoReply {
    pub fn ok() -> Self {
        Self::value(RESULT_OK)
    }

    pub fn value(result: i64) -> Self {
        Self {
            result,
            buffer: None,
        }
    }

    pub fn with_buffer(result: i64, buffer: Vec<u8>) -> Self {
        Self {
            result,
            buffer: Some(buffer),
        }
    }
}

/// Platform-specific operations tried for codes the core does not know.
pub trait ExtendedOps: Send {
    /// `None` if `request.op` is not handled here.
    fn execute(&mut self, request: &IoRequest) -> Option<IoResult<IoReply>>;
}
