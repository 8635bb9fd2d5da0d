//! Per-VM I/O state and the `execute` entry point.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::sync::Arc;

use super::{ChannelOp, ExtendedOps, IoReply, IoRequest};
use crate::config::IoConfig;
use crate::errors::{IoError, IoResult, RESULT_OK};
use crate::event::{event_or_zero, Completion, EventNumber, EventNumbers, EventQueue, EventStatus};
use crate::irq::IrqBridge;
use crate::natives;
use crate::platform::{
    FlashDevice, HostPower, HostedPlatform, LoopbackSerial, Platform, RamFlash, SerialPort,
};
use crate::sleep::{SleepOutcome, SleepScheduler, SleepStats};
use crate::sync::monitor::timeout_from_millis;
use crate::task::{errno, NativeFn, NativeTask, TaskArgs, TaskExecutor, MAX_TASK_ARGS};
use crate::time::{Clock, Duration, Instant, SystemClock};

#[cfg(unix)]
use crate::select::SelectPipe;

/// Flash size of [`IoContext::hosted`].
pub const HOSTED_FLASH_SIZE: usize = 64 * 1024;

enum TaskSlot {
    /// Submitted; completion not consumed yet
    Queued,
    /// Refused by a stopped executor; the completion is still queued
    Rejected,
    Completed(Box<NativeTask>),
}

/// Message of the last failed operation, read back one char at a time.
#[derive(Default)]
struct ErrorMessage {
    text: Vec<u8>,
    cursor: usize,
}

impl ErrorMessage {
    fn set(&mut self, error: &IoError) {
        self.text = error.to_string().into_bytes();
        self.cursor = 0;
    }

    fn next_char(&mut self) -> i64 {
        match self.text.get(self.cursor) {
            Some(&c) => {
                self.cursor += 1;
                c as i64
            }
            None => -1,
        }
    }
}

/// Everything the dispatcher operates on for one VM instance.
///
/// Only the VM thread calls into an `IoContext`. Worker threads reach it
/// through the shared event queue, interrupt handlers through the
/// [`IrqBridge`].
pub struct IoContext<P: Platform> {
    config: IoConfig,
    clock: P::Clock,
    epoch: Instant,
    numbers: Arc<EventNumbers>,
    events: Arc<EventQueue>,
    irq: Arc<IrqBridge<P::Arch>>,
    sleep: SleepScheduler<P::Power>,
    serial: P::Serial,
    flash: P::Flash,
    console: Box<dyn Write + Send>,
    #[cfg(unix)]
    select_pipe: Arc<SelectPipe>,
    executors: BTreeMap<i32, TaskExecutor>,
    next_executor: i32,
    natives: BTreeMap<i32, NativeFn>,
    tasks: BTreeMap<EventNumber, TaskSlot>,
    extended: Vec<Box<dyn ExtendedOps>>,
    error: ErrorMessage,
}

impl IoContext<HostedPlatform> {
    /// Context on the hosted platform, printing to stdout.
    pub fn hosted(config: IoConfig) -> IoResult<Self> {
        Self::new(
            config,
            SystemClock::new(),
            HostPower,
            LoopbackSerial::new(),
            RamFlash::new(HOSTED_FLASH_SIZE),
        )
    }
}

impl<P: Platform> IoContext<P> {
    pub fn new(
        config: IoConfig,
        clock: P::Clock,
        power: P::Power,
        serial: P::Serial,
        flash: P::Flash,
    ) -> IoResult<Self> {
        let epoch = clock.now();
        #[cfg(unix)]
        let select_pipe = Arc::new(SelectPipe::new()?);

        let mut context = Self {
            config,
            clock,
            epoch,
            numbers: Arc::new(EventNumbers::new(config.max_outstanding_events)),
            events: Arc::new(EventQueue::new()),
            irq: Arc::new(IrqBridge::new(config.sleep_manager_mask)),
            sleep: SleepScheduler::new(power, &config),
            serial,
            flash,
            console: Box::new(std::io::stdout()),
            #[cfg(unix)]
            select_pipe,
            executors: BTreeMap::new(),
            next_executor: 1,
            natives: BTreeMap::new(),
            tasks: BTreeMap::new(),
            extended: Vec::new(),
            error: ErrorMessage::default(),
        };
        context.register_native(natives::SLEEP_MILLIS, natives::sleep_millis());
        #[cfg(unix)]
        {
            let select = natives::select_read(context.select_pipe.clone());
            context.register_native(natives::SELECT_READ, select);
        }
        Ok(context)
    }

    /// Send the print operations somewhere other than stdout.
    pub fn with_console(mut self, console: Box<dyn Write + Send>) -> Self {
        self.console = console;
        self
    }

    /// Run `continuation` each time the outermost interrupt handler finishes.
    pub fn with_continuation(self, continuation: fn()) -> Self {
        self.irq.set_continuation(Some(continuation));
        self
    }

    pub fn config(&self) -> &IoConfig {
        &self.config
    }

    pub fn event_numbers(&self) -> &Arc<EventNumbers> {
        &self.numbers
    }

    pub fn event_queue(&self) -> &Arc<EventQueue> {
        &self.events
    }

    /// Interrupt bridge to hand to interrupt handlers.
    pub fn irq_bridge(&self) -> &Arc<IrqBridge<P::Arch>> {
        &self.irq
    }

    pub fn sleep_stats(&self) -> SleepStats {
        self.sleep.stats()
    }

    pub fn serial(&self) -> &P::Serial {
        &self.serial
    }

    pub fn flash(&self) -> &P::Flash {
        &self.flash
    }

    /// Make `function` callable as `id` through `RunBlockingFunctionOn`.
    /// Returns the function previously registered under `id`.
    pub fn register_native(&mut self, id: i32, function: NativeFn) -> Option<NativeFn> {
        self.natives.insert(id, function)
    }

    /// Add a table consulted, in registration order, for unknown op codes.
    pub fn register_extended(&mut self, ops: Box<dyn ExtendedOps>) {
        self.extended.push(ops);
    }

    /// Create a plain request to be completed later through
    /// [`EventQueue::signal_done`].
    pub fn create_event(&self) -> IoResult<EventNumber> {
        self.events.create_plain(&self.numbers)
    }

    /// Perform one channel operation.
    pub fn execute(&mut self, request: &IoRequest) -> IoReply {
        match self.dispatch(request) {
            Ok(reply) => reply,
            Err(error) => {
                log::debug!("channel operation {} failed: {}", request.op, error);
                self.error.set(&error);
                IoReply::value(error.result_code())
            }
        }
    }

    fn dispatch(&mut self, request: &IoRequest) -> IoResult<IoReply> {
        let Some(op) = ChannelOp::from_code(request.op) else {
            return self.dispatch_extended(request);
        };
        let p = &request.params;

        let reply = match op {
            ChannelOp::PrintChar => {
                let c = char::from_u32(p[0] as u32).unwrap_or(char::REPLACEMENT_CHARACTER);
                self.print(format_args!("{}", c))?
            }
            ChannelOp::PrintInt => self.print(format_args!("{}", p[0]))?,
            ChannelOp::PrintLong => {
                let value = ((p[0] as i64) << 32) | (p[1] as u32 as i64);
                self.print(format_args!("{}", value))?
            }
            ChannelOp::PrintString => {
                let text = String::from_utf8_lossy(&request.send);
                self.print(format_args!("{}", text))?
            }
            ChannelOp::GetTimeMillis => IoReply::value(self.uptime().as_millis() as i64),
            ChannelOp::GetTimeMicros => IoReply::value(self.uptime().as_micros() as i64),
            ChannelOp::GetErrorChar => IoReply::value(self.error.next_char()),
            ChannelOp::CancelSelect => {
                #[cfg(unix)]
                {
                    self.select_pipe.cancel()?;
                }
                IoReply::ok()
            }

            ChannelOp::GetEvent => IoReply::value(event_or_zero(self.get_event()) as i64),
            ChannelOp::WaitForEvent => {
                let number = self.wait_for_event(timeout_from_millis(p[0] as i64));
                IoReply::value(event_or_zero(number) as i64)
            }
            ChannelOp::Sleep => {
                let millis = non_negative(p[0], "sleep time")?;
                self.sleep_for(Duration::from_millis(millis));
                IoReply::ok()
            }

            ChannelOp::CreateTaskExecutor => {
                IoReply::value(self.create_executor(p[0], p[1], &request.send)? as i64)
            }
            ChannelOp::CancelTaskExecutor => {
                self.executor(p[0])?.cancel();
                IoReply::ok()
            }
            ChannelOp::DeleteTaskExecutor => {
                self.delete_executor(p[0])?;
                IoReply::ok()
            }
            ChannelOp::RunBlockingFunctionOn => {
                IoReply::value(self.run_blocking(request)?.get() as i64)
            }
            ChannelOp::TaskStatus => {
                let status = match self.task_slot(p[0])? {
                    TaskSlot::Queued => EventStatus::Starting,
                    TaskSlot::Rejected => EventStatus::Error,
                    TaskSlot::Completed(task) => task.status(),
                };
                IoReply::value(status as i64)
            }
            ChannelOp::TaskResult => IoReply::value(self.completed_task(p[0])?.result()),
            ChannelOp::TaskLowResult => {
                IoReply::value(self.completed_task(p[0])?.low_result() as i64)
            }
            ChannelOp::TaskErrno => {
                let errno = match self.task_slot(p[0])? {
                    TaskSlot::Rejected => errno::SHUTDOWN,
                    _ => self.completed_task(p[0])?.errno(),
                };
                IoReply::value(errno as i64)
            }
            ChannelOp::DeleteNativeTask => {
                self.delete_task(p[0])?;
                IoReply::ok()
            }
            ChannelOp::ExecutorStatus => IoReply::value(self.executor(p[0])?.status() as i64),

            ChannelOp::WaitForIrq => {
                let mask = p[0] as u32;
                if mask == 0 {
                    return Err(IoError::bad_parameter("empty interrupt mask"));
                }
                if self.irq.check_irq(mask, true) {
                    IoReply::value(0)
                } else {
                    let number = self.irq.store_irq_request(&self.numbers, mask)?;
                    IoReply::value(number.get() as i64)
                }
            }
            ChannelOp::CheckIrq => IoReply::value(self.irq.check_irq(p[0] as u32, p[1] != 0) as i64),
            ChannelOp::InterruptCaughtCount => {
                let slot = self.irq.slot(p[0] as u32).ok_or_else(|| bad_irq(p[0]))?;
                IoReply::value(slot.caught_count() as i64)
            }
            ChannelOp::InterruptIgnoredCount => {
                let slot = self.irq.slot(p[0] as u32).ok_or_else(|| bad_irq(p[0]))?;
                IoReply::value(slot.ignored_count() as i64)
            }

            ChannelOp::WaitForDeepSleep => {
                let millis = non_negative(p[0], "deep sleep time")?;
                self.sleep.wait_for_deep_sleep(Duration::from_millis(millis));
                let number = self.irq.arm_deep_sleep_wake(&self.numbers)?;
                IoReply::value(number.get() as i64)
            }
            ChannelOp::SetDeepSleepEnabled => {
                self.sleep.set_deep_sleep_enabled(p[0] != 0);
                IoReply::ok()
            }
            ChannelOp::SetMinimumDeepSleepTime => {
                let millis = non_negative(p[0], "deep sleep time")?;
                self.sleep.set_minimum_deep_sleep(Duration::from_millis(millis));
                IoReply::ok()
            }
            ChannelOp::TotalShallowSleepTime => {
                IoReply::value(self.sleep.stats().total_shallow.as_millis() as i64)
            }
            ChannelOp::TotalDeepSleepTime => {
                IoReply::value(self.sleep.stats().total_deep.as_millis() as i64)
            }
            ChannelOp::DeepSleepCount => IoReply::value(self.sleep.stats().deep_count as i64),
            ChannelOp::SleepManagerRunning => {
                IoReply::value(self.sleep.sleep_manager_running() as i64)
            }

            ChannelOp::AvailableSerialChars => IoReply::value(self.serial.available() as i64),
            ChannelOp::ReadSerialChars => {
                let mut buf = zeroed(request.recv_len)?;
                let count = self.serial.read(&mut buf)?;
                buf.truncate(count);
                IoReply::with_buffer(count as i64, buf)
            }
            ChannelOp::WaitForSerialChars => {
                if self.serial.available() > 0 {
                    IoReply::value(0)
                } else {
                    let number = self.irq.wait_for_serial(&self.numbers)?;
                    IoReply::value(number.get() as i64)
                }
            }
            ChannelOp::WriteSerialChars => IoReply::value(self.serial.write(&request.send)? as i64),

            ChannelOp::FlashErase => {
                let len = non_negative(p[1], "flash length")? as usize;
                self.flash.erase(flash_address(p[0])?, len)?;
                IoReply::ok()
            }
            ChannelOp::FlashWrite => {
                self.flash.write(flash_address(p[0])?, &request.send)?;
                IoReply::ok()
            }
            ChannelOp::FlashRead => {
                let mut buf = zeroed(request.recv_len)?;
                self.flash.read(flash_address(p[0])?, &mut buf)?;
                IoReply::with_buffer(RESULT_OK, buf)
            }
        };
        Ok(reply)
    }

    fn dispatch_extended(&mut self, request: &IoRequest) -> IoResult<IoReply> {
        for ops in self.extended.iter_mut() {
            if let Some(result) = ops.execute(request) {
                return result;
            }
        }
        Err(IoError::bad_parameter(format!(
            "unknown channel operation {}",
            request.op
        )))
    }

    fn print(&mut self, args: fmt::Arguments<'_>) -> IoResult<IoReply> {
        self.console.write_fmt(args)?;
        self.console.flush()?;
        Ok(IoReply::ok())
    }

    fn uptime(&self) -> Duration {
        self.clock.now().saturating_duration_since(self.epoch)
    }

    /// Consume one completed event, or `None` if nothing has completed.
    ///
    /// Task and plain completions are looked for first, then interrupt,
    /// serial and deep-sleep wake requests. Completed native tasks stay
    /// readable until `DeleteNativeTask`.
    pub fn get_event(&mut self) -> Option<EventNumber> {
        if let Some(completion) = self.events.get_event() {
            let number = completion.number();
            match completion {
                Completion::Plain(_) => self.numbers.release(number),
                Completion::Task(task) => {
                    self.tasks.insert(number, TaskSlot::Completed(task));
                }
            }
            return Some(number);
        }

        self.irq.set_serial_available(self.serial.available() > 0);
        let number = self.irq.get_event(true, false)?;
        self.numbers.release(number);
        Some(number)
    }

    /// [`get_event`](Self::get_event), blocking for at most `timeout`.
    ///
    /// Blocks on the event queue monitor in slices of the configured poll
    /// interval; interrupt-side events never signal it.
    pub fn wait_for_event(&mut self, timeout: Duration) -> Option<EventNumber> {
        let deadline = (timeout != Duration::MAX).then(|| self.clock.now() + timeout);
        loop {
            if let Some(number) = self.get_event() {
                return Some(number);
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = self.clock.now();
                    if now >= deadline {
                        return None;
                    }
                    deadline
                        .saturating_duration_since(now)
                        .min(self.config.event_poll_interval)
                }
                None => self.config.event_poll_interval,
            };
            let mut list = self.events.lock();
            if !list.has_completed() {
                list.wait(slice);
            }
        }
    }

    /// Idle the VM thread for up to `duration`.
    fn sleep_for(&mut self, duration: Duration) {
        let events = &self.events;
        let irq = &self.irq;
        let serial = &self.serial;
        let outcome = self.sleep.sleep(&self.clock, duration, || {
            irq.set_serial_available(serial.available() > 0);
            events.has_completed() || irq.has_event(false)
        });

        if let SleepOutcome::Deep { woken_by, slept } = outcome {
            log::debug!(
                "deep sleep ended after {} ms, pending irqs {:#x}",
                slept.as_millis(),
                woken_by
            );
            self.irq.fold_pending(woken_by);
            self.irq.fire_deep_sleep_wake();
        }
    }

    fn create_executor(&mut self, priority: i32, stack_size: i32, name: &[u8]) -> IoResult<i32> {
        let priority = u8::try_from(priority)
            .map_err(|_| IoError::bad_parameter(format!("priority {} out of range", priority)))?;
        let stack_size = match non_negative(stack_size, "stack size")? as usize {
            0 => self.config.default_stack_size,
            size => size,
        };
        let handle = self.next_executor;
        let name = if name.is_empty() {
            format!("task-executor-{}", handle)
        } else {
            String::from_utf8_lossy(name).replace('\0', "")
        };

        let executor = TaskExecutor::builder(name)
            .priority(priority)
            .stack_size(stack_size)
            .spawn(self.events.clone())?;
        self.next_executor += 1;
        self.executors.insert(handle, executor);
        Ok(handle)
    }

    fn executor(&self, handle: i32) -> IoResult<&TaskExecutor> {
        self.executors
            .get(&handle)
            .ok_or(IoError::UnknownHandle(handle as i64))
    }

    fn delete_executor(&mut self, handle: i32) -> IoResult<()> {
        let executor = self
            .executors
            .remove(&handle)
            .ok_or(IoError::UnknownHandle(handle as i64))?;
        if let Err(executor) = executor.delete() {
            self.executors.insert(handle, executor);
            return Err(IoError::ExecutorBusy);
        }
        Ok(())
    }

    fn run_blocking(&mut self, request: &IoRequest) -> IoResult<EventNumber> {
        let p = &request.params;
        let executor = self
            .executors
            .get(&p[0])
            .ok_or(IoError::UnknownHandle(p[0] as i64))?;
        let function = self
            .natives
            .get(&p[1])
            .ok_or_else(|| IoError::bad_parameter(format!("no native function {}", p[1])))?;
        let args = decode_args(p[2], &request.send)?;

        let number = self.numbers.allocate()?;
        let task = NativeTask::from_native(number, function, args);
        let slot = match executor.submit(task) {
            EventStatus::Error => TaskSlot::Rejected,
            _ => TaskSlot::Queued,
        };
        self.tasks.insert(number, slot);
        Ok(number)
    }

    fn task_slot(&self, handle: i32) -> IoResult<&TaskSlot> {
        EventNumber::new(handle)
            .and_then(|number| self.tasks.get(&number))
            .ok_or(IoError::UnknownHandle(handle as i64))
    }

    fn completed_task(&self, handle: i32) -> IoResult<&NativeTask> {
        match self.task_slot(handle)? {
            TaskSlot::Completed(task) => Ok(task),
            _ => Err(IoError::bad_parameter(format!(
                "task {} has not been collected by GetEvent",
                handle
            ))),
        }
    }

    fn delete_task(&mut self, handle: i32) -> IoResult<()> {
        let task = self.completed_task(handle)?;
        let number = task.number();
        self.tasks.remove(&number);
        self.numbers.release(number);
        Ok(())
    }
}

impl<P: Platform> Drop for IoContext<P> {
    fn drop(&mut self) {
        // unblock workers stuck in select so the executor drops can join them
        for executor in self.executors.values() {
            executor.cancel();
        }
        #[cfg(unix)]
        {
            if let Err(e) = self.select_pipe.cancel() {
                log::warn!("failed to cancel select on shutdown: {}", e);
            }
        }
    }
}

fn non_negative(value: i32, what: &str) -> IoResult<u64> {
    u64::try_from(value)
        .map_err(|_| IoError::bad_parameter(format!("{} must not be negative: {}", what, value)))
}

fn flash_address(value: i32) -> IoResult<u32> {
    u32::try_from(value)
        .map_err(|_| IoError::bad_parameter(format!("bad flash address {}", value)))
}

fn bad_irq(irq: i32) -> IoError {
    IoError::bad_parameter(format!("no interrupt source {}", irq))
}

fn zeroed(len: usize) -> IoResult<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)?;
    buf.resize(len, 0);
    Ok(buf)
}

/// Unpack `argc` little-endian `i32` arguments.
fn decode_args(argc: i32, data: &[u8]) -> IoResult<TaskArgs> {
    let argc = usize::try_from(argc)
        .ok()
        .filter(|&n| n <= MAX_TASK_ARGS)
        .ok_or_else(|| IoError::bad_parameter(format!("argument count {} out of range", argc)))?;
    if data.len() < argc * 4 {
        return Err(IoError::bad_parameter(format!(
            "{} arguments need {} bytes, got {}",
            argc,
            argc * 4,
            data.len()
        )));
    }
    let mut args = [0i64; MAX_TASK_ARGS];
    for (slot, chunk) in args.iter_mut().zip(data.chunks_exact(4)).take(argc) {
        *slot = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as i64;
    }
    Ok(args)
}
