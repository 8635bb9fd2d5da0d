//! One worker OS thread draining a run queue of native tasks.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use super::{errno, NativeTask};
use crate::config::DEFAULT_STACK_SIZE;
use crate::errors::IoResult;
use crate::event::{EventQueue, EventStatus};
use crate::sync::SimpleMonitor;
use crate::time::Duration;

/// Priority levels accepted by [`ExecutorBuilder::priority`].
pub mod priority {
    pub const IDLE: u8 = 0;
    pub const LOW: u8 = 64;
    pub const NORMAL: u8 = 128;
    pub const HIGH: u8 = 192;
    pub const REALTIME: u8 = 255;
}

/// Lifecycle of a task executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExecutorStatus {
    /// Thread spawned, has not reported in yet
    Starting = 0,
    Running = 1,
    /// Cancelled, worker has not finished draining
    Stopping = 2,
    /// Worker exited; safe to delete
    Done = 3,
    /// Worker loop died; queued tasks were failed
    Error = 4,
}

impl ExecutorStatus {
    fn accepts_tasks(self) -> bool {
        matches!(self, ExecutorStatus::Starting | ExecutorStatus::Running)
    }
}

struct ExecutorState {
    run_q: VecDeque<Box<NativeTask>>,
    status: ExecutorStatus,
    thread_id: Option<ThreadId>,
    errno: i32,
}

/// Builder for [`TaskExecutor`].
pub struct ExecutorBuilder {
    name: String,
    priority: u8,
    stack_size: usize,
}

impl ExecutorBuilder {
    pub fn new<T: Into<String>>(name: T) -> Self {
        Self {
            name: name.into(),
            priority: priority::NORMAL,
            stack_size: DEFAULT_STACK_SIZE,
        }
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Stack size in bytes; 0 keeps the default.
    pub fn stack_size(mut self, size: usize) -> Self {
        if size != 0 {
            self.stack_size = size;
        }
        self
    }

    /// Spawn the worker thread. Returns while the executor is still
    /// `Starting`.
    pub fn spawn(self, events: Arc<EventQueue>) -> IoResult<TaskExecutor> {
        let shared = Arc::new(SimpleMonitor::new(ExecutorState {
            run_q: VecDeque::new(),
            status: ExecutorStatus::Starting,
            thread_id: None,
            errno: 0,
        }));

        let priority = self.priority;
        let worker = {
            let shared = shared.clone();
            let events = events.clone();
            thread::Builder::new()
                .name(self.name.clone())
                .stack_size(self.stack_size)
                .spawn(move || {
                    apply_priority(priority);
                    let outcome =
                        panic::catch_unwind(AssertUnwindSafe(|| executor_loop(&shared, &events)));
                    if outcome.is_err() {
                        executor_failed(&shared, &events);
                    }
                })?
        };

        log::debug!("task executor '{}' spawned", self.name);
        Ok(TaskExecutor {
            name: self.name,
            shared,
            events,
            thread: Some(worker),
        })
    }
}

/// Priority hook for executor threads.
///
/// Every priority currently runs at the OS default; real priority scheduling
/// is not provided.
fn apply_priority(_priority: u8) {}

/// A worker thread plus its run queue.
///
/// The run queue and status are only touched with the executor's own monitor
/// held; executors never share a queue.
pub struct TaskExecutor {
    name: String,
    shared: Arc<SimpleMonitor<ExecutorState>>,
    events: Arc<EventQueue>,
    thread: Option<JoinHandle<()>>,
}

impl TaskExecutor {
    pub fn builder<T: Into<String>>(name: T) -> ExecutorBuilder {
        ExecutorBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> ExecutorStatus {
        self.shared.lock().status
    }

    /// OS thread of the worker, once it has reported in.
    pub fn thread_id(&self) -> Option<ThreadId> {
        self.shared.lock().thread_id
    }

    /// Last errno recorded by the executor itself (not by its tasks).
    pub fn errno(&self) -> i32 {
        self.shared.lock().errno
    }

    /// Number of tasks queued but not yet started.
    pub fn queued(&self) -> usize {
        self.shared.lock().run_q.len()
    }

    /// Queue a task for the worker.
    ///
    /// Returns `Starting` once queued. If the executor is stopping or stopped
    /// the task is failed on the spot, signalled `Error` through the event
    /// queue, and `Error` is returned; the caller still consumes it like any
    /// other completion.
    pub fn submit(&self, mut task: Box<NativeTask>) -> EventStatus {
        {
            let mut state = self.shared.lock();
            if state.status.accepts_tasks() {
                state.run_q.push_back(task);
                state.signal_all();
                return EventStatus::Starting;
            }
            state.errno = errno::SHUTDOWN;
        }

        log::warn!(
            "task executor '{}' is stopped, failing task {}",
            self.name,
            task.number()
        );
        task.reject(errno::SHUTDOWN);
        self.events.signal_task(task, true);
        EventStatus::Error
    }

    /// Ask the worker to stop. Does not wait for it.
    ///
    /// Tasks still queued are signalled `Error` by the worker. Cancelling
    /// again has no further effect.
    pub fn cancel(&self) {
        let mut state = self.shared.lock();
        if state.status.accepts_tasks() {
            state.status = ExecutorStatus::Stopping;
            log::debug!("task executor '{}' cancelled", self.name);
        }
        state.signal_all();
    }

    /// Wait until the worker has finished, at most `timeout`.
    pub fn wait_until_done(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now().checked_add(timeout.into());
        let mut state = self.shared.lock();
        while !matches!(state.status, ExecutorStatus::Done | ExecutorStatus::Error) {
            let remaining = match deadline {
                Some(deadline) => {
                    let now = std::time::Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    Duration::from(deadline - now)
                }
                None => Duration::MAX,
            };
            state.wait(remaining);
        }
        true
    }

    /// Release the executor.
    ///
    /// Refused, handing the executor back, unless the worker has exited.
    pub fn delete(mut self) -> Result<(), TaskExecutor> {
        {
            let state = self.shared.lock();
            if !matches!(state.status, ExecutorStatus::Done | ExecutorStatus::Error) {
                log::warn!(
                    "refusing to delete task executor '{}' in state {:?}",
                    self.name,
                    state.status
                );
                drop(state);
                return Err(self);
            }
            assert!(state.run_q.is_empty(), "deleted executor has queued tasks");
        }
        if let Some(worker) = self.thread.take() {
            if worker.join().is_err() {
                log::error!("task executor '{}' worker panicked", self.name);
            }
        }
        log::debug!("task executor '{}' deleted", self.name);
        Ok(())
    }
}

impl Drop for TaskExecutor {
    fn drop(&mut self) {
        if let Some(worker) = self.thread.take() {
            self.cancel();
            let _ = worker.join();
        }
    }
}

fn executor_loop(shared: &SimpleMonitor<ExecutorState>, events: &EventQueue) {
    {
        let mut state = shared.lock();
        state.thread_id = Some(thread::current().id());
        if state.status == ExecutorStatus::Starting {
            state.status = ExecutorStatus::Running;
        }
        state.signal_all();
    }

    loop {
        let next = {
            let mut state = shared.lock();
            loop {
                if !state.status.accepts_tasks() {
                    break None;
                }
                if let Some(mut task) = state.run_q.pop_front() {
                    task.set_status(EventStatus::Running);
                    break Some(task);
                }
                state.wait(Duration::MAX);
            }
        };
        let Some(mut task) = next else {
            break;
        };

        // the executor monitor is not held while the native call runs
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| task.run()));
        let failed = outcome.is_err();
        if failed {
            log::error!("native task {} panicked", task.number());
        }
        events.signal_task(task, failed);
    }

    let drained: Vec<Box<NativeTask>> = shared.lock().run_q.drain(..).collect();
    fail_tasks(drained, events);

    let mut state = shared.lock();
    if state.status != ExecutorStatus::Error {
        state.status = ExecutorStatus::Done;
    }
    state.signal_all();
}

/// The worker loop itself panicked.
fn executor_failed(shared: &SimpleMonitor<ExecutorState>, events: &EventQueue) {
    log::error!(
        "task executor '{}' worker loop died",
        thread::current().name().unwrap_or("?")
    );
    let drained: Vec<Box<NativeTask>> = {
        let mut state = shared.lock();
        state.status = ExecutorStatus::Error;
        state.errno = errno::SHUTDOWN;
        state.signal_all();
        state.run_q.drain(..).collect()
    };
    fail_tasks(drained, events);
}

fn fail_tasks(tasks: Vec<Box<NativeTask>>, events: &EventQueue) {
    for mut task in tasks {
        task.reject(errno::SHUTDOWN);
        events.signal_task(task, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Completion, EventNumbers};
    use std::sync::mpsc;
    use std::time::Instant;

    fn setup() -> (Arc<EventNumbers>, Arc<EventQueue>) {
        let _ = env_logger::builder().is_test(true).try_init();
        (Arc::new(EventNumbers::new(256)), Arc::new(EventQueue::new()))
    }

    fn wait_for_event(events: &EventQueue, timeout_ms: u64) -> Option<Completion> {
        let start = Instant::now();
        loop {
            if let Some(c) = events.get_event() {
                return Some(c);
            }
            if start.elapsed() > std::time::Duration::from_millis(timeout_ms) {
                return None;
            }
            events.wait_for_change(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_executor_reaches_running() {
        let (_, events) = setup();
        let executor = TaskExecutor::builder("te-running").spawn(events).unwrap();
        let start = Instant::now();
        while executor.status() != ExecutorStatus::Running {
            assert!(start.elapsed() < std::time::Duration::from_secs(5));
            thread::yield_now();
        }
        assert!(executor.thread_id().is_some());
        assert_ne!(executor.thread_id(), Some(thread::current().id()));
    }

    #[test]
    fn test_sleeping_task_completes_with_result() {
        let (numbers, events) = setup();
        let executor = TaskExecutor::builder("te-sleep").spawn(events.clone()).unwrap();

        let number = numbers.allocate().unwrap();
        let task = NativeTask::new(number, || {
            thread::sleep(std::time::Duration::from_millis(50));
            42
        });
        assert_eq!(executor.submit(task), EventStatus::Starting);
        assert!(events.get_event().is_none());

        thread::sleep(std::time::Duration::from_millis(60));
        match wait_for_event(&events, 5_000) {
            Some(Completion::Task(task)) => {
                assert_eq!(task.number(), number);
                assert_eq!(task.status(), EventStatus::Done);
                assert_eq!(task.result(), 42);
            }
            other => panic!("unexpected completion {:?}", other),
        }
    }

    #[test]
    fn test_tasks_run_in_submission_order() {
        let (numbers, events) = setup();
        let executor = TaskExecutor::builder("te-order").spawn(events.clone()).unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..5 {
            let tx = tx.clone();
            let task = NativeTask::new(numbers.allocate().unwrap(), move || {
                tx.send(i).unwrap();
                i
            });
            executor.submit(task);
        }
        let order: Vec<i64> = (0..5).map(|_| rx.recv().unwrap()).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_cancel_drains_queued_tasks_as_errors() {
        let (numbers, events) = setup();
        let executor = TaskExecutor::builder("te-cancel").spawn(events.clone()).unwrap();

        // block the worker so the following tasks stay queued
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let blocker = numbers.allocate().unwrap();
        executor.submit(NativeTask::new(blocker, move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            7
        }));
        started_rx.recv().unwrap();

        let queued: Vec<_> = (0..3)
            .map(|_| {
                let n = numbers.allocate().unwrap();
                executor.submit(NativeTask::new(n, || 1));
                n
            })
            .collect();
        assert_eq!(executor.queued(), 3);

        executor.cancel();
        executor.cancel();
        assert_eq!(executor.status(), ExecutorStatus::Stopping);
        release_tx.send(()).unwrap();
        assert!(executor.wait_until_done(Duration::from_millis(5_000)));

        let mut done = Vec::new();
        let mut errors = Vec::new();
        while let Some(completion) = events.get_event() {
            match completion {
                Completion::Task(task) if task.status() == EventStatus::Done => done.push(task.number()),
                Completion::Task(task) => errors.push(task.number()),
                Completion::Plain(n) => panic!("unexpected plain event {}", n),
            }
        }
        assert_eq!(done, vec![blocker]);
        errors.sort();
        assert_eq!(errors, queued);
        assert!(executor.delete().is_ok());
    }

    #[test]
    fn test_submit_after_cancel_fails_immediately() {
        let (numbers, events) = setup();
        let executor = TaskExecutor::builder("te-stopped").spawn(events.clone()).unwrap();
        executor.cancel();
        assert!(executor.wait_until_done(Duration::from_millis(5_000)));

        let number = numbers.allocate().unwrap();
        assert_eq!(executor.submit(NativeTask::new(number, || 1)), EventStatus::Error);
        match events.get_event() {
            Some(Completion::Task(task)) => {
                assert_eq!(task.number(), number);
                assert_eq!(task.status(), EventStatus::Error);
                assert_eq!(task.errno(), errno::SHUTDOWN);
            }
            other => panic!("unexpected completion {:?}", other),
        }
        assert_eq!(executor.errno(), errno::SHUTDOWN);
    }

    #[test]
    fn test_delete_refused_while_running() {
        let (_, events) = setup();
        let executor = TaskExecutor::builder("te-delete").spawn(events).unwrap();
        let executor = match executor.delete() {
            Ok(()) => panic!("deleted a live executor"),
            Err(executor) => executor,
        };
        executor.cancel();
        assert!(executor.wait_until_done(Duration::from_millis(5_000)));
        assert_eq!(executor.status(), ExecutorStatus::Done);
        assert!(executor.delete().is_ok());
    }

    #[test]
    fn test_failed_worker_reports_error_and_can_be_deleted() {
        let (numbers, events) = setup();
        let executor = TaskExecutor::builder("te-failed").spawn(events.clone()).unwrap();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        executor.submit(NativeTask::new(numbers.allocate().unwrap(), move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            0
        }));
        started_rx.recv().unwrap();
        let queued = numbers.allocate().unwrap();
        executor.submit(NativeTask::new(queued, || 1));

        // as if the loop had unwound while the running task was in flight
        executor_failed(&executor.shared, &events);
        assert_eq!(executor.status(), ExecutorStatus::Error);
        assert_eq!(executor.errno(), errno::SHUTDOWN);
        assert!(executor.wait_until_done(Duration::from_millis(100)));
        match events.get_event() {
            Some(Completion::Task(task)) => {
                assert_eq!(task.number(), queued);
                assert_eq!(task.status(), EventStatus::Error);
            }
            other => panic!("unexpected completion {:?}", other),
        }

        release_tx.send(()).unwrap();
        assert!(executor.delete().is_ok());
    }

    #[test]
    fn test_panicking_task_reports_error_and_worker_survives() {
        let (numbers, events) = setup();
        let executor = TaskExecutor::builder("te-panic").spawn(events.clone()).unwrap();
        let bad = numbers.allocate().unwrap();
        executor.submit(NativeTask::new(bad, || panic!("native call failed")));
        match wait_for_event(&events, 5_000) {
            Some(Completion::Task(task)) => assert_eq!(task.status(), EventStatus::Error),
            other => panic!("unexpected completion {:?}", other),
        }

        let good = numbers.allocate().unwrap();
        executor.submit(NativeTask::new(good, || 5));
        match wait_for_event(&events, 5_000) {
            Some(Completion::Task(task)) => assert_eq!(task.result(), 5),
            other => panic!("unexpected completion {:?}", other),
        }
    }
}
