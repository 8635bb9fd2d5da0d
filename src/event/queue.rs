//! The process-wide list of pending and completed requests.
//!
//! Worker threads signal completions into the list; only the VM thread reads
//! it through [`EventQueue::get_event`]. Both sides serialize on one monitor,
//! which is also what makes a task's result fields visible to the VM thread
//! once it has observed the completion.

use std::collections::VecDeque;

use super::{EventKind, EventNumber, EventNumbers, EventRequest, EventStatus};
use crate::errors::IoResult;
use crate::sync::{MonitorGuard, SimpleMonitor};
use crate::task::NativeTask;
use crate::time::Duration;

enum Pending {
    Plain(EventRequest),
    Task(Box<NativeTask>),
}

impl Pending {
    fn number(&self) -> EventNumber {
        match self {
            Pending::Plain(request) => request.number,
            Pending::Task(task) => task.number(),
        }
    }

    fn status(&self) -> EventStatus {
        match self {
            Pending::Plain(request) => request.status,
            Pending::Task(task) => task.status(),
        }
    }
}

/// A consumed completion.
#[derive(Debug)]
pub enum Completion {
    /// A plain request; the record itself is already gone.
    Plain(EventNumber),
    /// A native task, handed back so its results can be read.
    Task(Box<NativeTask>),
}

impl Completion {
    pub fn number(&self) -> EventNumber {
        match self {
            Completion::Plain(number) => *number,
            Completion::Task(task) => task.number(),
        }
    }
}

/// Contents of the event queue monitor.
pub struct PendingList {
    entries: VecDeque<Pending>,
    changed: bool,
}

impl PendingList {
    fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            changed: false,
        }
    }

    /// Prepend a freshly created plain request.
    pub fn push_pending(&mut self, request: EventRequest) -> IoResult<()> {
        debug_assert_eq!(request.kind, EventKind::Plain);
        self.entries.try_reserve(1)?;
        self.entries.push_front(Pending::Plain(request));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether any entry has reached a terminal state.
    pub fn has_completed(&self) -> bool {
        self.entries.iter().any(|p| p.status().is_terminal())
    }

    fn contains(&self, number: EventNumber) -> bool {
        self.entries.iter().any(|p| p.number() == number)
    }
}

pub struct EventQueue {
    monitor: SimpleMonitor<PendingList>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            monitor: SimpleMonitor::new(PendingList::new()),
        }
    }

    /// Take the queue monitor.
    pub fn lock(&self) -> MonitorGuard<'_, PendingList> {
        self.monitor.lock()
    }

    /// Allocate a plain request and put it on the pending list.
    pub fn create_plain(&self, numbers: &EventNumbers) -> IoResult<EventNumber> {
        let number = numbers.allocate()?;
        let mut list = self.lock();
        if let Err(e) = list.push_pending(EventRequest::new(number, EventKind::Plain)) {
            drop(list);
            numbers.release(number);
            return Err(e);
        }
        Ok(number)
    }

    /// Complete a plain request that is already on the list.
    ///
    /// Returns `false` if no request with that number is pending.
    pub fn signal_done(&self, number: EventNumber, is_error: bool) -> bool {
        let mut list = self.lock();
        let found = list.entries.iter_mut().find_map(|p| match p {
            Pending::Plain(request) if request.number == number => Some(request),
            _ => None,
        });
        match found {
            Some(request) => {
                request.status = terminal(is_error);
                list.changed = true;
                list.signal();
                true
            }
            None => false,
        }
    }

    /// Complete a native task and move it onto the list.
    pub fn signal_task(&self, mut task: Box<NativeTask>, is_error: bool) {
        task.set_status(terminal(is_error));
        let mut list = self.lock();
        debug_assert!(!list.contains(task.number()));
        list.entries.push_front(Pending::Task(task));
        list.changed = true;
        list.signal();
    }

    /// Unlink the first completed request, if any.
    ///
    /// The scan follows list order, not completion order. Only the VM thread
    /// calls this.
    pub fn get_event(&self) -> Option<Completion> {
        let mut list = self.lock();
        let index = list.entries.iter().position(|p| p.status().is_terminal());
        let Some(index) = index else {
            list.changed = false;
            return None;
        };
        match list.entries.remove(index) {
            Some(Pending::Plain(request)) => Some(Completion::Plain(request.number)),
            Some(Pending::Task(task)) => Some(Completion::Task(task)),
            None => None,
        }
    }

    /// Block until something is signalled or `timeout` elapses.
    ///
    /// Returns whether a change was observed; the flag is reset.
    pub fn wait_for_change(&self, timeout: Duration) -> bool {
        let mut list = self.lock();
        if !list.changed && !timeout.is_zero() {
            list.wait(timeout);
        }
        core::mem::replace(&mut list.changed, false)
    }

    pub fn has_completed(&self) -> bool {
        self.lock().has_completed()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn terminal(is_error: bool) -> EventStatus {
    if is_error {
        EventStatus::Error
    } else {
        EventStatus::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_get_event_on_empty_queue_is_idempotent() {
        let queue = EventQueue::new();
        for _ in 0..10 {
            assert!(queue.get_event().is_none());
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_plain_request_lifecycle() {
        let numbers = EventNumbers::new(16);
        let queue = EventQueue::new();
        let a = queue.create_plain(&numbers).unwrap();
        let b = queue.create_plain(&numbers).unwrap();
        assert_ne!(a, b);
        assert!(queue.get_event().is_none());

        assert!(queue.signal_done(a, false));
        match queue.get_event() {
            Some(Completion::Plain(n)) => assert_eq!(n, a),
            other => panic!("unexpected completion {:?}", other),
        }
        assert!(queue.get_event().is_none());
        assert_eq!(queue.len(), 1);

        assert!(queue.signal_done(b, true));
        assert_eq!(queue.get_event().map(|c| c.number()), Some(b));
        assert!(!queue.signal_done(b, false));
    }

    #[test]
    fn test_completed_task_is_handed_back() {
        let numbers = EventNumbers::new(16);
        let queue = EventQueue::new();
        let number = numbers.allocate().unwrap();
        let mut task = NativeTask::new(number, || 42);
        task.run();
        queue.signal_task(task, false);

        match queue.get_event() {
            Some(Completion::Task(task)) => {
                assert_eq!(task.number(), number);
                assert_eq!(task.status(), EventStatus::Done);
                assert_eq!(task.result(), 42);
            }
            other => panic!("unexpected completion {:?}", other),
        }
    }

    #[test]
    fn test_wait_for_change_wakes_on_signal() {
        let numbers = Arc::new(EventNumbers::new(16));
        let queue = Arc::new(EventQueue::new());
        let number = queue.create_plain(&numbers).unwrap();

        let signaller = {
            let queue = queue.clone();
            thread::spawn(move || {
                thread::sleep(std::time::Duration::from_millis(10));
                queue.signal_done(number, false);
            })
        };

        let mut changed = false;
        for _ in 0..100 {
            if queue.wait_for_change(Duration::from_millis(50)) {
                changed = true;
                break;
            }
        }
        signaller.join().unwrap();
        assert!(changed);
        assert_eq!(queue.get_event().map(|c| c.number()), Some(number));
    }

    #[test]
    fn test_wait_for_change_times_out() {
        let queue = EventQueue::new();
        assert!(!queue.wait_for_change(Duration::from_millis(5)));
        assert!(!queue.wait_for_change(Duration::ZERO));
    }

    #[test]
    fn test_concurrent_signals_are_all_delivered_once() {
        let numbers = Arc::new(EventNumbers::new(1000));
        let queue = Arc::new(EventQueue::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let numbers = numbers.clone();
            let queue = queue.clone();
            handles.push(thread::spawn(move || {
                let mut mine = Vec::new();
                for _ in 0..50 {
                    let n = numbers.allocate().unwrap();
                    let mut task = NativeTask::new(n, || 1);
                    task.run();
                    queue.signal_task(task, false);
                    mine.push(n);
                }
                mine
            }));
        }
        let mut expected = std::collections::BTreeSet::new();
        for handle in handles {
            expected.extend(handle.join().unwrap());
        }

        let mut delivered = std::collections::BTreeSet::new();
        while let Some(completion) = queue.get_event() {
            assert!(delivered.insert(completion.number()));
        }
        assert_eq!(delivered, expected);
    }

    /// Linear congruential generator for property-style tests.
    struct SimpleRng {
        state: u64,
    }

    impl SimpleRng {
        fn new(seed: u64) -> Self {
            Self { state: seed }
        }

        fn next_u64(&mut self) -> u64 {
            self.state = self
                .state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            self.state >> 33
        }

        fn gen_range(&mut self, max: u64) -> u64 {
            self.next_u64() % max
        }
    }

    #[test]
    fn property_random_interleavings_deliver_each_completion_once() {
        use std::collections::BTreeSet;

        let mut rng = SimpleRng::new(0x5eed_1234);
        let numbers = EventNumbers::new(64);
        let queue = EventQueue::new();
        let mut pending: Vec<EventNumber> = Vec::new();
        let mut signalled = BTreeSet::new();
        let mut delivered = BTreeSet::new();

        for _ in 0..2_000 {
            match rng.gen_range(3) {
                0 => {
                    if let Ok(n) = queue.create_plain(&numbers) {
                        assert!(!pending.contains(&n) && !signalled.contains(&n));
                        pending.push(n);
                    }
                }
                1 if !pending.is_empty() => {
                    let n = pending.swap_remove(rng.gen_range(pending.len() as u64) as usize);
                    assert!(queue.signal_done(n, rng.gen_range(2) == 0));
                    signalled.insert(n);
                }
                _ => match queue.get_event() {
                    Some(completion) => {
                        let n = completion.number();
                        assert!(signalled.remove(&n), "delivered unsignalled event {}", n);
                        assert!(delivered.insert(n), "event {} delivered twice", n);
                        numbers.release(n);
                    }
                    None => assert!(signalled.is_empty()),
                },
            }
            assert_eq!(numbers.outstanding(), pending.len() + signalled.len());
            assert_eq!(queue.len(), pending.len() + signalled.len());
        }
    }
}
