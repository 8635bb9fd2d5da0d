//! Shallow and deep sleep for the VM thread.
//!
//! The VM thread only sleeps when the interpreter has nothing runnable. A
//! sleep request is served either by halting the CPU in a loop that keeps
//! checking for events (shallow), or by handing the whole duration to the
//! platform power-down routine (deep). Deep sleep is only considered once the
//! designated sleep manager thread has declared itself idle, so ordinary
//! thread waits never fight over the power state.

use crate::config::IoConfig;
use crate::time::{Clock, Duration};

/// Platform power control used by the sleep scheduler.
pub trait PowerSleepController {
    /// Halt until an interrupt arrives or at most `max` has passed.
    fn stop_processor(&self, max: Duration);

    /// Switch to a slower, lower-power clock.
    fn enter_low_clock(&self) {}

    /// Return to the clock that was active before `enter_low_clock`.
    fn restore_clock(&self) {}

    /// Power down for `duration`. Returns the mask of interrupt sources that
    /// fired while powered down.
    fn deep_sleep(&self, duration: Duration) -> u32;

    /// Re-run low-level hardware setup after a deep sleep.
    fn reinit_hardware(&self) {}
}

/// Which way a sleep request will be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepPlan {
    Shallow,
    Deep,
}

/// What a sleep call actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    Shallow {
        slept: Duration,
        /// Returned early because an event became pending
        interrupted: bool,
    },
    Deep {
        slept: Duration,
        /// Interrupt sources that fired during the power-down
        woken_by: u32,
    },
}

/// Cumulative sleep accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SleepStats {
    /// Wall time actually spent in shallow sleep. Only ever grows.
    pub total_shallow: Duration,
    pub total_deep: Duration,
    pub shallow_count: u64,
    pub deep_count: u64,
}

pub struct SleepScheduler<P: PowerSleepController> {
    power: P,
    deep_sleep_enabled: bool,
    sleep_manager_running: bool,
    minimum_deep_sleep: Duration,
    manager_minimum: Duration,
    low_clock_threshold: Duration,
    stats: SleepStats,
}

impl<P: PowerSleepController> SleepScheduler<P> {
    pub fn new(power: P, config: &IoConfig) -> Self {
        Self {
            power,
            deep_sleep_enabled: config.deep_sleep_enabled,
            sleep_manager_running: true,
            minimum_deep_sleep: config.minimum_deep_sleep,
            manager_minimum: Duration::ZERO,
            low_clock_threshold: config.low_clock_threshold,
            stats: SleepStats::default(),
        }
    }

    pub fn power(&self) -> &P {
        &self.power
    }

    pub fn stats(&self) -> SleepStats {
        self.stats
    }

    pub fn deep_sleep_enabled(&self) -> bool {
        self.deep_sleep_enabled
    }

    pub fn set_deep_sleep_enabled(&mut self, enabled: bool) {
        self.deep_sleep_enabled = enabled;
    }

    pub fn set_minimum_deep_sleep(&mut self, minimum: Duration) {
        self.minimum_deep_sleep = minimum;
    }

    pub fn sleep_manager_running(&self) -> bool {
        self.sleep_manager_running
    }

    /// The sleep manager has nothing to do and accepts deep sleeps of at
    /// least `minimum`.
    pub fn wait_for_deep_sleep(&mut self, minimum: Duration) {
        self.sleep_manager_running = false;
        self.manager_minimum = minimum;
        log::debug!("sleep manager idle, deep sleep allowed from {} ms", minimum.as_millis());
    }

    /// Smallest duration that will be served by a deep sleep.
    pub fn deep_sleep_threshold(&self) -> Duration {
        self.minimum_deep_sleep.max(self.manager_minimum)
    }

    /// Decide how a sleep of `duration` would be served right now.
    pub fn plan(&self, duration: Duration) -> SleepPlan {
        if !self.deep_sleep_enabled
            || self.sleep_manager_running
            || duration < self.deep_sleep_threshold()
        {
            SleepPlan::Shallow
        } else {
            SleepPlan::Deep
        }
    }

    /// Sleep for up to `duration`.
    ///
    /// `events_pending` is checked before halting and after every wake; a
    /// shallow sleep returns as soon as it reports `true`.
    pub fn sleep<C: Clock + ?Sized>(
        &mut self,
        clock: &C,
        duration: Duration,
        mut events_pending: impl FnMut() -> bool,
    ) -> SleepOutcome {
        match self.plan(duration) {
            SleepPlan::Shallow => self.shallow_sleep(clock, duration, events_pending),
            SleepPlan::Deep if events_pending() => SleepOutcome::Shallow {
                slept: Duration::ZERO,
                interrupted: true,
            },
            SleepPlan::Deep => self.deep_sleep(clock, duration),
        }
    }

    fn shallow_sleep<C: Clock + ?Sized>(
        &mut self,
        clock: &C,
        duration: Duration,
        mut events_pending: impl FnMut() -> bool,
    ) -> SleepOutcome {
        let start = clock.now();
        let target = start + duration;
        let mut low_clock = false;
        let mut interrupted = false;

        loop {
            if events_pending() {
                interrupted = true;
                break;
            }
            let now = clock.now();
            if now >= target {
                break;
            }
            let remaining = target.saturating_duration_since(now);
            if !low_clock && remaining > self.low_clock_threshold {
                self.power.enter_low_clock();
                low_clock = true;
            }
            self.power.stop_processor(remaining);
        }

        if low_clock {
            self.power.restore_clock();
        }

        let slept = clock.now().saturating_duration_since(start);
        self.stats.total_shallow = self.stats.total_shallow.saturating_add(slept);
        self.stats.shallow_count += 1;
        SleepOutcome::Shallow { slept, interrupted }
    }

    fn deep_sleep<C: Clock + ?Sized>(&mut self, clock: &C, duration: Duration) -> SleepOutcome {
        log::debug!("entering deep sleep for {} ms", duration.as_millis());
        let start = clock.now();
        let woken_by = self.power.deep_sleep(duration);
        // a full power-down may have reset peripheral state
        self.power.reinit_hardware();
        let slept = clock.now().saturating_duration_since(start);

        self.stats.total_deep = self.stats.total_deep.saturating_add(slept);
        self.stats.deep_count += 1;
        self.sleep_manager_running = true;
        SleepOutcome::Deep { slept, woken_by }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;
    use portable_atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Power controller that advances a manual clock instead of halting.
    struct FakePower {
        clock: Arc<ManualClock>,
        tick: Duration,
        stops: AtomicU32,
        low_clock: AtomicU32,
        restores: AtomicU32,
        reinits: AtomicU32,
        deep_wake_mask: u32,
    }

    impl FakePower {
        fn new(clock: Arc<ManualClock>) -> Self {
            Self {
                clock,
                tick: Duration::from_millis(1),
                stops: AtomicU32::new(0),
                low_clock: AtomicU32::new(0),
                restores: AtomicU32::new(0),
                reinits: AtomicU32::new(0),
                deep_wake_mask: 0x20,
            }
        }
    }

    impl PowerSleepController for FakePower {
        fn stop_processor(&self, max: Duration) {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.clock.advance(self.tick.min(max));
        }

        fn enter_low_clock(&self) {
            self.low_clock.fetch_add(1, Ordering::SeqCst);
        }

        fn restore_clock(&self) {
            self.restores.fetch_add(1, Ordering::SeqCst);
        }

        fn deep_sleep(&self, duration: Duration) -> u32 {
            self.clock.advance(duration);
            self.deep_wake_mask
        }

        fn reinit_hardware(&self) {
            self.reinits.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn scheduler(config: IoConfig) -> (SleepScheduler<FakePower>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (SleepScheduler::new(FakePower::new(clock.clone()), &config), clock)
    }

    #[test]
    fn test_plan_selection() {
        let config = IoConfig::builder()
            .deep_sleep_enabled(true)
            .minimum_deep_sleep(Duration::from_millis(100))
            .build();
        let (mut sched, _) = scheduler(config);

        // manager still running
        assert_eq!(sched.plan(Duration::from_millis(1_000)), SleepPlan::Shallow);

        sched.wait_for_deep_sleep(Duration::from_millis(300));
        assert_eq!(sched.plan(Duration::from_millis(1_000)), SleepPlan::Deep);
        assert_eq!(sched.plan(Duration::from_millis(200)), SleepPlan::Shallow);

        sched.set_deep_sleep_enabled(false);
        assert_eq!(sched.plan(Duration::from_millis(1_000)), SleepPlan::Shallow);
    }

    #[test]
    fn test_shallow_sleep_full_duration() {
        let (mut sched, clock) = scheduler(IoConfig::default());
        let outcome = sched.sleep(&*clock, Duration::from_millis(10), || false);
        assert_eq!(
            outcome,
            SleepOutcome::Shallow {
                slept: Duration::from_millis(10),
                interrupted: false
            }
        );
        assert_eq!(sched.stats().total_shallow, Duration::from_millis(10));
        assert_eq!(sched.power().stops.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_shallow_sleep_records_elapsed_not_requested() {
        let (mut sched, clock) = scheduler(IoConfig::default());
        let mut polls = 0;
        let outcome = sched.sleep(&*clock, Duration::from_millis(10), || {
            polls += 1;
            polls > 3
        });
        assert_eq!(
            outcome,
            SleepOutcome::Shallow {
                slept: Duration::from_millis(3),
                interrupted: true
            }
        );
        assert_eq!(sched.stats().total_shallow, Duration::from_millis(3));
        assert_eq!(sched.stats().shallow_count, 1);

        sched.sleep(&*clock, Duration::from_millis(2), || false);
        assert_eq!(sched.stats().total_shallow, Duration::from_millis(5));
    }

    #[test]
    fn test_pending_event_skips_sleep() {
        let (mut sched, clock) = scheduler(IoConfig::default());
        sched.sleep(&*clock, Duration::from_millis(50), || true);
        assert_eq!(sched.power().stops.load(Ordering::SeqCst), 0);
        assert_eq!(sched.stats().total_shallow, Duration::ZERO);
    }

    #[test]
    fn test_low_clock_used_for_long_waits_and_restored() {
        let config = IoConfig::builder()
            .low_clock_threshold(Duration::from_millis(5))
            .build();
        let (mut sched, clock) = scheduler(config);
        sched.sleep(&*clock, Duration::from_millis(3), || false);
        assert_eq!(sched.power().low_clock.load(Ordering::SeqCst), 0);

        sched.sleep(&*clock, Duration::from_millis(20), || false);
        assert_eq!(sched.power().low_clock.load(Ordering::SeqCst), 1);
        assert_eq!(sched.power().restores.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_deep_sleep_reinitializes_and_resumes_manager() {
        let config = IoConfig::builder()
            .deep_sleep_enabled(true)
            .minimum_deep_sleep(Duration::from_millis(100))
            .build();
        let (mut sched, clock) = scheduler(config);
        sched.wait_for_deep_sleep(Duration::from_millis(100));
        assert!(!sched.sleep_manager_running());

        let outcome = sched.sleep(&*clock, Duration::from_millis(500), || false);
        assert_eq!(
            outcome,
            SleepOutcome::Deep {
                slept: Duration::from_millis(500),
                woken_by: 0x20
            }
        );
        assert_eq!(sched.power().reinits.load(Ordering::SeqCst), 1);
        assert!(sched.sleep_manager_running());
        assert_eq!(sched.stats().deep_count, 1);
        assert_eq!(sched.stats().total_shallow, Duration::ZERO);

        // next long sleep is shallow until the manager goes idle again
        assert_eq!(sched.plan(Duration::from_millis(500)), SleepPlan::Shallow);
    }

    #[test]
    fn test_pending_event_prevents_deep_sleep() {
        let config = IoConfig::builder()
            .deep_sleep_enabled(true)
            .minimum_deep_sleep(Duration::from_millis(100))
            .build();
        let (mut sched, clock) = scheduler(config);
        sched.wait_for_deep_sleep(Duration::from_millis(100));
        assert_eq!(sched.plan(Duration::from_millis(500)), SleepPlan::Deep);

        let outcome = sched.sleep(&*clock, Duration::from_millis(500), || true);
        assert_eq!(
            outcome,
            SleepOutcome::Shallow {
                slept: Duration::ZERO,
                interrupted: true
            }
        );
        assert_eq!(clock.now().as_nanos(), 0);
        assert_eq!(sched.stats().deep_count, 0);
        assert_eq!(sched.power().reinits.load(Ordering::SeqCst), 0);
        assert!(!sched.sleep_manager_running());
    }
}
