//! Runtime configuration for an I/O context.

use crate::time::Duration;

/// Default minimum duration worth a deep sleep (2 s).
pub const DEFAULT_MINIMUM_DEEP_SLEEP_MS: u64 = 2_000;
/// Remaining shallow wait above which the low-power clock is used.
pub const DEFAULT_LOW_CLOCK_THRESHOLD_MS: u64 = 50;
/// Upper bound on simultaneously outstanding event numbers.
pub const DEFAULT_MAX_OUTSTANDING_EVENTS: usize = 1024;
/// Slice used by `WaitForEvent` to notice interrupt-side events.
pub const DEFAULT_EVENT_POLL_INTERVAL_MS: u64 = 10;
/// Stack size for task executor threads when the caller passes 0.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// Settings shared by the dispatcher, the sleep scheduler and the
/// interrupt bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoConfig {
    pub deep_sleep_enabled: bool,
    pub minimum_deep_sleep: Duration,
    pub low_clock_threshold: Duration,
    pub max_outstanding_events: usize,
    pub event_poll_interval: Duration,
    /// Interrupt sources allowed to wake a sleep manager waiting for
    /// permission to deep sleep.
    pub sleep_manager_mask: u32,
    pub default_stack_size: usize,
}

impl IoConfig {
    pub fn builder() -> IoConfigBuilder {
        IoConfigBuilder::new()
    }
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            deep_sleep_enabled: false,
            minimum_deep_sleep: Duration::from_millis(DEFAULT_MINIMUM_DEEP_SLEEP_MS),
            low_clock_threshold: Duration::from_millis(DEFAULT_LOW_CLOCK_THRESHOLD_MS),
            max_outstanding_events: DEFAULT_MAX_OUTSTANDING_EVENTS,
            event_poll_interval: Duration::from_millis(DEFAULT_EVENT_POLL_INTERVAL_MS),
            sleep_manager_mask: 0,
            default_stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

pub struct IoConfigBuilder {
    config: IoConfig,
}

impl IoConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: IoConfig::default(),
        }
    }

    pub fn deep_sleep_enabled(mut self, enabled: bool) -> Self {
        self.config.deep_sleep_enabled = enabled;
        self
    }

    pub fn minimum_deep_sleep(mut self, duration: Duration) -> Self {
        self.config.minimum_deep_sleep = duration;
        self
    }

    pub fn low_clock_threshold(mut self, duration: Duration) -> Self {
        self.config.low_clock_threshold = duration;
        self
    }

    pub fn max_outstanding_events(mut self, max: usize) -> Self {
        self.config.max_outstanding_events = max;
        self
    }

    pub fn event_poll_interval(mut self, interval: Duration) -> Self {
        self.config.event_poll_interval = interval;
        self
    }

    pub fn sleep_manager_mask(mut self, mask: u32) -> Self {
        self.config.sleep_manager_mask = mask;
        self
    }

    pub fn default_stack_size(mut self, size: usize) -> Self {
        self.config.default_stack_size = size;
        self
    }

    pub fn build(self) -> IoConfig {
        self.config
    }
}

impl Default for IoConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
