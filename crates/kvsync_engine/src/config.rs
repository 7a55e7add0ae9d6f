//! Configuration for the sync engine.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Software version advertised during ability sync.
pub const SOFTWARE_VERSION_CURRENT: u32 = 3;

/// Configuration for one sync engine instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Software version advertised to peers.
    pub software_version: u32,
    /// How long a phase waits for a reply before its timeout handler runs.
    pub response_timeout: Duration,
    /// Retry policy for timed-out phases.
    pub retry: RetryConfig,
    /// Time sync results older than this are refreshed.
    pub time_sync_interval: Duration,
    /// Byte budget of the inbound message queue.
    pub max_queue_cache_size: usize,
    /// Maximum concurrently executing dispatch tasks.
    pub max_exec_tasks: usize,
    /// Upper bound of one data packet, used when the communicator reports
    /// a larger MTU or none.
    pub max_packet_size: usize,
    /// Maximum queued non-blocking manual syncs.
    pub queued_sync_limit: usize,
    /// Delay a busy receiver asks the sender to wait before resending.
    pub save_notify_delay: Duration,
    /// Longest delay a busy receiver may ask a sender to wait.
    pub max_save_notify_delay: Duration,
    /// Timeout handed to the communicator for each send.
    pub send_timeout: Duration,
}

impl EngineConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            software_version: SOFTWARE_VERSION_CURRENT,
            response_timeout: Duration::from_secs(5),
            retry: RetryConfig::default(),
            time_sync_interval: Duration::from_secs(24 * 60 * 60),
            max_queue_cache_size: 160 * 1024 * 1024,
            max_exec_tasks: 32,
            max_packet_size: 1024 * 1024,
            queued_sync_limit: 32,
            save_notify_delay: Duration::from_millis(100),
            max_save_notify_delay: Duration::from_secs(5),
            send_timeout: Duration::from_secs(5),
        }
    }

    /// Sets the per-phase response timeout.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the time sync refresh interval.
    pub fn with_time_sync_interval(mut self, interval: Duration) -> Self {
        self.time_sync_interval = interval;
        self
    }

    /// Sets the inbound queue byte budget.
    pub fn with_max_queue_cache_size(mut self, size: usize) -> Self {
        self.max_queue_cache_size = size;
        self
    }

    /// Sets the concurrent dispatch task ceiling.
    pub fn with_max_exec_tasks(mut self, count: usize) -> Self {
        self.max_exec_tasks = count;
        self
    }

    /// Sets the data packet size bound.
    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    /// Sets the queued manual sync limit.
    pub fn with_queued_sync_limit(mut self, limit: usize) -> Self {
        self.queued_sync_limit = limit;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of send attempts per phase step (1 = no retry).
    pub max_attempts: u32,
    /// Initial extra delay before a retry.
    pub initial_delay: Duration,
    /// Maximum extra delay before a retry.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Disables jitter.
    pub fn without_jitter(mut self) -> Self {
        self.add_jitter = false;
        self
    }

    /// Returns true if another attempt is allowed after `attempts` sends.
    pub fn can_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Calculates the delay for a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% jitter
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}
