// SPDX-License-Identifier: AGPL-3.0-only

//! Driver configuration
//!
//! Every pool size, retry budget and deadline the core uses lives here so
//! tests can shrink timeouts instead of sleeping through real ones. Values
//! can be overridden from `VERTEX_*` environment variables.

use crate::error::{Result, VertexError};
use std::time::Duration;
use tracing::{debug, warn};
use vertex_chip::limits;
use vertex_chip::mailbox::{DEFAULT_NORMAL_CAPACITY, DEFAULT_URGENT_CAPACITY};

/// Bounded spin with backoff.
///
/// `retries` attempts, sleeping `interval` between them. A zero interval
/// spins with [`std::hint::spin_loop`] instead of sleeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Attempts before giving up
    pub retries: u32,
    /// Pause between attempts
    pub interval: Duration,
}

impl PollConfig {
    /// Create a poll budget
    pub const fn new(retries: u32, interval: Duration) -> Self {
        Self { retries, interval }
    }

    /// Poll `attempt` until it yields `Some`, or the budget runs out.
    pub fn run<T>(&self, mut attempt: impl FnMut() -> Option<T>) -> Option<T> {
        for i in 0..=self.retries {
            if let Some(v) = attempt() {
                return Some(v);
            }
            if i == self.retries {
                break;
            }
            if self.interval.is_zero() {
                std::hint::spin_loop();
            } else {
                std::thread::sleep(self.interval);
            }
        }
        None
    }

    /// Upper bound on the time [`PollConfig::run`] can take.
    pub fn budget(&self) -> Duration {
        self.interval.saturating_mul(self.retries)
    }
}

/// Slot counts of the four mailbox rings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxConfig {
    /// Slots in each normal ring
    pub normal_capacity: u32,
    /// Slots in each urgent ring
    pub urgent_capacity: u32,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            normal_capacity: DEFAULT_NORMAL_CAPACITY,
            urgent_capacity: DEFAULT_URGENT_CAPACITY,
        }
    }
}

impl MailboxConfig {
    /// Check both capacities.
    ///
    /// Slots are addressed as `index % capacity` on wrapping `u32` indices,
    /// which only stays continuous across the wrap for powers of two.
    ///
    /// # Errors
    ///
    /// [`VertexError::InvalidArgument`] unless both are non-zero powers of two.
    pub fn validate(&self) -> Result<()> {
        for (ring, capacity) in [("normal", self.normal_capacity), ("urgent", self.urgent_capacity)] {
            if !capacity.is_power_of_two() {
                return Err(VertexError::invalid_argument(format!(
                    "{ring} ring capacity {capacity} is not a power of two"
                )));
            }
        }
        Ok(())
    }
}

/// Driver configuration
#[derive(Debug, Clone)]
pub struct VertexConfig {
    /// Graph slots in the scheduler
    pub max_graphs: usize,

    /// Task slots per graph (index 0 reserved)
    pub graph_tasks: usize,

    /// Task slots for interface bookkeeping (index 0 reserved)
    pub interface_tasks: usize,

    /// Scheduler task descriptors
    pub max_descriptors: usize,

    /// Bundle slot indices per direction
    pub max_bundles: usize,

    /// Mailbox ring sizes
    pub mailbox: MailboxConfig,

    /// Busy-poll budget while a host → firmware ring is full
    pub mailbox_poll: PollConfig,

    /// Reply deadline for control commands
    pub command_timeout: Duration,

    /// Reply deadline for INVOKE
    pub invoke_timeout: Duration,

    /// Reply worker wake-up period (watchdog granularity)
    pub reply_poll_interval: Duration,

    /// Deadline for a blocking dequeue
    pub dequeue_timeout: Duration,

    /// Drain budget when a graph stops with tasks still in flight
    pub stop_poll: PollConfig,

    /// Scheduler event channel depth
    pub event_queue_depth: usize,
}

impl Default for VertexConfig {
    fn default() -> Self {
        Self {
            max_graphs: limits::MAX_GRAPHS,
            graph_tasks: limits::MAX_TASKS,
            interface_tasks: limits::MAX_TASKS,
            max_descriptors: 64,
            max_bundles: limits::MAX_BUNDLES,
            mailbox: MailboxConfig::default(),
            mailbox_poll: PollConfig::new(1000, Duration::from_micros(10)),
            command_timeout: Duration::from_secs(3),
            invoke_timeout: Duration::from_secs(10),
            reply_poll_interval: Duration::from_millis(5),
            dequeue_timeout: Duration::from_secs(10),
            stop_poll: PollConfig::new(200, Duration::from_millis(10)),
            event_queue_depth: 64,
        }
    }
}

impl VertexConfig {
    /// Defaults with `VERTEX_*` environment overrides applied
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `VERTEX_COMMAND_TIMEOUT_MS` | `command_timeout` |
    /// | `VERTEX_INVOKE_TIMEOUT_MS` | `invoke_timeout` |
    /// | `VERTEX_DEQUEUE_TIMEOUT_MS` | `dequeue_timeout` |
    /// | `VERTEX_MBOX_RETRIES` | `mailbox_poll.retries` |
    /// | `VERTEX_MBOX_INTERVAL_US` | `mailbox_poll.interval` |
    /// | `VERTEX_STOP_RETRIES` | `stop_poll.retries` |
    /// | `VERTEX_MAX_DESCRIPTORS` | `max_descriptors` |
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ms) = env_u64("VERTEX_COMMAND_TIMEOUT_MS") {
            config.command_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("VERTEX_INVOKE_TIMEOUT_MS") {
            config.invoke_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("VERTEX_DEQUEUE_TIMEOUT_MS") {
            config.dequeue_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = env_u64("VERTEX_MBOX_RETRIES") {
            config.mailbox_poll.retries = n as u32;
        }
        if let Some(us) = env_u64("VERTEX_MBOX_INTERVAL_US") {
            config.mailbox_poll.interval = Duration::from_micros(us);
        }
        if let Some(n) = env_u64("VERTEX_STOP_RETRIES") {
            config.stop_poll.retries = n as u32;
        }
        if let Some(n) = env_u64("VERTEX_MAX_DESCRIPTORS") {
            config.max_descriptors = n as usize;
        }
        debug!("Driver config: {config:?}");
        config
    }

    /// Set the control command deadline
    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the INVOKE deadline
    #[must_use]
    pub fn with_invoke_timeout(mut self, timeout: Duration) -> Self {
        self.invoke_timeout = timeout;
        self
    }

    /// Set the dequeue deadline
    #[must_use]
    pub fn with_dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.dequeue_timeout = timeout;
        self
    }

    /// Set the mailbox busy-poll budget
    #[must_use]
    pub fn with_mailbox_poll(mut self, poll: PollConfig) -> Self {
        self.mailbox_poll = poll;
        self
    }

    /// Set the stop drain budget
    #[must_use]
    pub fn with_stop_poll(mut self, poll: PollConfig) -> Self {
        self.stop_poll = poll;
        self
    }

    /// Set the mailbox ring sizes
    #[must_use]
    pub fn with_mailbox(mut self, mailbox: MailboxConfig) -> Self {
        self.mailbox = mailbox;
        self
    }

    /// Set the scheduler descriptor pool size
    #[must_use]
    pub fn with_max_descriptors(mut self, n: usize) -> Self {
        self.max_descriptors = n;
        self
    }

    /// Set the per-graph task pool size (index 0 included)
    #[must_use]
    pub fn with_graph_tasks(mut self, n: usize) -> Self {
        self.graph_tasks = n;
        self
    }
}

fn env_u64(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("Ignoring {name}={raw:?}: {e}");
            None
        }
    }
}
