// SPDX-License-Identifier: AGPL-3.0-only

//! Remote engine implementations
//!
//! Only the in-process [`SoftwareFirmware`] exists today. It speaks the same
//! mailbox protocol a coprocessor would, which lets every driver path
//! (including timeouts and full rings) run without hardware.

pub mod software;

pub use software::SoftwareFirmware;

use std::time::Duration;
use vertex_chip::status;

/// Simulated firmware behaviour
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareConfig {
    /// Time one INVOKE takes to execute
    pub invoke_latency: Duration,

    /// Never drain the host → firmware rings (a wedged coprocessor)
    pub stalled: bool,

    /// Drain and execute, but never reply
    pub silent: bool,

    /// Fail this many upcoming invokes with `fail_status`
    pub fail_invokes: u32,

    /// Status used for injected invoke failures
    pub fail_status: i32,

    /// Lines kept in the firmware log ring
    pub log_capacity: usize,

    /// Idle wake-up period of the firmware thread
    pub poll_interval: Duration,
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            invoke_latency: Duration::from_micros(200),
            stalled: false,
            silent: false,
            fail_invokes: 0,
            fail_status: status::INTERNAL,
            log_capacity: 64,
            poll_interval: Duration::from_millis(10),
        }
    }
}

impl FirmwareConfig {
    /// Set the per-invoke execution time
    #[must_use]
    pub fn with_invoke_latency(mut self, latency: Duration) -> Self {
        self.invoke_latency = latency;
        self
    }

    /// Start stalled
    #[must_use]
    pub fn stalled(mut self) -> Self {
        self.stalled = true;
        self
    }

    /// Start silent
    #[must_use]
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    /// Fail the next `count` invokes with `status`
    #[must_use]
    pub fn with_invoke_failures(mut self, count: u32, status: i32) -> Self {
        self.fail_invokes = count;
        self.fail_status = status;
        self
    }
}
