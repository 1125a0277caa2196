// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for vertex driver operations

use thiserror::Error;
use vertex_chip::mailbox::ChannelId;
use vertex_chip::message::MessageType;

/// Result type alias for vertex operations
pub type Result<T> = std::result::Result<T, VertexError>;

/// Errors surfaced by externally visible driver operations
#[derive(Debug, Error)]
pub enum VertexError {
    /// Operation attempted against an object in the wrong state
    #[error("Invalid state: {state}")]
    InvalidState {
        /// Current state description
        state: String,
    },

    /// No free pool entry; the caller should try again later
    #[error("Resource exhausted: no free {resource}")]
    ResourceExhausted {
        /// Which pool ran dry
        resource: &'static str,
    },

    /// A mailbox ring stayed full for the whole busy-poll budget
    #[error("Mailbox channel {channel} full after {retries} retries")]
    MailboxFull {
        /// Ring that was full
        channel: ChannelId,
        /// Poll attempts made
        retries: u32,
    },

    /// No reply arrived before the deadline
    #[error("{command} timed out after {duration_ms}ms")]
    Timeout {
        /// Command that was waiting
        command: MessageType,
        /// Deadline in milliseconds
        duration_ms: u64,
    },

    /// Firmware replied with a failure status
    #[error("{command} failed in firmware: status {status} ({reason})")]
    Firmware {
        /// Command that failed
        command: MessageType,
        /// Payload status code
        status: i32,
        /// Status description
        reason: &'static str,
    },

    /// Malformed client input
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Reason for rejection
        reason: String,
    },

    /// Pixel format not in the format table
    #[error("Unsupported pixel format {format:#x}")]
    UnsupportedFormat {
        /// Rejected format code
        format: u32,
    },

    /// Stream cannot stop while bundles are still in flight
    #[error("Queue busy: {queued} queued, {process} in process, {done} done")]
    Busy {
        /// Bundles waiting for a partner
        queued: usize,
        /// Bundles attached to a task
        process: usize,
        /// Bundles waiting for dequeue
        done: usize,
    },

    /// Blocking wait interrupted by stream stop or close
    #[error("Wait interrupted")]
    Interrupted,

    /// Undecodable wire message
    #[error("Protocol error: {reason}")]
    Protocol {
        /// Reason for failure
        reason: String,
    },

    /// I/O error (worker thread creation)
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

impl VertexError {
    /// Create an invalid state error
    pub fn invalid_state(state: impl Into<String>) -> Self {
        Self::InvalidState {
            state: state.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    /// Create a resource exhaustion error
    pub const fn exhausted(resource: &'static str) -> Self {
        Self::ResourceExhausted { resource }
    }

    /// Create a firmware error from a reply status
    pub const fn firmware(command: MessageType, status: i32) -> Self {
        Self::Firmware {
            command,
            status,
            reason: vertex_chip::status::describe(status),
        }
    }

    /// Whether retrying the same call later may succeed
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ResourceExhausted { .. } | Self::Busy { .. } | Self::MailboxFull { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn firmware_error_names_status() {
        let err = VertexError::firmware(MessageType::SetGraph, vertex_chip::status::NO_RESOURCE);
        let text = err.to_string();
        assert!(text.contains("SET_GRAPH"));
        assert!(text.contains("no resource"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn exhaustion_is_retryable() {
        assert!(VertexError::exhausted("task").is_retryable());
        assert!(VertexError::Busy {
            queued: 1,
            process: 0,
            done: 0
        }
        .is_retryable());
    }
}
