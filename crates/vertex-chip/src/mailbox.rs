// SPDX-License-Identifier: AGPL-3.0-only

//! Mailbox layout: four independent rings of fixed-size messages.
//!
//! ```text
//!            normal ring            urgent ring
//! h2f   [w]──────────────[r]   [w]──────[r]      host writes, firmware reads
//! f2h   [w]──────────────[r]   [w]──────[r]      firmware writes, host reads
//! ```
//!
//! Every ring keeps a monotonically increasing write index and read index
//! (wrapping `u32`). A ring is empty when `write == read` and full when
//! `write - read == capacity`; slot `i` lives at `i % capacity`.

/// Bytes of the message header (`transaction id: u32`, `type: u32`).
pub const HEADER_SIZE: usize = 8;

/// Bytes reserved for the payload union. Every payload struct fits.
pub const PAYLOAD_SIZE: usize = 504;

/// Bytes of one mailbox message on the wire.
pub const MESSAGE_SIZE: usize = HEADER_SIZE + PAYLOAD_SIZE;

/// Default slot count of a normal-priority ring.
pub const DEFAULT_NORMAL_CAPACITY: u32 = 16;

/// Default slot count of an urgent ring.
pub const DEFAULT_URGENT_CAPACITY: u32 = 4;

/// Message direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Host to firmware.
    HostToFirmware,
    /// Firmware to host.
    FirmwareToHost,
}

/// One of the four rings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelId {
    /// Host → firmware, normal priority.
    H2fNormal,
    /// Host → firmware, urgent.
    H2fUrgent,
    /// Firmware → host, normal priority.
    F2hNormal,
    /// Firmware → host, urgent.
    F2hUrgent,
}

impl ChannelId {
    /// All channels in ring-table order.
    pub const ALL: [ChannelId; 4] = [
        ChannelId::H2fNormal,
        ChannelId::H2fUrgent,
        ChannelId::F2hNormal,
        ChannelId::F2hUrgent,
    ];

    /// Position of this ring in the ring table.
    #[must_use]
    pub const fn slot(self) -> usize {
        match self {
            Self::H2fNormal => 0,
            Self::H2fUrgent => 1,
            Self::F2hNormal => 2,
            Self::F2hUrgent => 3,
        }
    }

    /// Direction the ring carries.
    #[must_use]
    pub const fn direction(self) -> Direction {
        match self {
            Self::H2fNormal | Self::H2fUrgent => Direction::HostToFirmware,
            Self::F2hNormal | Self::F2hUrgent => Direction::FirmwareToHost,
        }
    }

    /// Whether this is one of the urgent rings.
    #[must_use]
    pub const fn is_urgent(self) -> bool {
        matches!(self, Self::H2fUrgent | Self::F2hUrgent)
    }

    /// Host → firmware ring for the given urgency.
    #[must_use]
    pub const fn h2f(urgent: bool) -> Self {
        if urgent {
            Self::H2fUrgent
        } else {
            Self::H2fNormal
        }
    }

    /// Firmware → host ring for the given urgency.
    #[must_use]
    pub const fn f2h(urgent: bool) -> Self {
        if urgent {
            Self::F2hUrgent
        } else {
            Self::F2hNormal
        }
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::H2fNormal => write!(f, "h2f-normal"),
            Self::H2fUrgent => write!(f, "h2f-urgent"),
            Self::F2hNormal => write!(f, "f2h-normal"),
            Self::F2hUrgent => write!(f, "f2h-urgent"),
        }
    }
}
