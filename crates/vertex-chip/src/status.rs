// SPDX-License-Identifier: AGPL-3.0-only

//! Status codes carried in response payloads.
//!
//! `0` is success; every failure is a distinct negative value.

/// Command completed.
pub const OK: i32 = 0;
/// Graph id unknown to the firmware.
pub const INVALID_GRAPH: i32 = -1;
/// Payload field out of range.
pub const INVALID_PARAM: i32 = -2;
/// Firmware ran out of an internal resource.
pub const NO_RESOURCE: i32 = -3;
/// Firmware is busy and refused the command.
pub const BUSY: i32 = -4;
/// Unexpected firmware fault.
pub const INTERNAL: i32 = -5;
/// Command type not understood by this firmware.
pub const UNSUPPORTED: i32 = -6;
/// Host-side marker: the host gave up waiting for the reply.
pub const HOST_TIMEOUT: i32 = -110;

/// Short name for a status code, for logs.
#[must_use]
pub const fn describe(code: i32) -> &'static str {
    match code {
        OK => "ok",
        INVALID_GRAPH => "invalid graph",
        INVALID_PARAM => "invalid parameter",
        NO_RESOURCE => "no resource",
        BUSY => "busy",
        INTERNAL => "internal fault",
        UNSUPPORTED => "unsupported command",
        HOST_TIMEOUT => "host timeout",
        _ => "unknown status",
    }
}
