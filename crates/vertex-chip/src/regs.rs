// SPDX-License-Identifier: AGPL-3.0-only

//! Diagnostic registers captured when the firmware stops answering.
//!
//! Only the subset worth reading after a hang is listed here; power and
//! clock sequencing registers are not part of the host contract.

/// Firmware status word (boot stage, fault bits).
pub const FW_STATUS: usize = 0x0000;
/// Program counter of the coprocessor at the time of the read.
pub const FW_PC: usize = 0x0004;
/// Host → firmware doorbell.
pub const H2F_DOORBELL: usize = 0x0010;
/// Firmware → host interrupt status.
pub const F2H_IRQ_STATUS: usize = 0x0014;
/// Last message type the firmware started handling.
pub const FW_LAST_MSG: usize = 0x0020;
/// Last transaction id the firmware started handling.
pub const FW_LAST_TRID: usize = 0x0024;
/// Firmware watchdog counter.
pub const FW_WATCHDOG: usize = 0x0030;

/// Registers read, in order, by a diagnostic dump.
pub const DUMP_SET: [(&str, usize); 7] = [
    ("FW_STATUS", FW_STATUS),
    ("FW_PC", FW_PC),
    ("H2F_DOORBELL", H2F_DOORBELL),
    ("F2H_IRQ_STATUS", F2H_IRQ_STATUS),
    ("FW_LAST_MSG", FW_LAST_MSG),
    ("FW_LAST_TRID", FW_LAST_TRID),
    ("FW_WATCHDOG", FW_WATCHDOG),
];

/// Firmware status bits.
pub mod fw_status {
    /// Firmware finished INIT.
    pub const BOOTED: u32 = 1 << 0;
    /// Firmware is handling a message.
    pub const BUSY: u32 = 1 << 1;
    /// Firmware hit a fault.
    pub const FAULT: u32 = 1 << 2;
    /// Firmware accepted POWER_DOWN.
    pub const POWERED_DOWN: u32 = 1 << 3;
}
