// SPDX-License-Identifier: AGPL-3.0-only

//! Table sizes shared by host and firmware.
//!
//! The firmware sizes its graph table and per-graph task table with the same
//! numbers, so the host never hands it an id it cannot index.

/// Number of graph slots (graph ids are `0..MAX_GRAPHS`).
pub const MAX_GRAPHS: usize = 32;

/// Task slots per task pool, including the reserved index 0.
pub const MAX_TASKS: usize = 16;

/// Task index 0 is never handed out; it marks "no task".
pub const INVALID_TASK_INDEX: u32 = 0;

/// Bundle slot indices per direction (`0..MAX_BUNDLES`).
pub const MAX_BUNDLES: usize = 16;

/// Buffers per direction carried by one INVOKE / SET_GRAPH payload.
pub const MAX_IO_BUFFERS: usize = 8;

/// Planes per image buffer.
pub const MAX_PLANES: usize = 3;

/// User parameter words carried by INVOKE.
pub const MAX_USER_PARAMS: usize = 4;

/// Highest scheduling priority a graph may request; larger values are clamped.
pub const MAX_PRIORITY: u32 = 20;

/// Default priority of a freshly created graph.
pub const DEFAULT_PRIORITY: u32 = 10;
