// SPDX-License-Identifier: AGPL-3.0-only

//! Host driver core for the vertex compute-graph engine.
//!
//! Clients open a [`VertexDevice`], create one [`VertexContext`] per graph,
//! describe the input and output formats, and stream bundles of buffers
//! through it. Every paired input/output bundle becomes one graph task; the
//! cross-graph [`GraphManager`] orders tasks by priority and hands them to
//! the [`Interface`], which carries INVOKE messages over the shared-memory
//! [`Mailbox`] to the remote engine.
//!
//! # Pipeline
//!
//! ```text
//! VertexContext ── qbuf ──> VertexQueue ── pair ──> Graph (TaskManager)
//!                                                     │ request
//!                                                     v
//!                                               GraphManager ── sched
//!                                                     │ send_process
//!                                                     v
//!   Mailbox <── INVOKE ── Interface <── reply worker (irq, watchdog)
//!      │                        ^
//!      v                        │ INVOKE_RSP
//!  SoftwareFirmware ────────────┘
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use vertex_driver::prelude::*;
//! use vertex_driver::format::codes;
//!
//! # fn main() -> Result<()> {
//! let device = VertexDevice::open(VertexConfig::from_env(), &FirmwareConfig::default())?;
//! let ctx = device.open_context()?;
//! let spec = FormatSpec { target: 0, format: codes::U8, planes: 1, width: 64, height: 64 };
//! ctx.set_format(Direction::Input, &[spec])?;
//! ctx.set_format(Direction::Output, &[spec])?;
//! ctx.streamon()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod config;
mod context;
mod device;
mod error;
pub mod firmware;
pub mod format;
mod graph;
pub mod graphmgr;
pub mod interface;
pub mod mailbox;
pub mod memory;
pub mod protocol;
pub mod queue;
pub mod task;

/// Firmware contract constants (re-exported from vertex-chip).
pub mod chip {
    pub use vertex_chip::limits;
    pub use vertex_chip::mailbox::{ChannelId, HEADER_SIZE, MESSAGE_SIZE, PAYLOAD_SIZE};
    pub use vertex_chip::message::MessageType;
    pub use vertex_chip::status;
}

pub use config::{MailboxConfig, PollConfig, VertexConfig};
pub use context::{Control, ControlOutput, VertexContext};
pub use device::{VertexDevice, HEAP_REGION_SIZE, LOG_REGION_SIZE};
pub use error::{Result, VertexError};
pub use firmware::{FirmwareConfig, SoftwareFirmware};
pub use format::{Format, FormatList, FormatSpec};
pub use graph::{Graph, GraphStats};
pub use graphmgr::{GraphManager, InvokeResult, ProcessReply, SchedulerStats};
pub use interface::{Diagnostics, Interface, InterfaceState, InterfaceStats};
pub use mailbox::Mailbox;
pub use memory::{HostMapper, MappedBuffer, MemHandle, MemoryMapper};
pub use queue::{
    bundle_flags, BufferDesc, BundleSubmit, ContainerDesc, DequeuedBundle, Direction, Roi,
    VertexQueue,
};
pub use task::{TaskId, TaskManager, TaskState, Timestamps};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        bundle_flags, BufferDesc, BundleSubmit, ContainerDesc, Control, ControlOutput,
        DequeuedBundle, Direction, FirmwareConfig, FormatSpec, MemHandle, Result, Roi,
        VertexConfig, VertexContext, VertexDevice, VertexError,
    };
}
