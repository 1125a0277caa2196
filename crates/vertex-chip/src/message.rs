// SPDX-License-Identifier: AGPL-3.0-only

//! Mailbox message model.
//!
//! A message is `{ transaction id: u32, type: u32, payload }` padded to
//! [`MESSAGE_SIZE`](crate::mailbox::MESSAGE_SIZE). The payload is a tagged
//! union with one struct per message type and no variable-length fields; the
//! counts in [`SetGraphPayload`] and [`InvokePayload`] say how many array
//! entries are meaningful.
//!
//! Requests and replies are paired by transaction id only. Control commands
//! carry the host bookkeeping task index; INVOKE carries the graph task
//! index and names the graph in its payload.
//!
//! | Request | Reply | Ring |
//! |---------|-------|------|
//! | `INIT` | `INIT_RSP` | normal |
//! | `DEINIT` | `DEINIT_RSP` | normal |
//! | `CREATE_GRAPH` | `CREATE_GRAPH_RSP` | normal |
//! | `DESTROY_GRAPH` | `DESTROY_GRAPH_RSP` | normal |
//! | `SET_GRAPH` | `SET_GRAPH_RSP` | normal |
//! | `INVOKE` | `INVOKE_RSP` | normal |
//! | `POWER_DOWN` | `POWER_DOWN_ACK` | urgent |

use crate::limits::{MAX_IO_BUFFERS, MAX_USER_PARAMS};

/// Wire value of the message `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    /// Bootstrap the firmware.
    Init = 0x0001,
    /// Tear the firmware down.
    Deinit = 0x0002,
    /// Allocate a graph slot on the firmware.
    CreateGraph = 0x0003,
    /// Release a graph slot on the firmware.
    DestroyGraph = 0x0004,
    /// Configure a graph's geometry and scratch heap.
    SetGraph = 0x0005,
    /// Run one invocation of a graph.
    Invoke = 0x0006,
    /// Enter low power.
    PowerDown = 0x0007,

    /// Reply to [`MessageType::Init`].
    InitRsp = 0x0101,
    /// Reply to [`MessageType::Deinit`].
    DeinitRsp = 0x0102,
    /// Reply to [`MessageType::CreateGraph`].
    CreateGraphRsp = 0x0103,
    /// Reply to [`MessageType::DestroyGraph`].
    DestroyGraphRsp = 0x0104,
    /// Reply to [`MessageType::SetGraph`].
    SetGraphRsp = 0x0105,
    /// Reply to [`MessageType::Invoke`].
    InvokeRsp = 0x0106,
    /// Acknowledgement of [`MessageType::PowerDown`].
    PowerDownAck = 0x0107,
}

const RESPONSE_BIT: u32 = 0x0100;

impl MessageType {
    /// Every message type, requests first.
    pub const ALL: [MessageType; 14] = [
        Self::Init,
        Self::Deinit,
        Self::CreateGraph,
        Self::DestroyGraph,
        Self::SetGraph,
        Self::Invoke,
        Self::PowerDown,
        Self::InitRsp,
        Self::DeinitRsp,
        Self::CreateGraphRsp,
        Self::DestroyGraphRsp,
        Self::SetGraphRsp,
        Self::InvokeRsp,
        Self::PowerDownAck,
    ];

    /// Decode a wire value.
    #[must_use]
    pub fn from_u32(value: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|t| *t as u32 == value)
    }

    /// Whether the firmware sends this type.
    #[must_use]
    pub const fn is_response(self) -> bool {
        (self as u32) & RESPONSE_BIT != 0
    }

    /// Reply type for a request type; `None` for reply types.
    #[must_use]
    pub const fn response(self) -> Option<Self> {
        match self {
            Self::Init => Some(Self::InitRsp),
            Self::Deinit => Some(Self::DeinitRsp),
            Self::CreateGraph => Some(Self::CreateGraphRsp),
            Self::DestroyGraph => Some(Self::DestroyGraphRsp),
            Self::SetGraph => Some(Self::SetGraphRsp),
            Self::Invoke => Some(Self::InvokeRsp),
            Self::PowerDown => Some(Self::PowerDownAck),
            _ => None,
        }
    }

    /// Whether the message travels on the urgent rings.
    #[must_use]
    pub const fn is_urgent(self) -> bool {
        matches!(self, Self::PowerDown | Self::PowerDownAck)
    }

    /// Protocol name, for logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Deinit => "DEINIT",
            Self::CreateGraph => "CREATE_GRAPH",
            Self::DestroyGraph => "DESTROY_GRAPH",
            Self::SetGraph => "SET_GRAPH",
            Self::Invoke => "INVOKE",
            Self::PowerDown => "POWER_DOWN",
            Self::InitRsp => "INIT_RSP",
            Self::DeinitRsp => "DEINIT_RSP",
            Self::CreateGraphRsp => "CREATE_GRAPH_RSP",
            Self::DestroyGraphRsp => "DESTROY_GRAPH_RSP",
            Self::SetGraphRsp => "SET_GRAPH_RSP",
            Self::InvokeRsp => "INVOKE_RSP",
            Self::PowerDownAck => "POWER_DOWN_ACK",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// INIT: memory the firmware may use for its log ring and heap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InitPayload {
    /// Device address of the firmware log buffer.
    pub log_addr: u64,
    /// Size of the log buffer in bytes.
    pub log_size: u32,
    /// Device address of the firmware heap.
    pub heap_addr: u64,
    /// Size of the heap in bytes.
    pub heap_size: u32,
}

/// CREATE_GRAPH.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreateGraphPayload {
    /// Graph id (graph table slot).
    pub gid: u32,
    /// Scheduling priority.
    pub priority: u32,
    /// Graph flags.
    pub flags: u32,
}

/// DESTROY_GRAPH.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DestroyGraphPayload {
    /// Graph id.
    pub gid: u32,
}

/// Image geometry of one graph input or output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Geometry {
    /// Pixel format code.
    pub format: u32,
    /// Plane count.
    pub planes: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

/// A device memory region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapDesc {
    /// Device address.
    pub addr: u64,
    /// Size in bytes.
    pub size: u32,
}

/// SET_GRAPH: per-direction geometry plus scratch heap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetGraphPayload {
    /// Graph id.
    pub gid: u32,
    /// Meaningful entries in `inputs`.
    pub num_inputs: u32,
    /// Meaningful entries in `outputs`.
    pub num_outputs: u32,
    /// Input geometry.
    pub inputs: [Geometry; MAX_IO_BUFFERS],
    /// Output geometry.
    pub outputs: [Geometry; MAX_IO_BUFFERS],
    /// Scratch memory the graph may use while running.
    pub scratch: HeapDesc,
}

/// Device address and size of one buffer handed to INVOKE.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferAddr {
    /// Device address.
    pub addr: u64,
    /// Size in bytes.
    pub size: u32,
}

/// INVOKE: the buffers of one run plus user parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvokePayload {
    /// Graph id.
    pub gid: u32,
    /// Invoke flags (see [`invoke_flags`]).
    pub flags: u32,
    /// Meaningful entries in `inputs`.
    pub num_inputs: u32,
    /// Meaningful entries in `outputs`.
    pub num_outputs: u32,
    /// Input buffers.
    pub inputs: [BufferAddr; MAX_IO_BUFFERS],
    /// Output buffers.
    pub outputs: [BufferAddr; MAX_IO_BUFFERS],
    /// User parameters (valid when [`invoke_flags::UPDATE_PARAM`] is set).
    pub user_params: [u32; MAX_USER_PARAMS],
}

/// Flags carried by [`InvokePayload::flags`].
pub mod invoke_flags {
    /// `user_params` changed since the previous invoke.
    pub const UPDATE_PARAM: u32 = 1 << 0;
}

/// Generic reply: graph id and status code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResponsePayload {
    /// Graph id the command concerned (0 for device-wide commands).
    pub gid: u32,
    /// Status code, see [`crate::status`].
    pub status: i32,
}

/// INVOKE_RSP.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvokeResponsePayload {
    /// Graph id.
    pub gid: u32,
    /// Status code, see [`crate::status`].
    pub status: i32,
    /// Firmware-side execution time in microseconds.
    pub exec_us: u64,
}

/// The payload union.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// INIT.
    Init(InitPayload),
    /// DEINIT and POWER_DOWN carry nothing.
    Empty,
    /// CREATE_GRAPH.
    CreateGraph(CreateGraphPayload),
    /// DESTROY_GRAPH.
    DestroyGraph(DestroyGraphPayload),
    /// SET_GRAPH.
    SetGraph(Box<SetGraphPayload>),
    /// INVOKE.
    Invoke(Box<InvokePayload>),
    /// Every reply except INVOKE_RSP.
    Response(ResponsePayload),
    /// INVOKE_RSP.
    InvokeResponse(InvokeResponsePayload),
}

/// One mailbox message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Transaction id.
    pub trid: u32,
    /// Message type.
    pub kind: MessageType,
    /// Payload; must match `kind`.
    pub payload: Payload,
}

impl Message {
    /// Build a message.
    #[must_use]
    pub const fn new(trid: u32, kind: MessageType, payload: Payload) -> Self {
        Self {
            trid,
            kind,
            payload,
        }
    }

    /// Build the reply to this request with the same transaction id.
    ///
    /// Returns `None` if this message is itself a reply.
    #[must_use]
    pub fn reply(&self, payload: Payload) -> Option<Self> {
        self.kind.response().map(|kind| Self::new(self.trid, kind, payload))
    }

    /// Whether `payload` is the variant `kind` requires.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        use MessageType as T;
        matches!(
            (self.kind, &self.payload),
            (T::Init, Payload::Init(_))
                | (T::Deinit | T::PowerDown, Payload::Empty)
                | (T::CreateGraph, Payload::CreateGraph(_))
                | (T::DestroyGraph, Payload::DestroyGraph(_))
                | (T::SetGraph, Payload::SetGraph(_))
                | (T::Invoke, Payload::Invoke(_))
                | (T::InvokeRsp, Payload::InvokeResponse(_))
                | (
                    T::InitRsp
                        | T::DeinitRsp
                        | T::CreateGraphRsp
                        | T::DestroyGraphRsp
                        | T::SetGraphRsp
                        | T::PowerDownAck,
                    Payload::Response(_)
                )
        )
    }

    /// Graph id named by the payload, if any.
    #[must_use]
    pub fn gid(&self) -> Option<u32> {
        match &self.payload {
            Payload::CreateGraph(p) => Some(p.gid),
            Payload::DestroyGraph(p) => Some(p.gid),
            Payload::SetGraph(p) => Some(p.gid),
            Payload::Invoke(p) => Some(p.gid),
            Payload::Response(p) => Some(p.gid),
            Payload::InvokeResponse(p) => Some(p.gid),
            Payload::Init(_) | Payload::Empty => None,
        }
    }

    /// Status code of a reply; `None` for requests.
    #[must_use]
    pub fn status(&self) -> Option<i32> {
        match &self.payload {
            Payload::Response(p) => Some(p.status),
            Payload::InvokeResponse(p) => Some(p.status),
            _ => None,
        }
    }
}
