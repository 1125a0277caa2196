// SPDX-License-Identifier: AGPL-3.0-only

//! Wire codec for mailbox messages
//!
//! Every frame is exactly [`MESSAGE_SIZE`] bytes, little-endian:
//!
//! ```text
//! 0      4      8                                               512
//! ┌──────┬──────┬─────────────────────────────────────────────────┐
//! │ trid │ type │ payload (per type, zero padded)                 │
//! └──────┴──────┴─────────────────────────────────────────────────┘
//! ```
//!
//! Array payloads (SET_GRAPH geometry, INVOKE buffers) are always encoded at
//! full length; the count fields say how many entries are meaningful.

use crate::error::{Result, VertexError};
use bytes::{Buf, BufMut, BytesMut};
use vertex_chip::limits::{MAX_IO_BUFFERS, MAX_USER_PARAMS};
use vertex_chip::mailbox::{HEADER_SIZE, MESSAGE_SIZE};
use vertex_chip::message::{
    BufferAddr, CreateGraphPayload, DestroyGraphPayload, Geometry, HeapDesc, InitPayload,
    InvokePayload, InvokeResponsePayload, Message, MessageType, Payload, ResponsePayload,
    SetGraphPayload,
};

/// One encoded message
pub type Frame = [u8; MESSAGE_SIZE];

/// Encode a message into a frame.
///
/// Fails if the payload variant does not belong to the message type.
pub fn encode(msg: &Message) -> Result<Frame> {
    if !msg.is_consistent() {
        return Err(VertexError::protocol(format!(
            "{} cannot carry payload {:?}",
            msg.kind,
            std::mem::discriminant(&msg.payload)
        )));
    }

    let mut buf = BytesMut::with_capacity(MESSAGE_SIZE);
    buf.put_u32_le(msg.trid);
    buf.put_u32_le(msg.kind as u32);

    match &msg.payload {
        Payload::Empty => {}
        Payload::Init(p) => {
            buf.put_u64_le(p.log_addr);
            buf.put_u32_le(p.log_size);
            buf.put_u64_le(p.heap_addr);
            buf.put_u32_le(p.heap_size);
        }
        Payload::CreateGraph(p) => {
            buf.put_u32_le(p.gid);
            buf.put_u32_le(p.priority);
            buf.put_u32_le(p.flags);
        }
        Payload::DestroyGraph(p) => buf.put_u32_le(p.gid),
        Payload::SetGraph(p) => {
            buf.put_u32_le(p.gid);
            buf.put_u32_le(p.num_inputs);
            buf.put_u32_le(p.num_outputs);
            for g in p.inputs.iter().chain(p.outputs.iter()) {
                buf.put_u32_le(g.format);
                buf.put_u32_le(g.planes);
                buf.put_u32_le(g.width);
                buf.put_u32_le(g.height);
            }
            buf.put_u64_le(p.scratch.addr);
            buf.put_u32_le(p.scratch.size);
        }
        Payload::Invoke(p) => {
            buf.put_u32_le(p.gid);
            buf.put_u32_le(p.flags);
            buf.put_u32_le(p.num_inputs);
            buf.put_u32_le(p.num_outputs);
            for b in p.inputs.iter().chain(p.outputs.iter()) {
                buf.put_u64_le(b.addr);
                buf.put_u32_le(b.size);
                buf.put_u32_le(0);
            }
            for w in p.user_params {
                buf.put_u32_le(w);
            }
        }
        Payload::Response(p) => {
            buf.put_u32_le(p.gid);
            buf.put_i32_le(p.status);
        }
        Payload::InvokeResponse(p) => {
            buf.put_u32_le(p.gid);
            buf.put_i32_le(p.status);
            buf.put_u64_le(p.exec_us);
        }
    }

    debug_assert!(buf.len() <= MESSAGE_SIZE);
    buf.resize(MESSAGE_SIZE, 0);
    let mut frame = [0u8; MESSAGE_SIZE];
    frame.copy_from_slice(&buf);
    Ok(frame)
}

/// Decode a frame.
pub fn decode(frame: &Frame) -> Result<Message> {
    let mut buf = &frame[..];
    let trid = buf.get_u32_le();
    let raw_kind = buf.get_u32_le();
    let kind = MessageType::from_u32(raw_kind)
        .ok_or_else(|| VertexError::protocol(format!("unknown message type {raw_kind:#x}")))?;
    debug_assert_eq!(buf.remaining(), MESSAGE_SIZE - HEADER_SIZE);

    let payload = match kind {
        MessageType::Deinit | MessageType::PowerDown => Payload::Empty,
        MessageType::Init => Payload::Init(InitPayload {
            log_addr: buf.get_u64_le(),
            log_size: buf.get_u32_le(),
            heap_addr: buf.get_u64_le(),
            heap_size: buf.get_u32_le(),
        }),
        MessageType::CreateGraph => Payload::CreateGraph(CreateGraphPayload {
            gid: buf.get_u32_le(),
            priority: buf.get_u32_le(),
            flags: buf.get_u32_le(),
        }),
        MessageType::DestroyGraph => Payload::DestroyGraph(DestroyGraphPayload {
            gid: buf.get_u32_le(),
        }),
        MessageType::SetGraph => {
            let gid = buf.get_u32_le();
            let num_inputs = checked_count(buf.get_u32_le(), "SET_GRAPH inputs")?;
            let num_outputs = checked_count(buf.get_u32_le(), "SET_GRAPH outputs")?;
            let mut read_geometry = || Geometry {
                format: buf.get_u32_le(),
                planes: buf.get_u32_le(),
                width: buf.get_u32_le(),
                height: buf.get_u32_le(),
            };
            let inputs: [Geometry; MAX_IO_BUFFERS] = std::array::from_fn(|_| read_geometry());
            let outputs: [Geometry; MAX_IO_BUFFERS] = std::array::from_fn(|_| read_geometry());
            let scratch = HeapDesc {
                addr: buf.get_u64_le(),
                size: buf.get_u32_le(),
            };
            Payload::SetGraph(Box::new(SetGraphPayload {
                gid,
                num_inputs,
                num_outputs,
                inputs,
                outputs,
                scratch,
            }))
        }
        MessageType::Invoke => {
            let gid = buf.get_u32_le();
            let flags = buf.get_u32_le();
            let num_inputs = checked_count(buf.get_u32_le(), "INVOKE inputs")?;
            let num_outputs = checked_count(buf.get_u32_le(), "INVOKE outputs")?;
            let mut read_buffer = || {
                let b = BufferAddr {
                    addr: buf.get_u64_le(),
                    size: buf.get_u32_le(),
                };
                buf.advance(4);
                b
            };
            let inputs: [BufferAddr; MAX_IO_BUFFERS] = std::array::from_fn(|_| read_buffer());
            let outputs: [BufferAddr; MAX_IO_BUFFERS] = std::array::from_fn(|_| read_buffer());
            let user_params: [u32; MAX_USER_PARAMS] = std::array::from_fn(|_| buf.get_u32_le());
            Payload::Invoke(Box::new(InvokePayload {
                gid,
                flags,
                num_inputs,
                num_outputs,
                inputs,
                outputs,
                user_params,
            }))
        }
        MessageType::InvokeRsp => Payload::InvokeResponse(InvokeResponsePayload {
            gid: buf.get_u32_le(),
            status: buf.get_i32_le(),
            exec_us: buf.get_u64_le(),
        }),
        MessageType::InitRsp
        | MessageType::DeinitRsp
        | MessageType::CreateGraphRsp
        | MessageType::DestroyGraphRsp
        | MessageType::SetGraphRsp
        | MessageType::PowerDownAck => Payload::Response(ResponsePayload {
            gid: buf.get_u32_le(),
            status: buf.get_i32_le(),
        }),
    };

    Ok(Message::new(trid, kind, payload))
}

fn checked_count(n: u32, what: &str) -> Result<u32> {
    if n as usize > MAX_IO_BUFFERS {
        return Err(VertexError::protocol(format!(
            "{what}: count {n} exceeds {MAX_IO_BUFFERS}"
        )));
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoke_survives_the_wire() {
        let mut invoke = InvokePayload {
            gid: 4,
            flags: 1,
            num_inputs: 2,
            num_outputs: 1,
            user_params: [7, 8, 9, 10],
            ..InvokePayload::default()
        };
        invoke.inputs[0] = BufferAddr { addr: 0x1_0000_0000, size: 4096 };
        invoke.inputs[1] = BufferAddr { addr: 0x2000, size: 2048 };
        invoke.outputs[0] = BufferAddr { addr: 0x3000, size: 100 };
        let msg = Message::new(11, MessageType::Invoke, Payload::Invoke(Box::new(invoke)));

        let frame = encode(&msg).unwrap();
        assert_eq!(&frame[0..4], &11u32.to_le_bytes());
        assert_eq!(decode(&frame).unwrap(), msg);
    }

    #[test]
    fn negative_status_preserved() {
        let msg = Message::new(
            2,
            MessageType::SetGraphRsp,
            Payload::Response(ResponsePayload {
                gid: 1,
                status: vertex_chip::status::INVALID_PARAM,
            }),
        );
        let back = decode(&encode(&msg).unwrap()).unwrap();
        assert_eq!(back.status(), Some(vertex_chip::status::INVALID_PARAM));
    }

    #[test]
    fn unknown_type_rejected() {
        let mut frame = [0u8; MESSAGE_SIZE];
        frame[4..8].copy_from_slice(&0xbeefu32.to_le_bytes());
        assert!(matches!(decode(&frame), Err(VertexError::Protocol { .. })));
    }

    #[test]
    fn oversized_count_rejected() {
        let msg = Message::new(
            1,
            MessageType::Invoke,
            Payload::Invoke(Box::default()),
        );
        let mut frame = encode(&msg).unwrap();
        frame[16..20].copy_from_slice(&99u32.to_le_bytes());
        assert!(decode(&frame).is_err());
    }

    #[test]
    fn inconsistent_payload_not_encoded() {
        let msg = Message::new(1, MessageType::Init, Payload::Empty);
        assert!(encode(&msg).is_err());
    }
}
