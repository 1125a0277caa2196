// SPDX-License-Identifier: AGPL-3.0-only

//! Shared-memory mailbox transport
//!
//! Four independent rings of fixed-size frames (host → firmware and firmware
//! → host, each with a normal and an urgent ring). Each ring keeps wrapping
//! `u32` write and read indices that only ever increase:
//!
//! - empty ⇔ `write == read`
//! - full ⇔ `write - read == capacity`
//! - slot of index `i` ⇔ `i % capacity`
//!
//! Capacities are powers of two so the slot sequence stays continuous when
//! the indices wrap.
//!
//! Order is FIFO within a ring and undefined across rings. Producers publish
//! the write index after the frame is in place (release), consumers publish
//! the read index after the frame is copied out, so each side only ever sees
//! whole frames.

use crate::config::{MailboxConfig, PollConfig};
use crate::error::{Result, VertexError};
use crate::protocol::{self, Frame};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, trace};
use vertex_chip::mailbox::{ChannelId, MESSAGE_SIZE};
use vertex_chip::message::Message;

/// Outcome of a single ring write attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    /// `write - read == capacity`
    Full,
}

/// One ring
#[derive(Debug)]
pub struct MailboxChannel {
    id: ChannelId,
    capacity: u32,
    write: AtomicU32,
    read: AtomicU32,
    slots: Box<[Mutex<Frame>]>,
    producer: Mutex<()>,
    consumer: Mutex<()>,
}

impl MailboxChannel {
    fn new(id: ChannelId, capacity: u32) -> Self {
        Self::starting_at(id, capacity, 0)
    }

    fn starting_at(id: ChannelId, capacity: u32, start: u32) -> Self {
        debug_assert!(capacity.is_power_of_two());
        Self {
            id,
            capacity,
            write: AtomicU32::new(start),
            read: AtomicU32::new(start),
            slots: (0..capacity).map(|_| Mutex::new([0u8; MESSAGE_SIZE])).collect(),
            producer: Mutex::new(()),
            consumer: Mutex::new(()),
        }
    }

    /// Ring id
    pub const fn id(&self) -> ChannelId {
        self.id
    }

    /// Slot count
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Frames waiting to be read
    pub fn len(&self) -> u32 {
        let write = self.write.load(Ordering::Acquire);
        let read = self.read.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }

    /// `write == read`
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `write - read == capacity`
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Free slots
    pub fn free(&self) -> u32 {
        self.capacity.saturating_sub(self.len())
    }

    /// Current `(write, read)` indices
    pub fn indices(&self) -> (u32, u32) {
        (
            self.write.load(Ordering::Acquire),
            self.read.load(Ordering::Acquire),
        )
    }

    /// Append one frame.
    pub fn try_write(&self, frame: &Frame) -> std::result::Result<(), RingError> {
        let _producer = self.producer.lock();
        let write = self.write.load(Ordering::Relaxed);
        let read = self.read.load(Ordering::Acquire);
        if write.wrapping_sub(read) >= self.capacity {
            return Err(RingError::Full);
        }
        self.slots[(write % self.capacity) as usize]
            .lock()
            .copy_from_slice(frame);
        self.write.store(write.wrapping_add(1), Ordering::Release);
        trace!("{}: wrote slot {} (w={}, r={read})", self.id, write % self.capacity, write.wrapping_add(1));
        Ok(())
    }

    /// Take the oldest frame, if any.
    pub fn try_read(&self) -> Option<Frame> {
        let _consumer = self.consumer.lock();
        let read = self.read.load(Ordering::Relaxed);
        let write = self.write.load(Ordering::Acquire);
        if read == write {
            return None;
        }
        let frame = *self.slots[(read % self.capacity) as usize].lock();
        self.read.store(read.wrapping_add(1), Ordering::Release);
        Some(frame)
    }
}

/// Ring indices at one instant, for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSnapshot {
    /// Ring id
    pub id: ChannelId,
    /// Slot count
    pub capacity: u32,
    /// Write index
    pub write: u32,
    /// Read index
    pub read: u32,
}

/// The four rings
#[derive(Debug)]
pub struct Mailbox {
    channels: [MailboxChannel; 4],
}

impl Mailbox {
    /// Allocate the rings.
    ///
    /// # Errors
    ///
    /// Returns error if a capacity is not a power of two.
    pub fn new(config: &MailboxConfig) -> Result<Self> {
        config.validate()?;
        let cap = |id: ChannelId| {
            if id.is_urgent() {
                config.urgent_capacity
            } else {
                config.normal_capacity
            }
        };
        let channels = ChannelId::ALL.map(|id| MailboxChannel::new(id, cap(id)));
        debug!(
            "Mailbox: normal={} urgent={} frame={}B",
            config.normal_capacity, config.urgent_capacity, MESSAGE_SIZE
        );
        Ok(Self { channels })
    }

    /// One ring
    pub fn channel(&self, id: ChannelId) -> &MailboxChannel {
        &self.channels[id.slot()]
    }

    /// Encode and append `msg` once.
    pub fn write(&self, id: ChannelId, msg: &Message) -> Result<()> {
        let frame = protocol::encode(msg)?;
        self.channel(id)
            .try_write(&frame)
            .map_err(|RingError::Full| VertexError::MailboxFull {
                channel: id,
                retries: 0,
            })
    }

    /// Encode and append `msg`, busy-polling while the ring is full.
    pub fn write_polled(&self, id: ChannelId, msg: &Message, poll: &PollConfig) -> Result<()> {
        let frame = protocol::encode(msg)?;
        let channel = self.channel(id);
        poll.run(|| channel.try_write(&frame).ok())
            .ok_or(VertexError::MailboxFull {
                channel: id,
                retries: poll.retries,
            })
    }

    /// Take and decode the oldest frame, if any.
    ///
    /// A frame that fails to decode is consumed and reported as an error.
    pub fn read(&self, id: ChannelId) -> Result<Option<Message>> {
        match self.channel(id).try_read() {
            Some(frame) => protocol::decode(&frame).map(Some),
            None => Ok(None),
        }
    }

    /// Whether any firmware → host ring has frames
    pub fn has_replies(&self) -> bool {
        !self.channel(ChannelId::F2hUrgent).is_empty()
            || !self.channel(ChannelId::F2hNormal).is_empty()
    }

    /// Indices of all rings
    pub fn snapshot(&self) -> [ChannelSnapshot; 4] {
        self.channels.each_ref().map(|c| {
            let (write, read) = c.indices();
            ChannelSnapshot {
                id: c.id,
                capacity: c.capacity,
                write,
                read,
            }
        })
    }
}
