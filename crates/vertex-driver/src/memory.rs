// SPDX-License-Identifier: AGPL-3.0-only

//! Client buffer mapping boundary
//!
//! The driver core never touches client memory. It hands each buffer handle
//! to a [`MemoryMapper`] once, keeps the returned device address for as long
//! as the bundle slot keeps the same handle, and unmaps when the stream
//! stops. IOMMU programming lives behind the trait.

use crate::error::{Result, VertexError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use tracing::{debug, warn};

/// Opaque client memory handle (a dma-buf descriptor on real systems)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemHandle(pub i32);

/// A handle mapped into the device address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedBuffer {
    /// Client handle
    pub handle: MemHandle,
    /// Device-visible address
    pub dvaddr: u64,
    /// Mapped length in bytes
    pub size: usize,
}

/// Maps client buffers for the remote engine
pub trait MemoryMapper: Debug + Send + Sync {
    /// Map `size` bytes of `handle`
    ///
    /// # Errors
    ///
    /// Returns error if the handle is invalid or the address space is full.
    fn map(&self, handle: MemHandle, size: usize) -> Result<MappedBuffer>;

    /// Release a mapping made by [`MemoryMapper::map`]
    fn unmap(&self, mapped: &MappedBuffer);
}

const HOST_DVA_BASE: u64 = 0x1000_0000;
const HOST_PAGE: u64 = 4096;

/// Host-side mapper handing out synthetic page-aligned device addresses
#[derive(Debug)]
pub struct HostMapper {
    state: Mutex<HostMapState>,
}

#[derive(Debug)]
struct HostMapState {
    next: u64,
    live: HashMap<u64, MappedBuffer>,
}

impl HostMapper {
    /// Create an empty mapper
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HostMapState {
                next: HOST_DVA_BASE,
                live: HashMap::new(),
            }),
        }
    }

    /// Mappings not yet released
    pub fn live_mappings(&self) -> usize {
        self.state.lock().live.len()
    }
}

impl Default for HostMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMapper for HostMapper {
    fn map(&self, handle: MemHandle, size: usize) -> Result<MappedBuffer> {
        if handle.0 < 0 {
            return Err(VertexError::invalid_argument(format!(
                "invalid memory handle {}",
                handle.0
            )));
        }
        if size == 0 {
            return Err(VertexError::invalid_argument("zero-sized buffer"));
        }
        let mut state = self.state.lock();
        let dvaddr = state.next;
        let span = (size as u64).div_ceil(HOST_PAGE) * HOST_PAGE;
        state.next = state
            .next
            .checked_add(span)
            .ok_or(VertexError::exhausted("device address space"))?;
        let mapped = MappedBuffer {
            handle,
            dvaddr,
            size,
        };
        state.live.insert(dvaddr, mapped);
        debug!("Mapped handle {} ({size} B) at {dvaddr:#x}", handle.0);
        Ok(mapped)
    }

    fn unmap(&self, mapped: &MappedBuffer) {
        if self.state.lock().live.remove(&mapped.dvaddr).is_none() {
            warn!("Unmap of unknown device address {:#x}", mapped.dvaddr);
        }
    }
}
