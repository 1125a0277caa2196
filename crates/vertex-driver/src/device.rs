// SPDX-License-Identifier: AGPL-3.0-only

//! Device bring-up and teardown
//!
//! [`VertexDevice`] wires the pipeline together: mailbox, interface, the
//! remote engine, and the scheduler. Opening boots the firmware with INIT
//! (log and heap regions mapped through the [`MemoryMapper`]); closing stops
//! the scheduler, sends DEINIT and POWER_DOWN, and releases the regions.

use crate::config::VertexConfig;
use crate::context::VertexContext;
use crate::error::Result;
use crate::firmware::{FirmwareConfig, SoftwareFirmware};
use crate::graphmgr::{Dispatch, GraphManager};
use crate::interface::{Interface, Platform};
use crate::mailbox::Mailbox;
use crate::memory::{HostMapper, MappedBuffer, MemHandle, MemoryMapper};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};
use vertex_chip::message::InitPayload;

const LOG_HANDLE: MemHandle = MemHandle(i32::MAX);
const HEAP_HANDLE: MemHandle = MemHandle(i32::MAX - 1);

/// Firmware log region size
pub const LOG_REGION_SIZE: usize = 64 * 1024;

/// Firmware heap region size
pub const HEAP_REGION_SIZE: usize = 1024 * 1024;

/// An opened vertex engine
#[derive(Debug)]
pub struct VertexDevice {
    config: VertexConfig,
    interface: Arc<Interface>,
    gmgr: Arc<GraphManager>,
    firmware: Arc<SoftwareFirmware>,
    mapper: Arc<dyn MemoryMapper>,
    regions: Mutex<Option<[MappedBuffer; 2]>>,
}

impl VertexDevice {
    /// Open with the host mapper.
    ///
    /// # Errors
    ///
    /// See [`VertexDevice::open_with_mapper`].
    pub fn open(config: VertexConfig, firmware: &FirmwareConfig) -> Result<Self> {
        Self::open_with_mapper(config, firmware, Arc::new(HostMapper::new()))
    }

    /// Bring the pipeline up and boot the firmware.
    ///
    /// # Errors
    ///
    /// Returns error if a ring capacity is not a power of two, a worker
    /// cannot be spawned, a region cannot be mapped, or INIT fails.
    pub fn open_with_mapper(
        config: VertexConfig,
        firmware: &FirmwareConfig,
        mapper: Arc<dyn MemoryMapper>,
    ) -> Result<Self> {
        debug!("Opening vertex device: {config:?}");
        let mailbox = Arc::new(Mailbox::new(&config.mailbox)?);
        let (reply_tx, reply_rx) = crossbeam_channel::unbounded();
        let interface = Arc::new(Interface::new(&config, Arc::clone(&mailbox), reply_tx));
        let fw = SoftwareFirmware::spawn(firmware, mailbox, interface.irq_line())?;
        interface.open(Arc::clone(&fw) as Arc<dyn Platform>)?;

        let log = mapper.map(LOG_HANDLE, LOG_REGION_SIZE)?;
        let heap = match mapper.map(HEAP_HANDLE, HEAP_REGION_SIZE) {
            Ok(heap) => heap,
            Err(e) => {
                mapper.unmap(&log);
                return Err(e);
            }
        };
        let init = InitPayload {
            log_addr: log.dvaddr,
            log_size: region_len(&log),
            heap_addr: heap.dvaddr,
            heap_size: region_len(&heap),
        };
        if let Err(e) = interface.start(init) {
            mapper.unmap(&heap);
            mapper.unmap(&log);
            let _ = interface.close();
            fw.stop();
            return Err(e);
        }

        let gmgr = Arc::new(GraphManager::new(
            &config,
            Arc::clone(&interface) as Arc<dyn Dispatch>,
            reply_rx,
        ));
        let device = Self {
            config,
            interface,
            gmgr,
            firmware: fw,
            mapper,
            regions: Mutex::new(Some([log, heap])),
        };
        device.gmgr.spawn()?;
        info!("Vertex device open");
        Ok(device)
    }

    /// Create a graph context.
    ///
    /// # Errors
    ///
    /// See [`VertexContext::open`].
    pub fn open_context(&self) -> Result<VertexContext> {
        VertexContext::open(
            &self.config,
            Arc::clone(&self.interface),
            Arc::clone(&self.gmgr),
            Arc::clone(&self.mapper),
        )
    }

    /// Driver configuration
    pub const fn config(&self) -> &VertexConfig {
        &self.config
    }

    /// Firmware transport
    pub const fn interface(&self) -> &Arc<Interface> {
        &self.interface
    }

    /// Cross-graph scheduler
    pub const fn graph_manager(&self) -> &Arc<GraphManager> {
        &self.gmgr
    }

    /// Remote engine
    pub const fn firmware(&self) -> &Arc<SoftwareFirmware> {
        &self.firmware
    }

    /// Buffer mapper
    pub fn mapper(&self) -> &Arc<dyn MemoryMapper> {
        &self.mapper
    }

    /// Stop scheduling and power the firmware down.
    ///
    /// # Errors
    ///
    /// Returns error if DEINIT or POWER_DOWN failed; every resource is
    /// released regardless.
    pub fn close(self) -> Result<()> {
        self.teardown()
    }

    fn teardown(&self) -> Result<()> {
        let Some(regions) = self.regions.lock().take() else {
            return Ok(());
        };
        self.gmgr.shutdown();
        let stopped = self.interface.stop();
        if let Err(e) = self.interface.close() {
            warn!("Interface close failed: {e}");
        }
        self.firmware.stop();
        for region in &regions {
            self.mapper.unmap(region);
        }
        info!("Vertex device closed");
        stopped
    }
}

impl Drop for VertexDevice {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            warn!("Vertex device teardown: {e}");
        }
    }
}

fn region_len(region: &MappedBuffer) -> u32 {
    u32::try_from(region.size).unwrap_or(u32::MAX)
}
