// SPDX-License-Identifier: AGPL-3.0-only

//! Client context: one graph with its bundle queues
//!
//! A [`VertexContext`] is what a client holds after opening the device. It
//! owns a [`Graph`] (created on the firmware with CREATE_GRAPH) and the
//! [`VertexQueue`] feeding it, and exposes the client operation set:
//!
//! | Operation | Effect |
//! |-----------|--------|
//! | [`set_graph`](VertexContext::set_graph) | priority (clamped) and flags, before any buffer is queued |
//! | [`set_format`](VertexContext::set_format) | per-direction format list, while stopped |
//! | [`qbuf`](VertexContext::qbuf) / [`dqbuf`](VertexContext::dqbuf) | submit and collect bundles |
//! | [`streamon`](VertexContext::streamon) | SET_GRAPH if formats changed, then schedule |
//! | [`streamoff`](VertexContext::streamoff) | cancel pending work, wait out dispatched work |
//! | [`set_ctrl`](VertexContext::set_ctrl) | diagnostics dump, wake blocked dequeues |
//! | [`set_param`](VertexContext::set_param) | user parameters for the next invoke |

use crate::config::VertexConfig;
use crate::error::{Result, VertexError};
use crate::format::{FormatList, FormatSpec};
use crate::graph::{Graph, GraphStats};
use crate::graphmgr::GraphManager;
use crate::interface::{Diagnostics, Interface};
use crate::memory::{MappedBuffer, MemHandle, MemoryMapper};
use crate::queue::{BundleSubmit, DequeuedBundle, Direction, QueueCounts, QueueOps, VertexQueue};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};
use vertex_chip::limits::{MAX_IO_BUFFERS, MAX_USER_PARAMS};
use vertex_chip::message::{
    CreateGraphPayload, DestroyGraphPayload, HeapDesc, MessageType, Payload, SetGraphPayload,
};

/// Driver-owned scratch regions use handles from the top of the range
const SCRATCH_HANDLE_BASE: i32 = i32::MAX - 1024;

/// Context controls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Capture a diagnostic dump
    Dump,
    /// Wake every blocked dequeue
    Interrupt,
}

/// What a control produced
#[derive(Debug, Clone)]
pub enum ControlOutput {
    /// Nothing to report
    None,
    /// The dump taken by [`Control::Dump`]
    Dump(Box<Diagnostics>),
}

#[derive(Debug)]
struct Setup {
    format_dirty: bool,
    scratch: Option<MappedBuffer>,
    closed: bool,
}

/// One client's graph and queues
#[derive(Debug)]
pub struct VertexContext {
    graph: Arc<Graph>,
    queue: VertexQueue,
    interface: Arc<Interface>,
    gmgr: Arc<GraphManager>,
    mapper: Arc<dyn MemoryMapper>,
    setup: Mutex<Setup>,
}

impl VertexContext {
    /// Reserve a graph id and create the graph on the firmware.
    ///
    /// # Errors
    ///
    /// Returns error if every graph id is taken or CREATE_GRAPH fails.
    pub fn open(
        config: &VertexConfig,
        interface: Arc<Interface>,
        gmgr: Arc<GraphManager>,
        mapper: Arc<dyn MemoryMapper>,
    ) -> Result<Self> {
        let gid = gmgr.reserve_id()?;
        let graph = Graph::new(gid, Arc::clone(&gmgr), config);
        let create = CreateGraphPayload {
            gid,
            priority: graph.stats().priority,
            flags: graph.flags(),
        };
        let created =
            interface.process_command(MessageType::CreateGraph, Payload::CreateGraph(create), Some(gid));
        if let Err(e) = created {
            gmgr.release_id(gid);
            return Err(e);
        }
        let queue = VertexQueue::new(
            Arc::clone(&graph) as Arc<dyn QueueOps>,
            Arc::clone(&mapper),
            config,
        );
        graph.attach(&queue.sink());
        info!("Graph {gid} created");
        Ok(Self {
            graph,
            queue,
            interface,
            gmgr,
            mapper,
            setup: Mutex::new(Setup {
                format_dirty: true,
                scratch: None,
                closed: false,
            }),
        })
    }

    /// Graph id
    pub fn id(&self) -> u32 {
        self.graph.id()
    }

    /// Graph counters
    pub fn stats(&self) -> GraphStats {
        self.graph.stats()
    }

    /// Bundle counts
    pub fn queue_counts(&self) -> QueueCounts {
        self.queue.counts()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.setup.lock().closed {
            return Err(VertexError::invalid_state(format!("context {} closed", self.id())));
        }
        Ok(())
    }

    /// Set scheduling priority and flags; returns the applied priority.
    ///
    /// # Errors
    ///
    /// Returns error once any buffer has been queued.
    pub fn set_graph(&self, priority: u32, flags: u32) -> Result<u32> {
        self.ensure_open()?;
        if self.graph.stats().input > 0 || self.queue.counts().active() > 0 {
            return Err(VertexError::invalid_state(format!(
                "graph {}: buffers already queued",
                self.id()
            )));
        }
        let applied = self.graph.set_priority(priority);
        self.graph.set_flags(flags);
        debug!("Graph {}: priority {applied}, flags {flags:#x}", self.id());
        Ok(applied)
    }

    /// Set the format list of one direction.
    ///
    /// # Errors
    ///
    /// Returns error for unknown formats, bad geometry, or while streaming.
    pub fn set_format(&self, direction: Direction, specs: &[FormatSpec]) -> Result<()> {
        self.ensure_open()?;
        let list = FormatList::new(specs)?;
        self.queue.set_format(direction, list)?;
        self.setup.lock().format_dirty = true;
        Ok(())
    }

    /// Submit a bundle.
    ///
    /// # Errors
    ///
    /// See [`VertexQueue::enqueue`].
    pub fn qbuf(&self, direction: Direction, submit: BundleSubmit) -> Result<()> {
        self.queue.enqueue(direction, submit)
    }

    /// Collect the oldest finished bundle of one direction.
    ///
    /// # Errors
    ///
    /// See [`VertexQueue::dequeue`].
    pub fn dqbuf(&self, direction: Direction) -> Result<DequeuedBundle> {
        self.queue.dequeue(direction)
    }

    /// Start streaming, configuring the firmware graph first if the formats
    /// changed since the last SET_GRAPH.
    ///
    /// # Errors
    ///
    /// Returns error if a format is missing, SET_GRAPH fails, or the graph
    /// cannot be scheduled.
    pub fn streamon(&self) -> Result<()> {
        self.ensure_open()?;
        if self.queue.is_streaming() {
            return Err(VertexError::invalid_state("already streaming"));
        }
        let dirty = self.setup.lock().format_dirty;
        if dirty {
            self.configure()?;
            self.setup.lock().format_dirty = false;
        }
        self.queue.streamon()
    }

    fn configure(&self) -> Result<()> {
        let (Some(inputs), Some(outputs)) = (
            self.queue.format(Direction::Input),
            self.queue.format(Direction::Output),
        ) else {
            return Err(VertexError::invalid_state("formats not set"));
        };
        let scratch = self.scratch(&outputs)?;
        let scratch_size = u32::try_from(scratch.size).map_err(|_| {
            VertexError::invalid_argument(format!(
                "graph {}: {} byte scratch heap is too large",
                self.id(),
                scratch.size
            ))
        })?;
        let payload = SetGraphPayload {
            gid: self.id(),
            num_inputs: count(&inputs),
            num_outputs: count(&outputs),
            inputs: inputs.geometry(),
            outputs: outputs.geometry(),
            scratch: HeapDesc {
                addr: scratch.dvaddr,
                size: scratch_size,
            },
        };
        self.interface.process_command(
            MessageType::SetGraph,
            Payload::SetGraph(Box::new(payload)),
            Some(self.id()),
        )?;
        info!(
            "Graph {} configured: {} input(s), {} output(s)",
            self.id(),
            inputs.len(),
            outputs.len()
        );
        Ok(())
    }

    /// Scratch heap sized to the output formats, remapped when that changes
    fn scratch(&self, outputs: &FormatList) -> Result<MappedBuffer> {
        let size = outputs
            .formats()
            .iter()
            .map(crate::format::Format::total_size)
            .sum::<usize>()
            .max(1);
        let mut setup = self.setup.lock();
        if let Some(existing) = setup.scratch {
            if existing.size == size {
                return Ok(existing);
            }
            self.mapper.unmap(&existing);
            setup.scratch = None;
        }
        let handle = MemHandle(SCRATCH_HANDLE_BASE + i32::try_from(self.id()).unwrap_or(0));
        let mapped = self.mapper.map(handle, size)?;
        setup.scratch = Some(mapped);
        Ok(mapped)
    }

    /// Stop streaming.
    ///
    /// # Errors
    ///
    /// [`VertexError::Busy`] while finished bundles wait to be dequeued.
    pub fn streamoff(&self) -> Result<()> {
        self.queue.streamoff()
    }

    /// Apply a control.
    ///
    /// # Errors
    ///
    /// Returns error if the context is closed.
    pub fn set_ctrl(&self, control: Control) -> Result<ControlOutput> {
        self.ensure_open()?;
        match control {
            Control::Dump => {
                let dump = self
                    .interface
                    .dump_diagnostics(&format!("CTRL_DUMP from graph {}", self.id()));
                Ok(ControlOutput::Dump(Box::new(dump)))
            }
            Control::Interrupt => {
                self.queue.interrupt();
                Ok(ControlOutput::None)
            }
        }
    }

    /// Store user parameters; the next dispatched invoke carries them.
    ///
    /// # Errors
    ///
    /// Returns error if the context is closed.
    pub fn set_param(&self, params: [u32; MAX_USER_PARAMS]) -> Result<()> {
        self.ensure_open()?;
        self.graph.set_params(params);
        Ok(())
    }

    /// Stop, destroy the firmware graph and release the id.
    ///
    /// # Errors
    ///
    /// Returns error if DESTROY_GRAPH fails; local resources are released
    /// regardless.
    pub fn close(self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&self) -> Result<()> {
        let scratch = {
            let mut setup = self.setup.lock();
            if setup.closed {
                return Ok(());
            }
            setup.closed = true;
            setup.scratch.take()
        };
        let gid = self.id();
        self.queue.interrupt();
        if let Err(e) = self.queue.streamoff() {
            warn!("Graph {gid}: closing with bundles outstanding ({e})");
        }
        let destroyed = self.interface.process_command(
            MessageType::DestroyGraph,
            Payload::DestroyGraph(DestroyGraphPayload { gid }),
            Some(gid),
        );
        if let Some(scratch) = scratch {
            self.mapper.unmap(&scratch);
        }
        self.gmgr.release_id(gid);
        info!("Graph {gid} destroyed");
        destroyed.map(|_| ())
    }
}

impl Drop for VertexContext {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("Graph {}: close failed: {e}", self.id());
        }
    }
}

fn count(list: &FormatList) -> u32 {
    u32::try_from(list.len().min(MAX_IO_BUFFERS)).unwrap_or(0)
}
