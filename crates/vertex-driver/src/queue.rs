// SPDX-License-Identifier: AGPL-3.0-only

//! Client buffer queue
//!
//! One [`VertexQueue`] per client context, with an input and an output side.
//! A submitted [`Bundle`] walks
//!
//! ```text
//! Dequeued ──enqueue──▶ Queued ──paired──▶ Process ──complete──▶ Done ──dequeue──▶ Dequeued
//! ```
//!
//! Pairing takes the oldest Queued bundle of each side and hands both to the
//! graph ([`QueueOps::queue`]), which turns them into one task. Results come
//! back through [`BundleSink::complete`] from whichever thread finished the
//! task. Bundle slots are created on first use, keep their buffer mappings
//! while the client resubmits the same handles, and are released when the
//! stream stops.
//!
//! Lock order: the queue lock may be held while calling into the graph, never
//! the other way round. [`VertexQueue::streamoff`] releases the queue lock
//! before stopping the graph because stopping cancels tasks, and cancellation
//! completes bundles through the sink.

use crate::config::VertexConfig;
use crate::error::{Result, VertexError};
use crate::format::FormatList;
use crate::memory::{MappedBuffer, MemHandle, MemoryMapper};
use crate::task::{Timestamps, TIME_POINTS};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use vertex_chip::limits::MAX_IO_BUFFERS;
use vertex_chip::message::{BufferAddr, MessageType};

/// Side of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Buffers read by the graph
    Input,
    /// Buffers written by the graph
    Output,
}

impl Direction {
    /// Both sides, input first
    pub const ALL: [Direction; 2] = [Self::Input, Self::Output];

    /// Array slot of this side
    pub const fn index(self) -> usize {
        match self {
            Self::Input => 0,
            Self::Output => 1,
        }
    }

    /// The other side
    pub const fn opposite(self) -> Self {
        match self {
            Self::Input => Self::Output,
            Self::Output => Self::Input,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
        }
    }
}

/// Region of interest inside a buffer, in pixels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Roi {
    /// Left edge
    pub x: u32,
    /// Top edge
    pub y: u32,
    /// Width (0 means the full width)
    pub width: u32,
    /// Height (0 means the full height)
    pub height: u32,
}

/// One client buffer (one plane)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    /// Client memory handle
    pub handle: MemHandle,
    /// Region the graph should work on
    pub roi: Roi,
}

/// Buffers for one format entry, one per plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDesc {
    /// Format target this container feeds
    pub target: u32,
    /// Plane buffers
    pub buffers: Vec<BufferDesc>,
}

/// What the client hands to [`VertexQueue::enqueue`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleSubmit {
    /// Client-chosen id, returned on dequeue
    pub id: u32,
    /// Bundle slot
    pub index: u32,
    /// One container per format entry, in format order
    pub containers: Vec<ContainerDesc>,
}

/// Bundle lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleState {
    /// Owned by the client
    Dequeued,
    /// Waiting for a partner on the other side
    Queued,
    /// Attached to a graph task
    Process,
    /// Result ready for dequeue
    Done,
}

impl std::fmt::Display for BundleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dequeued => write!(f, "dequeued"),
            Self::Queued => write!(f, "queued"),
            Self::Process => write!(f, "process"),
            Self::Done => write!(f, "done"),
        }
    }
}

/// Result flags reported on dequeue
pub mod bundle_flags {
    /// The bundle went through a task
    pub const DONE: u32 = 1 << 0;
    /// The task failed, timed out or was cancelled; contents are not valid
    pub const INVALID: u32 = 1 << 1;
}

/// Outcome of the task a bundle pair was attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// See [`bundle_flags`]
    pub flags: u32,
    /// Task lifecycle timestamps
    pub timestamps: Timestamps,
    /// Firmware execution time
    pub exec_us: u64,
}

impl Completion {
    /// Successful completion
    pub const fn done(timestamps: Timestamps, exec_us: u64) -> Self {
        Self {
            flags: bundle_flags::DONE,
            timestamps,
            exec_us,
        }
    }

    /// Failed or cancelled completion
    pub const fn invalid(timestamps: Timestamps) -> Self {
        Self {
            flags: bundle_flags::DONE | bundle_flags::INVALID,
            timestamps,
            exec_us: 0,
        }
    }

    /// Whether the task produced valid results
    pub const fn is_valid(&self) -> bool {
        self.flags & bundle_flags::INVALID == 0
    }
}

/// A finished bundle handed back to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DequeuedBundle {
    /// Side it was queued on
    pub direction: Direction,
    /// Client id from the submission
    pub id: u32,
    /// Bundle slot
    pub index: u32,
    /// See [`bundle_flags`]
    pub flags: u32,
    /// Task lifecycle timestamps
    pub timestamps: Timestamps,
    /// Firmware execution time
    pub exec_us: u64,
    /// The containers most recently queued at this slot
    pub containers: Vec<ContainerDesc>,
}

/// Device addresses of one paired input and output bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokeBuffers {
    /// Input bundle slot
    pub input: u32,
    /// Output bundle slot
    pub output: u32,
    /// Input plane buffers, flattened in container order
    pub inputs: Vec<BufferAddr>,
    /// Output plane buffers, flattened in container order
    pub outputs: Vec<BufferAddr>,
}

/// Operations the queue drives on its graph
pub trait QueueOps: Debug + Send + Sync {
    /// Stream is starting
    ///
    /// # Errors
    ///
    /// Returns error if the graph cannot be scheduled.
    fn start(&self) -> Result<()>;

    /// Stream is stopping; cancel pending work and wait out dispatched work
    ///
    /// # Errors
    ///
    /// Returns error if dispatched work did not drain.
    fn stop(&self) -> Result<()>;

    /// Turn a paired bundle set into a task
    ///
    /// # Errors
    ///
    /// Returns error if no task or scheduler descriptor is free, or the
    /// graph is not started.
    fn queue(&self, buffers: InvokeBuffers) -> Result<()>;

    /// A bundle was dequeued; returns the task index that produced it
    fn deque(&self, direction: Direction, index: u32) -> Option<u32>;
}

/// Receives task results for bundle pairs
pub trait BundleSink: Debug + Send + Sync {
    /// The task attached to `(input, output)` finished
    fn complete(&self, input: u32, output: u32, completion: Completion);
}

/// Bundle counts across both sides
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    /// Waiting for a partner
    pub queued: usize,
    /// Attached to a task
    pub process: usize,
    /// Waiting for dequeue
    pub done: usize,
}

impl QueueCounts {
    /// Bundles not owned by the client
    pub const fn active(&self) -> usize {
        self.queued + self.process + self.done
    }
}

#[derive(Debug)]
struct Bundle {
    id: u32,
    state: BundleState,
    submitted: Vec<ContainerDesc>,
    mapped: Vec<Vec<MappedBuffer>>,
    flags: u32,
    timestamps: Timestamps,
    exec_us: u64,
}

impl Bundle {
    fn addresses(&self) -> Vec<BufferAddr> {
        self.mapped
            .iter()
            .flatten()
            // mappings are sized from a Format, whose planes fit in u32
            .map(|m| BufferAddr {
                addr: m.dvaddr,
                size: u32::try_from(m.size).unwrap_or(u32::MAX),
            })
            .collect()
    }
}

#[derive(Debug)]
struct Side {
    format: Option<FormatList>,
    bundles: Vec<Option<Bundle>>,
    queued: VecDeque<u32>,
    done: VecDeque<u32>,
}

impl Side {
    fn new(slots: usize) -> Self {
        Self {
            format: None,
            bundles: (0..slots).map(|_| None).collect(),
            queued: VecDeque::new(),
            done: VecDeque::new(),
        }
    }

    fn count(&self, state: BundleState) -> usize {
        self.bundles
            .iter()
            .flatten()
            .filter(|b| b.state == state)
            .count()
    }
}

#[derive(Debug)]
struct QueueState {
    streaming: bool,
    interrupted: bool,
    sides: [Side; 2],
}

impl QueueState {
    fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for side in &self.sides {
            counts.queued += side.count(BundleState::Queued);
            counts.process += side.count(BundleState::Process);
            counts.done += side.count(BundleState::Done);
        }
        counts
    }
}

#[derive(Debug)]
struct QueueShared {
    state: Mutex<QueueState>,
    done: Condvar,
    ops: Arc<dyn QueueOps>,
    mapper: Arc<dyn MemoryMapper>,
    max_bundles: usize,
    dequeue_timeout: Duration,
}

impl QueueShared {
    fn release_all(&self, state: &mut QueueState) {
        for side in &mut state.sides {
            for bundle in side.bundles.iter_mut().filter_map(Option::take) {
                for mapped in bundle.mapped.iter().flatten() {
                    self.mapper.unmap(mapped);
                }
            }
            side.queued.clear();
            side.done.clear();
        }
    }
}

impl BundleSink for QueueShared {
    fn complete(&self, input: u32, output: u32, completion: Completion) {
        let mut state = self.state.lock();
        for (direction, index) in [(Direction::Input, input), (Direction::Output, output)] {
            let side = &mut state.sides[direction.index()];
            let Some(bundle) = side.bundles.get_mut(index as usize).and_then(Option::as_mut) else {
                warn!("Completion for unknown {direction} bundle {index}");
                continue;
            };
            if bundle.state != BundleState::Process {
                warn!(
                    "Completion for {direction} bundle {index} in state {}",
                    bundle.state
                );
                continue;
            }
            bundle.state = BundleState::Done;
            bundle.flags = completion.flags;
            bundle.timestamps = completion.timestamps;
            bundle.exec_us = completion.exec_us;
            side.done.push_back(index);
        }
        drop(state);
        self.done.notify_all();
    }
}

impl Drop for QueueShared {
    fn drop(&mut self) {
        let mut state = std::mem::replace(
            self.state.get_mut(),
            QueueState {
                streaming: false,
                interrupted: true,
                sides: [Side::new(0), Side::new(0)],
            },
        );
        self.release_all(&mut state);
    }
}

/// Input and output bundle queues of one client
#[derive(Debug)]
pub struct VertexQueue {
    shared: Arc<QueueShared>,
}

impl VertexQueue {
    /// Create an empty, stopped queue driving `ops`
    pub fn new(ops: Arc<dyn QueueOps>, mapper: Arc<dyn MemoryMapper>, config: &VertexConfig) -> Self {
        let slots = config.max_bundles;
        Self {
            shared: Arc::new(QueueShared {
                state: Mutex::new(QueueState {
                    streaming: false,
                    interrupted: false,
                    sides: [Side::new(slots), Side::new(slots)],
                }),
                done: Condvar::new(),
                ops,
                mapper,
                max_bundles: slots,
                dequeue_timeout: config.dequeue_timeout,
            }),
        }
    }

    /// Result sink for the graph
    pub fn sink(&self) -> Arc<dyn BundleSink> {
        Arc::clone(&self.shared) as Arc<dyn BundleSink>
    }

    /// Whether the stream is on
    pub fn is_streaming(&self) -> bool {
        self.shared.state.lock().streaming
    }

    /// Bundle counts
    pub fn counts(&self) -> QueueCounts {
        self.shared.state.lock().counts()
    }

    /// Current format of one side
    pub fn format(&self, direction: Direction) -> Option<FormatList> {
        self.shared.state.lock().sides[direction.index()].format.clone()
    }

    /// Set the format of one side.
    ///
    /// Only while stopped. Existing bundle slots of that side are released,
    /// since their mappings were sized for the old format.
    ///
    /// # Errors
    ///
    /// Returns error if the stream is on or bundles are still active.
    pub fn set_format(&self, direction: Direction, format: FormatList) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.streaming {
            return Err(VertexError::invalid_state("cannot change format while streaming"));
        }
        let counts = state.counts();
        if counts.active() > 0 {
            return Err(VertexError::Busy {
                queued: counts.queued,
                process: counts.process,
                done: counts.done,
            });
        }
        let side = &mut state.sides[direction.index()];
        for bundle in side.bundles.iter_mut().filter_map(Option::take) {
            for mapped in bundle.mapped.iter().flatten() {
                self.shared.mapper.unmap(mapped);
            }
        }
        debug!("{direction} format: {} entr(ies)", format.len());
        side.format = Some(format);
        Ok(())
    }

    /// Submit a bundle.
    ///
    /// # Errors
    ///
    /// Returns error if the stream is off, the submission does not match
    /// the format, the slot is still in use, mapping fails, or the graph
    /// cannot take the paired task.
    pub fn enqueue(&self, direction: Direction, submit: BundleSubmit) -> Result<()> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        if !state.streaming {
            return Err(VertexError::invalid_state("queue is not streaming"));
        }
        let index = submit.index;
        if index as usize >= shared.max_bundles {
            return Err(VertexError::invalid_argument(format!(
                "{direction} bundle index {index} out of range (max {})",
                shared.max_bundles
            )));
        }
        let side = &mut state.sides[direction.index()];
        let format = side
            .format
            .as_ref()
            .ok_or_else(|| VertexError::invalid_state(format!("{direction} format not set")))?;
        validate(direction, &submit, format)?;

        let slot = &mut side.bundles[index as usize];
        if let Some(existing) = slot.as_ref() {
            if existing.state != BundleState::Dequeued {
                return Err(VertexError::invalid_state(format!(
                    "{direction} bundle {index} is {}",
                    existing.state
                )));
            }
        }
        let previous = slot.take().map(|b| b.mapped).unwrap_or_default();
        let mapped = map_containers(shared.mapper.as_ref(), &submit, format, previous)?;

        *slot = Some(Bundle {
            id: submit.id,
            state: BundleState::Queued,
            submitted: submit.containers,
            mapped,
            flags: 0,
            timestamps: [None; TIME_POINTS],
            exec_us: 0,
        });
        side.queued.push_back(index);
        debug!("Queued {direction} bundle {index} (id {})", submit.id);

        self.pair(&mut state, direction)
    }

    fn pair(&self, state: &mut QueueState, submitted: Direction) -> Result<()> {
        let (Some(&input), Some(&output)) = (
            state.sides[Direction::Input.index()].queued.front(),
            state.sides[Direction::Output.index()].queued.front(),
        ) else {
            return Ok(());
        };
        let mut buffers = InvokeBuffers {
            input,
            output,
            inputs: Vec::new(),
            outputs: Vec::new(),
        };
        for (direction, index) in [(Direction::Input, input), (Direction::Output, output)] {
            let side = &mut state.sides[direction.index()];
            side.queued.pop_front();
            if let Some(bundle) = side.bundles[index as usize].as_mut() {
                bundle.state = BundleState::Process;
                match direction {
                    Direction::Input => buffers.inputs = bundle.addresses(),
                    Direction::Output => buffers.outputs = bundle.addresses(),
                }
            }
        }

        if let Err(e) = self.shared.ops.queue(buffers) {
            warn!("Graph refused bundle pair ({input}, {output}): {e}");
            let (reverted, partner) = match submitted {
                Direction::Input => (input, output),
                Direction::Output => (output, input),
            };
            if let Some(b) = state.sides[submitted.index()].bundles[reverted as usize].as_mut() {
                b.state = BundleState::Dequeued;
            }
            let other = &mut state.sides[submitted.opposite().index()];
            if let Some(b) = other.bundles[partner as usize].as_mut() {
                b.state = BundleState::Queued;
            }
            other.queued.push_front(partner);
            return Err(e);
        }
        Ok(())
    }

    /// Take the oldest finished bundle of one side.
    ///
    /// Blocks up to the dequeue timeout.
    ///
    /// # Errors
    ///
    /// [`VertexError::Interrupted`] if the stream stops (or the queue is
    /// interrupted) while nothing is done, [`VertexError::Timeout`] if
    /// nothing finishes in time.
    pub fn dequeue(&self, direction: Direction) -> Result<DequeuedBundle> {
        let shared = &self.shared;
        let deadline = Instant::now() + shared.dequeue_timeout;
        let mut state = shared.state.lock();
        loop {
            let side = &mut state.sides[direction.index()];
            if let Some(index) = side.done.pop_front() {
                let Some(bundle) = side.bundles[index as usize].as_mut() else {
                    warn!("Done list names empty {direction} slot {index}");
                    continue;
                };
                bundle.state = BundleState::Dequeued;
                let out = DequeuedBundle {
                    direction,
                    id: bundle.id,
                    index,
                    flags: bundle.flags,
                    timestamps: bundle.timestamps,
                    exec_us: bundle.exec_us,
                    containers: bundle.submitted.clone(),
                };
                let task = shared.ops.deque(direction, index);
                debug!(
                    "Dequeued {direction} bundle {index} (id {}, flags {:#x}, task {task:?})",
                    out.id, out.flags
                );
                return Ok(out);
            }
            if state.interrupted || !state.streaming {
                return Err(VertexError::Interrupted);
            }
            if shared.done.wait_until(&mut state, deadline).timed_out()
                && state.sides[direction.index()].done.is_empty()
            {
                return Err(VertexError::Timeout {
                    command: MessageType::Invoke,
                    duration_ms: u64::try_from(shared.dequeue_timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
        }
    }

    /// Start streaming.
    ///
    /// # Errors
    ///
    /// Returns error if already streaming, a format is missing, or the
    /// graph cannot start.
    pub fn streamon(&self) -> Result<()> {
        {
            let state = self.shared.state.lock();
            if state.streaming {
                return Err(VertexError::invalid_state("already streaming"));
            }
            for direction in Direction::ALL {
                if state.sides[direction.index()].format.is_none() {
                    return Err(VertexError::invalid_state(format!("{direction} format not set")));
                }
            }
        }
        self.shared.ops.start()?;
        let mut state = self.shared.state.lock();
        state.streaming = true;
        state.interrupted = false;
        info!("Stream on");
        Ok(())
    }

    /// Stop streaming.
    ///
    /// Stops the graph (pending tasks are cancelled, dispatched ones are
    /// waited out), marks bundles still waiting for a partner as invalid,
    /// then requires every bundle to be back with the client before the
    /// mappings are released.
    ///
    /// # Errors
    ///
    /// [`VertexError::Busy`] while bundles remain to be dequeued; dequeue
    /// them and call again.
    pub fn streamoff(&self) -> Result<()> {
        let was_streaming = {
            let mut state = self.shared.state.lock();
            std::mem::replace(&mut state.streaming, false)
        };
        self.shared.done.notify_all();

        if was_streaming {
            self.shared.ops.stop()?;
        }

        let mut state = self.shared.state.lock();
        let mut unpaired = 0;
        for side in &mut state.sides {
            while let Some(index) = side.queued.pop_front() {
                if let Some(b) = side.bundles[index as usize].as_mut() {
                    b.state = BundleState::Done;
                    b.flags = bundle_flags::DONE | bundle_flags::INVALID;
                    side.done.push_back(index);
                    unpaired += 1;
                }
            }
        }
        let counts = state.counts();
        if unpaired > 0 || counts.active() > 0 {
            drop(state);
            self.shared.done.notify_all();
            warn!(
                "Stream off refused: {unpaired} unpaired, {} in process, {} done",
                counts.process, counts.done
            );
            return Err(VertexError::Busy {
                queued: unpaired,
                process: counts.process,
                done: counts.done,
            });
        }
        self.shared.release_all(&mut state);
        if was_streaming {
            info!("Stream off");
        }
        Ok(())
    }

    /// Wake every blocked dequeue with [`VertexError::Interrupted`]
    pub fn interrupt(&self) {
        self.shared.state.lock().interrupted = true;
        self.shared.done.notify_all();
    }
}

fn validate(direction: Direction, submit: &BundleSubmit, format: &FormatList) -> Result<()> {
    if submit.containers.len() != format.len() {
        return Err(VertexError::invalid_argument(format!(
            "{direction} bundle {}: {} container(s) for {} format(s)",
            submit.index,
            submit.containers.len(),
            format.len()
        )));
    }
    let mut planes = 0usize;
    for (container, f) in submit.containers.iter().zip(format.formats()) {
        if container.target != f.spec.target {
            return Err(VertexError::invalid_argument(format!(
                "{direction} container target {} does not match format target {}",
                container.target, f.spec.target
            )));
        }
        if container.buffers.len() != f.spec.planes as usize {
            return Err(VertexError::invalid_argument(format!(
                "{direction} target {}: {} buffer(s) for {} plane(s)",
                container.target,
                container.buffers.len(),
                f.spec.planes
            )));
        }
        for buffer in &container.buffers {
            let roi = buffer.roi;
            let right = u64::from(roi.x) + u64::from(roi.width);
            let bottom = u64::from(roi.y) + u64::from(roi.height);
            if right > u64::from(f.spec.width) || bottom > u64::from(f.spec.height) {
                return Err(VertexError::invalid_argument(format!(
                    "{direction} target {}: roi {roi:?} outside {}x{}",
                    container.target, f.spec.width, f.spec.height
                )));
            }
        }
        planes += container.buffers.len();
    }
    if planes > MAX_IO_BUFFERS {
        return Err(VertexError::invalid_argument(format!(
            "{direction} bundle {}: {planes} plane buffers exceed {MAX_IO_BUFFERS}",
            submit.index
        )));
    }
    Ok(())
}

/// Map every plane, reusing `previous` mappings whose handle and size are
/// unchanged. On failure every mapping made here is undone and the old ones
/// are released too; the slot starts from scratch next time.
fn map_containers(
    mapper: &dyn MemoryMapper,
    submit: &BundleSubmit,
    format: &FormatList,
    previous: Vec<Vec<MappedBuffer>>,
) -> Result<Vec<Vec<MappedBuffer>>> {
    let mut old: Vec<MappedBuffer> = previous.into_iter().flatten().collect();
    let mut mapped = Vec::with_capacity(submit.containers.len());
    for (container, f) in submit.containers.iter().zip(format.formats()) {
        let mut planes = Vec::with_capacity(container.buffers.len());
        for (plane, buffer) in container.buffers.iter().enumerate() {
            let size = f.plane_size(plane);
            let reuse = old
                .iter()
                .position(|m| m.handle == buffer.handle && m.size == size);
            let result = match reuse {
                Some(pos) => Ok(old.swap_remove(pos)),
                None => mapper.map(buffer.handle, size),
            };
            match result {
                Ok(m) => planes.push(m),
                Err(e) => {
                    for m in mapped.iter().flatten().chain(&planes).chain(&old) {
                        mapper.unmap(m);
                    }
                    return Err(e);
                }
            }
        }
        mapped.push(planes);
    }
    for stale in &old {
        mapper.unmap(stale);
    }
    Ok(mapped)
}
