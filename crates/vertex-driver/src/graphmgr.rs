// SPDX-License-Identifier: AGPL-3.0-only

//! Cross-graph scheduler
//!
//! The [`GraphManager`] decides which pending graph task runs next on the
//! single firmware engine. It owns a fixed pool of task descriptors, each
//! binding a `(graph, task)` pair, kept in five ordered lists:
//!
//! ```text
//!  request()          pass step 1            step 2              step 3
//!  Free ──▶ Ready ──(priority insert)──▶ Request ──(drain)──▶ Process ──dispatch ok──▶ Complete
//!   ▲         │                            │                     │                       │
//!   │         └────────── stop_graph ──────┘                     └── dispatch failed ──┐ │
//!   └──────────────────────────────────────────────────────────────────────────────────┴─┴─ reply
//! ```
//!
//! A scheduling pass runs on the manager's worker thread after every event.
//! Ready descriptors are inserted into Request ahead of the first entry with
//! a strictly lower priority, so equal priorities keep their arrival order.
//! The whole Request list then moves to Process in order and is dispatched.
//! A dispatched descriptor sits in Complete until the firmware reply arrives
//! on the reply channel (fed by the interface's reply worker).
//!
//! There is no aging: a graph that keeps higher-priority work queued starves
//! lower-priority graphs for as long as it does so.
//!
//! The table lock is never held across a call into a graph or into the
//! dispatcher.

use crate::config::VertexConfig;
use crate::error::{Result, VertexError};
use crate::task::TaskId;
use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};
use vertex_chip::message::InvokePayload;
use vertex_chip::status;

/// Firmware outcome of one invoke
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvokeResult {
    /// Status code (0 = success)
    pub status: i32,
    /// Firmware execution time
    pub exec_us: u64,
}

impl InvokeResult {
    /// Host gave up waiting
    pub const TIMED_OUT: Self = Self {
        status: status::HOST_TIMEOUT,
        exec_us: 0,
    };

    /// Whether the invoke succeeded
    pub const fn is_ok(&self) -> bool {
        self.status == status::OK
    }
}

/// An invoke reply routed back to the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessReply {
    /// Graph id from the reply payload
    pub gid: u32,
    /// Task the invoke was sent for, generation included
    pub task: TaskId,
    /// Outcome
    pub result: InvokeResult,
}

/// Graph side of scheduling
pub trait ScheduledGraph: Debug + Send + Sync {
    /// Graph id
    fn id(&self) -> u32;

    /// Current scheduling priority
    fn priority(&self) -> u32;

    /// The scheduler picked `task` (Request → Prepare); false if the task moved
    fn request(&self, task: TaskId) -> bool;

    /// Build the invoke for `task` (Prepare → Process)
    ///
    /// # Errors
    ///
    /// Returns error if the task has no buffers or is no longer current.
    fn process(&self, task: TaskId) -> Result<InvokePayload>;

    /// `task` will never run; release it and unblock its buffers
    fn cancel(&self, task: TaskId);

    /// The firmware finished `task`
    fn done(&self, task: TaskId, result: InvokeResult);
}

/// Transport that sends invokes to the firmware
pub trait Dispatch: Debug + Send + Sync {
    /// Send an INVOKE without waiting for the reply
    ///
    /// # Errors
    ///
    /// Returns error if the transport is not started or the ring stays full.
    fn send_process(&self, gid: u32, task: TaskId, payload: InvokePayload) -> Result<()>;
}

/// Descriptor state; each state has its own list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorState {
    /// Unbound
    Free,
    /// Bound, waiting for the next pass
    Ready,
    /// Ordered by priority
    Request,
    /// Being dispatched
    Process,
    /// Dispatched, waiting for the reply
    Complete,
}

impl DescriptorState {
    /// All states in list order
    pub const ALL: [DescriptorState; 5] = [
        Self::Free,
        Self::Ready,
        Self::Request,
        Self::Process,
        Self::Complete,
    ];

    const fn list(self) -> usize {
        match self {
            Self::Free => 0,
            Self::Ready => 1,
            Self::Request => 2,
            Self::Process => 3,
            Self::Complete => 4,
        }
    }
}

impl std::fmt::Display for DescriptorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Free => write!(f, "free"),
            Self::Ready => write!(f, "ready"),
            Self::Request => write!(f, "request"),
            Self::Process => write!(f, "process"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

/// Snapshot of one descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorView {
    /// Pool index
    pub index: u32,
    /// Priority captured when bound
    pub priority: u32,
    /// List it is in
    pub state: DescriptorState,
    /// Bound graph
    pub gid: Option<u32>,
    /// Bound task
    pub task: Option<TaskId>,
}

/// List lengths of the descriptor pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescriptorCounts {
    /// Unbound
    pub free: usize,
    /// Waiting for a pass
    pub ready: usize,
    /// Ordered
    pub request: usize,
    /// Being dispatched
    pub process: usize,
    /// Waiting for replies
    pub complete: usize,
}

impl DescriptorCounts {
    /// Sum of all lists
    pub const fn total(&self) -> usize {
        self.free + self.ready + self.request + self.process + self.complete
    }
}

/// Scheduler counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Invokes handed to the transport
    pub dispatched: u64,
    /// Tasks cancelled (stop or dispatch failure)
    pub canceled: u64,
    /// Replies delivered to graphs
    pub completed: u64,
    /// Replies matching no descriptor
    pub stale: u64,
}

#[derive(Debug)]
enum Event {
    Schedule,
    Shutdown,
}

#[derive(Debug)]
struct Descriptor {
    index: u32,
    priority: u32,
    state: DescriptorState,
    graph: Option<Arc<dyn ScheduledGraph>>,
    task: Option<TaskId>,
}

impl Descriptor {
    fn is_bound_to(&self, gid: u32) -> bool {
        self.graph.as_ref().is_some_and(|g| g.id() == gid)
    }
}

type Binding = (Arc<dyn ScheduledGraph>, TaskId);

#[derive(Debug)]
struct Tables {
    descs: Vec<Descriptor>,
    lists: [VecDeque<u32>; 5],
    graphs: Vec<Option<Arc<dyn ScheduledGraph>>>,
    reserved: Vec<bool>,
}

impl Tables {
    fn move_desc(&mut self, index: u32, from: DescriptorState, to: DescriptorState) -> bool {
        let Some(desc) = self.descs.get(index as usize) else {
            warn!("Descriptor {index} out of range");
            return false;
        };
        if desc.state != from {
            warn!("Descriptor {index} is {} (expected {from}, -> {to})", desc.state);
            return false;
        }
        let list = &mut self.lists[from.list()];
        let Some(pos) = list.iter().position(|&i| i == index) else {
            warn!("Descriptor {index} missing from {from} list");
            return false;
        };
        list.remove(pos);
        self.descs[index as usize].state = to;
        self.lists[to.list()].push_back(index);
        true
    }

    fn unbind(&mut self, index: u32) -> Option<Binding> {
        let desc = &mut self.descs[index as usize];
        desc.priority = 0;
        desc.graph.take().zip(desc.task.take())
    }

    /// Step 1: Ready → Request by descending priority, ties in arrival order.
    fn promote_ready(&mut self) {
        while let Some(index) = self.lists[DescriptorState::Ready.list()].pop_front() {
            let priority = self.descs[index as usize].priority;
            let request = &self.lists[DescriptorState::Request.list()];
            let pos = request
                .iter()
                .position(|&j| self.descs[j as usize].priority < priority);
            self.descs[index as usize].state = DescriptorState::Request;
            let request = &mut self.lists[DescriptorState::Request.list()];
            match pos {
                Some(pos) => request.insert(pos, index),
                None => request.push_back(index),
            }
        }
    }

    /// Step 2: the whole Request list moves to Process, order kept.
    fn drain_request(&mut self) -> Vec<(u32, Binding)> {
        while let Some(index) = self.lists[DescriptorState::Request.list()].pop_front() {
            self.descs[index as usize].state = DescriptorState::Process;
            self.lists[DescriptorState::Process.list()].push_back(index);
        }
        self.lists[DescriptorState::Process.list()]
            .iter()
            .filter_map(|&i| {
                let d = &self.descs[i as usize];
                Some((i, (Arc::clone(d.graph.as_ref()?), d.task?)))
            })
            .collect()
    }

    fn view(&self, index: u32) -> DescriptorView {
        let d = &self.descs[index as usize];
        DescriptorView {
            index: d.index,
            priority: d.priority,
            state: d.state,
            gid: d.graph.as_ref().map(|g| g.id()),
            task: d.task,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    dispatched: AtomicU64,
    canceled: AtomicU64,
    completed: AtomicU64,
    stale: AtomicU64,
}

/// Scheduler shared by every graph of a device
#[derive(Debug)]
pub struct GraphManager {
    tables: Mutex<Tables>,
    pass: Mutex<()>,
    dispatch: Arc<dyn Dispatch>,
    events_tx: Sender<Event>,
    events_rx: Receiver<Event>,
    replies: Receiver<ProcessReply>,
    worker: Mutex<Option<JoinHandle<()>>>,
    counters: Counters,
}

impl GraphManager {
    /// Create a scheduler; call [`GraphManager::spawn`] to start its worker
    pub fn new(
        config: &VertexConfig,
        dispatch: Arc<dyn Dispatch>,
        replies: Receiver<ProcessReply>,
    ) -> Self {
        let n = config.max_descriptors.max(1);
        let descs = (0..n as u32)
            .map(|index| Descriptor {
                index,
                priority: 0,
                state: DescriptorState::Free,
                graph: None,
                task: None,
            })
            .collect();
        let mut free = VecDeque::with_capacity(n);
        free.extend(0..n as u32);
        let (events_tx, events_rx) = bounded(config.event_queue_depth.max(1));
        Self {
            tables: Mutex::new(Tables {
                descs,
                lists: [
                    free,
                    VecDeque::new(),
                    VecDeque::new(),
                    VecDeque::new(),
                    VecDeque::new(),
                ],
                graphs: (0..config.max_graphs).map(|_| None).collect(),
                reserved: vec![false; config.max_graphs],
            }),
            pass: Mutex::new(()),
            dispatch,
            events_tx,
            events_rx,
            replies,
            worker: Mutex::new(None),
            counters: Counters::default(),
        }
    }

    /// Start the scheduling worker.
    ///
    /// # Errors
    ///
    /// Returns error if the thread cannot be spawned.
    pub fn spawn(self: &Arc<Self>) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Err(VertexError::invalid_state("scheduler worker already running"));
        }
        let gmgr = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("vertex-gmgr".into())
            .spawn(move || gmgr.run())?;
        *worker = Some(handle);
        debug!("Scheduler worker started");
        Ok(())
    }

    fn run(&self) {
        let closed = crossbeam_channel::never();
        let mut replies_open = true;
        loop {
            let replies = if replies_open { &self.replies } else { &closed };
            select! {
                recv(self.events_rx) -> event => match event {
                    Ok(Event::Schedule) => self.sched(),
                    Ok(Event::Shutdown) | Err(_) => break,
                },
                recv(replies) -> reply => match reply {
                    Ok(reply) => {
                        self.handle_reply(reply);
                    }
                    Err(_) => {
                        debug!("Reply channel closed");
                        replies_open = false;
                    }
                },
            }
        }
        debug!("Scheduler worker exiting");
    }

    /// Stop the worker and cancel whatever is still bound.
    pub fn shutdown(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = self.events_tx.send(Event::Shutdown);
            if handle.join().is_err() {
                warn!("Scheduler worker panicked");
            }
        }
        let leftovers: Vec<Binding> = {
            let mut tables = self.tables.lock();
            let mut out = Vec::new();
            for state in &DescriptorState::ALL[1..] {
                let indices: Vec<u32> = tables.lists[state.list()].iter().copied().collect();
                for index in indices {
                    warn!("Force-releasing descriptor {index} from {state}");
                    if let Some(binding) = tables.unbind(index) {
                        out.push(binding);
                    }
                    tables.move_desc(index, *state, DescriptorState::Free);
                }
            }
            out
        };
        for (graph, task) in leftovers {
            graph.cancel(task);
        }
    }

    /// Reserve a graph id.
    ///
    /// # Errors
    ///
    /// [`VertexError::ResourceExhausted`] if every id is taken.
    pub fn reserve_id(&self) -> Result<u32> {
        let mut tables = self.tables.lock();
        let gid = tables
            .reserved
            .iter()
            .position(|r| !r)
            .ok_or(VertexError::exhausted("graph id"))?;
        tables.reserved[gid] = true;
        Ok(gid as u32)
    }

    /// Return a graph id reserved by [`GraphManager::reserve_id`]
    pub fn release_id(&self, gid: u32) {
        let mut tables = self.tables.lock();
        if tables.graphs.get(gid as usize).is_some_and(Option::is_some) {
            warn!("Releasing id of still-registered graph {gid}");
            tables.graphs[gid as usize] = None;
        }
        if let Some(r) = tables.reserved.get_mut(gid as usize) {
            *r = false;
        }
    }

    /// Make a graph schedulable.
    ///
    /// # Errors
    ///
    /// Returns error if the id was not reserved or is already registered.
    pub fn register(&self, graph: Arc<dyn ScheduledGraph>) -> Result<()> {
        let gid = graph.id();
        let mut tables = self.tables.lock();
        if !tables.reserved.get(gid as usize).copied().unwrap_or(false) {
            return Err(VertexError::invalid_state(format!("graph id {gid} not reserved")));
        }
        let slot = &mut tables.graphs[gid as usize];
        if slot.is_some() {
            return Err(VertexError::invalid_state(format!("graph {gid} already registered")));
        }
        *slot = Some(graph);
        debug!("Registered graph {gid}");
        Ok(())
    }

    /// Remove a graph from scheduling; bound descriptors keep their graph
    /// until they are cancelled or completed.
    pub fn unregister(&self, gid: u32) -> bool {
        let removed = self
            .tables
            .lock()
            .graphs
            .get_mut(gid as usize)
            .and_then(Option::take)
            .is_some();
        if removed {
            debug!("Unregistered graph {gid}");
        }
        removed
    }

    /// Whether `gid` is registered
    pub fn is_registered(&self, gid: u32) -> bool {
        self.tables
            .lock()
            .graphs
            .get(gid as usize)
            .is_some_and(Option::is_some)
    }

    /// Bind a requested graph task to a descriptor and wake the worker.
    ///
    /// # Errors
    ///
    /// [`VertexError::ResourceExhausted`] if no descriptor is free,
    /// [`VertexError::InvalidState`] if the graph is not registered.
    pub fn request(&self, graph: Arc<dyn ScheduledGraph>, task: TaskId) -> Result<()> {
        let gid = graph.id();
        let priority = graph.priority();
        {
            let mut tables = self.tables.lock();
            if !tables.graphs.get(gid as usize).is_some_and(Option::is_some) {
                return Err(VertexError::invalid_state(format!("graph {gid} not registered")));
            }
            let index = tables.lists[DescriptorState::Free.list()]
                .pop_front()
                .ok_or(VertexError::exhausted("task descriptor"))?;
            let desc = &mut tables.descs[index as usize];
            desc.priority = priority;
            desc.graph = Some(graph);
            desc.task = Some(task);
            desc.state = DescriptorState::Ready;
            tables.lists[DescriptorState::Ready.list()].push_back(index);
            debug!("Graph {gid} task {task} -> descriptor {index} (priority {priority})");
        }
        self.notify();
        Ok(())
    }

    fn notify(&self) {
        match self.events_tx.try_send(Event::Schedule) {
            // a full channel already holds pending passes
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => warn!("Scheduler event channel closed"),
        }
    }

    /// Run one scheduling pass.
    pub fn sched(&self) {
        let _pass = self.pass.lock();
        let batch = {
            let mut tables = self.tables.lock();
            tables.promote_ready();
            tables.drain_request()
        };
        for (index, (graph, task)) in batch {
            self.dispatch_one(index, &graph, task);
        }
    }

    fn dispatch_one(&self, index: u32, graph: &Arc<dyn ScheduledGraph>, task: TaskId) {
        let gid = graph.id();
        let result = if graph.request(task) {
            graph
                .process(task)
                .and_then(|payload| self.dispatch.send_process(gid, task, payload))
        } else {
            Err(VertexError::invalid_state(format!(
                "graph {gid} task {task} left request state"
            )))
        };

        let mut tables = self.tables.lock();
        match result {
            Ok(()) => {
                tables.move_desc(index, DescriptorState::Process, DescriptorState::Complete);
                self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!("Dispatch of graph {gid} task {task} failed: {e}");
                tables.unbind(index);
                tables.move_desc(index, DescriptorState::Process, DescriptorState::Free);
                drop(tables);
                graph.cancel(task);
                self.counters.canceled.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Cancel every not-yet-dispatched descriptor of one graph.
    ///
    /// Dispatched work is left to finish. Returns the number cancelled.
    pub fn stop_graph(&self, gid: u32) -> usize {
        let canceled: Vec<Binding> = {
            let mut tables = self.tables.lock();
            let mut out = Vec::new();
            for state in [DescriptorState::Ready, DescriptorState::Request] {
                let hits: Vec<u32> = tables.lists[state.list()]
                    .iter()
                    .copied()
                    .filter(|&i| tables.descs[i as usize].is_bound_to(gid))
                    .collect();
                for index in hits {
                    if let Some(binding) = tables.unbind(index) {
                        out.push(binding);
                    }
                    tables.move_desc(index, state, DescriptorState::Free);
                }
            }
            out
        };
        for (graph, task) in &canceled {
            graph.cancel(*task);
        }
        let n = canceled.len();
        self.counters.canceled.fetch_add(n as u64, Ordering::Relaxed);
        info!("Stop graph {gid}: {n} pending task(s) cancelled");
        n
    }

    /// Deliver an invoke reply to its graph and free the descriptor.
    ///
    /// Returns false for replies matching no dispatched descriptor.
    pub fn handle_reply(&self, reply: ProcessReply) -> bool {
        let found = {
            let mut tables = self.tables.lock();
            let hit = [DescriptorState::Complete, DescriptorState::Process]
                .into_iter()
                .find_map(|state| {
                    tables.lists[state.list()]
                        .iter()
                        .copied()
                        .find(|&i| {
                            let d = &tables.descs[i as usize];
                            d.is_bound_to(reply.gid) && d.task == Some(reply.task)
                        })
                        .map(|i| (i, state))
                });
            hit.and_then(|(index, state)| {
                let binding = tables.unbind(index);
                tables.move_desc(index, state, DescriptorState::Free);
                binding
            })
        };
        match found {
            Some((graph, task)) => {
                debug!(
                    "Reply for graph {} task {task}: status {}",
                    reply.gid, reply.result.status
                );
                graph.done(task, reply.result);
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => {
                warn!("Stale reply for graph {} task {}", reply.gid, reply.task);
                self.counters.stale.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Descriptor list lengths
    pub fn counts(&self) -> DescriptorCounts {
        let tables = self.tables.lock();
        let len = |s: DescriptorState| tables.lists[s.list()].len();
        DescriptorCounts {
            free: len(DescriptorState::Free),
            ready: len(DescriptorState::Ready),
            request: len(DescriptorState::Request),
            process: len(DescriptorState::Process),
            complete: len(DescriptorState::Complete),
        }
    }

    /// Descriptors of one list, in list order
    pub fn descriptors(&self, state: DescriptorState) -> Vec<DescriptorView> {
        let tables = self.tables.lock();
        tables.lists[state.list()]
            .iter()
            .map(|&i| tables.view(i))
            .collect()
    }

    /// Scheduler counters
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            canceled: self.counters.canceled.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            stale: self.counters.stale.load(Ordering::Relaxed),
        }
    }
}

impl Drop for GraphManager {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.get_mut().take() {
            let _ = self.events_tx.send(Event::Shutdown);
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskManager;
    use crossbeam_channel::unbounded;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize};
    use std::time::{Duration, Instant};

    #[derive(Debug)]
    struct MockGraph {
        id: u32,
        priority: AtomicU32,
        tasks: TaskManager,
        cancels: AtomicUsize,
        done: Mutex<Vec<(TaskId, InvokeResult)>>,
    }

    impl MockGraph {
        fn new(id: u32, priority: u32) -> Arc<Self> {
            Arc::new(Self {
                id,
                priority: AtomicU32::new(priority),
                tasks: TaskManager::new("mock", id, 8),
                cancels: AtomicUsize::new(0),
                done: Mutex::new(Vec::new()),
            })
        }

        fn submit(self: &Arc<Self>, gmgr: &GraphManager) -> TaskId {
            let task = self.tasks.pick_free_and_request().unwrap();
            gmgr.request(Arc::clone(self) as Arc<dyn ScheduledGraph>, task).unwrap();
            task
        }
    }

    impl ScheduledGraph for MockGraph {
        fn id(&self) -> u32 {
            self.id
        }

        fn priority(&self) -> u32 {
            self.priority.load(Ordering::SeqCst)
        }

        fn request(&self, task: TaskId) -> bool {
            self.tasks.trans_req_to_pre(task)
        }

        fn process(&self, task: TaskId) -> Result<InvokePayload> {
            self.tasks.trans_pre_to_pro(task);
            Ok(InvokePayload {
                gid: self.id,
                ..InvokePayload::default()
            })
        }

        fn cancel(&self, task: TaskId) {
            self.tasks.trans_any_to_fre(task);
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }

        fn done(&self, task: TaskId, result: InvokeResult) {
            self.tasks.trans_pro_to_com(task);
            self.tasks.trans_com_to_fre(task);
            self.done.lock().push((task, result));
        }
    }

    #[derive(Debug, Default)]
    struct MockDispatch {
        sent: Mutex<Vec<(u32, TaskId)>>,
        fail: AtomicBool,
        echo: Mutex<Option<Sender<ProcessReply>>>,
    }

    impl Dispatch for MockDispatch {
        fn send_process(&self, gid: u32, task: TaskId, payload: InvokePayload) -> Result<()> {
            assert_eq!(payload.gid, gid);
            if self.fail.load(Ordering::SeqCst) {
                return Err(VertexError::exhausted("mailbox slot"));
            }
            self.sent.lock().push((gid, task));
            if let Some(tx) = self.echo.lock().as_ref() {
                let _ = tx.send(ProcessReply {
                    gid,
                    task,
                    result: InvokeResult {
                        status: status::OK,
                        exec_us: 5,
                    },
                });
            }
            Ok(())
        }
    }

    fn gmgr(descriptors: usize) -> (GraphManager, Arc<MockDispatch>, Sender<ProcessReply>) {
        let dispatch = Arc::new(MockDispatch::default());
        let (tx, rx) = unbounded();
        let config = VertexConfig::default().with_max_descriptors(descriptors);
        let gm = GraphManager::new(&config, Arc::clone(&dispatch) as Arc<dyn Dispatch>, rx);
        (gm, dispatch, tx)
    }

    fn graph(gm: &GraphManager, priority: u32) -> Arc<MockGraph> {
        let g = MockGraph::new(gm.reserve_id().unwrap(), priority);
        gm.register(Arc::clone(&g) as Arc<dyn ScheduledGraph>).unwrap();
        g
    }

    #[test]
    fn request_order_is_priority_then_arrival() {
        let (gm, dispatch, _tx) = gmgr(8);
        let graphs: Vec<_> = [3, 7, 3, 9].into_iter().map(|p| graph(&gm, p)).collect();
        for g in &graphs {
            g.submit(&gm);
        }
        gm.tables.lock().promote_ready();

        let order = gm.descriptors(DescriptorState::Request);
        let priorities: Vec<u32> = order.iter().map(|d| d.priority).collect();
        assert_eq!(priorities, vec![9, 7, 3, 3]);
        let gids: Vec<u32> = order.iter().filter_map(|d| d.gid).collect();
        assert_eq!(gids, vec![graphs[3].id, graphs[1].id, graphs[0].id, graphs[2].id]);

        gm.sched();
        let sent: Vec<u32> = dispatch.sent.lock().iter().map(|(gid, _)| *gid).collect();
        assert_eq!(sent, gids);
        assert_eq!(gm.counts().complete, 4);
    }

    #[test]
    fn later_high_priority_jumps_waiting_request() {
        let (gm, _, _tx) = gmgr(8);
        let low = graph(&gm, 1);
        let high = graph(&gm, 15);
        low.submit(&gm);
        low.submit(&gm);
        gm.tables.lock().promote_ready();
        high.submit(&gm);
        gm.tables.lock().promote_ready();
        let gids: Vec<u32> = gm
            .descriptors(DescriptorState::Request)
            .iter()
            .filter_map(|d| d.gid)
            .collect();
        assert_eq!(gids, vec![high.id, low.id, low.id]);
    }

    #[test]
    fn stop_cancels_only_undispatched() {
        let (gm, _, _tx) = gmgr(8);
        let g = graph(&gm, 5);
        let running = g.submit(&gm);
        gm.sched();
        g.submit(&gm);
        g.submit(&gm);
        assert_eq!(gm.counts().ready, 2);

        assert_eq!(gm.stop_graph(g.id), 2);
        assert_eq!(g.cancels.load(Ordering::SeqCst), 2);
        assert_eq!(gm.counts().complete, 1);

        assert!(gm.handle_reply(ProcessReply {
            gid: g.id,
            task: running,
            result: InvokeResult { status: 0, exec_us: 9 },
        }));
        assert_eq!(g.done.lock().as_slice(), &[(running, InvokeResult { status: 0, exec_us: 9 })]);
        assert_eq!(gm.counts().free, 8);
        assert_eq!(g.tasks.counts().free, 7);
    }

    #[test]
    fn stop_leaves_other_graphs_alone() {
        let (gm, _, _tx) = gmgr(8);
        let a = graph(&gm, 5);
        let b = graph(&gm, 5);
        a.submit(&gm);
        b.submit(&gm);
        assert_eq!(gm.stop_graph(a.id), 1);
        assert_eq!(b.cancels.load(Ordering::SeqCst), 0);
        assert_eq!(gm.counts().ready, 1);
    }

    #[test]
    fn dispatch_failure_cancels_task() {
        let (gm, dispatch, _tx) = gmgr(4);
        let g = graph(&gm, 5);
        dispatch.fail.store(true, Ordering::SeqCst);
        g.submit(&gm);
        gm.sched();
        assert_eq!(g.cancels.load(Ordering::SeqCst), 1);
        assert_eq!(gm.counts().free, 4);
        assert_eq!(gm.stats().canceled, 1);
        assert!(g.tasks.is_consistent());
    }

    #[test]
    fn descriptor_exhaustion_is_reported() {
        let (gm, _, _tx) = gmgr(2);
        let g = graph(&gm, 5);
        g.submit(&gm);
        g.submit(&gm);
        let task = g.tasks.pick_free_and_request().unwrap();
        let err = gm
            .request(Arc::clone(&g) as Arc<dyn ScheduledGraph>, task)
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn unregistered_graph_cannot_request() {
        let (gm, _, _tx) = gmgr(2);
        let g = graph(&gm, 5);
        assert!(gm.unregister(g.id));
        let task = g.tasks.pick_free_and_request().unwrap();
        assert!(gm.request(Arc::clone(&g) as Arc<dyn ScheduledGraph>, task).is_err());
    }

    #[test]
    fn stale_reply_is_dropped() {
        let (gm, _, _tx) = gmgr(2);
        assert!(!gm.handle_reply(ProcessReply {
            gid: 0,
            task: TaskId::new(3, 0),
            result: InvokeResult::TIMED_OUT,
        }));
        assert_eq!(gm.stats().stale, 1);
    }

    #[test]
    fn reply_for_older_generation_is_not_matched() {
        let (gm, _, _tx) = gmgr(4);
        let g = graph(&gm, 5);
        let task = g.submit(&gm);
        gm.sched();
        let older = TaskId::new(task.index(), task.generation().wrapping_sub(1));
        assert!(!gm.handle_reply(ProcessReply {
            gid: g.id,
            task: older,
            result: InvokeResult::TIMED_OUT,
        }));
        assert_eq!(gm.counts().complete, 1);
        assert!(g.done.lock().is_empty());
    }

    #[test]
    fn graph_ids_are_bounded() {
        let (gm, _, _tx) = gmgr(2);
        let ids: Vec<u32> = std::iter::from_fn(|| gm.reserve_id().ok()).collect();
        assert_eq!(ids.len(), VertexConfig::default().max_graphs);
        gm.release_id(ids[4]);
        assert_eq!(gm.reserve_id().unwrap(), ids[4]);
    }

    #[test]
    fn worker_schedules_and_completes() {
        let (gm, dispatch, tx) = gmgr(16);
        *dispatch.echo.lock() = Some(tx);
        let gm = Arc::new(gm);
        gm.spawn().unwrap();
        let g = graph(&gm, 5);
        for _ in 0..20 {
            loop {
                if let Some(task) = g.tasks.pick_free_and_request() {
                    gm.request(Arc::clone(&g) as Arc<dyn ScheduledGraph>, task).unwrap();
                    break;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while g.done.lock().len() < 20 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(g.done.lock().len(), 20);
        gm.shutdown();
        assert_eq!(gm.counts().free, 16);
        assert_eq!(gm.stats().completed, 20);
    }
}
