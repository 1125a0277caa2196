// SPDX-License-Identifier: AGPL-3.0-only

//! One client's compute graph
//!
//! A [`Graph`] sits between the client's [`VertexQueue`](crate::queue::VertexQueue)
//! and the [`GraphManager`]. Paired bundles become tasks in the graph's own
//! [`TaskManager`]; the scheduler calls back through [`ScheduledGraph`] to
//! prepare, cancel and complete them; results go back to the queue through
//! its [`BundleSink`].
//!
//! Two slot-indexed tables (one per direction) remember which task a bundle
//! slot was last attached to, so a dequeue can be traced back to the task
//! that produced it.

use crate::config::{PollConfig, VertexConfig};
use crate::error::{Result, VertexError};
use crate::graphmgr::{GraphManager, InvokeResult, ScheduledGraph};
use crate::queue::{BundleSink, Completion, Direction, InvokeBuffers, QueueOps};
use crate::task::{task_flags, TaskCounts, TaskId, TaskManager, TaskState};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};
use vertex_chip::limits::{DEFAULT_PRIORITY, MAX_IO_BUFFERS, MAX_PRIORITY, MAX_USER_PARAMS};
use vertex_chip::message::{invoke_flags, InvokePayload, MessageType};

/// Graph counters and task pool usage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphStats {
    /// Graph id
    pub id: u32,
    /// Current priority
    pub priority: u32,
    /// Bundle pairs accepted
    pub input: u64,
    /// Tasks completed successfully
    pub done: u64,
    /// Tasks cancelled before dispatch
    pub cancel: u64,
    /// Tasks that failed or timed out in firmware
    pub failed: u64,
    /// Task pool list lengths
    pub tasks: TaskCounts,
}

#[derive(Debug)]
struct GraphIo {
    in_hash: Vec<Option<u32>>,
    out_hash: Vec<Option<u32>>,
    frames: HashMap<u32, InvokeBuffers>,
    params: [u32; MAX_USER_PARAMS],
    params_dirty: bool,
}

#[derive(Debug, Default)]
struct Counters {
    input: AtomicU64,
    done: AtomicU64,
    cancel: AtomicU64,
    failed: AtomicU64,
}

/// A schedulable compute graph
#[derive(Debug)]
pub struct Graph {
    id: u32,
    me: Weak<Graph>,
    priority: AtomicU32,
    flags: AtomicU32,
    started: AtomicBool,
    tasks: TaskManager,
    gmgr: Arc<GraphManager>,
    sink: Mutex<Option<Weak<dyn BundleSink>>>,
    io: Mutex<GraphIo>,
    stop_poll: PollConfig,
    counters: Counters,
}

impl Graph {
    /// Create a stopped graph with a reserved id
    pub fn new(id: u32, gmgr: Arc<GraphManager>, config: &VertexConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id,
            me: me.clone(),
            priority: AtomicU32::new(DEFAULT_PRIORITY),
            flags: AtomicU32::new(0),
            started: AtomicBool::new(false),
            tasks: TaskManager::new("graph", id, config.graph_tasks),
            gmgr,
            sink: Mutex::new(None),
            io: Mutex::new(GraphIo {
                in_hash: vec![None; config.max_bundles],
                out_hash: vec![None; config.max_bundles],
                frames: HashMap::new(),
                params: [0; MAX_USER_PARAMS],
                params_dirty: false,
            }),
            stop_poll: config.stop_poll,
            counters: Counters::default(),
        })
    }

    /// Graph id
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Set the scheduling priority; values above the ceiling are clamped.
    ///
    /// Returns the priority actually applied. Tasks already bound to a
    /// scheduler descriptor keep the priority they were bound with.
    pub fn set_priority(&self, priority: u32) -> u32 {
        let clamped = priority.min(MAX_PRIORITY);
        if clamped != priority {
            debug!("Graph {}: priority {priority} clamped to {clamped}", self.id);
        }
        self.priority.store(clamped, Ordering::Relaxed);
        clamped
    }

    /// Graph flags
    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Relaxed)
    }

    /// Replace the graph flags
    pub fn set_flags(&self, flags: u32) {
        self.flags.store(flags, Ordering::Relaxed);
    }

    /// Store user parameters; the next dispatched invoke carries them
    pub fn set_params(&self, params: [u32; MAX_USER_PARAMS]) {
        let mut io = self.io.lock();
        io.params = params;
        io.params_dirty = true;
    }

    /// Whether parameters are waiting for the next invoke
    pub fn params_pending(&self) -> bool {
        self.io.lock().params_dirty
    }

    /// Route results to `sink`
    pub fn attach(&self, sink: &Arc<dyn BundleSink>) {
        *self.sink.lock() = Some(Arc::downgrade(sink));
    }

    /// Whether the graph is registered for scheduling
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// The graph's task pool
    pub fn tasks(&self) -> &TaskManager {
        &self.tasks
    }

    /// Counters
    pub fn stats(&self) -> GraphStats {
        GraphStats {
            id: self.id,
            priority: self.priority.load(Ordering::Relaxed),
            input: self.counters.input.load(Ordering::Relaxed),
            done: self.counters.done.load(Ordering::Relaxed),
            cancel: self.counters.cancel.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            tasks: self.tasks.counts(),
        }
    }

    fn deliver(&self, input: Option<u32>, output: Option<u32>, completion: Completion) {
        let (Some(input), Some(output)) = (input, output) else {
            warn!("Graph {}: task without bundles completed", self.id);
            return;
        };
        let sink = self.sink.lock().as_ref().and_then(Weak::upgrade);
        match sink {
            Some(sink) => sink.complete(input, output, completion),
            None => debug!("Graph {}: no queue attached, result dropped", self.id),
        }
    }

    fn forget(&self, task: TaskId) {
        self.io.lock().frames.remove(&task.index());
    }

    /// Force every task still held after a stop timeout back to Free,
    /// reporting its bundles as invalid.
    fn abandon(&self) {
        for state in [
            TaskState::Request,
            TaskState::Prepare,
            TaskState::Process,
            TaskState::Complete,
        ] {
            for id in self.tasks.tasks_in(state) {
                let Some(task) = self.tasks.task(id) else {
                    continue;
                };
                if self.tasks.trans_any_to_fre(id) {
                    warn!("Graph {}: abandoning task {id} in {state}", self.id);
                    self.forget(id);
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    self.deliver(task.input, task.output, Completion::invalid(task.timestamps));
                }
            }
        }
    }
}

impl QueueOps for Graph {
    fn start(&self) -> Result<()> {
        if self.is_started() {
            return Ok(());
        }
        let me = self
            .me
            .upgrade()
            .ok_or_else(|| VertexError::invalid_state("graph is being dropped"))?;
        self.gmgr.register(me)?;
        self.started.store(true, Ordering::Release);
        info!("Graph {} started (priority {})", self.id, self.priority.load(Ordering::Relaxed));
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if !self.started.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let canceled = self.gmgr.stop_graph(self.id);
        let drained = self
            .stop_poll
            .run(|| (self.tasks.counts().in_flight() == 0).then_some(()));
        if drained.is_none() {
            error!(
                "Graph {}: {} task(s) still in flight after {:?}",
                self.id,
                self.tasks.counts().in_flight(),
                self.stop_poll.budget()
            );
            self.abandon();
        }
        self.gmgr.unregister(self.id);
        info!("Graph {} stopped ({canceled} cancelled)", self.id);
        Ok(())
    }

    fn queue(&self, buffers: InvokeBuffers) -> Result<()> {
        if !self.is_started() {
            return Err(VertexError::invalid_state(format!("graph {} not started", self.id)));
        }
        if buffers.inputs.len() > MAX_IO_BUFFERS || buffers.outputs.len() > MAX_IO_BUFFERS {
            return Err(VertexError::invalid_argument("too many buffers for one invoke"));
        }
        let me = self
            .me
            .upgrade()
            .ok_or_else(|| VertexError::invalid_state("graph is being dropped"))?;
        let task = self
            .tasks
            .pick_free_and_request()
            .ok_or(VertexError::exhausted("graph task"))?;
        let (input, output) = (buffers.input, buffers.output);
        self.tasks.update(task, |t| {
            t.message = Some(MessageType::Invoke);
            t.input = Some(input);
            t.output = Some(output);
        });
        {
            let mut io = self.io.lock();
            if let Some(slot) = io.in_hash.get_mut(input as usize) {
                *slot = Some(task.index());
            }
            if let Some(slot) = io.out_hash.get_mut(output as usize) {
                *slot = Some(task.index());
            }
            io.frames.insert(task.index(), buffers);
        }

        if let Err(e) = self.gmgr.request(me, task) {
            self.forget(task);
            self.tasks.trans_req_to_fre(task);
            return Err(e);
        }
        self.counters.input.fetch_add(1, Ordering::Relaxed);
        debug!("Graph {}: bundles ({input}, {output}) -> task {task}", self.id);
        Ok(())
    }

    fn deque(&self, direction: Direction, index: u32) -> Option<u32> {
        let mut io = self.io.lock();
        let table = match direction {
            Direction::Input => &mut io.in_hash,
            Direction::Output => &mut io.out_hash,
        };
        table.get_mut(index as usize).and_then(Option::take)
    }
}

impl ScheduledGraph for Graph {
    fn id(&self) -> u32 {
        self.id
    }

    fn priority(&self) -> u32 {
        self.priority.load(Ordering::Relaxed)
    }

    fn request(&self, task: TaskId) -> bool {
        self.tasks.trans_req_to_pre(task)
    }

    fn process(&self, task: TaskId) -> Result<InvokePayload> {
        let (payload, update) = {
            let mut io = self.io.lock();
            let frame = io.frames.get(&task.index()).ok_or_else(|| {
                VertexError::invalid_state(format!("graph {} task {task} has no buffers", self.id))
            })?;
            let mut payload = InvokePayload {
                gid: self.id,
                num_inputs: frame.inputs.len() as u32,
                num_outputs: frame.outputs.len() as u32,
                ..InvokePayload::default()
            };
            for (dst, src) in payload.inputs.iter_mut().zip(&frame.inputs) {
                *dst = *src;
            }
            for (dst, src) in payload.outputs.iter_mut().zip(&frame.outputs) {
                *dst = *src;
            }
            let update = std::mem::take(&mut io.params_dirty);
            if update {
                payload.flags |= invoke_flags::UPDATE_PARAM;
                payload.user_params = io.params;
            }
            (payload, update)
        };
        let moved = self
            .tasks
            .transition_with(task, TaskState::Prepare, TaskState::Process, |t| {
                if update {
                    t.flags |= task_flags::UPDATE_PARAM;
                }
            });
        if !moved {
            if update {
                self.io.lock().params_dirty = true;
            }
            return Err(VertexError::invalid_state(format!(
                "graph {} task {task} left prepare state",
                self.id
            )));
        }
        Ok(payload)
    }

    fn cancel(&self, task: TaskId) {
        let Some(snapshot) = self.tasks.task(task) else {
            warn!("Graph {}: cancel of stale task {task}", self.id);
            return;
        };
        if !self.tasks.trans_any_to_fre(task) {
            return;
        }
        if snapshot.flags & task_flags::UPDATE_PARAM != 0 {
            // parameters never reached the firmware
            self.io.lock().params_dirty = true;
        }
        self.forget(task);
        self.counters.cancel.fetch_add(1, Ordering::Relaxed);
        debug!("Graph {}: task {task} cancelled in {}", self.id, snapshot.state);
        self.deliver(
            snapshot.input,
            snapshot.output,
            Completion::invalid(snapshot.timestamps),
        );
    }

    fn done(&self, task: TaskId, result: InvokeResult) {
        if !self.tasks.trans_pro_to_com(task) {
            warn!("Graph {}: reply for task {task} which is not in process", self.id);
            return;
        }
        let snapshot = self.tasks.task(task);
        self.tasks.trans_com_to_fre(task);
        self.forget(task);
        let Some(snapshot) = snapshot else {
            return;
        };
        let completion = if result.is_ok() {
            self.counters.done.fetch_add(1, Ordering::Relaxed);
            Completion::done(snapshot.timestamps, result.exec_us)
        } else {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Graph {}: task {task} failed with status {} ({})",
                self.id,
                result.status,
                vertex_chip::status::describe(result.status)
            );
            Completion::invalid(snapshot.timestamps)
        };
        self.deliver(snapshot.input, snapshot.output, completion);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphmgr::{DescriptorState, Dispatch, ProcessReply};
    use crate::queue::bundle_flags;
    use crate::task::TimePoint;
    use crossbeam_channel::unbounded;
    use std::time::Duration;
    use vertex_chip::message::BufferAddr;
    use vertex_chip::status;

    #[derive(Debug, Default)]
    struct Sent(Mutex<Vec<InvokePayload>>);

    impl Dispatch for Sent {
        fn send_process(&self, _gid: u32, _task: TaskId, payload: InvokePayload) -> Result<()> {
            self.0.lock().push(payload);
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    struct Results(Mutex<Vec<(u32, u32, Completion)>>);

    impl BundleSink for Results {
        fn complete(&self, input: u32, output: u32, completion: Completion) {
            self.0.lock().push((input, output, completion));
        }
    }

    struct Fixture {
        gmgr: Arc<GraphManager>,
        sent: Arc<Sent>,
        results: Arc<Results>,
        graph: Arc<Graph>,
        _sink: Arc<dyn BundleSink>,
    }

    fn fixture(config: &VertexConfig) -> Fixture {
        let sent = Arc::new(Sent::default());
        let (_tx, rx) = unbounded::<ProcessReply>();
        let gmgr = Arc::new(GraphManager::new(config, Arc::clone(&sent) as Arc<dyn Dispatch>, rx));
        let graph = Graph::new(gmgr.reserve_id().unwrap(), Arc::clone(&gmgr), config);
        let results = Arc::new(Results::default());
        let sink = Arc::clone(&results) as Arc<dyn BundleSink>;
        graph.attach(&sink);
        graph.start().unwrap();
        Fixture {
            gmgr,
            sent,
            results,
            graph,
            _sink: sink,
        }
    }

    fn frame(input: u32, output: u32) -> InvokeBuffers {
        InvokeBuffers {
            input,
            output,
            inputs: vec![BufferAddr { addr: 0x1000 * u64::from(input + 1), size: 64 }],
            outputs: vec![
                BufferAddr { addr: 0x8000, size: 32 },
                BufferAddr { addr: 0x9000, size: 32 },
            ],
        }
    }

    fn reply(f: &Fixture, task: TaskId, status: i32) -> bool {
        f.gmgr.handle_reply(ProcessReply {
            gid: f.graph.id(),
            task,
            result: InvokeResult { status, exec_us: 12 },
        })
    }

    #[test]
    fn invoke_carries_bundle_addresses() {
        let f = fixture(&VertexConfig::default());
        f.graph.queue(frame(3, 4)).unwrap();
        f.gmgr.sched();
        let sent = f.sent.0.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].gid, f.graph.id());
        assert_eq!((sent[0].num_inputs, sent[0].num_outputs), (1, 2));
        assert_eq!(sent[0].inputs[0].addr, 0x4000);
        assert_eq!(sent[0].outputs[1].addr, 0x9000);
        assert_eq!(sent[0].flags & invoke_flags::UPDATE_PARAM, 0);
    }

    #[test]
    fn successful_reply_completes_bundles() {
        let f = fixture(&VertexConfig::default());
        f.graph.queue(frame(1, 2)).unwrap();
        f.gmgr.sched();
        let task = f.graph.tasks().tasks_in(TaskState::Process)[0];
        assert!(reply(&f, task, status::OK));

        let results = f.results.0.lock();
        let (input, output, completion) = results[0];
        assert_eq!((input, output), (1, 2));
        assert_eq!(completion.flags, bundle_flags::DONE);
        assert_eq!(completion.exec_us, 12);
        let queued = completion.timestamps[TimePoint::Queue as usize].unwrap();
        let done = completion.timestamps[TimePoint::Done as usize].unwrap();
        assert!(done >= queued);
        drop(results);

        assert_eq!(f.graph.deque(Direction::Input, 1), Some(task.index()));
        assert_eq!(f.graph.deque(Direction::Input, 1), None);
        let stats = f.graph.stats();
        assert_eq!((stats.input, stats.done, stats.failed), (1, 1, 0));
        assert_eq!(stats.tasks.free, f.graph.tasks().capacity() - 1);
    }

    #[test]
    fn firmware_error_marks_invalid() {
        let f = fixture(&VertexConfig::default());
        f.graph.queue(frame(0, 0)).unwrap();
        f.gmgr.sched();
        let task = f.graph.tasks().tasks_in(TaskState::Process)[0];
        assert!(reply(&f, task, status::INVALID_PARAM));
        let completion = f.results.0.lock()[0].2;
        assert!(!completion.is_valid());
        assert_eq!(f.graph.stats().failed, 1);
    }

    #[test]
    fn params_ride_on_next_invoke_only() {
        let f = fixture(&VertexConfig::default());
        f.graph.set_params([1, 2, 3, 4]);
        f.graph.queue(frame(0, 0)).unwrap();
        f.graph.queue(frame(1, 1)).unwrap();
        f.gmgr.sched();
        let sent = f.sent.0.lock();
        assert_eq!(sent[0].flags & invoke_flags::UPDATE_PARAM, invoke_flags::UPDATE_PARAM);
        assert_eq!(sent[0].user_params, [1, 2, 3, 4]);
        assert_eq!(sent[1].flags & invoke_flags::UPDATE_PARAM, 0);
        assert!(!f.graph.params_pending());
    }

    #[test]
    fn priority_is_clamped() {
        let f = fixture(&VertexConfig::default());
        assert_eq!(f.graph.set_priority(99), MAX_PRIORITY);
        assert_eq!(f.graph.set_priority(4), 4);
        f.graph.queue(frame(0, 0)).unwrap();
        assert_eq!(f.gmgr.descriptors(DescriptorState::Ready)[0].priority, 4);
    }

    #[test]
    fn stopped_graph_refuses_work() {
        let f = fixture(&VertexConfig::default());
        f.graph.stop().unwrap();
        assert!(!f.gmgr.is_registered(f.graph.id()));
        assert!(f.graph.queue(frame(0, 0)).is_err());
        assert_eq!(f.graph.tasks().counts().request, 0);
    }

    #[test]
    fn task_exhaustion_is_retryable() {
        let config = VertexConfig::default().with_graph_tasks(3);
        let f = fixture(&config);
        f.graph.queue(frame(0, 0)).unwrap();
        f.graph.queue(frame(1, 1)).unwrap();
        let err = f.graph.queue(frame(2, 2)).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(f.graph.stats().input, 2);
    }

    #[test]
    fn stop_cancels_pending_and_waits_for_dispatched() {
        let config = VertexConfig::default().with_stop_poll(PollConfig::new(500, Duration::from_millis(2)));
        let f = fixture(&config);
        f.graph.queue(frame(0, 0)).unwrap();
        f.gmgr.sched();
        let running = f.graph.tasks().tasks_in(TaskState::Process)[0];
        f.graph.queue(frame(1, 1)).unwrap();
        f.graph.queue(frame(2, 2)).unwrap();

        let replier = {
            let gmgr = Arc::clone(&f.gmgr);
            let gid = f.graph.id();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                gmgr.handle_reply(ProcessReply {
                    gid,
                    task: running,
                    result: InvokeResult { status: status::OK, exec_us: 1 },
                })
            })
        };
        f.graph.stop().unwrap();
        assert!(replier.join().unwrap());

        let stats = f.graph.stats();
        assert_eq!((stats.cancel, stats.done), (2, 1));
        let results = f.results.0.lock();
        assert_eq!(results.len(), 3);
        assert_eq!(results.iter().filter(|r| r.2.is_valid()).count(), 1);
    }

    #[test]
    fn stop_timeout_abandons_dispatched() {
        let config = VertexConfig::default().with_stop_poll(PollConfig::new(3, Duration::from_millis(1)));
        let f = fixture(&config);
        f.graph.queue(frame(0, 0)).unwrap();
        f.gmgr.sched();
        let running = f.graph.tasks().tasks_in(TaskState::Process)[0];
        f.graph.stop().unwrap();
        assert_eq!(f.graph.tasks().counts().in_flight(), 0);
        assert!(!f.results.0.lock()[0].2.is_valid());

        // the late reply finds a stale task and is ignored by the graph
        assert!(reply(&f, running, status::OK));
        assert_eq!(f.results.0.lock().len(), 1);
    }

    #[test]
    fn restart_after_abandon_completes_new_task() {
        let config = VertexConfig::default()
            .with_graph_tasks(2)
            .with_stop_poll(PollConfig::new(3, Duration::from_millis(1)));
        let f = fixture(&config);
        f.graph.queue(frame(0, 0)).unwrap();
        f.gmgr.sched();
        let old = f.graph.tasks().tasks_in(TaskState::Process)[0];
        f.graph.stop().unwrap();

        f.graph.start().unwrap();
        f.graph.queue(frame(1, 1)).unwrap();
        f.gmgr.sched();
        let new = f.graph.tasks().tasks_in(TaskState::Process)[0];
        assert_eq!(new.index(), old.index());
        assert_ne!(new, old);
        assert_eq!(f.gmgr.counts().complete, 2);

        assert!(reply(&f, new, status::OK));
        assert_eq!(f.graph.tasks().state(new), None);
        assert_eq!(f.graph.stats().done, 1);
        let results = f.results.0.lock();
        assert_eq!(results.len(), 2);
        assert!(results[1].2.is_valid());
        drop(results);

        // the abandoned descriptor stays bound until its own reply or timeout
        assert_eq!(f.gmgr.counts().complete, 1);
        assert!(reply(&f, old, status::OK));
        assert_eq!(f.gmgr.counts().complete, 0);
        assert_eq!(f.graph.stats().done, 1);
    }
}
