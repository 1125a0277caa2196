// SPDX-License-Identifier: AGPL-3.0-only

//! Task pool and task state machine
//!
//! A [`TaskManager`] owns a fixed array of [`Task`] slots for one owner (a
//! graph, or the interface's command bookkeeping) and five ordered lists, one
//! per [`TaskState`]. Index 0 is reserved, so the list lengths always add up
//! to `capacity - 1`.
//!
//! ```text
//!          pick_free_and_request
//!   Free ─────────────────────────▶ Request ──▶ Prepare ──▶ Process ──▶ Complete
//!    ▲                                 │  └───────────────────▲ │          │
//!    │                                 └──────────────────────┼─┼──────────┤
//!    └────────────── any state (error / cancel / flush) ◀─────┴─┴──────────┘
//! ```
//!
//! Transitions check the task's state tag and the source list before touching
//! anything. A mismatch is logged and refused, never a panic: the scheduling
//! worker and the reply worker can legitimately race on the same task, and the
//! loser of the race simply finds the task already moved.
//!
//! Ids carry a generation that is bumped every time a slot returns to Free,
//! so a stale [`TaskId`] held across a reuse is refused the same way.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Instant;
use tracing::{debug, warn};
use vertex_chip::limits::INVALID_TASK_INDEX;
use vertex_chip::message::MessageType;

/// Task state tag; each state has its own list in the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Slot available
    Free,
    /// Allocated, waiting for the scheduler
    Request,
    /// Picked by the scheduler, being prepared for dispatch
    Prepare,
    /// Dispatched to the firmware
    Process,
    /// Reply received, results being handed back
    Complete,
}

impl TaskState {
    /// All states in list order
    pub const ALL: [TaskState; 5] = [
        Self::Free,
        Self::Request,
        Self::Prepare,
        Self::Process,
        Self::Complete,
    ];

    const fn list(self) -> usize {
        match self {
            Self::Free => 0,
            Self::Request => 1,
            Self::Prepare => 2,
            Self::Process => 3,
            Self::Complete => 4,
        }
    }

    /// Whether `self → to` is an edge of the state machine
    pub const fn can_move_to(self, to: TaskState) -> bool {
        use TaskState::{Complete, Free, Prepare, Process, Request};
        matches!(
            (self, to),
            (Free, Request)
                | (Request, Prepare | Process | Complete | Free)
                | (Prepare, Process | Complete | Free)
                | (Process, Complete | Free)
                | (Complete, Free)
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Free => write!(f, "free"),
            Self::Request => write!(f, "request"),
            Self::Prepare => write!(f, "prepare"),
            Self::Process => write!(f, "process"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

/// Generational handle to a task slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId {
    index: u32,
    generation: u32,
}

impl TaskId {
    /// Create a task id
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index (1-based; 0 is never valid)
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Reuse generation of the slot
    pub const fn generation(&self) -> u32 {
        self.generation
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

/// Measured lifecycle points of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimePoint {
    /// Allocated from Free
    Queue = 0,
    /// Taken by the scheduler
    Request = 1,
    /// Dispatched
    Process = 2,
    /// Reply handled
    Done = 3,
}

/// Number of [`TimePoint`]s
pub const TIME_POINTS: usize = 4;

/// Timestamps indexed by [`TimePoint`]
pub type Timestamps = [Option<Instant>; TIME_POINTS];

/// Task flag bits
pub mod task_flags {
    /// Carry the graph's user parameters on this invoke
    pub const UPDATE_PARAM: u32 = 1 << 0;
    /// Task was cancelled before completion
    pub const CANCELED: u32 = 1 << 1;
    /// Dispatch or firmware execution failed
    pub const FAILED: u32 = 1 << 2;
}

/// One in-flight request
#[derive(Debug, Clone)]
pub struct Task {
    /// Slot index
    pub index: u32,
    /// Reuse generation
    pub generation: u32,
    /// Owning graph id
    pub owner: u32,
    /// State tag
    pub state: TaskState,
    /// Message this task stands for
    pub message: Option<MessageType>,
    /// Generic parameter slots
    pub params: [u64; 4],
    /// Paired input bundle slot
    pub input: Option<u32>,
    /// Paired output bundle slot
    pub output: Option<u32>,
    /// See [`task_flags`]
    pub flags: u32,
    /// Lifecycle timestamps
    pub timestamps: Timestamps,
}

impl Task {
    fn empty(index: u32) -> Self {
        Self {
            index,
            generation: 0,
            owner: 0,
            state: TaskState::Free,
            message: None,
            params: [0; 4],
            input: None,
            output: None,
            flags: 0,
            timestamps: [None; TIME_POINTS],
        }
    }

    /// Current id of this slot
    pub const fn id(&self) -> TaskId {
        TaskId::new(self.index, self.generation)
    }

    /// Timestamp of a lifecycle point
    pub fn time(&self, point: TimePoint) -> Option<Instant> {
        self.timestamps[point as usize]
    }

    fn recycle(&mut self) {
        let generation = self.generation.wrapping_add(1);
        *self = Self::empty(self.index);
        self.generation = generation;
    }
}

/// List lengths of a pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskCounts {
    /// Free slots
    pub free: usize,
    /// Waiting for the scheduler
    pub request: usize,
    /// Being prepared
    pub prepare: usize,
    /// Dispatched
    pub process: usize,
    /// Completing
    pub complete: usize,
}

impl TaskCounts {
    /// Sum of all lists
    pub const fn total(&self) -> usize {
        self.free + self.request + self.prepare + self.process + self.complete
    }

    /// Tasks not yet dispatched or still running
    pub const fn in_flight(&self) -> usize {
        self.request + self.prepare + self.process
    }
}

#[derive(Debug)]
struct Pool {
    tasks: Vec<Task>,
    lists: [VecDeque<u32>; 5],
}

impl Pool {
    fn slot(&self, id: TaskId) -> Option<&Task> {
        if id.index == INVALID_TASK_INDEX {
            return None;
        }
        self.tasks
            .get(id.index as usize)
            .filter(|t| t.generation == id.generation)
    }

    fn unlink(&mut self, state: TaskState, index: u32) -> bool {
        let list = &mut self.lists[state.list()];
        match list.iter().position(|&i| i == index) {
            Some(pos) => {
                list.remove(pos);
                true
            }
            None => false,
        }
    }

    fn link(&mut self, index: u32, to: TaskState) {
        let task = &mut self.tasks[index as usize];
        task.state = to;
        let now = Instant::now();
        match to {
            TaskState::Request => task.timestamps[TimePoint::Queue as usize] = Some(now),
            TaskState::Prepare => task.timestamps[TimePoint::Request as usize] = Some(now),
            TaskState::Process => task.timestamps[TimePoint::Process as usize] = Some(now),
            TaskState::Complete => task.timestamps[TimePoint::Done as usize] = Some(now),
            TaskState::Free => task.recycle(),
        }
        self.lists[to.list()].push_back(index);
    }
}

/// Pool of tasks for one owner
#[derive(Debug)]
pub struct TaskManager {
    owner: u32,
    name: &'static str,
    capacity: usize,
    pool: Mutex<Pool>,
}

impl TaskManager {
    /// Create a pool with `capacity` slots, slot 0 reserved
    pub fn new(name: &'static str, owner: u32, capacity: usize) -> Self {
        let capacity = capacity.max(2);
        let tasks = (0..capacity as u32).map(Task::empty).collect();
        let mut free = VecDeque::with_capacity(capacity);
        free.extend(1..capacity as u32);
        Self {
            owner,
            name,
            capacity,
            pool: Mutex::new(Pool {
                tasks,
                lists: [
                    free,
                    VecDeque::new(),
                    VecDeque::new(),
                    VecDeque::new(),
                    VecDeque::new(),
                ],
            }),
        }
    }

    /// Owner id
    pub const fn owner(&self) -> u32 {
        self.owner
    }

    /// Slot count including the reserved index 0
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Take the oldest free task into Request.
    ///
    /// `None` means the pool is exhausted; the caller decides whether that is
    /// worth an error.
    pub fn pick_free_and_request(&self) -> Option<TaskId> {
        let mut pool = self.pool.lock();
        let index = pool.lists[TaskState::Free.list()].pop_front()?;
        pool.link(index, TaskState::Request);
        let task = &mut pool.tasks[index as usize];
        task.owner = self.owner;
        Some(task.id())
    }

    /// Move a task from `from` to `to`.
    ///
    /// Refuses (and logs) stale ids, illegal edges, and tasks whose state or
    /// list membership does not match `from`.
    pub fn transition(&self, id: TaskId, from: TaskState, to: TaskState) -> bool {
        self.transition_with(id, from, to, |_| {})
    }

    /// [`TaskManager::transition`], then apply `update` to the moved task
    /// under the same lock.
    pub fn transition_with(
        &self,
        id: TaskId,
        from: TaskState,
        to: TaskState,
        update: impl FnOnce(&mut Task),
    ) -> bool {
        if !from.can_move_to(to) || from == TaskState::Free {
            warn!("[{}:{}] illegal transition {from} -> {to} for task {id}", self.name, self.owner);
            return false;
        }
        let mut pool = self.pool.lock();
        let Some(task) = pool.slot(id) else {
            warn!("[{}:{}] stale or invalid task {id} ({from} -> {to})", self.name, self.owner);
            return false;
        };
        if task.state != from {
            warn!(
                "[{}:{}] task {id} is {} (expected {from}, -> {to})",
                self.name, self.owner, task.state
            );
            return false;
        }
        if pool.lists[from.list()].is_empty() || !pool.unlink(from, id.index) {
            warn!(
                "[{}:{}] task {id} missing from {from} list ({} entries)",
                self.name,
                self.owner,
                pool.lists[from.list()].len()
            );
            return false;
        }
        if to != TaskState::Free {
            update(&mut pool.tasks[id.index as usize]);
        }
        pool.link(id.index, to);
        true
    }

    /// Request → Prepare
    pub fn trans_req_to_pre(&self, id: TaskId) -> bool {
        self.transition(id, TaskState::Request, TaskState::Prepare)
    }

    /// Request → Process (host command path, no prepare stage)
    pub fn trans_req_to_pro(&self, id: TaskId) -> bool {
        self.transition(id, TaskState::Request, TaskState::Process)
    }

    /// Request → Complete
    pub fn trans_req_to_com(&self, id: TaskId) -> bool {
        self.transition(id, TaskState::Request, TaskState::Complete)
    }

    /// Request → Free
    pub fn trans_req_to_fre(&self, id: TaskId) -> bool {
        self.transition(id, TaskState::Request, TaskState::Free)
    }

    /// Prepare → Process
    pub fn trans_pre_to_pro(&self, id: TaskId) -> bool {
        self.transition(id, TaskState::Prepare, TaskState::Process)
    }

    /// Prepare → Complete
    pub fn trans_pre_to_com(&self, id: TaskId) -> bool {
        self.transition(id, TaskState::Prepare, TaskState::Complete)
    }

    /// Prepare → Free
    pub fn trans_pre_to_fre(&self, id: TaskId) -> bool {
        self.transition(id, TaskState::Prepare, TaskState::Free)
    }

    /// Process → Complete
    pub fn trans_pro_to_com(&self, id: TaskId) -> bool {
        self.transition(id, TaskState::Process, TaskState::Complete)
    }

    /// Process → Free
    pub fn trans_pro_to_fre(&self, id: TaskId) -> bool {
        self.transition(id, TaskState::Process, TaskState::Free)
    }

    /// Complete → Free
    pub fn trans_com_to_fre(&self, id: TaskId) -> bool {
        self.transition(id, TaskState::Complete, TaskState::Free)
    }

    /// Whatever state the task is in → Free (error and cancel paths)
    pub fn trans_any_to_fre(&self, id: TaskId) -> bool {
        let Some(state) = self.state(id) else {
            warn!("[{}:{}] stale or invalid task {id} (any -> free)", self.name, self.owner);
            return false;
        };
        if state == TaskState::Free {
            warn!("[{}:{}] task {id} already free", self.name, self.owner);
            return false;
        }
        self.transition(id, state, TaskState::Free)
    }

    /// Force every non-free task back to Free.
    ///
    /// Only for shutdown and crash recovery; each flushed task is a caller
    /// that never finished its task, so each one is logged.
    pub fn flush(&self) -> usize {
        let mut pool = self.pool.lock();
        let mut flushed = 0;
        for state in &TaskState::ALL[1..] {
            while let Some(index) = pool.lists[state.list()].pop_front() {
                let task = &pool.tasks[index as usize];
                warn!(
                    "[{}:{}] force-flushing task {} from {state} (message {:?})",
                    self.name,
                    self.owner,
                    task.id(),
                    task.message
                );
                pool.link(index, TaskState::Free);
                flushed += 1;
            }
        }
        if flushed > 0 {
            debug!("[{}:{}] flushed {flushed} task(s)", self.name, self.owner);
        }
        flushed
    }

    /// Snapshot of a task, if `id` is current
    pub fn task(&self, id: TaskId) -> Option<Task> {
        self.pool.lock().slot(id).cloned()
    }

    /// State of a task, if `id` is current
    pub fn state(&self, id: TaskId) -> Option<TaskState> {
        self.pool.lock().slot(id).map(|t| t.state)
    }

    /// Current id of a non-free slot, for correlating replies by index
    pub fn lookup(&self, index: u32) -> Option<TaskId> {
        let pool = self.pool.lock();
        if index == INVALID_TASK_INDEX {
            return None;
        }
        pool.tasks
            .get(index as usize)
            .filter(|t| t.state != TaskState::Free)
            .map(Task::id)
    }

    /// Mutate a non-free task in place. Returns false for stale ids.
    pub fn update(&self, id: TaskId, f: impl FnOnce(&mut Task)) -> bool {
        let mut pool = self.pool.lock();
        if pool.slot(id).map_or(true, |t| t.state == TaskState::Free) {
            return false;
        }
        f(&mut pool.tasks[id.index as usize]);
        true
    }

    /// Ids currently in `state`, in list order
    pub fn tasks_in(&self, state: TaskState) -> Vec<TaskId> {
        let pool = self.pool.lock();
        pool.lists[state.list()]
            .iter()
            .map(|&i| pool.tasks[i as usize].id())
            .collect()
    }

    /// List lengths
    pub fn counts(&self) -> TaskCounts {
        let pool = self.pool.lock();
        TaskCounts {
            free: pool.lists[0].len(),
            request: pool.lists[1].len(),
            prepare: pool.lists[2].len(),
            process: pool.lists[3].len(),
            complete: pool.lists[4].len(),
        }
    }

    /// Verify list lengths and state tags agree.
    pub fn is_consistent(&self) -> bool {
        let pool = self.pool.lock();
        let total: usize = pool.lists.iter().map(VecDeque::len).sum();
        if total != self.capacity - 1 {
            return false;
        }
        let mut seen = vec![false; self.capacity];
        for state in TaskState::ALL {
            for &index in &pool.lists[state.list()] {
                let i = index as usize;
                if i == 0 || i >= self.capacity || seen[i] || pool.tasks[i].state != state {
                    return false;
                }
                seen[i] = true;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(capacity: usize) -> TaskManager {
        TaskManager::new("test", 1, capacity)
    }

    #[test]
    fn counts_sum_to_capacity_minus_one() {
        let tm = pool(8);
        assert_eq!(tm.counts().total(), 7);
        let a = tm.pick_free_and_request().unwrap();
        let b = tm.pick_free_and_request().unwrap();
        assert!(tm.trans_req_to_pre(a));
        assert!(tm.trans_pre_to_pro(a));
        assert!(tm.trans_req_to_pro(b));
        assert!(tm.trans_pro_to_com(b));
        let c = tm.counts();
        assert_eq!(c.total(), 7);
        assert_eq!((c.free, c.process, c.complete), (5, 1, 1));
        assert!(tm.is_consistent());
    }

    #[test]
    fn index_zero_never_handed_out() {
        let tm = pool(4);
        let ids: Vec<_> = std::iter::from_fn(|| tm.pick_free_and_request()).collect();
        assert_eq!(ids.len(), 3);
        assert!(ids.iter().all(|id| id.index() != 0));
        assert!(tm.pick_free_and_request().is_none());
    }

    #[test]
    fn mismatched_transition_is_refused() {
        let tm = pool(4);
        let id = tm.pick_free_and_request().unwrap();
        assert!(!tm.trans_pro_to_com(id));
        assert!(!tm.trans_com_to_fre(id));
        assert_eq!(tm.state(id), Some(TaskState::Request));
        assert!(tm.is_consistent());
    }

    #[test]
    fn illegal_edge_is_refused() {
        let tm = pool(4);
        let id = tm.pick_free_and_request().unwrap();
        assert!(tm.trans_req_to_pro(id));
        assert!(!tm.transition(id, TaskState::Process, TaskState::Prepare));
        assert_eq!(tm.state(id), Some(TaskState::Process));
    }

    #[test]
    fn stale_generation_is_refused() {
        let tm = pool(2);
        let old = tm.pick_free_and_request().unwrap();
        assert!(tm.trans_req_to_fre(old));
        let new = tm.pick_free_and_request().unwrap();
        assert_eq!(old.index(), new.index());
        assert_ne!(old.generation(), new.generation());
        assert!(!tm.trans_req_to_pre(old));
        assert!(tm.task(old).is_none());
        assert_eq!(tm.state(new), Some(TaskState::Request));
    }

    #[test]
    fn any_to_free_from_every_state() {
        let tm = pool(6);
        let r = tm.pick_free_and_request().unwrap();
        let p = tm.pick_free_and_request().unwrap();
        let x = tm.pick_free_and_request().unwrap();
        let c = tm.pick_free_and_request().unwrap();
        tm.trans_req_to_pre(p);
        tm.trans_req_to_pro(x);
        tm.trans_req_to_com(c);
        for id in [r, p, x, c] {
            assert!(tm.trans_any_to_fre(id));
        }
        assert_eq!(tm.counts().free, 5);
        assert!(!tm.trans_any_to_fre(r));
    }

    #[test]
    fn flush_returns_everything() {
        let tm = pool(6);
        let a = tm.pick_free_and_request().unwrap();
        let b = tm.pick_free_and_request().unwrap();
        tm.trans_req_to_pro(b);
        assert_eq!(tm.flush(), 2);
        assert_eq!(tm.counts().free, 5);
        assert!(tm.state(a).is_none());
        assert!(tm.is_consistent());
        assert_eq!(tm.flush(), 0);
    }

    #[test]
    fn lists_keep_fifo_order() {
        let tm = pool(5);
        let a = tm.pick_free_and_request().unwrap();
        let b = tm.pick_free_and_request().unwrap();
        let c = tm.pick_free_and_request().unwrap();
        assert_eq!(tm.tasks_in(TaskState::Request), vec![a, b, c]);
        tm.trans_req_to_pro(b);
        tm.trans_req_to_pro(a);
        assert_eq!(tm.tasks_in(TaskState::Process), vec![b, a]);
    }

    #[test]
    fn timestamps_follow_lifecycle() {
        let tm = pool(3);
        let id = tm.pick_free_and_request().unwrap();
        tm.trans_req_to_pre(id);
        tm.trans_pre_to_pro(id);
        tm.trans_pro_to_com(id);
        let task = tm.task(id).unwrap();
        let queue = task.time(TimePoint::Queue).unwrap();
        let done = task.time(TimePoint::Done).unwrap();
        assert!(done >= queue);
        assert!(task.time(TimePoint::Process).is_some());
        tm.trans_com_to_fre(id);
        assert!(tm.lookup(id.index()).is_none());
    }

    #[test]
    fn update_and_lookup() {
        let tm = pool(3);
        let id = tm.pick_free_and_request().unwrap();
        assert!(tm.update(id, |t| {
            t.params[0] = 42;
            t.message = Some(MessageType::Invoke);
        }));
        assert_eq!(tm.lookup(id.index()), Some(id));
        let task = tm.task(id).unwrap();
        assert_eq!(task.params[0], 42);
        assert_eq!(task.owner, 1);
    }

    #[test]
    fn concurrent_churn_keeps_invariant() {
        use std::sync::Arc;
        let tm = Arc::new(pool(9));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let tm = Arc::clone(&tm);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        if let Some(id) = tm.pick_free_and_request() {
                            tm.trans_req_to_pre(id);
                            tm.trans_pre_to_pro(id);
                            tm.trans_pro_to_com(id);
                            tm.trans_com_to_fre(id);
                        }
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert!(tm.is_consistent());
        assert_eq!(tm.counts().free, 8);
    }
}
