// SPDX-License-Identifier: AGPL-3.0-only

//! Host ↔ firmware command transport
//!
//! The [`Interface`] turns commands into mailbox messages, rings the
//! firmware doorbell and correlates the replies.
//!
//! ```text
//! Closed ──open──▶ Open ──start (INIT)──▶ Started ──stop (DEINIT, POWER_DOWN)──▶ Stopped
//!   ▲                                                                              │
//!   └──────────────────────────────────── close ───────────────────────────────────┘
//! ```
//!
//! Two paths share the rings:
//!
//! - **Control commands** ([`Interface::process_command`]) block the caller.
//!   Each graph id has its own command slot, so one control command per graph
//!   is outstanding at a time; the transaction id is the index of a
//!   bookkeeping task in the interface's own [`TaskManager`].
//! - **Invokes** ([`Dispatch::send_process`]) return once the message is on
//!   the ring. The transaction id is the graph task index, and the reply is
//!   forwarded to the scheduler as a [`ProcessReply`].
//!
//! A single dispatch lock makes every ring write plus doorbell atomic across
//! graphs. Replies are drained by a worker woken through the [`IrqLine`];
//! the same worker runs the invoke watchdog. Every timeout captures a
//! [`Diagnostics`] snapshot.

use crate::config::{PollConfig, VertexConfig};
use crate::error::{Result, VertexError};
use crate::graphmgr::{Dispatch, InvokeResult, ProcessReply};
use crate::mailbox::{ChannelSnapshot, Mailbox};
use crate::task::{TaskCounts, TaskId, TaskManager};
use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use vertex_chip::mailbox::ChannelId;
use vertex_chip::message::{InitPayload, InvokePayload, Message, MessageType, Payload};
use vertex_chip::status;

/// Interface lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceState {
    /// No platform attached
    Closed,
    /// Platform attached, firmware not booted
    Open,
    /// Firmware booted, accepting commands
    Started,
    /// Firmware torn down
    Stopped,
}

impl std::fmt::Display for InterfaceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::Started => write!(f, "started"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Platform services the interface needs from the remote side
pub trait Platform: Debug + Send + Sync {
    /// Ring the host → firmware doorbell
    fn signal(&self);

    /// Read the diagnostic register set
    fn register_dump(&self) -> Vec<(&'static str, u32)>;

    /// Snapshot of the firmware log ring, oldest first
    fn firmware_log(&self) -> Vec<String>;
}

/// Firmware → host interrupt line
///
/// Raising an already pending line is a no-op.
#[derive(Debug, Clone)]
pub struct IrqLine(Sender<()>);

impl IrqLine {
    /// Wrap the sending end of an interrupt channel
    pub const fn new(line: Sender<()>) -> Self {
        Self(line)
    }

    /// Raise the interrupt
    pub fn raise(&self) {
        match self.0.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => debug!("IRQ raised with no listener"),
        }
    }
}

/// State captured when the firmware stops answering
#[derive(Debug, Clone)]
pub struct Diagnostics {
    /// What triggered the dump
    pub reason: String,
    /// When it was taken
    pub taken_at: Instant,
    /// Diagnostic registers
    pub registers: Vec<(&'static str, u32)>,
    /// Firmware log tail
    pub firmware_log: Vec<String>,
    /// Ring indices
    pub mailbox: [ChannelSnapshot; 4],
    /// Bookkeeping task lists
    pub tasks: TaskCounts,
    /// Invokes waiting for a reply
    pub outstanding_invokes: usize,
}

/// Transport counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceStats {
    /// Control commands written
    pub commands: u64,
    /// Invokes written
    pub invokes: u64,
    /// Replies routed
    pub replies: u64,
    /// Control and invoke timeouts
    pub timeouts: u64,
    /// Replies matching nothing outstanding
    pub stale: u64,
}

#[derive(Debug, Default)]
struct Counters {
    commands: AtomicU64,
    invokes: AtomicU64,
    replies: AtomicU64,
    timeouts: AtomicU64,
    stale: AtomicU64,
}

#[derive(Debug, Default)]
struct CommandSlot {
    request: Mutex<()>,
    reply: Mutex<Option<Message>>,
    ready: Condvar,
}

/// A dispatched invoke, keyed by `(gid, trid)` as the wire reply carries it
#[derive(Debug, Clone, Copy)]
struct Inflight {
    task: TaskId,
    deadline: Instant,
}

#[derive(Debug)]
struct Worker {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Host side of the mailbox protocol
#[derive(Debug)]
pub struct Interface {
    state: Mutex<InterfaceState>,
    mailbox: Arc<Mailbox>,
    platform: Mutex<Option<Arc<dyn Platform>>>,
    tasks: TaskManager,
    slots: Box<[CommandSlot]>,
    dispatch: Mutex<()>,
    inflight: Mutex<HashMap<(u32, u32), Inflight>>,
    replies: Sender<ProcessReply>,
    irq_tx: Sender<()>,
    irq_rx: Receiver<()>,
    worker: Mutex<Option<Worker>>,
    diagnostics: Mutex<Option<Diagnostics>>,
    counters: Counters,
    mailbox_poll: PollConfig,
    command_timeout: Duration,
    invoke_timeout: Duration,
    reply_poll_interval: Duration,
}

impl Interface {
    /// Create a closed interface over `mailbox`; invoke replies go to `replies`
    pub fn new(config: &VertexConfig, mailbox: Arc<Mailbox>, replies: Sender<ProcessReply>) -> Self {
        let (irq_tx, irq_rx) = bounded(1);
        // one slot per graph id plus one for device-wide commands
        let slots = (0..=config.max_graphs).map(|_| CommandSlot::default()).collect();
        Self {
            state: Mutex::new(InterfaceState::Closed),
            mailbox,
            platform: Mutex::new(None),
            tasks: TaskManager::new("itf", 0, config.interface_tasks),
            slots,
            dispatch: Mutex::new(()),
            inflight: Mutex::new(HashMap::new()),
            replies,
            irq_tx,
            irq_rx,
            worker: Mutex::new(None),
            diagnostics: Mutex::new(None),
            counters: Counters::default(),
            mailbox_poll: config.mailbox_poll,
            command_timeout: config.command_timeout,
            invoke_timeout: config.invoke_timeout,
            reply_poll_interval: config.reply_poll_interval,
        }
    }

    /// Interrupt line for the firmware side to raise
    pub fn irq_line(&self) -> IrqLine {
        IrqLine(self.irq_tx.clone())
    }

    /// Current lifecycle state
    pub fn state(&self) -> InterfaceState {
        *self.state.lock()
    }

    /// The transport rings
    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }

    /// Bookkeeping task pool
    pub fn tasks(&self) -> &TaskManager {
        &self.tasks
    }

    /// Attach the platform.
    ///
    /// # Errors
    ///
    /// Returns error unless the interface is closed.
    pub fn open(&self, platform: Arc<dyn Platform>) -> Result<()> {
        let mut state = self.state.lock();
        if *state != InterfaceState::Closed {
            return Err(VertexError::invalid_state(format!("interface is {state}")));
        }
        *self.platform.lock() = Some(platform);
        *state = InterfaceState::Open;
        debug!("Interface open");
        Ok(())
    }

    /// Start the reply worker and boot the firmware with INIT.
    ///
    /// # Errors
    ///
    /// Returns error if the interface is not open, the worker cannot be
    /// spawned, or INIT fails or times out.
    pub fn start(self: &Arc<Self>, init: InitPayload) -> Result<()> {
        {
            let state = self.state.lock();
            if *state != InterfaceState::Open {
                return Err(VertexError::invalid_state(format!("cannot start: interface is {state}")));
            }
        }
        self.spawn_worker()?;
        if let Err(e) = self.process_command(MessageType::Init, Payload::Init(init), None) {
            self.stop_worker();
            return Err(e);
        }
        *self.state.lock() = InterfaceState::Started;
        info!("Firmware booted");
        Ok(())
    }

    /// Tear the firmware down: DEINIT, then POWER_DOWN on the urgent ring.
    ///
    /// The interface ends up Stopped even if a command fails; the first
    /// failure is returned.
    ///
    /// # Errors
    ///
    /// Returns error if the interface was not started or a command failed.
    pub fn stop(&self) -> Result<()> {
        if self.state() != InterfaceState::Started {
            return Err(VertexError::invalid_state(format!(
                "cannot stop: interface is {}",
                self.state()
            )));
        }
        let deinit = self.process_command(MessageType::Deinit, Payload::Empty, None);
        let power = self.process_command(MessageType::PowerDown, Payload::Empty, None);
        *self.state.lock() = InterfaceState::Stopped;
        self.stop_worker();

        let abandoned = std::mem::take(&mut *self.inflight.lock());
        if !abandoned.is_empty() {
            warn!("{} invoke(s) still outstanding at stop", abandoned.len());
        }
        self.tasks.flush();
        info!("Firmware stopped");
        deinit.and(power).map(|_| ())
    }

    /// Detach the platform.
    ///
    /// # Errors
    ///
    /// Returns error while the firmware is running.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state == InterfaceState::Started {
            return Err(VertexError::invalid_state("interface still started"));
        }
        *self.platform.lock() = None;
        *state = InterfaceState::Closed;
        debug!("Interface closed");
        Ok(())
    }

    fn spawn_worker(self: &Arc<Self>) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        let (stop, stop_rx) = bounded(1);
        let itf = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("vertex-reply".into())
            .spawn(move || itf.run(&stop_rx))?;
        *worker = Some(Worker { stop, handle });
        Ok(())
    }

    fn stop_worker(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        let _ = worker.stop.send(());
        if worker.handle.join().is_err() {
            warn!("Reply worker panicked");
        }
    }

    fn platform(&self) -> Option<Arc<dyn Platform>> {
        self.platform.lock().clone()
    }

    fn slot_for(&self, gid: Option<u32>) -> Result<usize> {
        let system = self.slots.len() - 1;
        match gid {
            None => Ok(system),
            Some(gid) if (gid as usize) < system => Ok(gid as usize),
            Some(gid) => Err(VertexError::invalid_argument(format!("graph id {gid} out of range"))),
        }
    }

    fn timeout_for(&self, kind: MessageType) -> Duration {
        if kind == MessageType::Invoke {
            self.invoke_timeout
        } else {
            self.command_timeout
        }
    }

    /// Write one message and ring the doorbell, atomically with respect to
    /// every other writer.
    fn post(&self, msg: &Message) -> Result<()> {
        let channel = ChannelId::h2f(msg.kind.is_urgent());
        let _dispatch = self.dispatch.lock();
        self.mailbox.write_polled(channel, msg, &self.mailbox_poll)?;
        if let Some(platform) = self.platform() {
            platform.signal();
        }
        Ok(())
    }

    /// Send a control command and block until its reply or the deadline.
    ///
    /// `gid` selects the per-graph command slot; `None` uses the device-wide
    /// slot. Commands on the same slot are serialized.
    ///
    /// # Errors
    ///
    /// - [`VertexError::InvalidState`] if the interface does not accept commands
    /// - [`VertexError::ResourceExhausted`] if no bookkeeping task is free
    /// - [`VertexError::MailboxFull`] if the ring stayed full
    /// - [`VertexError::Timeout`] if no reply arrived in time
    /// - [`VertexError::Firmware`] if the reply carries a failure status
    pub fn process_command(&self, kind: MessageType, payload: Payload, gid: Option<u32>) -> Result<Message> {
        let state = self.state();
        let accepted = match kind {
            MessageType::Init => state == InterfaceState::Open,
            _ => state == InterfaceState::Started,
        };
        if !accepted || kind.is_response() {
            return Err(VertexError::invalid_state(format!("cannot send {kind}: interface is {state}")));
        }
        let slot_index = self.slot_for(gid)?;
        let slot = &self.slots[slot_index];
        let _request = slot.request.lock();
        slot.reply.lock().take();

        let task = self
            .tasks
            .pick_free_and_request()
            .ok_or(VertexError::exhausted("interface task"))?;
        self.tasks.update(task, |t| {
            t.message = Some(kind);
            t.params[0] = slot_index as u64;
        });
        let msg = Message::new(task.index(), kind, payload);

        // the reply may be routed before post() returns
        self.tasks.trans_req_to_pro(task);
        if let Err(e) = self.post(&msg) {
            self.tasks.trans_any_to_fre(task);
            if matches!(e, VertexError::MailboxFull { .. }) {
                self.dump_diagnostics(&format!("{kind}: {e}"));
            }
            return Err(e);
        }
        self.counters.commands.fetch_add(1, Ordering::Relaxed);
        debug!("{kind} sent (trid {}, slot {slot_index})", task.index());

        let timeout = self.timeout_for(kind);
        let deadline = Instant::now() + timeout;
        let reply = {
            let mut reply = slot.reply.lock();
            loop {
                if let Some(msg) = reply.take() {
                    if msg.trid == task.index() {
                        break Some(msg);
                    }
                    debug!("Dropping reply trid {} on slot {slot_index}", msg.trid);
                }
                if slot.ready.wait_until(&mut reply, deadline).timed_out() {
                    break reply.take().filter(|m| m.trid == task.index());
                }
            }
        };

        self.tasks.trans_any_to_fre(task);
        let Some(reply) = reply else {
            self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
            let err = VertexError::Timeout {
                command: kind,
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            };
            error!("{err}");
            self.dump_diagnostics(&format!("{kind} (trid {}) timed out", task.index()));
            return Err(err);
        };
        match reply.status() {
            Some(status::OK) => Ok(reply),
            Some(code) => Err(VertexError::firmware(kind, code)),
            None => Err(VertexError::protocol(format!("{} without status", reply.kind))),
        }
    }

    /// Route every pending firmware → host message.
    ///
    /// Urgent ring first. Returns the number of messages consumed.
    pub fn drain_replies(&self) -> usize {
        let mut handled = 0;
        for channel in [ChannelId::F2hUrgent, ChannelId::F2hNormal] {
            loop {
                match self.mailbox.read(channel) {
                    Ok(Some(msg)) => {
                        handled += 1;
                        self.route(msg);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        handled += 1;
                        warn!("Undecodable frame on {channel}: {e}");
                    }
                }
            }
        }
        handled
    }

    fn route(&self, msg: Message) {
        if !msg.kind.is_response() {
            warn!("Firmware sent request {} (trid {})", msg.kind, msg.trid);
            return;
        }
        if msg.kind == MessageType::InvokeRsp {
            self.route_invoke(&msg);
            return;
        }
        let Some(task) = self.tasks.lookup(msg.trid) else {
            self.stale(&msg);
            return;
        };
        let Some(snapshot) = self.tasks.task(task) else {
            self.stale(&msg);
            return;
        };
        if snapshot.message.and_then(MessageType::response) != Some(msg.kind) {
            warn!(
                "Reply {} for trid {} which is waiting on {:?}",
                msg.kind, msg.trid, snapshot.message
            );
            self.counters.stale.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if !self.tasks.trans_pro_to_com(task) {
            self.stale(&msg);
            return;
        }
        self.counters.replies.fetch_add(1, Ordering::Relaxed);
        let Some(slot) = usize::try_from(snapshot.params[0])
            .ok()
            .and_then(|i| self.slots.get(i))
        else {
            return;
        };
        debug!("{} received (trid {})", msg.kind, msg.trid);
        *slot.reply.lock() = Some(msg);
        slot.ready.notify_all();
    }

    fn route_invoke(&self, msg: &Message) {
        let Payload::InvokeResponse(rsp) = &msg.payload else {
            warn!("INVOKE_RSP without invoke payload (trid {})", msg.trid);
            return;
        };
        let Some(inflight) = self.inflight.lock().remove(&(rsp.gid, msg.trid)) else {
            self.stale(msg);
            return;
        };
        self.counters.replies.fetch_add(1, Ordering::Relaxed);
        self.forward(ProcessReply {
            gid: rsp.gid,
            task: inflight.task,
            result: InvokeResult {
                status: rsp.status,
                exec_us: rsp.exec_us,
            },
        });
    }

    fn forward(&self, reply: ProcessReply) {
        if self.replies.send(reply).is_err() {
            warn!("Scheduler gone; reply for graph {} dropped", reply.gid);
        }
    }

    fn stale(&self, msg: &Message) {
        warn!("Stale {} (trid {}, gid {:?})", msg.kind, msg.trid, msg.gid());
        self.counters.stale.fetch_add(1, Ordering::Relaxed);
    }

    /// Fail every invoke whose deadline has passed.
    ///
    /// Returns the number expired.
    pub fn check_invoke_deadlines(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(u32, TaskId)> = {
            let mut inflight = self.inflight.lock();
            let keys: Vec<_> = inflight
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(key, _)| *key)
                .collect();
            keys.iter()
                .filter_map(|key| inflight.remove(key).map(|entry| (key.0, entry.task)))
                .collect()
        };
        if expired.is_empty() {
            return 0;
        }
        self.counters
            .timeouts
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        for &(gid, task) in &expired {
            error!("INVOKE for graph {gid} (task {task}) timed out after {:?}", self.invoke_timeout);
        }
        self.dump_diagnostics(&format!("{} invoke(s) timed out", expired.len()));
        for &(gid, task) in &expired {
            self.forward(ProcessReply {
                gid,
                task,
                result: InvokeResult::TIMED_OUT,
            });
        }
        expired.len()
    }

    fn run(&self, stop: &Receiver<()>) {
        debug!("Reply worker started");
        loop {
            select! {
                recv(self.irq_rx) -> _ => {}
                recv(stop) -> _ => break,
                default(self.reply_poll_interval) => {}
            }
            self.drain_replies();
            self.check_invoke_deadlines();
        }
        // replies already on the ring still belong to someone
        self.drain_replies();
        debug!("Reply worker exiting");
    }

    /// Capture registers, firmware log and ring state.
    pub fn dump_diagnostics(&self, reason: &str) -> Diagnostics {
        let platform = self.platform();
        let diagnostics = Diagnostics {
            reason: reason.to_string(),
            taken_at: Instant::now(),
            registers: platform.as_ref().map(|p| p.register_dump()).unwrap_or_default(),
            firmware_log: platform.as_ref().map(|p| p.firmware_log()).unwrap_or_default(),
            mailbox: self.mailbox.snapshot(),
            tasks: self.tasks.counts(),
            outstanding_invokes: self.inflight.lock().len(),
        };
        error!("Diagnostic dump: {reason}");
        for (name, value) in &diagnostics.registers {
            error!("  {name:<16} {value:#010x}");
        }
        for ring in &diagnostics.mailbox {
            error!(
                "  {:<10} w={} r={} cap={}",
                ring.id.to_string(),
                ring.write,
                ring.read,
                ring.capacity
            );
        }
        for line in &diagnostics.firmware_log {
            error!("  fw: {line}");
        }
        *self.diagnostics.lock() = Some(diagnostics.clone());
        diagnostics
    }

    /// Most recent diagnostic dump
    pub fn last_diagnostics(&self) -> Option<Diagnostics> {
        self.diagnostics.lock().clone()
    }

    /// Invokes waiting for a reply
    pub fn outstanding_invokes(&self) -> usize {
        self.inflight.lock().len()
    }

    /// Counters
    pub fn stats(&self) -> InterfaceStats {
        InterfaceStats {
            commands: self.counters.commands.load(Ordering::Relaxed),
            invokes: self.counters.invokes.load(Ordering::Relaxed),
            replies: self.counters.replies.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            stale: self.counters.stale.load(Ordering::Relaxed),
        }
    }
}

impl Dispatch for Interface {
    fn send_process(&self, gid: u32, task: TaskId, payload: InvokePayload) -> Result<()> {
        if self.state() != InterfaceState::Started {
            return Err(VertexError::invalid_state(format!(
                "cannot invoke: interface is {}",
                self.state()
            )));
        }
        let key = (gid, task.index());
        let msg = Message::new(task.index(), MessageType::Invoke, Payload::Invoke(Box::new(payload)));
        let entry = Inflight {
            task,
            deadline: Instant::now() + self.invoke_timeout,
        };
        let superseded = self.inflight.lock().insert(key, entry);
        if let Some(old) = superseded {
            // an abandoned invoke on the same slot never gets its own reply
            warn!("INVOKE for graph {gid} task {task} replaces unanswered task {}", old.task);
            self.forward(ProcessReply {
                gid,
                task: old.task,
                result: InvokeResult::TIMED_OUT,
            });
        }
        if let Err(e) = self.post(&msg) {
            self.inflight.lock().remove(&key);
            if matches!(e, VertexError::MailboxFull { .. }) {
                self.dump_diagnostics(&format!("INVOKE for graph {gid}: {e}"));
            }
            return Err(e);
        }
        self.counters.invokes.fetch_add(1, Ordering::Relaxed);
        debug!("INVOKE sent (graph {gid}, trid {})", task.index());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MailboxConfig;
    use crossbeam_channel::unbounded;
    use vertex_chip::message::{InvokeResponsePayload, ResponsePayload};

    /// Firmware stand-in answering from the test thread
    #[derive(Debug, Default)]
    struct Doorbell {
        rings: AtomicU64,
    }

    impl Platform for Doorbell {
        fn signal(&self) {
            self.rings.fetch_add(1, Ordering::Relaxed);
        }

        fn register_dump(&self) -> Vec<(&'static str, u32)> {
            vec![("FW_STATUS", 0x1)]
        }

        fn firmware_log(&self) -> Vec<String> {
            vec!["boot".into()]
        }
    }

    /// Firmware stand-in that answers and routes the reply inside the doorbell
    #[derive(Debug, Default)]
    struct Eager(Mutex<std::sync::Weak<Interface>>);

    impl Platform for Eager {
        fn signal(&self) {
            if let Some(itf) = self.0.lock().upgrade() {
                answer(&itf, status::OK);
                itf.drain_replies();
            }
        }

        fn register_dump(&self) -> Vec<(&'static str, u32)> {
            Vec::new()
        }

        fn firmware_log(&self) -> Vec<String> {
            Vec::new()
        }
    }

    fn config() -> VertexConfig {
        VertexConfig::default()
            .with_command_timeout(Duration::from_millis(200))
            .with_invoke_timeout(Duration::from_millis(30))
            .with_mailbox_poll(PollConfig::new(3, Duration::ZERO))
            .with_mailbox(MailboxConfig {
                normal_capacity: 4,
                urgent_capacity: 2,
            })
    }

    fn interface(config: &VertexConfig) -> (Arc<Interface>, Arc<Doorbell>, Receiver<ProcessReply>) {
        let (tx, rx) = unbounded();
        let mailbox = Arc::new(Mailbox::new(&config.mailbox).unwrap());
        let itf = Arc::new(Interface::new(config, mailbox, tx));
        let bell = Arc::new(Doorbell::default());
        itf.open(Arc::clone(&bell) as Arc<dyn Platform>).unwrap();
        (itf, bell, rx)
    }

    /// Reply to every request currently on the h2f rings with `status`
    fn answer(itf: &Interface, status: i32) -> usize {
        let mut n = 0;
        for channel in [ChannelId::H2fUrgent, ChannelId::H2fNormal] {
            while let Some(req) = itf.mailbox().read(channel).unwrap() {
                let payload = match &req.payload {
                    Payload::Invoke(p) => Payload::InvokeResponse(InvokeResponsePayload {
                        gid: p.gid,
                        status,
                        exec_us: 3,
                    }),
                    _ => Payload::Response(ResponsePayload {
                        gid: req.gid().unwrap_or(0),
                        status,
                    }),
                };
                let rsp = req.reply(payload).unwrap();
                itf.mailbox().write(ChannelId::f2h(rsp.kind.is_urgent()), &rsp).unwrap();
                n += 1;
            }
        }
        itf.irq_line().raise();
        n
    }

    fn responder(itf: &Arc<Interface>, status: i32, rounds: usize) -> std::thread::JoinHandle<()> {
        let itf = Arc::clone(itf);
        std::thread::spawn(move || {
            for _ in 0..rounds {
                std::thread::sleep(Duration::from_millis(2));
                answer(&itf, status);
            }
        })
    }

    #[test]
    fn start_requires_open() {
        let config = config();
        let (tx, _rx) = unbounded();
        let itf = Arc::new(Interface::new(&config, Arc::new(Mailbox::new(&config.mailbox).unwrap()), tx));
        assert!(itf.start(InitPayload::default()).is_err());
        assert_eq!(itf.state(), InterfaceState::Closed);
    }

    #[test]
    fn init_round_trip_starts_interface() {
        let (itf, bell, _rx) = interface(&config());
        let firmware = responder(&itf, status::OK, 20);
        itf.start(InitPayload::default()).unwrap();
        firmware.join().unwrap();
        assert_eq!(itf.state(), InterfaceState::Started);
        assert!(bell.rings.load(Ordering::Relaxed) >= 1);
        let stats = itf.stats();
        assert_eq!((stats.commands, stats.replies, stats.timeouts), (1, 1, 0));
        assert_eq!(itf.tasks().counts().free, itf.tasks().capacity() - 1);
        itf.stop_worker();
    }

    #[test]
    fn firmware_failure_status_is_reported() {
        let (itf, _bell, _rx) = interface(&config());
        let firmware = responder(&itf, status::NO_RESOURCE, 20);
        let err = itf.start(InitPayload::default()).unwrap_err();
        firmware.join().unwrap();
        assert!(matches!(
            err,
            VertexError::Firmware { command: MessageType::Init, status: status::NO_RESOURCE, .. }
        ));
        assert_eq!(itf.state(), InterfaceState::Open);
    }

    #[test]
    fn silent_firmware_times_out_with_diagnostics() {
        let config = config().with_command_timeout(Duration::from_millis(40));
        let (itf, _bell, _rx) = interface(&config);
        itf.spawn_worker().unwrap();

        let start = Instant::now();
        let err = itf.process_command(MessageType::Init, Payload::Init(InitPayload::default()), None);
        let elapsed = start.elapsed();
        assert!(matches!(err, Err(VertexError::Timeout { command: MessageType::Init, .. })));
        assert!(elapsed >= Duration::from_millis(40));
        assert!(elapsed < Duration::from_millis(40) + config.reply_poll_interval * 4);

        let diag = itf.last_diagnostics().unwrap();
        assert!(diag.reason.contains("INIT"));
        assert_eq!(diag.registers, vec![("FW_STATUS", 0x1)]);
        assert_eq!(diag.mailbox[ChannelId::H2fNormal.slot()].write, 1);
        assert_eq!(itf.stats().timeouts, 1);
        assert_eq!(itf.tasks().counts().in_flight(), 0);

        // the late reply finds nothing waiting
        itf.stop_worker();
        answer(&itf, status::OK);
        itf.drain_replies();
        assert_eq!(itf.stats().stale, 1);
    }

    #[test]
    fn full_ring_reports_mailbox_full() {
        let (itf, _bell, _rx) = interface(&config());
        *itf.state.lock() = InterfaceState::Started;
        let payload = InvokePayload { gid: 1, ..InvokePayload::default() };
        for i in 1..=4 {
            itf.send_process(1, TaskId::new(i, 0), payload).unwrap();
        }
        let err = itf.send_process(1, TaskId::new(5, 0), payload).unwrap_err();
        assert!(matches!(err, VertexError::MailboxFull { channel: ChannelId::H2fNormal, .. }));
        assert!(err.is_retryable());
        assert_eq!(itf.outstanding_invokes(), 4);
        assert!(itf.last_diagnostics().is_some());
    }

    #[test]
    fn invoke_reply_is_forwarded() {
        let (itf, _bell, rx) = interface(&config());
        *itf.state.lock() = InterfaceState::Started;
        let payload = InvokePayload { gid: 2, ..InvokePayload::default() };
        itf.send_process(2, TaskId::new(7, 3), payload).unwrap();
        answer(&itf, status::OK);
        assert_eq!(itf.drain_replies(), 1);
        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.gid, 2);
        assert_eq!(reply.task, TaskId::new(7, 3));
        assert!(reply.result.is_ok());
        assert_eq!(reply.result.exec_us, 3);
        assert_eq!(itf.outstanding_invokes(), 0);
    }

    #[test]
    fn reply_routed_inside_doorbell_reaches_caller() {
        let config = config();
        let (tx, _rx) = unbounded();
        let itf = Arc::new(Interface::new(&config, Arc::new(Mailbox::new(&config.mailbox).unwrap()), tx));
        let eager = Arc::new(Eager::default());
        *eager.0.lock() = Arc::downgrade(&itf);
        itf.open(Arc::clone(&eager) as Arc<dyn Platform>).unwrap();

        let started = Instant::now();
        let rsp = itf
            .process_command(MessageType::Init, Payload::Init(InitPayload::default()), None)
            .unwrap();
        assert_eq!(rsp.kind, MessageType::InitRsp);
        assert!(started.elapsed() < config.command_timeout);
        let stats = itf.stats();
        assert_eq!((stats.replies, stats.timeouts, stats.stale), (1, 0, 0));
        assert_eq!(itf.tasks().counts().in_flight(), 0);
    }

    #[test]
    fn reused_task_slot_retires_older_invoke() {
        let (itf, _bell, rx) = interface(&config());
        *itf.state.lock() = InterfaceState::Started;
        let payload = InvokePayload { gid: 3, ..InvokePayload::default() };
        let old = TaskId::new(1, 0);
        let new = TaskId::new(1, 1);
        itf.send_process(3, old, payload).unwrap();
        itf.send_process(3, new, payload).unwrap();

        let retired = rx.try_recv().unwrap();
        assert_eq!((retired.task, retired.result), (old, InvokeResult::TIMED_OUT));
        assert_eq!(itf.outstanding_invokes(), 1);

        answer(&itf, status::OK);
        itf.drain_replies();
        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.task, new);
        assert!(reply.result.is_ok());
        assert!(rx.try_recv().is_err());
        assert_eq!(itf.stats().stale, 1);
    }

    #[test]
    fn expired_invoke_completes_with_timeout() {
        let (itf, _bell, rx) = interface(&config());
        *itf.state.lock() = InterfaceState::Started;
        let payload = InvokePayload { gid: 4, ..InvokePayload::default() };
        itf.send_process(4, TaskId::new(2, 0), payload).unwrap();
        assert_eq!(itf.check_invoke_deadlines(), 0);
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(itf.check_invoke_deadlines(), 1);
        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.result, InvokeResult::TIMED_OUT);

        // the late reply is dropped
        answer(&itf, status::OK);
        itf.drain_replies();
        assert!(rx.try_recv().is_err());
        assert_eq!(itf.stats().stale, 1);
    }

    #[test]
    fn graph_id_out_of_range_rejected() {
        let (itf, _bell, _rx) = interface(&config());
        *itf.state.lock() = InterfaceState::Started;
        let gid = u32::try_from(config().max_graphs).unwrap();
        let err = itf
            .process_command(MessageType::DestroyGraph, Payload::Empty, Some(gid))
            .unwrap_err();
        assert!(matches!(err, VertexError::InvalidArgument { .. }));
    }

    #[test]
    fn stop_sends_deinit_then_power_down() {
        let (itf, _bell, _rx) = interface(&config());
        let firmware = responder(&itf, status::OK, 60);
        itf.start(InitPayload::default()).unwrap();
        itf.stop().unwrap();
        firmware.join().unwrap();
        assert_eq!(itf.state(), InterfaceState::Stopped);
        assert_eq!(itf.stats().commands, 3);
        let urgent = itf.mailbox().snapshot()[ChannelId::H2fUrgent.slot()];
        assert_eq!(urgent.write, 1);
        itf.close().unwrap();
        assert_eq!(itf.state(), InterfaceState::Closed);
    }
}
