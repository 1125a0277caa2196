// SPDX-License-Identifier: AGPL-3.0-only

//! Software (in-process) firmware
//!
//! A thread that plays the coprocessor side of the mailbox: it waits for the
//! doorbell, drains the host → firmware rings (urgent first), executes each
//! command against a small graph table and answers on the matching
//! firmware → host ring before raising the interrupt line.
//!
//! Faults can be switched on at runtime:
//!
//! | Mode | Effect |
//! |------|--------|
//! | stalled | rings are never drained, so the host sees them fill up |
//! | silent | commands execute but no reply is written |
//! | injected status | the next N invokes reply with a failure status |
//!
//! Registers and the log ring are kept so timeouts produce realistic
//! diagnostic dumps.

use super::FirmwareConfig;
use crate::error::{Result, VertexError};
use crate::interface::{IrqLine, Platform};
use crate::mailbox::Mailbox;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};
use vertex_chip::limits::{MAX_GRAPHS, MAX_IO_BUFFERS, MAX_USER_PARAMS};
use vertex_chip::mailbox::ChannelId;
use vertex_chip::message::{
    invoke_flags, InvokeResponsePayload, Message, MessageType, Payload, ResponsePayload,
};
use vertex_chip::regs::{self, fw_status, DUMP_SET};
use vertex_chip::status;

/// Reply-ring write attempts before a reply is dropped
const REPLY_RETRIES: u32 = 100;

#[derive(Debug, Clone, Copy, Default)]
struct FwGraph {
    priority: u32,
    configured: bool,
    inputs: u32,
    outputs: u32,
    params: [u32; MAX_USER_PARAMS],
    invokes: u64,
}

#[derive(Debug)]
struct FwState {
    booted: bool,
    powered_down: bool,
    graphs: Vec<Option<FwGraph>>,
    registers: [u32; DUMP_SET.len()],
    log: VecDeque<String>,
    log_capacity: usize,
    sequence: u64,
    fail_invokes: u32,
    fail_status: i32,
}

impl FwState {
    fn register_mut(&mut self, offset: usize) -> Option<&mut u32> {
        let slot = DUMP_SET.iter().position(|(_, o)| *o == offset)?;
        self.registers.get_mut(slot)
    }

    fn set_register(&mut self, offset: usize, value: u32) {
        if let Some(r) = self.register_mut(offset) {
            *r = value;
        }
    }

    fn bump_register(&mut self, offset: usize) {
        if let Some(r) = self.register_mut(offset) {
            *r = r.wrapping_add(1);
        }
    }

    fn set_status_bits(&mut self, bits: u32, on: bool) {
        if let Some(r) = self.register_mut(regs::FW_STATUS) {
            if on {
                *r |= bits;
            } else {
                *r &= !bits;
            }
        }
    }

    fn log(&mut self, line: String) {
        self.sequence += 1;
        if self.log.len() >= self.log_capacity {
            self.log.pop_front();
        }
        self.log.push_back(format!("[{:06}] {line}", self.sequence));
    }

    fn graph_mut(&mut self, gid: u32) -> Option<&mut FwGraph> {
        self.graphs.get_mut(gid as usize).and_then(Option::as_mut)
    }
}

#[derive(Debug)]
struct Core {
    mailbox: Arc<Mailbox>,
    irq: IrqLine,
    state: Mutex<FwState>,
    stalled: AtomicBool,
    silent: AtomicBool,
    invoke_latency: Duration,
}

#[derive(Debug)]
struct Worker {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// In-process firmware speaking the mailbox protocol
#[derive(Debug)]
pub struct SoftwareFirmware {
    core: Arc<Core>,
    doorbell: Sender<()>,
    worker: Mutex<Option<Worker>>,
}

impl SoftwareFirmware {
    /// Start the firmware thread on `mailbox`, answering through `irq`.
    ///
    /// # Errors
    ///
    /// Returns error if the thread cannot be spawned.
    pub fn spawn(config: &FirmwareConfig, mailbox: Arc<Mailbox>, irq: IrqLine) -> Result<Arc<Self>> {
        let core = Arc::new(Core {
            mailbox,
            irq,
            state: Mutex::new(FwState {
                booted: false,
                powered_down: false,
                graphs: vec![None; MAX_GRAPHS],
                registers: [0; DUMP_SET.len()],
                log: VecDeque::with_capacity(config.log_capacity),
                log_capacity: config.log_capacity.max(1),
                sequence: 0,
                fail_invokes: config.fail_invokes,
                fail_status: config.fail_status,
            }),
            stalled: AtomicBool::new(config.stalled),
            silent: AtomicBool::new(config.silent),
            invoke_latency: config.invoke_latency,
        });
        let (doorbell, doorbell_rx) = bounded(1);
        let (stop, stop_rx) = bounded(1);
        let thread_core = Arc::clone(&core);
        let poll = config.poll_interval;
        let handle = std::thread::Builder::new()
            .name("vertex-fw".into())
            .spawn(move || thread_core.run(&doorbell_rx, &stop_rx, poll))?;
        info!(
            "SoftwareFirmware: started (latency {:?}, stalled={}, silent={})",
            config.invoke_latency, config.stalled, config.silent
        );
        Ok(Arc::new(Self {
            core,
            doorbell,
            worker: Mutex::new(Some(Worker { stop, handle })),
        }))
    }

    /// Stop draining the rings
    pub fn set_stalled(&self, stalled: bool) {
        self.core.stalled.store(stalled, Ordering::Release);
        if !stalled {
            self.signal();
        }
    }

    /// Stop writing replies
    pub fn set_silent(&self, silent: bool) {
        self.core.silent.store(silent, Ordering::Release);
    }

    /// Fail the next `count` invokes with `status`
    pub fn inject_invoke_status(&self, count: u32, status: i32) {
        let mut state = self.core.state.lock();
        state.fail_invokes = count;
        state.fail_status = status;
    }

    /// Whether INIT has been handled (and DEINIT has not)
    pub fn is_booted(&self) -> bool {
        self.core.state.lock().booted
    }

    /// Whether POWER_DOWN has been handled
    pub fn is_powered_down(&self) -> bool {
        self.core.state.lock().powered_down
    }

    /// Whether `gid` exists on the firmware side
    pub fn has_graph(&self, gid: u32) -> bool {
        self.core
            .state
            .lock()
            .graphs
            .get(gid as usize)
            .is_some_and(Option::is_some)
    }

    /// Invokes executed for `gid`
    pub fn invokes(&self, gid: u32) -> u64 {
        self.core
            .state
            .lock()
            .graph_mut(gid)
            .map_or(0, |g| g.invokes)
    }

    /// Last user parameters delivered to `gid`
    pub fn graph_params(&self, gid: u32) -> Option<[u32; MAX_USER_PARAMS]> {
        self.core.state.lock().graph_mut(gid).map(|g| g.params)
    }

    /// Stop the firmware thread; idempotent
    pub fn stop(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        let _ = worker.stop.send(());
        if worker.handle.join().is_err() {
            warn!("SoftwareFirmware: thread panicked");
        }
        debug!("SoftwareFirmware: stopped");
    }
}

impl Drop for SoftwareFirmware {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Platform for SoftwareFirmware {
    fn signal(&self) {
        // a pending doorbell already covers this write
        let _ = self.doorbell.try_send(());
    }

    fn register_dump(&self) -> Vec<(&'static str, u32)> {
        let state = self.core.state.lock();
        DUMP_SET
            .iter()
            .zip(state.registers)
            .map(|((name, _), value)| (*name, value))
            .collect()
    }

    fn firmware_log(&self) -> Vec<String> {
        self.core.state.lock().log.iter().cloned().collect()
    }
}

impl Core {
    fn run(&self, doorbell: &Receiver<()>, stop: &Receiver<()>, poll: Duration) {
        loop {
            select! {
                recv(doorbell) -> _ => {
                    self.state.lock().bump_register(regs::H2F_DOORBELL);
                }
                recv(stop) -> _ => break,
                default(poll) => {}
            }
            self.state.lock().bump_register(regs::FW_WATCHDOG);
            if !self.stalled.load(Ordering::Acquire) {
                self.service();
            }
        }
    }

    fn service(&self) {
        let mut replied = false;
        for channel in [ChannelId::H2fUrgent, ChannelId::H2fNormal] {
            loop {
                let msg = match self.mailbox.read(channel) {
                    Ok(Some(msg)) => msg,
                    Ok(None) => break,
                    Err(e) => {
                        self.state.lock().log(format!("dropped frame on {channel}: {e}"));
                        continue;
                    }
                };
                let reply = self.execute(&msg);
                if self.silent.load(Ordering::Acquire) {
                    continue;
                }
                if let Some(reply) = reply {
                    replied |= self.send(&reply);
                }
            }
        }
        if replied {
            self.state.lock().bump_register(regs::F2H_IRQ_STATUS);
            self.irq.raise();
        }
    }

    fn send(&self, reply: &Message) -> bool {
        let channel = ChannelId::f2h(reply.kind.is_urgent());
        for _ in 0..REPLY_RETRIES {
            match self.mailbox.write(channel, reply) {
                Ok(()) => return true,
                Err(VertexError::MailboxFull { .. }) => {
                    // the host drains on interrupt
                    self.irq.raise();
                    std::thread::sleep(Duration::from_micros(100));
                }
                Err(e) => {
                    warn!("SoftwareFirmware: cannot encode {}: {e}", reply.kind);
                    return false;
                }
            }
        }
        self.state
            .lock()
            .log(format!("{channel} full, {} trid={} dropped", reply.kind, reply.trid));
        false
    }

    fn execute(&self, msg: &Message) -> Option<Message> {
        {
            let mut state = self.state.lock();
            state.set_register(regs::FW_LAST_MSG, msg.kind as u32);
            state.set_register(regs::FW_LAST_TRID, msg.trid);
            state.bump_register(regs::FW_PC);
            state.set_status_bits(fw_status::BUSY, true);
        }
        let reply = match &msg.payload {
            Payload::Invoke(invoke) => {
                let status = self.invoke(
                    invoke.gid,
                    invoke.flags,
                    invoke.num_inputs,
                    invoke.num_outputs,
                    invoke.user_params,
                );
                let exec_us = if status == status::OK {
                    u64::try_from(self.invoke_latency.as_micros()).unwrap_or(u64::MAX)
                } else {
                    0
                };
                msg.reply(Payload::InvokeResponse(InvokeResponsePayload {
                    gid: invoke.gid,
                    status,
                    exec_us,
                }))
            }
            _ => {
                let status = self.control(msg);
                msg.reply(Payload::Response(ResponsePayload {
                    gid: msg.gid().unwrap_or(0),
                    status,
                }))
            }
        };
        let mut state = self.state.lock();
        state.set_status_bits(fw_status::BUSY, false);
        if let Some(reply) = &reply {
            let code = reply.status().unwrap_or(status::OK);
            state.log(format!(
                "{} trid={} -> {}",
                msg.kind,
                msg.trid,
                status::describe(code)
            ));
        }
        reply
    }

    fn control(&self, msg: &Message) -> i32 {
        let mut state = self.state.lock();
        if !state.booted && !matches!(msg.kind, MessageType::Init | MessageType::PowerDown) {
            return status::INTERNAL;
        }
        match &msg.payload {
            Payload::Init(init) => {
                state.booted = true;
                state.powered_down = false;
                state.set_status_bits(fw_status::BOOTED, true);
                state.set_status_bits(fw_status::POWERED_DOWN, false);
                state.log(format!(
                    "boot: log {:#x}+{} heap {:#x}+{}",
                    init.log_addr, init.log_size, init.heap_addr, init.heap_size
                ));
                status::OK
            }
            Payload::Empty if msg.kind == MessageType::Deinit => {
                state.booted = false;
                state.graphs.iter_mut().for_each(|g| *g = None);
                state.set_status_bits(fw_status::BOOTED, false);
                status::OK
            }
            Payload::Empty if msg.kind == MessageType::PowerDown => {
                state.powered_down = true;
                state.set_status_bits(fw_status::POWERED_DOWN, true);
                status::OK
            }
            Payload::CreateGraph(create) => match state.graphs.get_mut(create.gid as usize) {
                None => status::INVALID_PARAM,
                Some(Some(_)) => status::BUSY,
                Some(slot) => {
                    *slot = Some(FwGraph {
                        priority: create.priority,
                        ..FwGraph::default()
                    });
                    status::OK
                }
            },
            Payload::DestroyGraph(destroy) => match state.graphs.get_mut(destroy.gid as usize) {
                Some(slot) if slot.is_some() => {
                    *slot = None;
                    status::OK
                }
                _ => status::INVALID_GRAPH,
            },
            Payload::SetGraph(set) => {
                let in_range = (1..=MAX_IO_BUFFERS as u32).contains(&set.num_inputs)
                    && (1..=MAX_IO_BUFFERS as u32).contains(&set.num_outputs);
                let configured = match state.graph_mut(set.gid) {
                    None => return status::INVALID_GRAPH,
                    Some(_) if !in_range => return status::INVALID_PARAM,
                    Some(graph) => {
                        graph.configured = true;
                        graph.inputs = set.num_inputs;
                        graph.outputs = set.num_outputs;
                        *graph
                    }
                };
                state.log(format!(
                    "graph {}: {} in / {} out, priority {}, scratch {:#x}+{}",
                    set.gid,
                    configured.inputs,
                    configured.outputs,
                    configured.priority,
                    set.scratch.addr,
                    set.scratch.size
                ));
                status::OK
            }
            _ => status::UNSUPPORTED,
        }
    }

    fn invoke(
        &self,
        gid: u32,
        flags: u32,
        num_inputs: u32,
        num_outputs: u32,
        params: [u32; MAX_USER_PARAMS],
    ) -> i32 {
        {
            let mut state = self.state.lock();
            if !state.booted {
                return status::INTERNAL;
            }
            let in_range =
                num_inputs as usize <= MAX_IO_BUFFERS && num_outputs as usize <= MAX_IO_BUFFERS;
            let Some(graph) = state.graph_mut(gid) else {
                return status::INVALID_GRAPH;
            };
            if !graph.configured {
                return status::INVALID_GRAPH;
            }
            if !in_range {
                return status::INVALID_PARAM;
            }
            if flags & invoke_flags::UPDATE_PARAM != 0 {
                graph.params = params;
            }
            graph.invokes += 1;
            if state.fail_invokes > 0 {
                state.fail_invokes -= 1;
                return state.fail_status;
            }
        }
        if !self.invoke_latency.is_zero() {
            std::thread::sleep(self.invoke_latency);
        }
        status::OK
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MailboxConfig;
    use vertex_chip::message::{
        CreateGraphPayload, Geometry, InitPayload, InvokePayload, SetGraphPayload,
    };

    struct Rig {
        mailbox: Arc<Mailbox>,
        irq: Receiver<()>,
        fw: Arc<SoftwareFirmware>,
    }

    fn rig(config: &FirmwareConfig) -> Rig {
        let mailbox = Arc::new(Mailbox::new(&MailboxConfig::default()).unwrap());
        let (tx, irq) = bounded(1);
        let fw = SoftwareFirmware::spawn(config, Arc::clone(&mailbox), IrqLine::new(tx)).unwrap();
        Rig { mailbox, irq, fw }
    }

    impl Rig {
        fn call(&self, trid: u32, kind: MessageType, payload: Payload) -> Message {
            let msg = Message::new(trid, kind, payload);
            self.mailbox.write(ChannelId::h2f(kind.is_urgent()), &msg).unwrap();
            self.fw.signal();
            self.irq.recv_timeout(Duration::from_secs(2)).unwrap();
            self.mailbox
                .read(ChannelId::f2h(kind.is_urgent()))
                .unwrap()
                .unwrap()
        }

        fn boot_graph(&self, gid: u32) {
            self.call(1, MessageType::Init, Payload::Init(InitPayload::default()));
            self.call(
                2,
                MessageType::CreateGraph,
                Payload::CreateGraph(CreateGraphPayload { gid, priority: 5, flags: 0 }),
            );
            let mut set = SetGraphPayload {
                gid,
                num_inputs: 1,
                num_outputs: 1,
                ..SetGraphPayload::default()
            };
            set.inputs[0] = Geometry { format: 1, planes: 1, width: 4, height: 4 };
            self.call(3, MessageType::SetGraph, Payload::SetGraph(Box::new(set)));
        }

        fn invoke(&self, trid: u32, gid: u32, flags: u32) -> Message {
            let payload = InvokePayload {
                gid,
                flags,
                num_inputs: 1,
                num_outputs: 1,
                user_params: [9, 8, 7, 6],
                ..InvokePayload::default()
            };
            self.call(trid, MessageType::Invoke, Payload::Invoke(Box::new(payload)))
        }
    }

    fn fast() -> FirmwareConfig {
        FirmwareConfig::default().with_invoke_latency(Duration::ZERO)
    }

    #[test]
    fn commands_before_init_fail() {
        let rig = rig(&fast());
        let rsp = rig.call(
            4,
            MessageType::CreateGraph,
            Payload::CreateGraph(CreateGraphPayload::default()),
        );
        assert_eq!(rsp.kind, MessageType::CreateGraphRsp);
        assert_eq!(rsp.trid, 4);
        assert_eq!(rsp.status(), Some(status::INTERNAL));
    }

    #[test]
    fn graph_lifecycle() {
        let rig = rig(&fast());
        rig.boot_graph(3);
        assert!(rig.fw.is_booted());
        assert!(rig.fw.has_graph(3));

        let rsp = rig.invoke(5, 3, invoke_flags::UPDATE_PARAM);
        assert_eq!(rsp.kind, MessageType::InvokeRsp);
        assert_eq!(rsp.status(), Some(status::OK));
        assert_eq!(rig.fw.invokes(3), 1);
        assert_eq!(rig.fw.graph_params(3), Some([9, 8, 7, 6]));

        let rsp = rig.call(
            6,
            MessageType::DestroyGraph,
            Payload::DestroyGraph(vertex_chip::message::DestroyGraphPayload { gid: 3 }),
        );
        assert_eq!(rsp.status(), Some(status::OK));
        assert!(!rig.fw.has_graph(3));
    }

    #[test]
    fn invoke_needs_configured_graph() {
        let rig = rig(&fast());
        rig.call(1, MessageType::Init, Payload::Init(InitPayload::default()));
        assert_eq!(rig.invoke(2, 0, 0).status(), Some(status::INVALID_GRAPH));
    }

    #[test]
    fn injected_failures_run_out() {
        let rig = rig(&fast().with_invoke_failures(1, status::NO_RESOURCE));
        rig.boot_graph(0);
        assert_eq!(rig.invoke(4, 0, 0).status(), Some(status::NO_RESOURCE));
        assert_eq!(rig.invoke(5, 0, 0).status(), Some(status::OK));
    }

    #[test]
    fn power_down_uses_urgent_ring() {
        let rig = rig(&fast());
        let rsp = rig.call(9, MessageType::PowerDown, Payload::Empty);
        assert_eq!(rsp.kind, MessageType::PowerDownAck);
        assert!(rig.fw.is_powered_down());
    }

    #[test]
    fn stalled_firmware_leaves_ring_full() {
        let rig = rig(&fast().stalled());
        let msg = Message::new(1, MessageType::Deinit, Payload::Empty);
        let capacity = rig.mailbox.channel(ChannelId::H2fNormal).capacity();
        for _ in 0..capacity {
            rig.mailbox.write(ChannelId::H2fNormal, &msg).unwrap();
            rig.fw.signal();
        }
        std::thread::sleep(Duration::from_millis(30));
        assert!(rig.mailbox.channel(ChannelId::H2fNormal).is_full());

        rig.fw.set_stalled(false);
        rig.irq.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(rig.mailbox.channel(ChannelId::H2fNormal).is_empty());
    }

    #[test]
    fn registers_and_log_track_traffic() {
        let rig = rig(&fast());
        rig.call(7, MessageType::Init, Payload::Init(InitPayload::default()));
        let regs: std::collections::HashMap<_, _> = rig.fw.register_dump().into_iter().collect();
        assert_eq!(regs["FW_LAST_TRID"], 7);
        assert_eq!(regs["FW_LAST_MSG"], MessageType::Init as u32);
        assert_eq!(regs["FW_STATUS"] & fw_status::BOOTED, fw_status::BOOTED);
        let log = rig.fw.firmware_log();
        assert!(log.iter().any(|l| l.contains("INIT trid=7 -> ok")));
    }
}
