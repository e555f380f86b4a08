//! The transaction scheduler: four strict-priority queues, per-unit
//! delivery gating, callback and reply correlation, the nonce handshake
//! for secured traffic, and every bounded wait in the system.
//!
//! One mutex guards all of it. The mutex is never held across a wait:
//! both threads publish what they are waiting for into the core state,
//! release the lock, and block on the shared [Wakeup].

use crate::error::{Error, Result};
use crate::fields::{FieldId, FieldStore, FieldValue, FieldWriteRes};
use crate::timings::SchedTimings;
use crate::units::Unit;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use zwusb_cc::commands::{MultiChannelCmd, SecurityCmd};
use zwusb_cc::inmsg::InMsgClass;
use zwusb_cc::outmsg::OutMsgState;
use zwusb_cc::{security, InMsg, OutMsg};
use zwusb_core::prelude::*;
use zwusb_core::security::keys::{NetworkKey, SecurityKeys};
use zwusb_core::security::nonce::NonceTable;
use zwusb_logging::loggers::{DriverLogger, SecurityLogger, SerialLogger, UnitLogger};
use zwusb_logging::{Direction, ImmutableLogger, NullLogger};
use zwusb_serial::consts::MAX_CONSECUTIVE_NAKS;
use zwusb_serial::frame::{SerialControlByte, SerialFrame};
use zwusb_serial::link::{FrameReader, FrameWriter, LinkShared, Wakeup};

/// Scheduler-level resend attempts after the link layer gave up.
const MAX_SCHED_RETRIES: u32 = 3;

struct InFlight {
    msg: OutMsg,
    deadline: Instant,
}

struct ReplyWait {
    msg: OutMsg,
    deadline: Instant,
}

struct NonceWait {
    msgs: VecDeque<OutMsg>,
    deadline: Instant,
}

struct ResponseWait {
    function: u8,
    slot: Option<InMsg>,
}

#[derive(Default)]
struct SchedulerCore {
    queues: [VecDeque<OutMsg>; PRIORITY_COUNT],
    /// Sleeper traffic released by a wakeup notification; drained ahead
    /// of everything except SpecialCmd.
    drain_queue: VecDeque<OutMsg>,
    /// Traffic parked until its sleeper target wakes, per unit.
    wakeup_queues: BTreeMap<NodeId, VecDeque<OutMsg>>,
    /// A message being resent after a link-layer failure; it cuts the line.
    retry: Option<(OutMsg, u32)>,
    in_flight: BTreeMap<u8, InFlight>,
    reply_waits: Vec<ReplyWait>,
    nonce_waits: BTreeMap<NodeId, NonceWait>,
    response_wait: Option<ResponseWait>,
    units: BTreeMap<NodeId, Unit>,
    /// Manufacturer ids reported by nodes not yet bound, for the
    /// interview flow.
    pending_manufacturer: BTreeMap<NodeId, ManufacturerId>,
    /// Ack ids of in-progress background polls. A poll attempt is
    /// charged once, on the poll ladder at dispatch; when one of these
    /// later times out, [Scheduler::charge_failure_locked] must not
    /// strike the impl a second time.
    poll_acks: BTreeSet<u32>,
    stopping: bool,
}

impl SchedulerCore {
    /// Whether any traffic for this unit is still somewhere in the
    /// pipeline. Gates the wakeup close-out.
    fn has_pending_traffic(&self, node: NodeId) -> bool {
        self.queues
            .iter()
            .flatten()
            .chain(self.drain_queue.iter())
            .any(|m| m.target() == node)
            || self.retry.as_ref().map(|(m, _)| m.target() == node).unwrap_or(false)
            || self.in_flight.values().any(|f| f.msg.target() == node)
            || self.reply_waits.iter().any(|w| w.msg.target() == node)
            || self.nonce_waits.contains_key(&node)
    }
}

struct SecurityState {
    keys: SecurityKeys,
    network_key: NetworkKey,
    nonces: NonceTable,
}

pub struct Scheduler {
    core: Mutex<SchedulerCore>,
    security: Mutex<SecurityState>,
    own_node_id: Mutex<NodeId>,
    wakeup: Arc<Wakeup>,
    link: Arc<LinkShared>,
    fields: Arc<dyn FieldStore>,
    timings: SchedTimings,
    log: DriverLogger,
    sec_log: SecurityLogger,
    serial_log: SerialLogger,
    unit_log: UnitLogger,
}

impl Scheduler {
    pub fn new(
        fields: Arc<dyn FieldStore>,
        network_key: NetworkKey,
        timings: SchedTimings,
        logger: Option<Arc<dyn ImmutableLogger>>,
    ) -> Arc<Self> {
        let logger = logger.unwrap_or_else(|| Arc::new(NullLogger));
        let wakeup = Arc::new(Wakeup::default());
        Arc::new(Self {
            core: Mutex::new(SchedulerCore::default()),
            security: Mutex::new(SecurityState {
                keys: SecurityKeys::derive(&network_key),
                network_key,
                nonces: NonceTable::new(),
            }),
            own_node_id: Mutex::new(NodeId::new(1)),
            wakeup: wakeup.clone(),
            link: Arc::new(LinkShared::new(wakeup)),
            fields,
            timings,
            log: DriverLogger::new(logger.clone()),
            sec_log: SecurityLogger::new(logger.clone()),
            serial_log: SerialLogger::new(logger.clone()),
            unit_log: UnitLogger::new(logger),
        })
    }

    pub fn link(&self) -> Arc<LinkShared> {
        self.link.clone()
    }

    pub fn fields(&self) -> Arc<dyn FieldStore> {
        self.fields.clone()
    }

    pub fn wakeup(&self) -> Arc<Wakeup> {
        self.wakeup.clone()
    }

    pub fn set_own_node_id(&self, id: NodeId) {
        *self.own_node_id.lock().expect("scheduler lock poisoned") = id;
    }

    pub fn own_node_id(&self) -> NodeId {
        *self.own_node_id.lock().expect("scheduler lock poisoned")
    }

    /// Install a new network key and re-derive the working keys.
    pub fn set_network_key(&self, key: NetworkKey) {
        let mut sec = self.security.lock().expect("scheduler lock poisoned");
        sec.keys = SecurityKeys::derive(&key);
        sec.network_key = key;
    }

    // ------------------------------------------------------------------
    // Unit management (called by the driver facade)
    // ------------------------------------------------------------------

    pub fn add_unit(&self, unit: Unit) {
        let mut core = self.core.lock().expect("scheduler lock poisoned");
        core.units.insert(unit.node(), unit);
    }

    pub fn with_unit<R>(&self, node: NodeId, f: impl FnOnce(&Unit) -> R) -> Option<R> {
        let core = self.core.lock().expect("scheduler lock poisoned");
        core.units.get(&node).map(f)
    }

    pub fn unit_nodes(&self) -> Vec<NodeId> {
        let core = self.core.lock().expect("scheduler lock poisoned");
        core.units.keys().copied().collect()
    }

    /// Consume the manufacturer id a node reported during its interview.
    pub fn take_manufacturer_report(&self, node: NodeId) -> Option<ManufacturerId> {
        let mut core = self.core.lock().expect("scheduler lock poisoned");
        core.pending_manufacturer.remove(&node)
    }

    // ------------------------------------------------------------------
    // Enqueue and host-facing entry points
    // ------------------------------------------------------------------

    /// Queue a message. Sleeper-bound traffic (except SpecialCmd) parks in
    /// the unit's wakeup queue instead.
    pub fn enqueue(&self, msg: OutMsg) {
        let mut core = self.core.lock().expect("scheduler lock poisoned");
        self.enqueue_locked(&mut core, msg);
        drop(core);
        self.wakeup.notify();
    }

    fn enqueue_locked(&self, core: &mut SchedulerCore, msg: OutMsg) {
        let target = msg.target();
        let gate_on_sleep = msg.priority() != MessagePriority::SpecialCmd
            && core
                .units
                .get(&target)
                .map(|u| u.listener() == ListenerClass::Sleeper && !u.is_awake())
                .unwrap_or(false);
        if gate_on_sleep {
            core.wakeup_queues.entry(target).or_default().push_back(msg);
        } else {
            core.queues[msg.priority().index()].push_back(msg);
        }
    }

    /// Host write path: find the owning unit and let its impls build the
    /// protocol request.
    pub fn write_field(&self, field_id: FieldId, value: &FieldValue) -> FieldWriteRes {
        let now = Instant::now();
        let mut out = Vec::new();
        let mut core = self.core.lock().expect("scheduler lock poisoned");
        let res = match core.units.values_mut().find(|u| u.owns_field(field_id)) {
            Some(unit) => unit.on_field_written(field_id, value, self.fields.as_ref(), &mut out, now),
            None => return FieldWriteRes::Unhandled,
        };
        for msg in out {
            self.enqueue_locked(&mut core, msg);
        }
        drop(core);
        self.wakeup.notify();
        res
    }

    /// Submit a controller-local request and block for its response frame.
    /// Used by the driver bootstrap only.
    pub fn request_response(&self, msg: OutMsg, timeout: Duration) -> Result<InMsg> {
        let function = msg.function().id();
        {
            let mut core = self.core.lock().expect("scheduler lock poisoned");
            if core.stopping {
                return Err(Error::Stopping);
            }
            core.response_wait = Some(ResponseWait {
                function,
                slot: None,
            });
            self.enqueue_locked(&mut core, msg);
        }
        self.wakeup.notify();

        let deadline = Instant::now() + timeout;
        loop {
            let seen = self.wakeup.generation();
            {
                let mut core = self.core.lock().expect("scheduler lock poisoned");
                if core.stopping {
                    core.response_wait = None;
                    return Err(Error::Stopping);
                }
                if let Some(reply) = core.response_wait.as_mut().and_then(|w| w.slot.take()) {
                    core.response_wait = None;
                    return Ok(reply);
                }
            }
            if Instant::now() >= deadline {
                let mut core = self.core.lock().expect("scheduler lock poisoned");
                core.response_wait = None;
                return Err(Error::Timeout);
            }
            self.wakeup.wait_past(seen, deadline);
        }
    }

    /// Begin shutdown: every parked wait resolves with a synthetic
    /// driver-stopping outcome, then the threads unwind.
    pub fn shutdown(&self) {
        let mut core = self.core.lock().expect("scheduler lock poisoned");
        core.stopping = true;
        let cancelled = core.queues.iter().map(|q| q.len()).sum::<usize>()
            + core.drain_queue.len()
            + core.in_flight.len()
            + core.reply_waits.len()
            + core.nonce_waits.values().map(|w| w.msgs.len()).sum::<usize>();
        for queue in core.queues.iter_mut() {
            queue.clear();
        }
        core.drain_queue.clear();
        core.wakeup_queues.clear();
        core.in_flight.clear();
        core.reply_waits.clear();
        core.nonce_waits.clear();
        core.poll_acks.clear();
        core.retry = None;
        drop(core);

        if cancelled > 0 {
            self.log
                .warn(format!("driver stopping, cancelled {cancelled} pending messages"));
        }
        self.link.shutdown();
        self.wakeup.notify();
    }

    pub fn is_stopping(&self) -> bool {
        self.core.lock().expect("scheduler lock poisoned").stopping
    }

    // ------------------------------------------------------------------
    // Writer thread
    // ------------------------------------------------------------------

    /// The writer/scheduler thread body: drain queues by priority, run
    /// the timers, sweep polls, sleep bounded when idle.
    pub fn run_writer(&self, mut writer: FrameWriter) {
        let mut last_sweep = Instant::now();
        loop {
            if writer.service_requests().is_err() {
                return;
            }

            let now = Instant::now();
            if now.duration_since(last_sweep) >= self.timings.sweep {
                last_sweep = now;
                self.sweep(now);
            }

            enum Action {
                Stop,
                Send(OutMsg, u32),
                Idle(Instant),
            }

            let seen = self.wakeup.generation();
            let action = {
                let mut core = self.core.lock().expect("scheduler lock poisoned");
                if core.stopping {
                    Action::Stop
                } else if let Some((msg, attempts)) = self.next_msg_locked(&mut core) {
                    Action::Send(msg, attempts)
                } else {
                    let deadline = self
                        .next_deadline_locked(&core)
                        .unwrap_or(now + self.timings.sweep)
                        .min(now + self.timings.sweep);
                    Action::Idle(deadline)
                }
            };

            match action {
                Action::Stop => return,
                Action::Send(msg, attempts) => self.transmit(&mut writer, msg, attempts),
                Action::Idle(deadline) => {
                    self.wakeup.wait_past(seen, deadline);
                }
            }
        }
    }

    /// Timer expirations and due polls.
    fn sweep(&self, now: Instant) {
        let mut out = Vec::new();
        {
            let mut core = self.core.lock().expect("scheduler lock poisoned");

            // TransAck timeouts
            let expired: Vec<u8> = core
                .in_flight
                .iter()
                .filter(|(_, f)| now >= f.deadline)
                .map(|(cb, _)| *cb)
                .collect();
            for cb in expired {
                let flight = core.in_flight.remove(&cb).expect("key just seen");
                self.log.warn(format!(
                    "no transmit callback for cb {cb:#04x} (node {})",
                    flight.msg.target()
                ));
                self.charge_failure_locked(&mut core, &flight.msg, now);
            }

            // Reply timeouts
            let mut timed_out = Vec::new();
            core.reply_waits.retain_mut(|wait| {
                if now >= wait.deadline {
                    timed_out.push(wait.msg.clone());
                    false
                } else {
                    true
                }
            });
            for msg in timed_out {
                self.log.warn(format!(
                    "no reply from node {} for class {:#04x}",
                    msg.target(),
                    msg.reply_class()
                ));
                self.charge_failure_locked(&mut core, &msg, now);
            }

            // Nonce waits that ran out
            let expired: Vec<NodeId> = core
                .nonce_waits
                .iter()
                .filter(|(_, w)| now >= w.deadline)
                .map(|(node, _)| *node)
                .collect();
            for node in expired {
                let wait = core.nonce_waits.remove(&node).expect("key just seen");
                self.sec_log.dropped(node, "no nonce report within the window");
                for msg in &wait.msgs {
                    self.charge_failure_locked(&mut core, msg, now);
                }
            }

            // Polls. Each dispatched query already took its strike on the
            // poll ladder, so remember the ack ids: their later timeout
            // must not count again.
            let fields = self.fields.as_ref();
            {
                let core = &mut *core;
                for unit in core.units.values_mut() {
                    let first = out.len();
                    unit.process_polls(fields, &mut out, now);
                    for msg in &out[first..] {
                        core.poll_acks.insert(msg.ack_id());
                    }
                }
            }

            // Nonce table hygiene
            self.security
                .lock()
                .expect("scheduler lock poisoned")
                .nonces
                .prune(now);

            // Wakeup close-outs: an awake sleeper with nothing left
            // pending gets its NoMoreInformation
            let done: Vec<NodeId> = core
                .units
                .values()
                .filter(|u| u.is_awake() && u.listener() == ListenerClass::Sleeper)
                .map(|u| u.node())
                .filter(|n| !core.has_pending_traffic(*n))
                .collect();
            for node in done {
                if let Some(unit) = core.units.get_mut(&node) {
                    unit.wakeup_done();
                }
                self.unit_log.message(node, "queue drained, sending no-more-information");
                out.push(crate::ccimpl::admin::build_no_more_information(node));
            }

            for msg in out.drain(..) {
                self.enqueue_locked(&mut core, msg);
            }
        }
        self.wakeup.notify();
    }

    /// Strict priority pop with sleeper gating: SpecialCmd, then the
    /// wakeup drain queue, then Command, Query, Async.
    fn next_msg_locked(&self, core: &mut SchedulerCore) -> Option<(OutMsg, u32)> {
        if let Some((msg, attempts)) = core.retry.take() {
            return Some((msg, attempts));
        }
        if let Some(msg) = core.queues[MessagePriority::SpecialCmd.index()].pop_front() {
            return Some((msg, 0));
        }
        if let Some(msg) = core.drain_queue.pop_front() {
            return Some((msg, 0));
        }
        for priority in [
            MessagePriority::Command,
            MessagePriority::Query,
            MessagePriority::Async,
        ] {
            while let Some(msg) = core.queues[priority.index()].pop_front() {
                let target = msg.target();
                let asleep = core
                    .units
                    .get(&target)
                    .map(|u| u.listener() == ListenerClass::Sleeper && !u.is_awake())
                    .unwrap_or(false);
                if asleep {
                    core.wakeup_queues.entry(target).or_default().push_back(msg);
                    continue;
                }
                return Some((msg, 0));
            }
        }
        None
    }

    fn next_deadline_locked(&self, core: &SchedulerCore) -> Option<Instant> {
        let flight = core.in_flight.values().map(|f| f.deadline).min();
        let reply = core.reply_waits.iter().map(|w| w.deadline).min();
        let nonce = core.nonce_waits.values().map(|w| w.deadline).min();
        let poll = core.units.values().filter_map(|u| u.next_poll_at()).min();
        [flight, reply, nonce, poll].into_iter().flatten().min()
    }

    /// Send one message: run the nonce handshake for secured traffic,
    /// write the frame, wait out the link layer, and record whatever
    /// wait comes next.
    fn transmit(&self, writer: &mut FrameWriter, mut msg: OutMsg, prior_attempts: u32) {
        let now = Instant::now();

        // A secured message first needs a nonce from its target
        if msg.state() == OutMsgState::WaitEncrypt {
            let target = msg.target();
            let nonce_get = {
                let mut core = self.core.lock().expect("scheduler lock poisoned");
                let wait = core.nonce_waits.entry(target).or_insert_with(|| NonceWait {
                    msgs: VecDeque::new(),
                    deadline: now + self.timings.nonce_wait,
                });
                wait.msgs.push_back(msg);
                // Only the first parked message triggers the handshake
                (wait.msgs.len() == 1).then(|| security::build_nonce_get(target))
            };
            self.sec_log.nonce_requested(target);
            if let Some(nonce_get) = nonce_get {
                self.transmit(writer, nonce_get, 0);
            }
            return;
        }

        let bytes = msg.as_bytes().to_vec();
        self.serial_log.data(&bytes, Direction::Outbound);

        match writer.send_data(&bytes, msg.freq_listener()) {
            Ok(()) => {
                msg.note_send(1);
                self.log
                    .sent(msg.target(), msg.ack_id(), msg.callback_id());
                let mut core = self.core.lock().expect("scheduler lock poisoned");
                if msg.needs_callback() {
                    let cb = msg.callback_id().expect("needs_callback implies id");
                    core.in_flight.insert(
                        cb,
                        InFlight {
                            msg,
                            deadline: Instant::now() + self.timings.trans_ack,
                        },
                    );
                } else if msg.expects_reply() && !is_nonce_get(&msg) {
                    let deadline = Instant::now() + self.reply_timeout(msg.priority());
                    core.reply_waits.push(ReplyWait { msg, deadline });
                }
            }
            Err(zwusb_serial::Error::Stopping) => {}
            Err(err) => {
                let mut core = self.core.lock().expect("scheduler lock poisoned");
                let attempts = prior_attempts + 1;
                if attempts < MAX_SCHED_RETRIES {
                    self.log.warn(format!(
                        "link send failed ({err}), retry {attempts} for node {}",
                        msg.target()
                    ));
                    msg.update_callback();
                    core.retry = Some((msg, attempts));
                } else {
                    self.log.error(format!(
                        "giving up on message to node {} after {attempts} attempts ({err})",
                        msg.target()
                    ));
                    let now = Instant::now();
                    self.charge_failure_locked(&mut core, &msg, now);
                }
            }
        }
    }

    fn reply_timeout(&self, priority: MessagePriority) -> Duration {
        match priority {
            MessagePriority::Command => self.timings.reply_command,
            _ => self.timings.reply_query,
        }
    }

    /// Charge a transport failure to the owning unit's impls. A failed
    /// background poll was already accounted on the poll ladder at
    /// dispatch and takes no second strike here.
    fn charge_failure_locked(&self, core: &mut SchedulerCore, msg: &OutMsg, now: Instant) {
        if core.poll_acks.remove(&msg.ack_id()) {
            self.unit_log
                .message(msg.target(), "poll went unanswered");
            return;
        }
        let class = effective_class(msg);
        if let Some(unit) = core.units.get_mut(&msg.target()) {
            unit.note_comm_failure(class, self.fields.as_ref(), now);
            if unit.comm_failures() == 1 {
                self.unit_log
                    .message(unit.node(), "transport failure charged");
            }
        }
    }

    // ------------------------------------------------------------------
    // Reader thread
    // ------------------------------------------------------------------

    /// The reader thread body: pull frames, answer control flow, and
    /// dispatch data frames into the scheduler state.
    pub fn run_reader(&self, mut reader: FrameReader) {
        loop {
            if self.is_stopping() {
                return;
            }
            let frame = match reader.poll_frame(Duration::from_millis(100)) {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(err) => {
                    if !self.is_stopping() {
                        self.log.error(format!("serial read failed: {err}"));
                    }
                    return;
                }
            };
            match frame {
                SerialFrame::ACK => {
                    self.serial_log.control_flow("ACK", Direction::Inbound);
                    self.link.offer_control(SerialControlByte::ACK);
                }
                SerialFrame::NAK => {
                    self.serial_log.control_flow("NAK", Direction::Inbound);
                    self.link.offer_control(SerialControlByte::NAK);
                }
                SerialFrame::CAN => {
                    self.serial_log.control_flow("CAN", Direction::Inbound);
                    self.link.offer_control(SerialControlByte::CAN);
                }
                SerialFrame::Garbage(data) => self.serial_log.discarded(&data),
                SerialFrame::Data(data) => {
                    self.serial_log.data(data.as_ref(), Direction::Inbound);
                    if !data.checksum_ok() {
                        let naks = self.link.request_nak();
                        if naks > MAX_CONSECUTIVE_NAKS {
                            self.serial_log.link_failure(naks);
                        }
                        continue;
                    }
                    self.link.request_ack();
                    if let Some(msg) = InMsg::from_message(data.message(), Instant::now()) {
                        self.dispatch_in(msg);
                    }
                }
            }
        }
    }

    /// Classify and dispatch one inbound message.
    pub fn dispatch_in(&self, msg: InMsg) {
        match msg.classify() {
            InMsgClass::Response => self.handle_response(msg),
            InMsgClass::TransAck => self.handle_trans_ack(msg),
            InMsgClass::AppCmd => self.handle_app_cmd(msg, 0),
            InMsgClass::AppUpdate => self.handle_app_update(msg),
            InMsgClass::OtherRequest => {
                self.log.unhandled_frame(msg.function_id());
            }
        }
    }

    fn handle_response(&self, msg: InMsg) {
        let function = msg.function_id();
        let mut core = self.core.lock().expect("scheduler lock poisoned");
        let matched = match &mut core.response_wait {
            Some(wait) if wait.function == function && wait.slot.is_none() => {
                wait.slot = Some(msg);
                true
            }
            _ => false,
        };
        drop(core);
        if matched {
            self.wakeup.notify();
        } else {
            // SEND_DATA submit confirmations and the like
            self.log
                .message(format!("response for function {function:#04x}"));
        }
    }

    fn handle_trans_ack(&self, msg: InMsg) {
        let (Some(cb), Some(status)) = (msg.trans_ack_callback(), msg.trans_ack_status()) else {
            self.log.unhandled_frame(msg.function_id());
            return;
        };
        self.log.trans_ack(cb, status);

        let now = Instant::now();
        let mut out = Vec::new();
        {
            let mut core = self.core.lock().expect("scheduler lock poisoned");
            let Some(flight) = core.in_flight.remove(&cb) else {
                self.log.message(format!("transmit callback for unknown cb {cb:#04x}"));
                return;
            };
            let flight_msg = flight.msg;

            if status == TransmitStatus::Ok {
                if flight_msg.expects_reply() && !is_nonce_get(&flight_msg) {
                    let deadline = now + self.reply_timeout(flight_msg.priority());
                    core.reply_waits.push(ReplyWait {
                        msg: flight_msg.clone(),
                        deadline,
                    });
                }
                let ack_id = flight_msg.ack_id();
                let target = flight_msg.target();
                if let Some(unit) = core.units.get_mut(&target) {
                    unit.on_write_delivered(ack_id, self.fields.as_ref(), &mut out, now);
                }
            } else {
                self.charge_failure_locked(&mut core, &flight_msg, now);
            }

            for m in out.drain(..) {
                self.enqueue_locked(&mut core, m);
            }
        }
        self.wakeup.notify();
    }

    /// Application commands, potentially multiple layers deep in
    /// encapsulation. `depth` stops a malicious nesting loop.
    fn handle_app_cmd(&self, msg: InMsg, depth: u8) {
        if depth > 2 {
            return;
        }
        let Some(src) = msg.src_node() else {
            return;
        };

        // Security encapsulation: decrypt and recurse with the inner frame
        if msg.is_security_encap() {
            let own_id = self.own_node_id();
            let now = Instant::now();
            let decrypted = {
                let mut sec = self.security.lock().expect("scheduler lock poisoned");
                let SecurityState { keys, nonces, .. } = &mut *sec;
                security::decrypt_in(&msg, keys, own_id, nonces, now)
            };
            match decrypted {
                Ok(result) => {
                    if result.wants_nonce {
                        self.issue_nonce(src);
                    }
                    self.handle_app_cmd(result.msg, depth + 1);
                }
                Err(err) => {
                    self.sec_log.dropped(src, decrypt_error_text(err));
                }
            }
            return;
        }

        // Multi-channel encapsulation: strip and recurse
        if msg.is_multi_channel_encap() {
            match msg.strip_multi_channel() {
                Some(inner) => self.handle_app_cmd(inner, depth + 1),
                None => self.log.unhandled_frame(msg.function_id()),
            }
            return;
        }

        let (Some(class), Some(cmd)) = (msg.class_id(), msg.cmd_id()) else {
            return;
        };

        // Security command class plumbing
        if class == CommandClass::Security.id() {
            if self.handle_security_cmd(src, cmd, &msg) {
                return;
            }
        }

        // Wakeup notifications release the unit's parked traffic
        if msg.is_wakeup_notification() {
            self.handle_wakeup(src);
            return;
        }

        // Manufacturer reports feed the interview flow when the node has
        // no unit yet
        if class == CommandClass::ManufacturerSpecific.id()
            && cmd == zwusb_cc::commands::ManufacturerSpecificCmd::Report as u8
        {
            if let Some(id) = msg.cc_bytes().and_then(|cc| ManufacturerId::from_report(&cc[2..])) {
                let mut core = self.core.lock().expect("scheduler lock poisoned");
                core.pending_manufacturer.insert(src, id);
                if let Some(pos) = core
                    .reply_waits
                    .iter()
                    .position(|w| w.msg.is_expected_reply(src, class, cmd))
                {
                    core.reply_waits.remove(pos);
                }
                drop(core);
                self.wakeup.notify();
                return;
            }
        }

        let now = Instant::now();
        let mut out = Vec::new();
        let handled = {
            let mut core = self.core.lock().expect("scheduler lock poisoned");

            // Resolve a pending reply wait first
            if let Some(pos) = core
                .reply_waits
                .iter()
                .position(|w| w.msg.is_expected_reply(src, class, cmd))
            {
                let wait = core.reply_waits.remove(pos);
                core.poll_acks.remove(&wait.msg.ack_id());
            }

            let handled = match core.units.get_mut(&src) {
                Some(unit) => unit.handle_app_cmd(&msg, self.fields.as_ref(), &mut out, now),
                None => false,
            };
            for m in out.drain(..) {
                self.enqueue_locked(&mut core, m);
            }
            handled
        };
        if !handled {
            self.log.message(format!(
                "unhandled command from node {src}: class {class:#04x} cmd {cmd:#04x}"
            ));
        }
        self.wakeup.notify();
    }

    /// The Security CC traffic the engine answers itself. Returns true
    /// when the command was consumed.
    fn handle_security_cmd(&self, src: NodeId, cmd: u8, msg: &InMsg) -> bool {
        if cmd == SecurityCmd::NonceGet as u8 {
            self.issue_nonce(src);
            return true;
        }

        if cmd == SecurityCmd::NonceReport as u8 {
            let Some(nonce) = security::nonce_from_report(msg) else {
                self.sec_log.dropped(src, "malformed nonce report");
                return true;
            };
            self.resume_nonce_wait(src, nonce);
            return true;
        }

        if cmd == SecurityCmd::SchemeGet as u8 {
            // Inclusion key exchange: we support scheme 0 only
            let own = self.own_node_id();
            let mut reply = OutMsg::new_cc(
                src,
                CommandClass::Security,
                SecurityCmd::SchemeReport as u8,
                0,
                3,
                MessagePriority::SpecialCmd,
            );
            reply.append_byte(0x00);
            reply.append_transmit_options(true);
            reply.append_null_callback();
            reply.finalize(false, false, false);
            self.log
                .message(format!("security scheme requested by node {src} (controller {own})"));
            self.enqueue(reply);
            return true;
        }

        if cmd == SecurityCmd::NetworkKeySet as u8 {
            // Arrives under the default all-zero key during inclusion
            if !msg.was_secure() {
                self.sec_log.dropped(src, "network key set outside secure envelope");
                return true;
            }
            let Some(cc) = msg.cc_bytes() else {
                return true;
            };
            let Ok(key) = NetworkKey::try_from(&cc[2..]) else {
                self.sec_log.dropped(src, "network key with bad length");
                return true;
            };
            self.set_network_key(key);
            let mut reply = OutMsg::new_cc(
                src,
                CommandClass::Security,
                SecurityCmd::NetworkKeyVerify as u8,
                0,
                2,
                MessagePriority::SpecialCmd,
            );
            reply.append_transmit_options(true);
            reply.append_callback(false);
            reply.finalize(false, true, false);
            self.enqueue(reply);
            return true;
        }

        false
    }

    /// Answer a Nonce Get: issue, remember, report.
    fn issue_nonce(&self, src: NodeId) {
        let nonce = {
            let mut sec = self.security.lock().expect("scheduler lock poisoned");
            sec.nonces.generate(src, Instant::now())
        };
        self.sec_log.nonce_issued(src, nonce.id());
        self.enqueue(security::build_nonce_report(src, &nonce));
    }

    /// A nonce report arrived: encrypt the first parked message and put
    /// it back at the head of its priority. More parked messages restart
    /// the handshake.
    fn resume_nonce_wait(&self, src: NodeId, nonce: zwusb_core::security::nonce::S0Nonce) {
        let own_id = self.own_node_id();
        let mut follow_up = None;
        {
            let mut core = self.core.lock().expect("scheduler lock poisoned");
            let (msg_opt, has_more) = match core.nonce_waits.get_mut(&src) {
                Some(wait) => {
                    let msg_opt = wait.msgs.pop_front();
                    let has_more = !wait.msgs.is_empty();
                    if has_more {
                        wait.deadline = Instant::now() + self.timings.nonce_wait;
                    }
                    (msg_opt, has_more)
                }
                None => {
                    self.sec_log.dropped(src, "unexpected nonce report");
                    return;
                }
            };
            if has_more {
                // More parked traffic needs its own nonce
                follow_up = Some(security::build_nonce_get(src));
            } else {
                core.nonce_waits.remove(&src);
            }
            let Some(mut msg) = msg_opt else {
                return;
            };

            {
                let sec = self.security.lock().expect("scheduler lock poisoned");
                msg.encrypt(&sec.keys, own_id, &nonce);
            }
            // Same ack id, fresh callback id
            msg.update_callback();
            core.queues[msg.priority().index()].push_front(msg);
        }
        if let Some(follow_up) = follow_up {
            self.enqueue(follow_up);
        }
        self.wakeup.notify();
    }

    /// Wakeup notification: liveness, read-on-wake queries, and the
    /// parked queue moves into the drain queue ahead of general traffic.
    fn handle_wakeup(&self, src: NodeId) {
        let now = Instant::now();
        let mut out = Vec::new();
        {
            let mut core = self.core.lock().expect("scheduler lock poisoned");
            if let Some(unit) = core.units.get_mut(&src) {
                unit.on_wakeup(self.fields.as_ref(), &mut out, now);
            }
            self.unit_log.message(src, "wakeup notification");

            if let Some(mut parked) = core.wakeup_queues.remove(&src) {
                while let Some(msg) = parked.pop_front() {
                    core.drain_queue.push_back(msg);
                }
            }
            for m in out.drain(..) {
                self.enqueue_locked(&mut core, m);
            }
        }
        self.wakeup.notify();
    }

    fn handle_app_update(&self, msg: InMsg) {
        let Some(src) = msg.src_node() else {
            return;
        };
        let now = Instant::now();
        let mut core = self.core.lock().expect("scheduler lock poisoned");
        if let Some(unit) = core.units.get_mut(&src) {
            unit.on_node_info(self.fields.as_ref(), now);
        }
    }
}

fn is_nonce_get(msg: &OutMsg) -> bool {
    msg.is_cc()
        && msg.cc_class() == CommandClass::Security.id()
        && msg.cc_cmd() == SecurityCmd::NonceGet as u8
}

/// The class to charge a failure against: the plaintext class for
/// messages that were encrypted in place, and the inner class for
/// endpoint-encapsulated ones.
fn effective_class(msg: &OutMsg) -> Option<u8> {
    if !msg.is_cc() {
        return None;
    }
    let msg = msg.original().unwrap_or(msg);
    let cc = msg.cc_bytes();
    if cc.first() == Some(&CommandClass::MultiChannel.id())
        && cc.get(1) == Some(&(MultiChannelCmd::CmdEncap as u8))
    {
        return cc.get(4).copied();
    }
    cc.first().copied()
}

fn decrypt_error_text(err: security::DecryptError) -> &'static str {
    match err {
        security::DecryptError::Malformed => "malformed security encapsulation",
        security::DecryptError::NonceMissing => "nonce missing or expired",
        security::DecryptError::MacMismatch => "MAC verification failed",
    }
}
