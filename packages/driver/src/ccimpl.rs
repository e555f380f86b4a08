//! The command-class implementation object model: the polymorphic unit of
//! work that turns protocol reports into host field values and host field
//! writes into protocol requests. One trait with contained concrete
//! variants; composites hold several impls rather than inheriting.

pub mod admin;

mod battery;
pub use battery::BatteryImpl;

mod binary;
pub use binary::{BinaryCarrier, BinaryImpl};

mod color_switch;
pub use color_switch::ColorSwitchImpl;

mod door_lock;
pub use door_lock::DoorLockImpl;

mod level;
pub use level::{LevelCarrier, LevelImpl};

mod meter;
pub use meter::MeterImpl;

mod ml_sensor;
pub use ml_sensor::{MlSensorImpl, MlSensorKind};

mod node_naming;
pub use node_naming::NodeNamingImpl;

mod notification;
pub use notification::{EvType, NotIdType, NotificationImpl};

mod scene;
pub use scene::SceneActivationImpl;

mod thermostat;
pub use thermostat::{
    ThermostatModeImpl, ThermostatSetPointImpl, SETPOINT_COOLING, SETPOINT_HEATING,
};

use crate::device_info::XInfoItem;
use crate::error::{Error, Result};
use crate::fields::{FieldDef, FieldId, FieldStore, FieldValue, FieldWriteRes};
use std::time::{Duration, Instant};
use zwusb_cc::outmsg::OutMsg;
use zwusb_core::prelude::*;

/// Access capabilities of one impl.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccessFlags(u8);

impl AccessFlags {
    pub const READ: AccessFlags = AccessFlags(0x01);
    pub const WRITE: AccessFlags = AccessFlags(0x02);
    pub const READ_ON_WAKE: AccessFlags = AccessFlags(0x04);
    pub const READ_AFTER_WRITE: AccessFlags = AccessFlags(0x08);

    pub fn or(self, other: AccessFlags) -> AccessFlags {
        AccessFlags(self.0 | other.0)
    }

    pub fn has(&self, flag: AccessFlags) -> bool {
        self.0 & flag.0 != 0
    }

    pub fn readable(&self) -> bool {
        self.has(Self::READ)
    }

    pub fn writeable(&self) -> bool {
        self.has(Self::WRITE)
    }
}

/// What an impl made of an inbound CC message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CcMsgRes {
    Unhandled,
    HandledNoValue,
    HandledValue,
}

/// Everything an impl needs while reacting to traffic or host writes.
pub struct ImplCtx<'a> {
    pub fields: &'a dyn FieldStore,
    /// Messages to hand to the scheduler when the call returns.
    pub out: &'a mut Vec<OutMsg>,
    pub now: Instant,
    /// The unit's SendTrigger option.
    pub send_triggers: bool,
}

/// A value change an impl wants its unit to see, for trigger emission and
/// cross-impl mirroring.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueChange {
    pub impl_id: u32,
    pub source: ValueSource,
    pub was_in_error: bool,
    pub value: FieldValue,
}

/// The capability surface every CC implementation exposes to its unit.
pub trait CcImpl: Send {
    fn info(&self) -> &CcImplInfo;
    fn info_mut(&mut self) -> &mut CcImplInfo;

    /// Called by the unit for every inbound frame the unit receives.
    /// Returns what was done with it; a reported value change is left in
    /// [CcImpl::take_change] for the unit to collect.
    fn handle_cc_msg(&mut self, class: u8, cmd: u8, msg: &zwusb_cc::InMsg, ctx: &mut ImplCtx)
        -> CcMsgRes;

    /// Emit the relevant Get. The default does nothing; readable impls
    /// override.
    fn send_value_query(&mut self, _priority: MessagePriority, _ctx: &mut ImplCtx) {}

    /// Route a host write to this impl's fields.
    fn on_field_written(
        &mut self,
        _field_id: FieldId,
        _value: &FieldValue,
        _ctx: &mut ImplCtx,
    ) -> FieldWriteRes {
        FieldWriteRes::Unhandled
    }

    /// Declare the host fields this impl owns.
    fn declare_fields(&self, _defs: &mut Vec<FieldDef>) {}

    /// After the host registered the fields, store the assigned ids.
    fn store_field_ids(&mut self, _lookup: &mut dyn FnMut(&str) -> Option<FieldId>) {}

    /// Apply the device info file's per-CC extra info. A parse failure
    /// makes the owning unit non-viable.
    fn parse_extra_info(&mut self, _xinfo: &[XInfoItem]) -> Result<()> {
        Ok(())
    }

    /// Push a value into this impl from a companion impl. Only Program-
    /// sourced pushes arrive here; they must never start another mirror.
    fn push_value(&mut self, _value: &FieldValue, _source: ValueSource, _ctx: &mut ImplCtx) {}

    /// The transmit callback confirmed delivery of a message this impl
    /// sent. Writeable impls commit their pending value here and queue the
    /// read-after-write confirmation.
    fn on_write_delivered(&mut self, _ack_id: u32, _ctx: &mut ImplCtx) {}

    /// The pending value change, if the last handled message produced one.
    fn take_change(&mut self) -> Option<ValueChange> {
        None
    }

    fn current_value(&self) -> Option<FieldValue> {
        None
    }
}

/// Polling backoff: how long after the n-th consecutive unanswered poll
/// the next attempt runs.
fn backoff_step(timeout_count: u32, long_default: Duration) -> Duration {
    match timeout_count {
        0 | 1 => Duration::from_secs(30),
        2 => Duration::from_secs(60),
        3 => Duration::from_secs(120),
        4 => Duration::from_secs(240),
        _ => long_default,
    }
}

/// Consecutive unanswered polls before an impl goes into error state.
const POLL_ERROR_STRIKES: u32 = 3;

/// The first poll holds off long enough for the interview and auto-config
/// traffic to clear the queues.
const FIRST_POLL_DELAY: Duration = Duration::from_secs(30);

/// State common to every CC implementation.
#[derive(Debug, Clone)]
pub struct CcImplInfo {
    pub class: CommandClass,
    pub endpoint: EndpointId,
    pub impl_id: u32,
    pub desc: String,
    pub access: AccessFlags,
    node: NodeId,
    secure: bool,
    freq_listener: bool,
    error: bool,
    timeout_count: u32,
    next_poll: Option<Instant>,
    default_poll: Option<Duration>,
    long_backoff: Duration,
    field_ids: Vec<FieldId>,
}

impl CcImplInfo {
    pub fn new(class: CommandClass, desc: impl Into<String>, access: AccessFlags) -> Self {
        Self {
            class,
            endpoint: EndpointId::root(),
            impl_id: 0,
            desc: desc.into(),
            access,
            node: NodeId::unspecified(),
            secure: false,
            freq_listener: false,
            error: false,
            timeout_count: 0,
            next_poll: None,
            default_poll: None,
            long_backoff: Duration::from_secs(300),
            field_ids: Vec::new(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: u8) -> Self {
        self.endpoint = EndpointId::new(endpoint);
        self
    }

    /// Bind to the owning unit: node id, security, listener class. Called
    /// once during unit prepare.
    pub fn bind(&mut self, node: NodeId, impl_id: u32, secure: bool, listener: ListenerClass) {
        self.node = node;
        self.impl_id = impl_id;
        self.secure = secure;
        self.freq_listener = listener == ListenerClass::FrequentListener;
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn secure(&self) -> bool {
        self.secure
    }

    pub fn is_error(&self) -> bool {
        self.error
    }

    pub fn timeout_count(&self) -> u32 {
        self.timeout_count
    }

    // ------------------------------------------------------------------
    // Polling
    // ------------------------------------------------------------------

    /// Turn on background polling. Readable impls on listening units get a
    /// randomized default interval; sleepers never poll.
    pub fn enable_poll(&mut self, listener: ListenerClass, now: Instant) {
        if !self.access.readable() {
            return;
        }
        let (base_secs, jitter_secs, long_backoff) = match listener {
            // 8.75 to 11.25 minutes
            ListenerClass::AlwaysOn => (525u64, 150u64, Duration::from_secs(300)),
            // 52.5 to 67.5 minutes
            ListenerClass::FrequentListener => (3150, 900, Duration::from_secs(1200)),
            ListenerClass::Sleeper => return,
        };
        let mut r = [0u8; 2];
        getrandom::getrandom(&mut r).expect("system randomness unavailable");
        let jitter = u16::from_be_bytes(r) as u64 % jitter_secs;
        self.default_poll = Some(Duration::from_secs(base_secs + jitter));
        self.long_backoff = long_backoff;
        self.next_poll = Some(now + FIRST_POLL_DELAY);
    }

    pub fn disable_poll(&mut self) {
        self.default_poll = None;
        self.next_poll = None;
    }

    pub fn polls(&self) -> bool {
        self.default_poll.is_some()
    }

    pub fn default_poll_interval(&self) -> Option<Duration> {
        self.default_poll
    }

    pub fn next_poll(&self) -> Option<Instant> {
        self.next_poll
    }

    pub fn poll_due(&self, now: Instant) -> bool {
        matches!(self.next_poll, Some(at) if now >= at)
    }

    /// Record a poll attempt: bump the failure counter, move the next-poll
    /// time along the backoff ladder, and enter error state on the strike
    /// limit. Returns true when this attempt newly entered error state.
    pub fn note_poll_attempt(&mut self, now: Instant) -> bool {
        if self.default_poll.is_none() {
            return false;
        }
        self.timeout_count += 1;
        self.next_poll = Some(now + backoff_step(self.timeout_count, self.long_backoff));

        if self.timeout_count > POLL_ERROR_STRIKES && !self.error {
            self.error = true;
            return true;
        }
        false
    }

    /// A valid value arrived: clear the failure counter and error state
    /// and fall back to the default cadence. Returns true when error state
    /// was cleared.
    pub fn note_valid_value(&mut self, now: Instant) -> bool {
        self.timeout_count = 0;
        if let Some(interval) = self.default_poll {
            self.next_poll = Some(now + interval);
        }
        let was_error = self.error;
        self.error = false;
        was_error
    }

    /// A transport failure charged to this impl (TransAck failure or reply
    /// timeout). Returns true when this newly entered error state.
    pub fn note_comm_failure(&mut self, now: Instant) -> bool {
        self.timeout_count += 1;
        if self.polls() {
            self.next_poll = Some(now + backoff_step(self.timeout_count, self.long_backoff));
        }
        if self.timeout_count >= POLL_ERROR_STRIKES && !self.error {
            self.error = true;
            return true;
        }
        false
    }

    pub fn force_error(&mut self) -> bool {
        let newly = !self.error;
        self.error = true;
        newly
    }

    // ------------------------------------------------------------------
    // Fields
    // ------------------------------------------------------------------

    pub fn add_field_id(&mut self, id: FieldId) {
        self.field_ids.push(id);
    }

    pub fn field_ids(&self) -> &[FieldId] {
        &self.field_ids
    }

    pub fn owns_field(&self, id: FieldId) -> bool {
        self.field_ids.contains(&id)
    }

    pub fn mark_fields_error(&self, fields: &dyn FieldStore, in_error: bool) {
        for id in &self.field_ids {
            fields.set_in_error(*id, in_error);
        }
    }

    // ------------------------------------------------------------------
    // Message building
    // ------------------------------------------------------------------

    /// Whether an inbound message is addressed to this impl's endpoint.
    pub fn endpoint_matches(&self, msg: &zwusb_cc::InMsg) -> bool {
        if self.endpoint.is_root() {
            msg.src_endpoint() == 0
        } else {
            msg.src_endpoint() == self.endpoint.value()
        }
    }

    /// A Get-style request with the right encapsulation, security and
    /// reply expectation for this impl.
    pub fn build_get(&self, cmd: u8, reply_cmd: u8, priority: MessagePriority) -> OutMsg {
        let mut msg = OutMsg::new_cc(self.node, self.class, cmd, reply_cmd, 2, priority);
        msg.append_transmit_options(true);
        msg.append_callback(false);
        msg.finalize(self.freq_listener, self.secure, false);
        self.encap(&mut msg);
        msg
    }

    /// A Set-style request carrying a payload, no reply expected.
    pub fn build_set(&self, cmd: u8, payload: &[u8], priority: MessagePriority) -> OutMsg {
        let mut msg = OutMsg::new_cc(
            self.node,
            self.class,
            cmd,
            0,
            (payload.len() + 2) as u8,
            priority,
        );
        msg.append_bytes(payload);
        msg.append_transmit_options(true);
        msg.append_callback(false);
        msg.finalize(self.freq_listener, self.secure, false);
        self.encap(&mut msg);
        msg
    }

    fn encap(&self, msg: &mut OutMsg) {
        if !self.endpoint.is_root() {
            msg.end_point_encap(0, self.endpoint.value());
        }
    }
}

/// Find an extra info value by name.
pub fn find_xinfo<'a>(items: &'a [XInfoItem], name: &str) -> Option<&'a str> {
    items
        .iter()
        .find(|x| x.name.eq_ignore_ascii_case(name))
        .map(|x| x.value.as_str())
}

/// Parse a space-separated byte list like "1 2 0x10".
pub fn parse_byte_list(text: &str) -> Result<Vec<u8>> {
    text.split_whitespace()
        .map(|tok| {
            crate::device_info::parse_num(tok)
                .filter(|v| (0..=0xff).contains(v))
                .map(|v| v as u8)
                .ok_or_else(|| Error::ExtraInfo(format!("bad byte value '{tok}'")))
        })
        .collect()
}
