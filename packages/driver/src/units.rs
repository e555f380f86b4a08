//! The unit model: one logical Z-Wave device, composed of an ordered list
//! of CC implementations plus the device-info record that shaped them.
//! The unit routes inbound frames to its impls, mirrors state between
//! paired impls, and owns the per-device failure budget.

mod profiles;
pub use profiles::UNIT_CLASSES;

use crate::ccimpl::{admin, CcImpl, CcMsgRes, ImplCtx, ValueChange};
use crate::device_info::DevInfo;
use crate::error::Result;
use crate::fields::{FieldId, FieldStore, FieldValue, FieldWriteRes};
use std::collections::BTreeMap;
use std::time::Instant;
use zwusb_cc::{InMsg, OutMsg};
use zwusb_core::prelude::*;

/// A relationship between two impls of the same unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImplLink {
    /// State mirrors both ways, tagged source=Program to stop the echo.
    Mirror { a: usize, b: usize },
    /// When `from` enters error state, `to` is forced into error too.
    ErrorFollows { from: usize, to: usize },
}

/// Everything the driver knows about a unit before the catalog is
/// consulted.
#[derive(Debug, Clone)]
pub struct UnitConfig {
    pub node: NodeId,
    pub name: String,
    pub listener: ListenerClass,
    pub manufacturer: ManufacturerId,
    pub options: BTreeMap<String, String>,
}

impl UnitConfig {
    pub fn new(node: NodeId, name: impl Into<String>, listener: ListenerClass) -> Self {
        Self {
            node,
            name: name.into(),
            listener,
            manufacturer: ManufacturerId::default(),
            options: BTreeMap::new(),
        }
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(|s| s.as_str())
    }
}

pub struct Unit {
    node: NodeId,
    name: String,
    listener: ListenerClass,
    manufacturer: ManufacturerId,
    wakeup_interval: Option<u32>,
    dev_info: DevInfo,
    impls: Vec<Box<dyn CcImpl>>,
    links: Vec<ImplLink>,
    send_triggers: bool,
    viable: bool,
    awake: bool,
    comm_failures: u32,
    /// The endpoint count the device advertised, once known.
    endpoint_count: Option<u8>,
    /// Per-class versions reported by the device, refining the catalog's
    /// assumptions.
    cc_versions: BTreeMap<u8, u8>,
}

impl Unit {
    /// Build a unit from its config and device info: construct the impl
    /// set for the declared unit class, apply extra info, register fields.
    /// Any extra-info failure aborts the prepare; the caller records the
    /// unit as non-viable.
    pub fn prepare(
        config: UnitConfig,
        dev_info: DevInfo,
        fields: &dyn FieldStore,
    ) -> Result<Unit> {
        let now = Instant::now();
        let mut build = profiles::build_impls(&config, &dev_info)?;

        for (index, imp) in build.impls.iter_mut().enumerate() {
            let class = imp.info().class;
            imp.info_mut().bind(
                config.node,
                (index + 1) as u32,
                dev_info.secure_class(class.id()),
                config.listener,
            );
            imp.info_mut().enable_poll(config.listener, now);
        }
        for index in &build.suppress_poll {
            build.impls[*index].info_mut().disable_poll();
        }

        // Declare, register, and store back the assigned field ids
        let mut registered: BTreeMap<String, FieldId> = BTreeMap::new();
        for imp in &build.impls {
            let mut defs = Vec::new();
            imp.declare_fields(&mut defs);
            for def in defs {
                let id = fields.register_field(&def);
                registered.insert(def.name, id);
            }
        }
        for imp in build.impls.iter_mut() {
            imp.store_field_ids(&mut |name| registered.get(name).copied());
        }

        let send_triggers = config
            .option("SendTrigger")
            .or_else(|| dev_info.unit_extra_info("SendTrigger"))
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(true);

        Ok(Unit {
            node: config.node,
            name: config.name,
            listener: config.listener,
            manufacturer: config.manufacturer,
            wakeup_interval: dev_info.auto_cfg.wakeup_interval,
            dev_info,
            impls: build.impls,
            links: build.links,
            send_triggers,
            viable: true,
            awake: false,
            comm_failures: 0,
            endpoint_count: None,
            cc_versions: BTreeMap::new(),
        })
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn listener(&self) -> ListenerClass {
        self.listener
    }

    pub fn manufacturer(&self) -> ManufacturerId {
        self.manufacturer
    }

    pub fn dev_info(&self) -> &DevInfo {
        &self.dev_info
    }

    pub fn is_viable(&self) -> bool {
        self.viable
    }

    pub fn set_viable(&mut self, viable: bool) {
        self.viable = viable;
    }

    pub fn is_awake(&self) -> bool {
        self.awake
    }

    pub fn send_triggers(&self) -> bool {
        self.send_triggers
    }

    pub fn comm_failures(&self) -> u32 {
        self.comm_failures
    }

    pub fn impl_count(&self) -> usize {
        self.impls.len()
    }

    pub fn impls(&self) -> &[Box<dyn CcImpl>] {
        &self.impls
    }

    /// The messages to send when the unit is first bound: association
    /// group memberships, configuration parameters, and the wakeup
    /// interval for sleepers.
    pub fn bootstrap_msgs(&self, controller: NodeId) -> Vec<OutMsg> {
        let mut msgs = Vec::new();
        for group in &self.dev_info.auto_cfg.groups {
            let dest = if group.dest == NodeId::unspecified() {
                controller
            } else {
                group.dest
            };
            match group.endpoint {
                Some(ep) if ep > 0 => {
                    msgs.push(admin::build_mc_association_set(self.node, group.group, dest, ep));
                }
                _ => msgs.push(admin::build_association_set(self.node, group.group, dest)),
            }
        }
        for param in &self.dev_info.auto_cfg.params {
            msgs.push(admin::build_configuration_set(
                self.node,
                param.number,
                param.value,
                param.size,
            ));
        }
        if self.listener == ListenerClass::Sleeper {
            if let Some(interval) = self.wakeup_interval {
                msgs.push(admin::build_wakeup_interval_set(self.node, interval, controller));
            }
        }
        msgs
    }

    /// Dispatch an inbound application command: first the impls listening
    /// for the class, then the liveness default handler for frames nothing
    /// claimed.
    pub fn handle_app_cmd(
        &mut self,
        msg: &InMsg,
        fields: &dyn FieldStore,
        out: &mut Vec<OutMsg>,
        now: Instant,
    ) -> bool {
        if !self.viable {
            return false;
        }
        let (Some(class), Some(cmd)) = (msg.class_id(), msg.cmd_id()) else {
            return false;
        };

        // Multi-channel endpoint report: check the advertised count
        // against what the profile built
        if class == CommandClass::MultiChannel.id()
            && cmd == zwusb_cc::commands::MultiChannelCmd::EndPointReport as u8
        {
            if let Some(count) = msg.cc_byte_at(3).map(|b| b & 0x7f) {
                self.note_endpoint_count(count);
            }
            return true;
        }

        // Version report for one class, answering the bind-time query
        if class == CommandClass::Version.id()
            && cmd == zwusb_cc::commands::VersionCmd::CommandClassReport as u8
        {
            if let (Some(queried), Some(version)) = (msg.cc_byte_at(2), msg.cc_byte_at(3)) {
                self.cc_versions.insert(queried, version);
            }
            return true;
        }

        let mut handled = false;
        {
            let mut ctx = ImplCtx {
                fields,
                out: &mut *out,
                now,
                send_triggers: self.send_triggers,
            };
            for imp in self.impls.iter_mut() {
                if imp.handle_cc_msg(class, cmd, msg, &mut ctx) != CcMsgRes::Unhandled {
                    handled = true;
                }
            }
        }

        if handled {
            self.comm_failures = 0;
            self.mirror_changes(fields, out, now);
        } else if msg.is_wakeup_notification() {
            // Liveness: the default handler resets the error counters of
            // every readable impl
            self.liveness_reset(fields, now);
            handled = true;
        }
        handled
    }

    /// Mirror collected value changes across links. A Program-sourced
    /// change never starts another mirror, which is what terminates the
    /// combo-unit echo.
    fn mirror_changes(&mut self, fields: &dyn FieldStore, out: &mut Vec<OutMsg>, now: Instant) {
        let mut changes: Vec<(usize, ValueChange)> = Vec::new();
        for (i, imp) in self.impls.iter_mut().enumerate() {
            if let Some(change) = imp.take_change() {
                changes.push((i, change));
            }
        }

        for (index, change) in changes {
            if change.source == ValueSource::Program {
                continue;
            }
            let partners: Vec<usize> = self
                .links
                .iter()
                .filter_map(|link| match link {
                    ImplLink::Mirror { a, b } if *a == index => Some(*b),
                    ImplLink::Mirror { a, b } if *b == index => Some(*a),
                    _ => None,
                })
                .collect();
            for partner in partners {
                let mut ctx = ImplCtx {
                    fields,
                    out: &mut *out,
                    now,
                    send_triggers: self.send_triggers,
                };
                self.impls[partner].push_value(&change.value, ValueSource::Program, &mut ctx);
                // Consume the mirrored change so it cannot cascade
                let _ = self.impls[partner].take_change();
            }
        }

        self.apply_error_links(fields);
    }

    fn apply_error_links(&mut self, fields: &dyn FieldStore) {
        for link in self.links.clone() {
            if let ImplLink::ErrorFollows { from, to } = link {
                if self.impls[from].info().is_error() && !self.impls[to].info().is_error() {
                    self.impls[to].info_mut().force_error();
                    self.impls[to].info().mark_fields_error(fields, true);
                }
            }
        }
    }

    /// Route a host field write to the owning impl.
    pub fn on_field_written(
        &mut self,
        field_id: FieldId,
        value: &FieldValue,
        fields: &dyn FieldStore,
        out: &mut Vec<OutMsg>,
        now: Instant,
    ) -> FieldWriteRes {
        if !self.viable {
            return FieldWriteRes::NotViable;
        }
        let send_triggers = self.send_triggers;
        for imp in self.impls.iter_mut() {
            let mut ctx = ImplCtx {
                fields,
                out: &mut *out,
                now,
                send_triggers,
            };
            let res = imp.on_field_written(field_id, value, &mut ctx);
            if res != FieldWriteRes::Unhandled {
                return res;
            }
        }
        FieldWriteRes::Unhandled
    }

    pub fn owns_field(&self, field_id: FieldId) -> bool {
        self.impls.iter().any(|i| i.info().owns_field(field_id))
    }

    /// A transmit callback confirmed one of this unit's messages.
    pub fn on_write_delivered(
        &mut self,
        ack_id: u32,
        fields: &dyn FieldStore,
        out: &mut Vec<OutMsg>,
        now: Instant,
    ) {
        self.comm_failures = 0;
        let send_triggers = self.send_triggers;
        for imp in self.impls.iter_mut() {
            let mut ctx = ImplCtx {
                fields,
                out: &mut *out,
                now,
                send_triggers,
            };
            imp.on_write_delivered(ack_id, &mut ctx);
        }
        self.mirror_changes(fields, out, now);
    }

    /// A transport failure (no-ack or reply timeout) on a message to this
    /// unit. The impls matching the message's class take the strike. When
    /// none match, every readable impl does, but only for data-carrying
    /// classes: a lost auto-config or interview message (Configuration,
    /// Association, Version, ...) says nothing about the data points.
    pub fn note_comm_failure(&mut self, class: Option<u8>, fields: &dyn FieldStore, now: Instant) {
        self.comm_failures += 1;
        let mut charged = false;
        for imp in self.impls.iter_mut() {
            let matches = class.map(|c| imp.info().class.id() == c).unwrap_or(false);
            if matches {
                charged = true;
                if imp.info_mut().note_comm_failure(now) {
                    imp.info().mark_fields_error(fields, true);
                }
            }
        }
        let data_class = class
            .and_then(|c| CommandClass::try_from(c).ok())
            .map(|c| !c.is_management())
            .unwrap_or(false);
        if !charged && data_class {
            for imp in self.impls.iter_mut() {
                if imp.info().access.readable() && imp.info_mut().note_comm_failure(now) {
                    imp.info().mark_fields_error(fields, true);
                }
            }
        }
        self.apply_error_links(fields);
    }

    /// Wakeup notification: mark awake, reset liveness, and let every
    /// read-on-wake impl queue its query ahead of the close-out.
    pub fn on_wakeup(&mut self, fields: &dyn FieldStore, out: &mut Vec<OutMsg>, now: Instant) {
        self.awake = true;
        self.liveness_reset(fields, now);
        let send_triggers = self.send_triggers;
        for imp in self.impls.iter_mut() {
            if imp
                .info()
                .access
                .has(crate::ccimpl::AccessFlags::READ_ON_WAKE)
            {
                let mut ctx = ImplCtx {
                    fields,
                    out: &mut *out,
                    now,
                    send_triggers,
                };
                imp.send_value_query(MessagePriority::Async, &mut ctx);
            }
        }
    }

    /// The wakeup close-out went to the device; it is asleep again.
    pub fn wakeup_done(&mut self) {
        self.awake = false;
    }

    /// A node info frame proves the unit is alive; treat it like the
    /// liveness default handler does a wakeup.
    pub fn on_node_info(&mut self, fields: &dyn FieldStore, now: Instant) {
        self.liveness_reset(fields, now);
    }

    fn liveness_reset(&mut self, fields: &dyn FieldStore, now: Instant) {
        self.comm_failures = 0;
        for imp in self.impls.iter_mut() {
            if imp.info().access.readable() && imp.info_mut().note_valid_value(now) {
                imp.info().mark_fields_error(fields, false);
            }
        }
    }

    /// Run due polls: each due impl takes a poll attempt (with its backoff
    /// and error-state bookkeeping) and emits its Get.
    pub fn process_polls(&mut self, fields: &dyn FieldStore, out: &mut Vec<OutMsg>, now: Instant) {
        if !self.viable || self.listener == ListenerClass::Sleeper {
            return;
        }
        let send_triggers = self.send_triggers;
        for imp in self.impls.iter_mut() {
            if !imp.info().poll_due(now) {
                continue;
            }
            if imp.info_mut().note_poll_attempt(now) {
                imp.info().mark_fields_error(fields, true);
            }
            let mut ctx = ImplCtx {
                fields,
                out: &mut *out,
                now,
                send_triggers,
            };
            imp.send_value_query(MessagePriority::Async, &mut ctx);
        }
        self.apply_error_links(fields);
    }

    /// The earliest pending poll deadline, for the scheduler's sweep.
    pub fn next_poll_at(&self) -> Option<Instant> {
        self.impls.iter().filter_map(|i| i.info().next_poll()).min()
    }

    fn note_endpoint_count(&mut self, count: u8) {
        self.endpoint_count = Some(count);
        if let Some(expected) = profiles::expected_endpoints(&self.dev_info) {
            if count < expected {
                // The device cannot serve the outlets the profile built
                self.viable = false;
            }
        }
    }

    pub fn endpoint_count(&self) -> Option<u8> {
        self.endpoint_count
    }

    /// The version a class reported, falling back to the catalog's claim.
    pub fn cc_version(&self, class: u8) -> u8 {
        self.cc_versions
            .get(&class)
            .copied()
            .or_else(|| self.dev_info.cc(class).map(|c| c.version))
            .unwrap_or(1)
    }
}
