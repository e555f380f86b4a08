//! The binary CC implementation: one boolean of state carried over Basic,
//! Binary Switch or Binary Sensor. Most of the composite unit patterns are
//! built out of one or more of these.

use crate::ccimpl::{AccessFlags, CcImpl, CcImplInfo, CcMsgRes, ImplCtx, ValueChange};
use crate::fields::{
    EventTrigger, FieldAccess, FieldDef, FieldId, FieldType, FieldValue, FieldWriteRes,
    SemanticType,
};
use zwusb_cc::commands::{BasicCmd, BinarySensorCmd, BinarySwitchCmd, MultiLevelSwitchCmd};
use zwusb_cc::InMsg;
use zwusb_core::prelude::*;

/// Which command class carries the boolean. A multi-level switch can act
/// as a binary carrier too: off is 0, on is full-on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryCarrier {
    Basic,
    BinarySwitch,
    BinarySensor,
    MultiLevelSwitch,
}

impl BinaryCarrier {
    pub fn class(&self) -> CommandClass {
        match self {
            BinaryCarrier::Basic => CommandClass::Basic,
            BinaryCarrier::BinarySwitch => CommandClass::BinarySwitch,
            BinaryCarrier::BinarySensor => CommandClass::BinarySensor,
            BinaryCarrier::MultiLevelSwitch => CommandClass::MultiLevelSwitch,
        }
    }

    fn can_write(&self) -> bool {
        !matches!(self, BinaryCarrier::BinarySensor)
    }
}

pub struct BinaryImpl {
    info: CcImplInfo,
    carrier: BinaryCarrier,
    field_name: String,
    field_id: Option<FieldId>,
    semantic: SemanticType,
    value: Option<bool>,
    pending_write: Option<(u32, bool)>,
    change: Option<ValueChange>,
}

impl BinaryImpl {
    pub fn new(
        carrier: BinaryCarrier,
        field_name: impl Into<String>,
        semantic: SemanticType,
        access: AccessFlags,
    ) -> Self {
        let field_name = field_name.into();
        let access = if carrier.can_write() {
            access
        } else {
            // A sensor never writes, whatever the profile asked for
            AccessFlags::READ.or(if access.has(AccessFlags::READ_ON_WAKE) {
                AccessFlags::READ_ON_WAKE
            } else {
                AccessFlags::default()
            })
        };
        Self {
            info: CcImplInfo::new(carrier.class(), field_name.clone(), access),
            carrier,
            field_name,
            field_id: None,
            semantic,
            value: None,
            pending_write: None,
            change: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: u8) -> Self {
        self.info = self.info.with_endpoint(endpoint);
        self
    }

    pub fn value(&self) -> Option<bool> {
        self.value
    }

    fn apply(&mut self, value: bool, source: ValueSource, ctx: &mut ImplCtx) {
        let was_in_error = self.info.is_error();
        if source == ValueSource::Unit {
            if self.info.note_valid_value(ctx.now) {
                self.info.mark_fields_error(ctx.fields, false);
            }
        }

        let changed = self.value != Some(value);
        self.value = Some(value);
        if let Some(id) = self.field_id {
            ctx.fields.write_value(id, FieldValue::Bool(value));
        }

        if changed && source != ValueSource::Program {
            self.emit_trigger(value, ctx);
        }
        if changed || was_in_error {
            self.change = Some(ValueChange {
                impl_id: self.info.impl_id,
                source,
                was_in_error,
                value: FieldValue::Bool(value),
            });
        }
    }

    fn emit_trigger(&self, value: bool, ctx: &mut ImplCtx) {
        let node = self.info.node();
        match self.semantic {
            SemanticType::Motion => {
                if ctx.send_triggers {
                    ctx.fields
                        .emit_trigger(EventTrigger::Motion { node, start: value });
                }
            }
            SemanticType::Switch | SemanticType::Dimmer => {
                ctx.fields
                    .emit_trigger(EventTrigger::LoadChange { node, on: value });
            }
            _ => {}
        }
    }

}

impl CcImpl for BinaryImpl {
    fn info(&self) -> &CcImplInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut CcImplInfo {
        &mut self.info
    }

    fn handle_cc_msg(&mut self, class: u8, cmd: u8, msg: &InMsg, ctx: &mut ImplCtx) -> CcMsgRes {
        if class != self.info.class.id() || !self.info.endpoint_matches(msg) {
            return CcMsgRes::Unhandled;
        }

        let carries_value = match self.carrier {
            BinaryCarrier::Basic => {
                cmd == BasicCmd::Set as u8 || cmd == BasicCmd::Report as u8
            }
            BinaryCarrier::BinarySwitch => {
                cmd == BinarySwitchCmd::Set as u8 || cmd == BinarySwitchCmd::Report as u8
            }
            BinaryCarrier::BinarySensor => cmd == BinarySensorCmd::Report as u8,
            BinaryCarrier::MultiLevelSwitch => {
                cmd == MultiLevelSwitchCmd::Set as u8 || cmd == MultiLevelSwitchCmd::Report as u8
            }
        };
        if !carries_value {
            return CcMsgRes::Unhandled;
        }

        let Some(raw) = msg.cc_byte_at(2) else {
            return CcMsgRes::HandledNoValue;
        };
        self.apply(raw != 0, ValueSource::Unit, ctx);
        CcMsgRes::HandledValue
    }

    fn send_value_query(&mut self, priority: MessagePriority, ctx: &mut ImplCtx) {
        let (cmd, reply) = match self.carrier {
            BinaryCarrier::Basic => (BasicCmd::Get as u8, BasicCmd::Report as u8),
            BinaryCarrier::BinarySwitch => {
                (BinarySwitchCmd::Get as u8, BinarySwitchCmd::Report as u8)
            }
            BinaryCarrier::BinarySensor => {
                (BinarySensorCmd::Get as u8, BinarySensorCmd::Report as u8)
            }
            BinaryCarrier::MultiLevelSwitch => (
                MultiLevelSwitchCmd::Get as u8,
                MultiLevelSwitchCmd::Report as u8,
            ),
        };
        ctx.out.push(self.info.build_get(cmd, reply, priority));
    }

    fn on_field_written(
        &mut self,
        field_id: FieldId,
        value: &FieldValue,
        ctx: &mut ImplCtx,
    ) -> FieldWriteRes {
        if Some(field_id) != self.field_id || !self.info.access.writeable() {
            return FieldWriteRes::Unhandled;
        }
        let Some(on) = value.as_bool() else {
            return FieldWriteRes::Rejected;
        };

        let cmd = match self.carrier {
            BinaryCarrier::Basic => BasicCmd::Set as u8,
            BinaryCarrier::BinarySwitch => BinarySwitchCmd::Set as u8,
            BinaryCarrier::MultiLevelSwitch => MultiLevelSwitchCmd::Set as u8,
            BinaryCarrier::BinarySensor => return FieldWriteRes::Rejected,
        };
        let msg = self.info.build_set(
            cmd,
            &[if on { 0xff } else { 0x00 }],
            MessagePriority::Command,
        );
        self.pending_write = Some((msg.ack_id(), on));
        ctx.out.push(msg);
        FieldWriteRes::Sent
    }

    fn declare_fields(&self, defs: &mut Vec<FieldDef>) {
        let access = if self.info.access.writeable() {
            FieldAccess::ReadWrite
        } else {
            FieldAccess::Read
        };
        defs.push(
            FieldDef::new(self.field_name.clone(), FieldType::Bool, access)
                .semantic(self.semantic),
        );
    }

    fn store_field_ids(&mut self, lookup: &mut dyn FnMut(&str) -> Option<FieldId>) {
        if let Some(id) = lookup(&self.field_name) {
            self.field_id = Some(id);
            self.info.add_field_id(id);
        }
    }

    fn push_value(&mut self, value: &FieldValue, source: ValueSource, ctx: &mut ImplCtx) {
        if let Some(on) = value.as_bool() {
            self.apply(on, source, ctx);
        }
    }

    /// The delivery confirmation for a pending host write arrived.
    fn on_write_delivered(&mut self, ack_id: u32, ctx: &mut ImplCtx) {
        if let Some((pending_ack, value)) = self.pending_write {
            if pending_ack == ack_id {
                self.pending_write = None;
                self.apply(value, ValueSource::Driver, ctx);
                if self.info.access.has(AccessFlags::READ_AFTER_WRITE) {
                    self.send_value_query(MessagePriority::Async, ctx);
                }
            }
        }
    }

    fn take_change(&mut self) -> Option<ValueChange> {
        self.change.take()
    }

    fn current_value(&self) -> Option<FieldValue> {
        self.value.map(FieldValue::Bool)
    }
}
