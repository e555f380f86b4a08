//! The level CC implementation: a 0..=100 percent carried over Basic or
//! Multi-Level Switch. Dimmer profiles pair one of these with a binary
//! switch impl.

use crate::ccimpl::{
    find_xinfo, AccessFlags, CcImpl, CcImplInfo, CcMsgRes, ImplCtx, ValueChange,
};
use crate::device_info::{parse_num, XInfoItem};
use crate::error::{Error, Result};
use crate::fields::{
    FieldAccess, FieldDef, FieldId, FieldType, FieldValue, FieldWriteRes, SemanticType,
};
use zwusb_cc::commands::{BasicCmd, MultiLevelSwitchCmd};
use zwusb_cc::InMsg;
use zwusb_core::prelude::*;
use zwusb_core::values::{dim_to_percent, percent_to_dim};

/// Which command class carries the level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelCarrier {
    Basic,
    MultiLevelSwitch,
}

impl LevelCarrier {
    pub fn class(&self) -> CommandClass {
        match self {
            LevelCarrier::Basic => CommandClass::Basic,
            LevelCarrier::MultiLevelSwitch => CommandClass::MultiLevelSwitch,
        }
    }
}

pub struct LevelImpl {
    info: CcImplInfo,
    carrier: LevelCarrier,
    field_name: String,
    field_id: Option<FieldId>,
    range: (u8, u8),
    value: Option<u8>,
    pending_write: Option<(u32, u8)>,
    change: Option<ValueChange>,
}

impl LevelImpl {
    pub fn new(carrier: LevelCarrier, field_name: impl Into<String>, access: AccessFlags) -> Self {
        let field_name = field_name.into();
        Self {
            info: CcImplInfo::new(carrier.class(), field_name.clone(), access),
            carrier,
            field_name,
            field_id: None,
            range: (0, 100),
            value: None,
            pending_write: None,
            change: None,
        }
    }

    pub fn value(&self) -> Option<u8> {
        self.value
    }

    fn apply(&mut self, percent: u8, source: ValueSource, ctx: &mut ImplCtx) {
        let was_in_error = self.info.is_error();
        if source == ValueSource::Unit && self.info.note_valid_value(ctx.now) {
            self.info.mark_fields_error(ctx.fields, false);
        }

        let changed = self.value != Some(percent);
        self.value = Some(percent);
        if let Some(id) = self.field_id {
            ctx.fields.write_value(id, FieldValue::Card(percent as u32));
        }
        if changed || was_in_error {
            self.change = Some(ValueChange {
                impl_id: self.info.impl_id,
                source,
                was_in_error,
                value: FieldValue::Card(percent as u32),
            });
        }
    }

}

impl CcImpl for LevelImpl {
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
            LevelCarrier::Basic => cmd == BasicCmd::Set as u8 || cmd == BasicCmd::Report as u8,
            LevelCarrier::MultiLevelSwitch => {
                cmd == MultiLevelSwitchCmd::Set as u8 || cmd == MultiLevelSwitchCmd::Report as u8
            }
        };
        if !carries_value {
            return CcMsgRes::Unhandled;
        }

        let Some(raw) = msg.cc_byte_at(2) else {
            return CcMsgRes::HandledNoValue;
        };
        let Some(percent) = dim_to_percent(raw) else {
            // 100..=254 are not valid levels
            return CcMsgRes::HandledNoValue;
        };
        self.apply(percent, ValueSource::Unit, ctx);
        CcMsgRes::HandledValue
    }

    fn send_value_query(&mut self, priority: MessagePriority, ctx: &mut ImplCtx) {
        let (cmd, reply) = match self.carrier {
            LevelCarrier::Basic => (BasicCmd::Get as u8, BasicCmd::Report as u8),
            LevelCarrier::MultiLevelSwitch => (
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
        let percent = match value.as_card() {
            Some(v) if v >= self.range.0 as u32 && v <= self.range.1 as u32 => v as u8,
            _ => return FieldWriteRes::Rejected,
        };
        let Some(dim) = percent_to_dim(percent) else {
            return FieldWriteRes::Rejected;
        };

        let cmd = match self.carrier {
            LevelCarrier::Basic => BasicCmd::Set as u8,
            LevelCarrier::MultiLevelSwitch => MultiLevelSwitchCmd::Set as u8,
        };
        let msg = self.info.build_set(cmd, &[dim], MessagePriority::Command);
        self.pending_write = Some((msg.ack_id(), percent));
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
            FieldDef::new(self.field_name.clone(), FieldType::Card, access)
                .semantic(SemanticType::Dimmer)
                .limits(self.range.0 as i64, self.range.1 as i64),
        );
    }

    fn store_field_ids(&mut self, lookup: &mut dyn FnMut(&str) -> Option<FieldId>) {
        if let Some(id) = lookup(&self.field_name) {
            self.field_id = Some(id);
            self.info.add_field_id(id);
        }
    }

    /// `Range=min max` overrides the default 0..=100.
    fn parse_extra_info(&mut self, xinfo: &[XInfoItem]) -> Result<()> {
        if let Some(range) = find_xinfo(xinfo, "Range") {
            let parts: Vec<i64> = range
                .split_whitespace()
                .filter_map(parse_num)
                .collect();
            match parts[..] {
                [min, max] if (0..=100).contains(&min) && (0..=100).contains(&max) && min < max => {
                    self.range = (min as u8, max as u8);
                }
                _ => {
                    return Err(Error::ExtraInfo(format!("bad Range '{range}'")));
                }
            }
        }
        Ok(())
    }

    fn push_value(&mut self, value: &FieldValue, source: ValueSource, ctx: &mut ImplCtx) {
        if let Some(v) = value.as_card() {
            if v <= 100 {
                self.apply(v as u8, source, ctx);
            }
        }
    }

    fn on_write_delivered(&mut self, ack_id: u32, ctx: &mut ImplCtx) {
        if let Some((pending_ack, percent)) = self.pending_write {
            if pending_ack == ack_id {
                self.pending_write = None;
                self.apply(percent, ValueSource::Driver, ctx);
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
        self.value.map(|v| FieldValue::Card(v as u32))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fields::{FieldStore, MemoryFieldStore};
    use std::time::Instant;

    fn app_cmd(src: u8, cc: &[u8]) -> InMsg {
        let mut msg = vec![0u8, 0x00, 0x04, 0x00, src, cc.len() as u8];
        msg.extend_from_slice(cc);
        msg[0] = msg.len() as u8;
        InMsg::from_message(&msg, Instant::now()).unwrap()
    }

    fn prepared() -> (LevelImpl, MemoryFieldStore) {
        let store = MemoryFieldStore::new();
        let mut imp = LevelImpl::new(
            LevelCarrier::MultiLevelSwitch,
            "Unit_Level",
            AccessFlags::READ.or(AccessFlags::WRITE),
        );
        imp.info_mut()
            .bind(NodeId::new(4), 2, false, ListenerClass::AlwaysOn);
        let mut defs = Vec::new();
        imp.declare_fields(&mut defs);
        for d in &defs {
            store.register_field(d);
        }
        imp.store_field_ids(&mut |name| store.id_of(name));
        (imp, store)
    }

    #[test]
    fn test_report_full_on() {
        let (mut imp, store) = prepared();
        let mut out = Vec::new();
        let mut ctx = ImplCtx {
            fields: &store,
            out: &mut out,
            now: Instant::now(),
            send_triggers: true,
        };
        let msg = app_cmd(4, &[0x26, 0x03, 0xff]);
        assert_eq!(imp.handle_cc_msg(0x26, 0x03, &msg, &mut ctx), CcMsgRes::HandledValue);
        assert_eq!(store.value_by_name("Unit_Level"), Some(FieldValue::Card(100)));
    }

    #[test]
    fn test_invalid_level_ignored() {
        let (mut imp, store) = prepared();
        let mut out = Vec::new();
        let mut ctx = ImplCtx {
            fields: &store,
            out: &mut out,
            now: Instant::now(),
            send_triggers: true,
        };
        let msg = app_cmd(4, &[0x26, 0x03, 0xfe]);
        assert_eq!(
            imp.handle_cc_msg(0x26, 0x03, &msg, &mut ctx),
            CcMsgRes::HandledNoValue
        );
        assert_eq!(store.value_by_name("Unit_Level"), None);
    }

    #[test]
    fn test_write_converts_percent() {
        let (mut imp, store) = prepared();
        let id = store.id_of("Unit_Level").unwrap();
        let mut out = Vec::new();
        let mut ctx = ImplCtx {
            fields: &store,
            out: &mut out,
            now: Instant::now(),
            send_triggers: true,
        };
        assert_eq!(
            imp.on_field_written(id, &FieldValue::Card(100), &mut ctx),
            FieldWriteRes::Sent
        );
        let bytes = out[0].as_bytes();
        assert_eq!(&bytes[5..8], &[0x26, 0x01, 0xff], "100% maps to full-on");
    }

    #[test]
    fn test_write_out_of_range_rejected() {
        let (mut imp, store) = prepared();
        let id = store.id_of("Unit_Level").unwrap();
        let mut out = Vec::new();
        let mut ctx = ImplCtx {
            fields: &store,
            out: &mut out,
            now: Instant::now(),
            send_triggers: true,
        };
        assert_eq!(
            imp.on_field_written(id, &FieldValue::Card(101), &mut ctx),
            FieldWriteRes::Rejected
        );
        assert!(out.is_empty());
    }

    #[test]
    fn test_range_override() {
        let (mut imp, store) = prepared();
        imp.parse_extra_info(&[XInfoItem {
            name: "Range".into(),
            value: "10 90".into(),
            endpoint: None,
        }])
        .unwrap();
        let id = store.id_of("Unit_Level").unwrap();
        let mut out = Vec::new();
        let mut ctx = ImplCtx {
            fields: &store,
            out: &mut out,
            now: Instant::now(),
            send_triggers: true,
        };
        assert_eq!(
            imp.on_field_written(id, &FieldValue::Card(5), &mut ctx),
            FieldWriteRes::Rejected
        );
        assert_eq!(
            imp.on_field_written(id, &FieldValue::Card(50), &mut ctx),
            FieldWriteRes::Sent
        );
    }

    #[test]
    fn test_bad_range_fails_prepare() {
        let (mut imp, _) = prepared();
        let res = imp.parse_extra_info(&[XInfoItem {
            name: "Range".into(),
            value: "90 10".into(),
            endpoint: None,
        }]);
        assert!(res.is_err());
    }
}
