use crate::ccimpl::{
    find_xinfo, AccessFlags, CcImpl, CcImplInfo, CcMsgRes, ImplCtx, ValueChange,
};
use crate::device_info::XInfoItem;
use crate::error::{Error, Result};
use crate::fields::{FieldAccess, FieldDef, FieldId, FieldType, FieldValue, SemanticType};
use zwusb_cc::commands::BatteryCmd;
use zwusb_cc::InMsg;
use zwusb_core::prelude::*;

/// Battery level, 0..=100. Devices report 0xFF as the low-battery alarm,
/// which we surface as 0.
pub struct BatteryImpl {
    info: CcImplInfo,
    field_name: String,
    field_id: Option<FieldId>,
    value: Option<u8>,
    change: Option<ValueChange>,
}

impl BatteryImpl {
    pub fn new(field_name: impl Into<String>) -> Self {
        let field_name = field_name.into();
        Self {
            info: CcImplInfo::new(CommandClass::Battery, field_name.clone(), AccessFlags::READ),
            field_name,
            field_id: None,
            value: None,
            change: None,
        }
    }
}

impl CcImpl for BatteryImpl {
    fn info(&self) -> &CcImplInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut CcImplInfo {
        &mut self.info
    }

    fn handle_cc_msg(&mut self, class: u8, cmd: u8, msg: &InMsg, ctx: &mut ImplCtx) -> CcMsgRes {
        if class != CommandClass::Battery.id() || cmd != BatteryCmd::Report as u8 {
            return CcMsgRes::Unhandled;
        }
        let Some(raw) = msg.cc_byte_at(2) else {
            return CcMsgRes::HandledNoValue;
        };
        let percent = match raw {
            0xff => 0, // low battery alarm
            0..=100 => raw,
            _ => return CcMsgRes::HandledNoValue,
        };

        let was_in_error = self.info.is_error();
        if self.info.note_valid_value(ctx.now) {
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
                source: ValueSource::Unit,
                was_in_error,
                value: FieldValue::Card(percent as u32),
            });
        }
        CcMsgRes::HandledValue
    }

    fn send_value_query(&mut self, priority: MessagePriority, ctx: &mut ImplCtx) {
        ctx.out.push(self.info.build_get(
            BatteryCmd::Get as u8,
            BatteryCmd::Report as u8,
            priority,
        ));
    }

    fn declare_fields(&self, defs: &mut Vec<FieldDef>) {
        defs.push(
            FieldDef::new(self.field_name.clone(), FieldType::Card, FieldAccess::Read)
                .semantic(SemanticType::BatteryLevel)
                .limits(0, 100),
        );
    }

    fn store_field_ids(&mut self, lookup: &mut dyn FnMut(&str) -> Option<FieldId>) {
        if let Some(id) = lookup(&self.field_name) {
            self.field_id = Some(id);
            self.info.add_field_id(id);
        }
    }

    /// `ReadAcc` selects how the level is obtained: polled, read on wakeup,
    /// or only from unsolicited reports.
    fn parse_extra_info(&mut self, xinfo: &[XInfoItem]) -> Result<()> {
        match find_xinfo(xinfo, "ReadAcc") {
            None | Some("Read") => {}
            Some("Wakeup") => {
                self.info.access = AccessFlags::READ.or(AccessFlags::READ_ON_WAKE);
                self.info.disable_poll();
            }
            Some("Notify") => {
                self.info.access = AccessFlags::default();
                self.info.disable_poll();
            }
            Some(other) => {
                return Err(Error::ExtraInfo(format!("bad ReadAcc '{other}'")));
            }
        }
        Ok(())
    }

    fn take_change(&mut self) -> Option<ValueChange> {
        self.change.take()
    }

    fn current_value(&self) -> Option<FieldValue> {
        self.value.map(|v| FieldValue::Card(v as u32))
    }
}
