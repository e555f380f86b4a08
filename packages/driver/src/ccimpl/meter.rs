use crate::ccimpl::{AccessFlags, CcImpl, CcImplInfo, CcMsgRes, ImplCtx, ValueChange};
use crate::fields::{FieldAccess, FieldDef, FieldId, FieldType, FieldValue, SemanticType};
use zwusb_cc::commands::MeterCmd;
use zwusb_cc::InMsg;
use zwusb_core::prelude::*;
use zwusb_core::values::SensorValue;

/// A meter reading surfaced as a float field. The report's precision/
/// scale/size byte packs the same way a sensor report does.
pub struct MeterImpl {
    info: CcImplInfo,
    field_name: String,
    field_id: Option<FieldId>,
    value: Option<f64>,
    change: Option<ValueChange>,
}

impl MeterImpl {
    pub fn new(field_name: impl Into<String>) -> Self {
        let field_name = field_name.into();
        Self {
            info: CcImplInfo::new(CommandClass::Meter, field_name.clone(), AccessFlags::READ),
            field_name,
            field_id: None,
            value: None,
            change: None,
        }
    }
}

impl CcImpl for MeterImpl {
    fn info(&self) -> &CcImplInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut CcImplInfo {
        &mut self.info
    }

    fn handle_cc_msg(&mut self, class: u8, cmd: u8, msg: &InMsg, ctx: &mut ImplCtx) -> CcMsgRes {
        if class != CommandClass::Meter.id()
            || cmd != MeterCmd::Report as u8
            || !self.info.endpoint_matches(msg)
        {
            return CcMsgRes::Unhandled;
        }
        // [2] = meter type and rate bits, [3..] = packed value
        let Some(cc) = msg.cc_bytes() else {
            return CcMsgRes::HandledNoValue;
        };
        if cc.len() < 4 {
            return CcMsgRes::HandledNoValue;
        }
        let Some((decoded, _)) = SensorValue::decode(&cc[3..]) else {
            return CcMsgRes::HandledNoValue;
        };

        let was_in_error = self.info.is_error();
        if self.info.note_valid_value(ctx.now) {
            self.info.mark_fields_error(ctx.fields, false);
        }
        let changed = self.value != Some(decoded.value);
        self.value = Some(decoded.value);
        if let Some(id) = self.field_id {
            ctx.fields.write_value(id, FieldValue::Float(decoded.value));
        }
        if changed || was_in_error {
            self.change = Some(ValueChange {
                impl_id: self.info.impl_id,
                source: ValueSource::Unit,
                was_in_error,
                value: FieldValue::Float(decoded.value),
            });
        }
        CcMsgRes::HandledValue
    }

    fn send_value_query(&mut self, priority: MessagePriority, ctx: &mut ImplCtx) {
        ctx.out
            .push(self.info.build_get(MeterCmd::Get as u8, MeterCmd::Report as u8, priority));
    }

    fn declare_fields(&self, defs: &mut Vec<FieldDef>) {
        defs.push(
            FieldDef::new(self.field_name.clone(), FieldType::Float, FieldAccess::Read)
                .semantic(SemanticType::Power),
        );
    }

    fn store_field_ids(&mut self, lookup: &mut dyn FnMut(&str) -> Option<FieldId>) {
        if let Some(id) = lookup(&self.field_name) {
            self.field_id = Some(id);
            self.info.add_field_id(id);
        }
    }

    fn take_change(&mut self) -> Option<ValueChange> {
        self.change.take()
    }

    fn current_value(&self) -> Option<FieldValue> {
        self.value.map(FieldValue::Float)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fields::{FieldStore, MemoryFieldStore};
    use std::time::Instant;

    #[test]
    fn test_meter_report() {
        let store = MemoryFieldStore::new();
        let mut imp = MeterImpl::new("Unit_Watts");
        imp.info_mut()
            .bind(NodeId::new(6), 1, false, ListenerClass::AlwaysOn);
        let mut defs = Vec::new();
        imp.declare_fields(&mut defs);
        store.register_field(&defs[0]);
        imp.store_field_ids(&mut |name| store.id_of(name));

        // electric meter, W scale: 123.4 W, precision 1, size 2
        let raw = 1234i16.to_be_bytes();
        let cc = [0x32, 0x02, 0x21, 0b001_10_010, raw[0], raw[1]];
        let mut msg = vec![0u8, 0x00, 0x04, 0x00, 6, cc.len() as u8];
        msg.extend_from_slice(&cc);
        msg[0] = msg.len() as u8;
        let msg = InMsg::from_message(&msg, Instant::now()).unwrap();

        let mut out = Vec::new();
        let mut ctx = ImplCtx {
            fields: &store,
            out: &mut out,
            now: Instant::now(),
            send_triggers: true,
        };
        assert_eq!(imp.handle_cc_msg(0x32, 0x02, &msg, &mut ctx), CcMsgRes::HandledValue);
        let Some(FieldValue::Float(v)) = store.value_by_name("Unit_Watts") else {
            panic!("field not written");
        };
        assert!((v - 123.4).abs() < 1e-9);
    }
}
