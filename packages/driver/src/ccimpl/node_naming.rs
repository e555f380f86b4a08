use crate::ccimpl::{AccessFlags, CcImpl, CcImplInfo, CcMsgRes, ImplCtx, ValueChange};
use crate::fields::{FieldAccess, FieldDef, FieldId, FieldType, FieldValue};
use zwusb_cc::commands::NodeNamingCmd;
use zwusb_cc::InMsg;
use zwusb_core::prelude::*;

/// The name the device itself holds, surfaced read-only. Char set byte 0
/// is plain ASCII; anything else is passed through lossily.
pub struct NodeNamingImpl {
    info: CcImplInfo,
    field_name: String,
    field_id: Option<FieldId>,
    value: Option<String>,
    change: Option<ValueChange>,
}

impl NodeNamingImpl {
    pub fn new(field_name: impl Into<String>) -> Self {
        let field_name = field_name.into();
        Self {
            info: CcImplInfo::new(
                CommandClass::NodeNaming,
                field_name.clone(),
                AccessFlags::READ,
            ),
            field_name,
            field_id: None,
            value: None,
            change: None,
        }
    }
}

impl CcImpl for NodeNamingImpl {
    fn info(&self) -> &CcImplInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut CcImplInfo {
        &mut self.info
    }

    fn handle_cc_msg(&mut self, class: u8, cmd: u8, msg: &InMsg, ctx: &mut ImplCtx) -> CcMsgRes {
        if class != CommandClass::NodeNaming.id() || cmd != NodeNamingCmd::NameReport as u8 {
            return CcMsgRes::Unhandled;
        }
        let Some(cc) = msg.cc_bytes() else {
            return CcMsgRes::HandledNoValue;
        };
        if cc.len() < 3 {
            return CcMsgRes::HandledNoValue;
        }
        // [2] = char set, [3..] = up to 16 name bytes
        let name: String = String::from_utf8_lossy(&cc[3..cc.len().min(19)])
            .trim_end_matches('\0')
            .to_string();

        let was_in_error = self.info.is_error();
        if self.info.note_valid_value(ctx.now) {
            self.info.mark_fields_error(ctx.fields, false);
        }
        let changed = self.value.as_deref() != Some(name.as_str());
        self.value = Some(name.clone());
        if let Some(id) = self.field_id {
            ctx.fields.write_value(id, FieldValue::String(name.clone()));
        }
        if changed || was_in_error {
            self.change = Some(ValueChange {
                impl_id: self.info.impl_id,
                source: ValueSource::Unit,
                was_in_error,
                value: FieldValue::String(name),
            });
        }
        CcMsgRes::HandledValue
    }

    fn send_value_query(&mut self, priority: MessagePriority, ctx: &mut ImplCtx) {
        ctx.out.push(self.info.build_get(
            NodeNamingCmd::NameGet as u8,
            NodeNamingCmd::NameReport as u8,
            priority,
        ));
    }

    fn declare_fields(&self, defs: &mut Vec<FieldDef>) {
        defs.push(FieldDef::new(
            self.field_name.clone(),
            FieldType::String,
            FieldAccess::Read,
        ));
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
        self.value.clone().map(FieldValue::String)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fields::{FieldStore, MemoryFieldStore};
    use std::time::Instant;

    #[test]
    fn test_name_report() {
        let store = MemoryFieldStore::new();
        let mut imp = NodeNamingImpl::new("Unit_Name");
        imp.info_mut()
            .bind(NodeId::new(2), 1, false, ListenerClass::AlwaysOn);
        let mut defs = Vec::new();
        imp.declare_fields(&mut defs);
        store.register_field(&defs[0]);
        imp.store_field_ids(&mut |name| store.id_of(name));

        let mut cc = vec![0x77, 0x03, 0x00];
        cc.extend_from_slice(b"Porch\0\0");
        let mut msg = vec![0u8, 0x00, 0x04, 0x00, 2, cc.len() as u8];
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
        assert_eq!(imp.handle_cc_msg(0x77, 0x03, &msg, &mut ctx), CcMsgRes::HandledValue);
        assert_eq!(
            store.value_by_name("Unit_Name"),
            Some(FieldValue::String("Porch".into()))
        );
    }
}
