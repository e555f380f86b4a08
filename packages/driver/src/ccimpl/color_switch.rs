use crate::ccimpl::{AccessFlags, CcImpl, CcImplInfo, CcMsgRes, ImplCtx, ValueChange};
use crate::fields::{
    FieldAccess, FieldDef, FieldId, FieldType, FieldValue, FieldWriteRes, SemanticType,
};
use zwusb_cc::commands::ColorSwitchCmd;
use zwusb_cc::InMsg;
use zwusb_core::prelude::*;

const COMP_RED: u8 = 0x02;
const COMP_GREEN: u8 = 0x03;
const COMP_BLUE: u8 = 0x04;

/// RGB color as one packed 0xRRGGBB card field. Reports come one component
/// at a time; the field updates as each lands.
pub struct ColorSwitchImpl {
    info: CcImplInfo,
    field_name: String,
    field_id: Option<FieldId>,
    rgb: [u8; 3],
    seen_any: bool,
    pending_write: Option<(u32, u32)>,
    change: Option<ValueChange>,
}

impl ColorSwitchImpl {
    pub fn new(field_name: impl Into<String>) -> Self {
        let field_name = field_name.into();
        Self {
            info: CcImplInfo::new(
                CommandClass::ColorSwitch,
                field_name.clone(),
                AccessFlags::READ.or(AccessFlags::WRITE),
            ),
            field_name,
            field_id: None,
            rgb: [0; 3],
            seen_any: false,
            pending_write: None,
            change: None,
        }
    }

    fn packed(&self) -> u32 {
        ((self.rgb[0] as u32) << 16) | ((self.rgb[1] as u32) << 8) | self.rgb[2] as u32
    }

    fn store(&mut self, source: ValueSource, was_in_error: bool, ctx: &mut ImplCtx) {
        let packed = self.packed();
        if let Some(id) = self.field_id {
            ctx.fields.write_value(id, FieldValue::Card(packed));
        }
        self.change = Some(ValueChange {
            impl_id: self.info.impl_id,
            source,
            was_in_error,
            value: FieldValue::Card(packed),
        });
    }

}

impl CcImpl for ColorSwitchImpl {
    fn info(&self) -> &CcImplInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut CcImplInfo {
        &mut self.info
    }

    fn handle_cc_msg(&mut self, class: u8, cmd: u8, msg: &InMsg, ctx: &mut ImplCtx) -> CcMsgRes {
        if class != CommandClass::ColorSwitch.id() || cmd != ColorSwitchCmd::Report as u8 {
            return CcMsgRes::Unhandled;
        }
        let (Some(component), Some(level)) = (msg.cc_byte_at(2), msg.cc_byte_at(3)) else {
            return CcMsgRes::HandledNoValue;
        };
        let slot = match component {
            COMP_RED => 0,
            COMP_GREEN => 1,
            COMP_BLUE => 2,
            _ => return CcMsgRes::HandledNoValue,
        };

        let was_in_error = self.info.is_error();
        if self.info.note_valid_value(ctx.now) {
            self.info.mark_fields_error(ctx.fields, false);
        }
        let changed = !self.seen_any || self.rgb[slot] != level;
        self.rgb[slot] = level;
        self.seen_any = true;
        if changed || was_in_error {
            self.store(ValueSource::Unit, was_in_error, ctx);
        }
        CcMsgRes::HandledValue
    }

    fn send_value_query(&mut self, priority: MessagePriority, ctx: &mut ImplCtx) {
        // One Get per component; reports come back independently
        for component in [COMP_RED, COMP_GREEN, COMP_BLUE] {
            let mut msg = zwusb_cc::OutMsg::new_cc(
                self.info.node(),
                CommandClass::ColorSwitch,
                ColorSwitchCmd::Get as u8,
                ColorSwitchCmd::Report as u8,
                3,
                priority,
            );
            msg.append_byte(component);
            msg.append_transmit_options(true);
            msg.append_callback(false);
            msg.finalize(false, self.info.secure(), false);
            ctx.out.push(msg);
        }
    }

    fn on_field_written(
        &mut self,
        field_id: FieldId,
        value: &FieldValue,
        ctx: &mut ImplCtx,
    ) -> FieldWriteRes {
        if Some(field_id) != self.field_id {
            return FieldWriteRes::Unhandled;
        }
        let Some(packed) = value.as_card() else {
            return FieldWriteRes::Rejected;
        };
        if packed > 0xff_ff_ff {
            return FieldWriteRes::Rejected;
        }

        // Component count, then id/value pairs
        let payload = [
            3,
            COMP_RED,
            (packed >> 16) as u8,
            COMP_GREEN,
            (packed >> 8) as u8,
            COMP_BLUE,
            packed as u8,
        ];
        let msg = self
            .info
            .build_set(ColorSwitchCmd::Set as u8, &payload, MessagePriority::Command);
        self.pending_write = Some((msg.ack_id(), packed));
        ctx.out.push(msg);
        FieldWriteRes::Sent
    }

    fn declare_fields(&self, defs: &mut Vec<FieldDef>) {
        defs.push(
            FieldDef::new(
                self.field_name.clone(),
                FieldType::Card,
                FieldAccess::ReadWrite,
            )
            .semantic(SemanticType::ColorRGB)
            .limits(0, 0xff_ff_ff),
        );
    }

    fn store_field_ids(&mut self, lookup: &mut dyn FnMut(&str) -> Option<FieldId>) {
        if let Some(id) = lookup(&self.field_name) {
            self.field_id = Some(id);
            self.info.add_field_id(id);
        }
    }

    fn on_write_delivered(&mut self, ack_id: u32, ctx: &mut ImplCtx) {
        if let Some((pending_ack, packed)) = self.pending_write {
            if pending_ack == ack_id {
                self.pending_write = None;
                self.rgb = [(packed >> 16) as u8, (packed >> 8) as u8, packed as u8];
                self.seen_any = true;
                self.store(ValueSource::Driver, false, ctx);
            }
        }
    }

    fn take_change(&mut self) -> Option<ValueChange> {
        self.change.take()
    }

    fn current_value(&self) -> Option<FieldValue> {
        self.seen_any.then(|| FieldValue::Card(self.packed()))
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

    fn prepared() -> (ColorSwitchImpl, MemoryFieldStore) {
        let store = MemoryFieldStore::new();
        let mut imp = ColorSwitchImpl::new("Unit_Color");
        imp.info_mut()
            .bind(NodeId::new(9), 1, false, ListenerClass::AlwaysOn);
        let mut defs = Vec::new();
        imp.declare_fields(&mut defs);
        store.register_field(&defs[0]);
        imp.store_field_ids(&mut |name| store.id_of(name));
        (imp, store)
    }

    #[test]
    fn test_component_reports_assemble() {
        let (mut imp, store) = prepared();
        let mut out = Vec::new();
        let mut ctx = ImplCtx {
            fields: &store,
            out: &mut out,
            now: Instant::now(),
            send_triggers: true,
        };

        imp.handle_cc_msg(0x33, 0x04, &app_cmd(9, &[0x33, 0x04, COMP_RED, 0x80]), &mut ctx);
        imp.handle_cc_msg(0x33, 0x04, &app_cmd(9, &[0x33, 0x04, COMP_BLUE, 0x40]), &mut ctx);

        assert_eq!(
            store.value_by_name("Unit_Color"),
            Some(FieldValue::Card(0x800040))
        );
    }

    #[test]
    fn test_write_emits_three_components() {
        let (mut imp, store) = prepared();
        let id = store.id_of("Unit_Color").unwrap();
        let mut out = Vec::new();
        let mut ctx = ImplCtx {
            fields: &store,
            out: &mut out,
            now: Instant::now(),
            send_triggers: true,
        };
        assert_eq!(
            imp.on_field_written(id, &FieldValue::Card(0x112233), &mut ctx),
            FieldWriteRes::Sent
        );
        let bytes = out[0].as_bytes();
        assert_eq!(
            &bytes[7..14],
            &[3, COMP_RED, 0x11, COMP_GREEN, 0x22, COMP_BLUE, 0x33]
        );
    }
}
