use crate::ccimpl::{AccessFlags, CcImpl, CcImplInfo, CcMsgRes, ImplCtx, ValueChange};
use crate::fields::{
    EventTrigger, FieldAccess, FieldDef, FieldId, FieldType, FieldValue, FieldWriteRes,
    SemanticType,
};
use zwusb_cc::commands::DoorLockCmd;
use zwusb_cc::InMsg;
use zwusb_core::prelude::*;

/// Door lock mode byte: fully secured vs everything else.
const MODE_SECURED: u8 = 0xff;
const MODE_UNSECURED: u8 = 0x00;

/// Lock state as a bool field (true = locked). Lock units typically pair
/// this with a notification impl that supplies the user code on keypad
/// events.
pub struct DoorLockImpl {
    info: CcImplInfo,
    field_name: String,
    field_id: Option<FieldId>,
    locked: Option<bool>,
    pending_write: Option<(u32, bool)>,
    change: Option<ValueChange>,
}

impl DoorLockImpl {
    pub fn new(field_name: impl Into<String>) -> Self {
        let field_name = field_name.into();
        Self {
            info: CcImplInfo::new(
                CommandClass::DoorLock,
                field_name.clone(),
                AccessFlags::READ
                    .or(AccessFlags::WRITE)
                    .or(AccessFlags::READ_AFTER_WRITE),
            ),
            field_name,
            field_id: None,
            locked: None,
            pending_write: None,
            change: None,
        }
    }

    fn apply(&mut self, locked: bool, source: ValueSource, ctx: &mut ImplCtx) {
        let was_in_error = self.info.is_error();
        if source == ValueSource::Unit && self.info.note_valid_value(ctx.now) {
            self.info.mark_fields_error(ctx.fields, false);
        }
        let changed = self.locked != Some(locked);
        self.locked = Some(locked);
        if let Some(id) = self.field_id {
            ctx.fields.write_value(id, FieldValue::Bool(locked));
        }
        if changed && source != ValueSource::Program {
            ctx.fields.emit_trigger(EventTrigger::LockStatus {
                node: self.info.node(),
                locked,
                code: None,
            });
        }
        if changed || was_in_error {
            self.change = Some(ValueChange {
                impl_id: self.info.impl_id,
                source,
                was_in_error,
                value: FieldValue::Bool(locked),
            });
        }
    }

}

impl CcImpl for DoorLockImpl {
    fn info(&self) -> &CcImplInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut CcImplInfo {
        &mut self.info
    }

    fn handle_cc_msg(&mut self, class: u8, cmd: u8, msg: &InMsg, ctx: &mut ImplCtx) -> CcMsgRes {
        if class != CommandClass::DoorLock.id() || cmd != DoorLockCmd::OperationReport as u8 {
            return CcMsgRes::Unhandled;
        }
        let Some(mode) = msg.cc_byte_at(2) else {
            return CcMsgRes::HandledNoValue;
        };
        self.apply(mode == MODE_SECURED, ValueSource::Unit, ctx);
        CcMsgRes::HandledValue
    }

    fn send_value_query(&mut self, priority: MessagePriority, ctx: &mut ImplCtx) {
        ctx.out.push(self.info.build_get(
            DoorLockCmd::OperationGet as u8,
            DoorLockCmd::OperationReport as u8,
            priority,
        ));
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
        let Some(locked) = value.as_bool() else {
            return FieldWriteRes::Rejected;
        };
        let mode = if locked { MODE_SECURED } else { MODE_UNSECURED };
        let msg = self
            .info
            .build_set(DoorLockCmd::OperationSet as u8, &[mode], MessagePriority::Command);
        self.pending_write = Some((msg.ack_id(), locked));
        ctx.out.push(msg);
        FieldWriteRes::Sent
    }

    fn declare_fields(&self, defs: &mut Vec<FieldDef>) {
        defs.push(
            FieldDef::new(
                self.field_name.clone(),
                FieldType::Bool,
                FieldAccess::ReadWrite,
            )
            .semantic(SemanticType::LockState),
        );
    }

    fn store_field_ids(&mut self, lookup: &mut dyn FnMut(&str) -> Option<FieldId>) {
        if let Some(id) = lookup(&self.field_name) {
            self.field_id = Some(id);
            self.info.add_field_id(id);
        }
    }

    fn push_value(&mut self, value: &FieldValue, source: ValueSource, ctx: &mut ImplCtx) {
        if let Some(locked) = value.as_bool() {
            self.apply(locked, source, ctx);
        }
    }

    fn on_write_delivered(&mut self, ack_id: u32, ctx: &mut ImplCtx) {
        if let Some((pending_ack, locked)) = self.pending_write {
            if pending_ack == ack_id {
                self.pending_write = None;
                self.apply(locked, ValueSource::Driver, ctx);
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
        self.locked.map(FieldValue::Bool)
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

    #[test]
    fn test_operation_report_locks_field_and_triggers() {
        let store = MemoryFieldStore::new();
        let mut imp = DoorLockImpl::new("Unit_Lock");
        imp.info_mut()
            .bind(NodeId::new(0x0a), 1, true, ListenerClass::AlwaysOn);
        let mut defs = Vec::new();
        imp.declare_fields(&mut defs);
        store.register_field(&defs[0]);
        imp.store_field_ids(&mut |name| store.id_of(name));

        let mut out = Vec::new();
        let mut ctx = ImplCtx {
            fields: &store,
            out: &mut out,
            now: Instant::now(),
            send_triggers: true,
        };
        let msg = app_cmd(0x0a, &[0x62, 0x03, 0xff]);
        assert_eq!(imp.handle_cc_msg(0x62, 0x03, &msg, &mut ctx), CcMsgRes::HandledValue);
        assert_eq!(store.value_by_name("Unit_Lock"), Some(FieldValue::Bool(true)));
        assert_eq!(
            store.triggers(),
            vec![EventTrigger::LockStatus {
                node: NodeId::new(0x0a),
                locked: true,
                code: None
            }]
        );
    }

    #[test]
    fn test_write_builds_operation_set() {
        let store = MemoryFieldStore::new();
        let mut imp = DoorLockImpl::new("Unit_Lock");
        imp.info_mut()
            .bind(NodeId::new(0x0a), 1, true, ListenerClass::AlwaysOn);
        let mut defs = Vec::new();
        imp.declare_fields(&mut defs);
        store.register_field(&defs[0]);
        imp.store_field_ids(&mut |name| store.id_of(name));
        let id = store.id_of("Unit_Lock").unwrap();

        let mut out = Vec::new();
        let mut ctx = ImplCtx {
            fields: &store,
            out: &mut out,
            now: Instant::now(),
            send_triggers: true,
        };
        assert_eq!(
            imp.on_field_written(id, &FieldValue::Bool(true), &mut ctx),
            FieldWriteRes::Sent
        );
        // Secure class: the message parks in wait-encrypt until the nonce
        // handshake runs
        assert_eq!(out[0].state(), zwusb_cc::OutMsgState::WaitEncrypt);
    }
}
