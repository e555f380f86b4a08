use crate::ccimpl::{
    find_xinfo, parse_byte_list, AccessFlags, CcImpl, CcImplInfo, CcMsgRes, ImplCtx, ValueChange,
};
use crate::device_info::{parse_num, XInfoItem};
use crate::error::{Error, Result};
use crate::fields::{
    EventTrigger, FieldAccess, FieldDef, FieldId, FieldType, FieldValue, SemanticType,
};
use zwusb_cc::commands::NotificationCmd;
use zwusb_cc::InMsg;
use zwusb_core::prelude::*;

/// Where the notification id to match lives in the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotIdType {
    /// The V2+ notification type byte.
    #[default]
    NotType,
    /// The V1 alarm type byte.
    AlarmType,
    /// Both ids are in the new-style positions.
    BothNew,
}

/// Which byte carries the on/off event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvType {
    #[default]
    NotEvent,
    AlarmLevel,
}

// Report layout: [2] V1 alarm type, [3] V1 alarm level, [4] reserved,
// [5] status, [6] notification type, [7] event, [8] properties,
// [9..] event parameters.
const IDX_ALARM_TYPE: usize = 2;
const IDX_ALARM_LEVEL: usize = 3;
const IDX_NOT_TYPE: usize = 6;
const IDX_NOT_EVENT: usize = 7;
const IDX_PROPS: usize = 8;
const IDX_PARAMS: usize = 9;

/// A boolean driven by Notification (or V1 Alarm) reports. Which reports
/// mean on and which mean off is entirely device specific, so it all comes
/// from extra info.
pub struct NotificationImpl {
    info: CcImplInfo,
    field_name: String,
    field_id: Option<FieldId>,
    semantic: SemanticType,
    not_id: u8,
    id_type: NotIdType,
    ev_type: EvType,
    on_evs: Vec<u8>,
    off_evs: Vec<u8>,
    value: Option<bool>,
    change: Option<ValueChange>,
}

impl NotificationImpl {
    pub fn new(field_name: impl Into<String>, semantic: SemanticType) -> Self {
        let field_name = field_name.into();
        Self {
            info: CcImplInfo::new(
                CommandClass::Notification,
                field_name.clone(),
                // Notifications are inherently unsolicited
                AccessFlags::default(),
            ),
            field_name,
            field_id: None,
            semantic,
            not_id: 0,
            id_type: NotIdType::default(),
            ev_type: EvType::default(),
            on_evs: Vec::new(),
            off_evs: Vec::new(),
            value: None,
            change: None,
        }
    }

    fn apply(&mut self, value: bool, code: Option<u8>, source: ValueSource, ctx: &mut ImplCtx) {
        let was_in_error = self.info.is_error();
        if source == ValueSource::Unit && self.info.note_valid_value(ctx.now) {
            self.info.mark_fields_error(ctx.fields, false);
        }
        let changed = self.value != Some(value);
        self.value = Some(value);
        if let Some(id) = self.field_id {
            ctx.fields.write_value(id, FieldValue::Bool(value));
        }
        if changed && source != ValueSource::Program {
            self.emit_trigger(value, code, ctx);
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

    fn emit_trigger(&self, value: bool, code: Option<u8>, ctx: &mut ImplCtx) {
        let node = self.info.node();
        match self.semantic {
            SemanticType::Motion => {
                if ctx.send_triggers {
                    ctx.fields
                        .emit_trigger(EventTrigger::Motion { node, start: value });
                }
            }
            SemanticType::LockState => {
                ctx.fields.emit_trigger(EventTrigger::LockStatus {
                    node,
                    locked: value,
                    code,
                });
            }
            _ => {}
        }
    }
}

impl CcImpl for NotificationImpl {
    fn info(&self) -> &CcImplInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut CcImplInfo {
        &mut self.info
    }

    fn handle_cc_msg(&mut self, class: u8, cmd: u8, msg: &InMsg, ctx: &mut ImplCtx) -> CcMsgRes {
        if class != CommandClass::Notification.id() || cmd != NotificationCmd::Report as u8 {
            return CcMsgRes::Unhandled;
        }

        let type_byte = match self.id_type {
            NotIdType::AlarmType => msg.cc_byte_at(IDX_ALARM_TYPE),
            NotIdType::NotType | NotIdType::BothNew => msg.cc_byte_at(IDX_NOT_TYPE),
        };
        if type_byte != Some(self.not_id) {
            return CcMsgRes::Unhandled;
        }

        let Some(event) = (match self.ev_type {
            EvType::NotEvent => msg.cc_byte_at(IDX_NOT_EVENT),
            EvType::AlarmLevel => msg.cc_byte_at(IDX_ALARM_LEVEL),
        }) else {
            return CcMsgRes::HandledNoValue;
        };

        let value = if self.on_evs.contains(&event) {
            true
        } else if self.off_evs.contains(&event) {
            false
        } else {
            return CcMsgRes::HandledNoValue;
        };

        // Keypad events carry the user code in the first event parameter
        let code = match msg.cc_byte_at(IDX_PROPS) {
            Some(props) if props & 0x1f > 0 => msg.cc_byte_at(IDX_PARAMS),
            _ => None,
        };

        self.apply(value, code, ValueSource::Unit, ctx);
        CcMsgRes::HandledValue
    }

    fn declare_fields(&self, defs: &mut Vec<FieldDef>) {
        defs.push(
            FieldDef::new(self.field_name.clone(), FieldType::Bool, FieldAccess::Read)
                .semantic(self.semantic),
        );
    }

    fn store_field_ids(&mut self, lookup: &mut dyn FnMut(&str) -> Option<FieldId>) {
        if let Some(id) = lookup(&self.field_name) {
            self.field_id = Some(id);
            self.info.add_field_id(id);
        }
    }

    fn parse_extra_info(&mut self, xinfo: &[XInfoItem]) -> Result<()> {
        let not_id = find_xinfo(xinfo, "NotId")
            .ok_or_else(|| Error::ExtraInfo("notification impl requires NotId".into()))?;
        self.not_id = parse_num(not_id)
            .filter(|v| (0..=0xff).contains(v))
            .ok_or_else(|| Error::ExtraInfo(format!("bad NotId '{not_id}'")))? as u8;

        self.id_type = match find_xinfo(xinfo, "NIdType") {
            None | Some("NotType") => NotIdType::NotType,
            Some("AlarmType") => NotIdType::AlarmType,
            Some("BothNew") => NotIdType::BothNew,
            Some(other) => {
                return Err(Error::ExtraInfo(format!("bad NIdType '{other}'")));
            }
        };
        self.ev_type = match find_xinfo(xinfo, "EvType") {
            None | Some("NotEvent") => EvType::NotEvent,
            Some("AlarmLevel") => EvType::AlarmLevel,
            Some(other) => {
                return Err(Error::ExtraInfo(format!("bad EvType '{other}'")));
            }
        };

        self.on_evs = parse_byte_list(find_xinfo(xinfo, "OnEvs").unwrap_or_default())?;
        self.off_evs = parse_byte_list(find_xinfo(xinfo, "OffEvs").unwrap_or_default())?;
        if self.on_evs.is_empty() {
            return Err(Error::ExtraInfo("notification impl requires OnEvs".into()));
        }
        Ok(())
    }

    fn push_value(&mut self, value: &FieldValue, source: ValueSource, ctx: &mut ImplCtx) {
        if let Some(v) = value.as_bool() {
            self.apply(v, None, source, ctx);
        }
    }

    fn take_change(&mut self) -> Option<ValueChange> {
        self.change.take()
    }

    fn current_value(&self) -> Option<FieldValue> {
        self.value.map(FieldValue::Bool)
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

    fn xi(name: &str, value: &str) -> XInfoItem {
        XInfoItem {
            name: name.into(),
            value: value.into(),
            endpoint: None,
        }
    }

    fn motion_impl() -> (NotificationImpl, MemoryFieldStore) {
        let store = MemoryFieldStore::new();
        let mut imp = NotificationImpl::new("Unit_Motion", SemanticType::Motion);
        imp.info_mut()
            .bind(NodeId::new(5), 1, false, ListenerClass::AlwaysOn);
        imp.parse_extra_info(&[
            xi("NotId", "0x07"),
            xi("NIdType", "NotType"),
            xi("EvType", "NotEvent"),
            xi("OnEvs", "7 8"),
            xi("OffEvs", "0"),
        ])
        .unwrap();
        let mut defs = Vec::new();
        imp.declare_fields(&mut defs);
        store.register_field(&defs[0]);
        imp.store_field_ids(&mut |name| store.id_of(name));
        (imp, store)
    }

    #[test]
    fn test_motion_on_off() {
        let (mut imp, store) = motion_impl();
        let mut out = Vec::new();
        let mut ctx = ImplCtx {
            fields: &store,
            out: &mut out,
            now: Instant::now(),
            send_triggers: true,
        };

        // Home Security / motion detected
        let on = app_cmd(5, &[0x71, 0x05, 0x00, 0x00, 0x00, 0xff, 0x07, 0x08, 0x00]);
        assert_eq!(imp.handle_cc_msg(0x71, 0x05, &on, &mut ctx), CcMsgRes::HandledValue);
        assert_eq!(store.value_by_name("Unit_Motion"), Some(FieldValue::Bool(true)));
        assert_eq!(
            store.triggers(),
            vec![EventTrigger::Motion {
                node: NodeId::new(5),
                start: true
            }]
        );

        // idle
        let off = app_cmd(5, &[0x71, 0x05, 0x00, 0x00, 0x00, 0xff, 0x07, 0x00, 0x00]);
        assert_eq!(imp.handle_cc_msg(0x71, 0x05, &off, &mut ctx), CcMsgRes::HandledValue);
        assert_eq!(store.value_by_name("Unit_Motion"), Some(FieldValue::Bool(false)));
    }

    #[test]
    fn test_unlisted_event_ignored() {
        let (mut imp, store) = motion_impl();
        let mut out = Vec::new();
        let mut ctx = ImplCtx {
            fields: &store,
            out: &mut out,
            now: Instant::now(),
            send_triggers: true,
        };
        let msg = app_cmd(5, &[0x71, 0x05, 0x00, 0x00, 0x00, 0xff, 0x07, 0x55, 0x00]);
        assert_eq!(
            imp.handle_cc_msg(0x71, 0x05, &msg, &mut ctx),
            CcMsgRes::HandledNoValue
        );
        assert_eq!(store.value_by_name("Unit_Motion"), None);
    }

    #[test]
    fn test_wrong_notification_type_unhandled() {
        let (mut imp, store) = motion_impl();
        let mut out = Vec::new();
        let mut ctx = ImplCtx {
            fields: &store,
            out: &mut out,
            now: Instant::now(),
            send_triggers: true,
        };
        let msg = app_cmd(5, &[0x71, 0x05, 0x00, 0x00, 0x00, 0xff, 0x06, 0x08, 0x00]);
        assert_eq!(imp.handle_cc_msg(0x71, 0x05, &msg, &mut ctx), CcMsgRes::Unhandled);
    }

    #[test]
    fn test_alarm_style_matching() {
        let store = MemoryFieldStore::new();
        let mut imp = NotificationImpl::new("Unit_Door", SemanticType::Door);
        imp.info_mut()
            .bind(NodeId::new(5), 1, false, ListenerClass::AlwaysOn);
        imp.parse_extra_info(&[
            xi("NotId", "0x15"),
            xi("NIdType", "AlarmType"),
            xi("EvType", "AlarmLevel"),
            xi("OnEvs", "0xff"),
            xi("OffEvs", "0"),
        ])
        .unwrap();
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
        // V1 alarm report: type 0x15, level 0xFF
        let msg = app_cmd(5, &[0x71, 0x05, 0x15, 0xff]);
        assert_eq!(imp.handle_cc_msg(0x71, 0x05, &msg, &mut ctx), CcMsgRes::HandledValue);
        assert_eq!(store.value_by_name("Unit_Door"), Some(FieldValue::Bool(true)));
    }

    #[test]
    fn test_lock_code_in_trigger() {
        let store = MemoryFieldStore::new();
        let mut imp = NotificationImpl::new("Unit_LockNote", SemanticType::LockState);
        imp.info_mut()
            .bind(NodeId::new(0x0a), 2, false, ListenerClass::AlwaysOn);
        imp.parse_extra_info(&[
            xi("NotId", "0x06"),
            xi("OnEvs", "5"),
            xi("OffEvs", "6"),
        ])
        .unwrap();
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
        // Access control / keypad lock, one event parameter: user code 3
        let msg = app_cmd(
            0x0a,
            &[0x71, 0x05, 0x00, 0x00, 0x00, 0xff, 0x06, 0x05, 0x01, 0x03],
        );
        imp.handle_cc_msg(0x71, 0x05, &msg, &mut ctx);
        assert_eq!(
            store.triggers(),
            vec![EventTrigger::LockStatus {
                node: NodeId::new(0x0a),
                locked: true,
                code: Some(3)
            }]
        );
    }

    #[test]
    fn test_requires_not_id() {
        let mut imp = NotificationImpl::new("Unit_Motion", SemanticType::Motion);
        assert!(imp.parse_extra_info(&[xi("OnEvs", "7")]).is_err());
    }
}
