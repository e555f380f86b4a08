use crate::ccimpl::{AccessFlags, CcImpl, CcImplInfo, CcMsgRes, ImplCtx, ValueChange};
use crate::fields::{
    FieldAccess, FieldDef, FieldId, FieldType, FieldValue, FieldWriteRes, SemanticType,
};
use zwusb_cc::commands::{ThermostatModeCmd, ThermostatSetPointCmd};
use zwusb_cc::InMsg;
use zwusb_core::prelude::*;
use zwusb_core::values::{convert_temp, SensorValue, TempScale};

/// Thermostat mode as a card field holding the raw mode number
/// (0=Off, 1=Heat, 2=Cool, 3=Auto, ...).
pub struct ThermostatModeImpl {
    info: CcImplInfo,
    field_name: String,
    field_id: Option<FieldId>,
    value: Option<u8>,
    pending_write: Option<(u32, u8)>,
    change: Option<ValueChange>,
}

const MODE_MAX: u8 = 0x1f;

impl ThermostatModeImpl {
    pub fn new(field_name: impl Into<String>) -> Self {
        let field_name = field_name.into();
        Self {
            info: CcImplInfo::new(
                CommandClass::ThermostatMode,
                field_name.clone(),
                AccessFlags::READ.or(AccessFlags::WRITE),
            ),
            field_name,
            field_id: None,
            value: None,
            pending_write: None,
            change: None,
        }
    }

    fn apply(&mut self, mode: u8, source: ValueSource, ctx: &mut ImplCtx) {
        let was_in_error = self.info.is_error();
        if source == ValueSource::Unit && self.info.note_valid_value(ctx.now) {
            self.info.mark_fields_error(ctx.fields, false);
        }
        let changed = self.value != Some(mode);
        self.value = Some(mode);
        if let Some(id) = self.field_id {
            ctx.fields.write_value(id, FieldValue::Card(mode as u32));
        }
        if changed || was_in_error {
            self.change = Some(ValueChange {
                impl_id: self.info.impl_id,
                source,
                was_in_error,
                value: FieldValue::Card(mode as u32),
            });
        }
    }

}

impl CcImpl for ThermostatModeImpl {
    fn info(&self) -> &CcImplInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut CcImplInfo {
        &mut self.info
    }

    fn handle_cc_msg(&mut self, class: u8, cmd: u8, msg: &InMsg, ctx: &mut ImplCtx) -> CcMsgRes {
        if class != CommandClass::ThermostatMode.id() || cmd != ThermostatModeCmd::Report as u8 {
            return CcMsgRes::Unhandled;
        }
        let Some(raw) = msg.cc_byte_at(2) else {
            return CcMsgRes::HandledNoValue;
        };
        self.apply(raw & MODE_MAX, ValueSource::Unit, ctx);
        CcMsgRes::HandledValue
    }

    fn send_value_query(&mut self, priority: MessagePriority, ctx: &mut ImplCtx) {
        ctx.out.push(self.info.build_get(
            ThermostatModeCmd::Get as u8,
            ThermostatModeCmd::Report as u8,
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
        let mode = match value.as_card() {
            Some(v) if v <= MODE_MAX as u32 => v as u8,
            _ => return FieldWriteRes::Rejected,
        };
        let msg = self
            .info
            .build_set(ThermostatModeCmd::Set as u8, &[mode], MessagePriority::Command);
        self.pending_write = Some((msg.ack_id(), mode));
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
            .semantic(SemanticType::ThermostatMode)
            .limits(0, MODE_MAX as i64),
        );
    }

    fn store_field_ids(&mut self, lookup: &mut dyn FnMut(&str) -> Option<FieldId>) {
        if let Some(id) = lookup(&self.field_name) {
            self.field_id = Some(id);
            self.info.add_field_id(id);
        }
    }

    fn on_write_delivered(&mut self, ack_id: u32, ctx: &mut ImplCtx) {
        if let Some((pending_ack, mode)) = self.pending_write {
            if pending_ack == ack_id {
                self.pending_write = None;
                self.apply(mode, ValueSource::Driver, ctx);
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

/// Heating (1) or cooling (2) set point, as a float field in the unit's
/// configured scale.
pub struct ThermostatSetPointImpl {
    info: CcImplInfo,
    field_name: String,
    field_id: Option<FieldId>,
    setpoint_type: u8,
    scale: TempScale,
    range: (f64, f64),
    value: Option<f64>,
    pending_write: Option<(u32, f64)>,
    change: Option<ValueChange>,
}

pub const SETPOINT_HEATING: u8 = 0x01;
pub const SETPOINT_COOLING: u8 = 0x02;

impl ThermostatSetPointImpl {
    pub fn new(field_name: impl Into<String>, setpoint_type: u8) -> Self {
        let field_name = field_name.into();
        Self {
            info: CcImplInfo::new(
                CommandClass::ThermostatSetPoint,
                field_name.clone(),
                AccessFlags::READ.or(AccessFlags::WRITE),
            ),
            field_name,
            field_id: None,
            setpoint_type,
            scale: TempScale::Fahrenheit,
            range: (40.0, 100.0),
            value: None,
            pending_write: None,
            change: None,
        }
    }

    pub fn set_temp_options(&mut self, scale: TempScale, range: Option<(f64, f64)>) {
        self.scale = scale;
        if let Some(range) = range {
            self.range = range;
        } else if scale == TempScale::Celsius {
            self.range = (5.0, 40.0);
        }
    }

    fn apply(&mut self, value: f64, source: ValueSource, ctx: &mut ImplCtx) {
        let was_in_error = self.info.is_error();
        if source == ValueSource::Unit && self.info.note_valid_value(ctx.now) {
            self.info.mark_fields_error(ctx.fields, false);
        }
        let changed = self.value != Some(value);
        self.value = Some(value);
        if let Some(id) = self.field_id {
            ctx.fields.write_value(id, FieldValue::Float(value));
        }
        if changed || was_in_error {
            self.change = Some(ValueChange {
                impl_id: self.info.impl_id,
                source,
                was_in_error,
                value: FieldValue::Float(value),
            });
        }
    }

}

impl CcImpl for ThermostatSetPointImpl {
    fn info(&self) -> &CcImplInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut CcImplInfo {
        &mut self.info
    }

    fn handle_cc_msg(&mut self, class: u8, cmd: u8, msg: &InMsg, ctx: &mut ImplCtx) -> CcMsgRes {
        if class != CommandClass::ThermostatSetPoint.id()
            || cmd != ThermostatSetPointCmd::Report as u8
        {
            return CcMsgRes::Unhandled;
        }
        // [2] = setpoint type (low nibble), [3..] = packed value
        if msg.cc_byte_at(2).map(|t| t & 0x0f) != Some(self.setpoint_type) {
            return CcMsgRes::Unhandled;
        }
        let Some(cc) = msg.cc_bytes() else {
            return CcMsgRes::HandledNoValue;
        };
        let Some((decoded, _)) = SensorValue::decode(&cc[3..]) else {
            return CcMsgRes::HandledNoValue;
        };
        let device_scale = TempScale::from_report_bits(decoded.scale_bits);
        let value = convert_temp(decoded.value, device_scale, self.scale);
        self.apply(value, ValueSource::Unit, ctx);
        CcMsgRes::HandledValue
    }

    fn send_value_query(&mut self, priority: MessagePriority, ctx: &mut ImplCtx) {
        let mut msg = zwusb_cc::OutMsg::new_cc(
            self.info.node(),
            CommandClass::ThermostatSetPoint,
            ThermostatSetPointCmd::Get as u8,
            ThermostatSetPointCmd::Report as u8,
            3,
            priority,
        );
        msg.append_byte(self.setpoint_type);
        msg.append_transmit_options(true);
        msg.append_callback(false);
        msg.finalize(false, self.info.secure(), false);
        ctx.out.push(msg);
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
        let Some(temp) = value.as_float() else {
            return FieldWriteRes::Rejected;
        };
        if temp < self.range.0 || temp > self.range.1 {
            return FieldWriteRes::Rejected;
        }

        let encoded = SensorValue::encode_2byte(temp, 1, self.scale.report_bits());
        let payload = [self.setpoint_type, encoded[0], encoded[1], encoded[2]];
        let msg = self.info.build_set(
            ThermostatSetPointCmd::Set as u8,
            &payload,
            MessagePriority::Command,
        );
        self.pending_write = Some((msg.ack_id(), temp));
        ctx.out.push(msg);
        FieldWriteRes::Sent
    }

    fn declare_fields(&self, defs: &mut Vec<FieldDef>) {
        let semantic = if self.setpoint_type == SETPOINT_COOLING {
            SemanticType::HighSetPoint
        } else {
            SemanticType::LowSetPoint
        };
        defs.push(
            FieldDef::new(
                self.field_name.clone(),
                FieldType::Float,
                FieldAccess::ReadWrite,
            )
            .semantic(semantic)
            .limits(self.range.0 as i64, self.range.1 as i64),
        );
    }

    fn store_field_ids(&mut self, lookup: &mut dyn FnMut(&str) -> Option<FieldId>) {
        if let Some(id) = lookup(&self.field_name) {
            self.field_id = Some(id);
            self.info.add_field_id(id);
        }
    }

    fn on_write_delivered(&mut self, ack_id: u32, ctx: &mut ImplCtx) {
        if let Some((pending_ack, value)) = self.pending_write {
            if pending_ack == ack_id {
                self.pending_write = None;
                self.apply(value, ValueSource::Driver, ctx);
            }
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

    fn app_cmd(src: u8, cc: &[u8]) -> InMsg {
        let mut msg = vec![0u8, 0x00, 0x04, 0x00, src, cc.len() as u8];
        msg.extend_from_slice(cc);
        msg[0] = msg.len() as u8;
        InMsg::from_message(&msg, Instant::now()).unwrap()
    }

    #[test]
    fn test_mode_report_and_write() {
        let store = MemoryFieldStore::new();
        let mut imp = ThermostatModeImpl::new("Unit_Mode");
        imp.info_mut()
            .bind(NodeId::new(0x20), 1, false, ListenerClass::AlwaysOn);
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
        let msg = app_cmd(0x20, &[0x40, 0x03, 0x02]);
        assert_eq!(imp.handle_cc_msg(0x40, 0x03, &msg, &mut ctx), CcMsgRes::HandledValue);
        assert_eq!(store.value_by_name("Unit_Mode"), Some(FieldValue::Card(2)));

        let id = store.id_of("Unit_Mode").unwrap();
        assert_eq!(
            imp.on_field_written(id, &FieldValue::Card(1), &mut ctx),
            FieldWriteRes::Sent
        );
        assert_eq!(
            imp.on_field_written(id, &FieldValue::Card(99), &mut ctx),
            FieldWriteRes::Rejected
        );
    }

    #[test]
    fn test_setpoint_type_filter_and_round_trip() {
        let store = MemoryFieldStore::new();
        let mut heat = ThermostatSetPointImpl::new("Unit_LowSP", SETPOINT_HEATING);
        heat.info_mut()
            .bind(NodeId::new(0x20), 2, false, ListenerClass::AlwaysOn);
        let mut defs = Vec::new();
        heat.declare_fields(&mut defs);
        store.register_field(&defs[0]);
        heat.store_field_ids(&mut |name| store.id_of(name));

        let mut out = Vec::new();
        let mut ctx = ImplCtx {
            fields: &store,
            out: &mut out,
            now: Instant::now(),
            send_triggers: true,
        };

        // Cooling setpoint must not land on the heating impl
        let cool = app_cmd(0x20, &[0x43, 0x03, 0x02, 0b001_01_010, 0x02, 0xd1]);
        assert_eq!(heat.handle_cc_msg(0x43, 0x03, &cool, &mut ctx), CcMsgRes::Unhandled);

        // 72.1 F heating setpoint
        let msg = app_cmd(0x20, &[0x43, 0x03, 0x01, 0b001_01_010, 0x02, 0xd1]);
        assert_eq!(heat.handle_cc_msg(0x43, 0x03, &msg, &mut ctx), CcMsgRes::HandledValue);
        let Some(FieldValue::Float(v)) = store.value_by_name("Unit_LowSP") else {
            panic!("field not written");
        };
        assert!((v - 72.1).abs() < 1e-9);

        // Write 68.0 F: encoded payload decodes back to the same value
        let id = store.id_of("Unit_LowSP").unwrap();
        assert_eq!(
            heat.on_field_written(id, &FieldValue::Float(68.0), &mut ctx),
            FieldWriteRes::Sent
        );
        let bytes = out.last().unwrap().as_bytes();
        assert_eq!(bytes[7], SETPOINT_HEATING);
        let (decoded, _) = SensorValue::decode(&bytes[8..11]).unwrap();
        assert!((decoded.value - 68.0).abs() < 1e-9);
    }
}
