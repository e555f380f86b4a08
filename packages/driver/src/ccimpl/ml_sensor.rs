use crate::ccimpl::{AccessFlags, CcImpl, CcImplInfo, CcMsgRes, ImplCtx, ValueChange};
use crate::fields::{FieldAccess, FieldDef, FieldId, FieldType, FieldValue, SemanticType};
use zwusb_cc::commands::MultiLevelSensorCmd;
use zwusb_cc::InMsg;
use zwusb_core::prelude::*;
use zwusb_core::values::{convert_temp, SensorValue, TempScale};

/// The sensor types this impl knows how to label. Anything else is decoded
/// as a generic float.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MlSensorKind {
    Temperature,
    Luminance,
    Humidity,
    Power,
    Generic(u8),
}

impl MlSensorKind {
    pub fn type_byte(&self) -> u8 {
        match self {
            MlSensorKind::Temperature => 0x01,
            MlSensorKind::Luminance => 0x03,
            MlSensorKind::Power => 0x04,
            MlSensorKind::Humidity => 0x05,
            MlSensorKind::Generic(t) => *t,
        }
    }
}

/// A multi-level sensor value surfaced as a float field. Temperature
/// sensors convert to the configured scale at this boundary; the scale the
/// device used is in the report metadata, so nothing stores both forms.
pub struct MlSensorImpl {
    info: CcImplInfo,
    kind: MlSensorKind,
    field_name: String,
    field_id: Option<FieldId>,
    scale: TempScale,
    range: Option<(f64, f64)>,
    value: Option<f64>,
    change: Option<ValueChange>,
}

impl MlSensorImpl {
    pub fn new(kind: MlSensorKind, field_name: impl Into<String>) -> Self {
        let field_name = field_name.into();
        Self {
            info: CcImplInfo::new(
                CommandClass::MultiLevelSensor,
                field_name.clone(),
                AccessFlags::READ,
            ),
            kind,
            field_name,
            field_id: None,
            scale: TempScale::Fahrenheit,
            range: None,
            value: None,
            change: None,
        }
    }

    /// The unit-level TempScale / CurTempMin / CurTempMax options.
    pub fn set_temp_options(&mut self, scale: TempScale, range: Option<(f64, f64)>) {
        self.scale = scale;
        self.range = range;
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

impl CcImpl for MlSensorImpl {
    fn info(&self) -> &CcImplInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut CcImplInfo {
        &mut self.info
    }

    fn handle_cc_msg(&mut self, class: u8, cmd: u8, msg: &InMsg, ctx: &mut ImplCtx) -> CcMsgRes {
        if class != CommandClass::MultiLevelSensor.id()
            || cmd != MultiLevelSensorCmd::Report as u8
            || !self.info.endpoint_matches(msg)
        {
            return CcMsgRes::Unhandled;
        }
        // Report: sensor type, then the packed value
        if msg.cc_byte_at(2) != Some(self.kind.type_byte()) {
            return CcMsgRes::Unhandled;
        }
        let Some(cc) = msg.cc_bytes() else {
            return CcMsgRes::HandledNoValue;
        };
        let Some((decoded, _)) = SensorValue::decode(&cc[3..]) else {
            return CcMsgRes::HandledNoValue;
        };

        let mut value = decoded.value;
        if self.kind == MlSensorKind::Temperature {
            let device_scale = TempScale::from_report_bits(decoded.scale_bits);
            value = convert_temp(value, device_scale, self.scale);
            if let Some((min, max)) = self.range {
                if value < min || value > max {
                    return CcMsgRes::HandledNoValue;
                }
            }
        }

        let was_in_error = self.info.is_error();
        if self.info.note_valid_value(ctx.now) {
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
                source: ValueSource::Unit,
                was_in_error,
                value: FieldValue::Float(value),
            });
        }
        CcMsgRes::HandledValue
    }

    fn send_value_query(&mut self, priority: MessagePriority, ctx: &mut ImplCtx) {
        ctx.out.push(self.info.build_get(
            MultiLevelSensorCmd::Get as u8,
            MultiLevelSensorCmd::Report as u8,
            priority,
        ));
    }

    fn declare_fields(&self, defs: &mut Vec<FieldDef>) {
        let semantic = match self.kind {
            MlSensorKind::Temperature => SemanticType::CurrentTemp,
            MlSensorKind::Power => SemanticType::Power,
            _ => SemanticType::Generic,
        };
        defs.push(
            FieldDef::new(self.field_name.clone(), FieldType::Float, FieldAccess::Read)
                .semantic(semantic),
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

    fn app_cmd(src: u8, cc: &[u8]) -> InMsg {
        let mut msg = vec![0u8, 0x00, 0x04, 0x00, src, cc.len() as u8];
        msg.extend_from_slice(cc);
        msg[0] = msg.len() as u8;
        InMsg::from_message(&msg, Instant::now()).unwrap()
    }

    fn prepared() -> (MlSensorImpl, MemoryFieldStore) {
        let store = MemoryFieldStore::new();
        let mut imp = MlSensorImpl::new(MlSensorKind::Temperature, "Unit_Temp");
        imp.info_mut()
            .bind(NodeId::new(8), 1, false, ListenerClass::AlwaysOn);
        let mut defs = Vec::new();
        imp.declare_fields(&mut defs);
        store.register_field(&defs[0]);
        imp.store_field_ids(&mut |name| store.id_of(name));
        (imp, store)
    }

    #[test]
    fn test_temp_report_converted_to_configured_scale() {
        let (mut imp, store) = prepared();
        imp.set_temp_options(TempScale::Celsius, None);

        // 72.1 F, precision 1, scale F, size 2
        let raw = 721i16.to_be_bytes();
        let msg = app_cmd(8, &[0x31, 0x05, 0x01, 0b001_01_010, raw[0], raw[1]]);
        let mut out = Vec::new();
        let mut ctx = ImplCtx {
            fields: &store,
            out: &mut out,
            now: Instant::now(),
            send_triggers: true,
        };
        assert_eq!(imp.handle_cc_msg(0x31, 0x05, &msg, &mut ctx), CcMsgRes::HandledValue);

        let Some(FieldValue::Float(v)) = store.value_by_name("Unit_Temp") else {
            panic!("field not written");
        };
        assert!((v - (72.1 - 32.0) * 5.0 / 9.0).abs() < 1e-9);
    }

    #[test]
    fn test_other_sensor_type_not_consumed() {
        let (mut imp, store) = prepared();
        let msg = app_cmd(8, &[0x31, 0x05, 0x03, 0b000_00_001, 50]);
        let mut out = Vec::new();
        let mut ctx = ImplCtx {
            fields: &store,
            out: &mut out,
            now: Instant::now(),
            send_triggers: true,
        };
        assert_eq!(imp.handle_cc_msg(0x31, 0x05, &msg, &mut ctx), CcMsgRes::Unhandled);
    }

    #[test]
    fn test_out_of_range_temp_dropped() {
        let (mut imp, store) = prepared();
        imp.set_temp_options(TempScale::Fahrenheit, Some((-20.0, 120.0)));

        // 200 F, precision 0, scale F, size 2
        let raw = 200i16.to_be_bytes();
        let msg = app_cmd(8, &[0x31, 0x05, 0x01, 0b000_01_010, raw[0], raw[1]]);
        let mut out = Vec::new();
        let mut ctx = ImplCtx {
            fields: &store,
            out: &mut out,
            now: Instant::now(),
            send_triggers: true,
        };
        assert_eq!(
            imp.handle_cc_msg(0x31, 0x05, &msg, &mut ctx),
            CcMsgRes::HandledNoValue
        );
        assert_eq!(store.value_by_name("Unit_Temp"), None);
    }
}
