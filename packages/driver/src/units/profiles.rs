//! The composite unit patterns. The device info's `UnitClass` attribute
//! selects one; the profile decides which impls exist, how they are
//! linked, and which extra-info grammar applies.

use crate::ccimpl::{
    find_xinfo, AccessFlags, BatteryImpl, BinaryCarrier, BinaryImpl, CcImpl, ColorSwitchImpl,
    DoorLockImpl, LevelCarrier, LevelImpl, MeterImpl, MlSensorImpl, MlSensorKind, NodeNamingImpl,
    NotificationImpl, SceneActivationImpl, ThermostatModeImpl, ThermostatSetPointImpl,
    SETPOINT_COOLING, SETPOINT_HEATING,
};
use crate::device_info::{parse_num, DevInfo, XInfoItem};
use crate::error::{Error, Result};
use crate::fields::SemanticType;
use crate::units::{ImplLink, UnitConfig};
use zwusb_core::prelude::*;
use zwusb_core::values::TempScale;

/// The unit classes a device info file may declare.
pub const UNIT_CLASSES: &[&str] = &[
    "BinNotSensor",
    "DualBinSensor",
    "GenLightSwitch",
    "GenDimmer",
    "GenRGBW",
    "NCHOutlet",
    "MChCombo",
    "Thermostat",
    "Lock",
    "GenSceneAct",
];

pub struct ProfileBuild {
    pub impls: Vec<Box<dyn CcImpl>>,
    pub links: Vec<ImplLink>,
    /// Impl indexes whose background polling the profile suppresses.
    pub suppress_poll: Vec<usize>,
}

impl ProfileBuild {
    fn new() -> Self {
        Self {
            impls: Vec::new(),
            links: Vec::new(),
            suppress_poll: Vec::new(),
        }
    }
}

/// Build the impl set for a unit. Common auxiliary impls (battery for
/// sleepers, meter, node naming) ride along whenever the device declares
/// the class.
pub fn build_impls(config: &UnitConfig, dev_info: &DevInfo) -> Result<ProfileBuild> {
    let mut build = match dev_info.unit_class.as_str() {
        "BinNotSensor" => bin_not_sensor(config, dev_info)?,
        "DualBinSensor" => dual_bin_sensor(config, dev_info)?,
        "GenLightSwitch" => gen_light_switch(config, dev_info)?,
        "GenDimmer" => gen_dimmer(config, dev_info)?,
        "GenRGBW" => gen_rgbw(config, dev_info)?,
        "NCHOutlet" => nch_outlet(config, dev_info)?,
        "MChCombo" => mch_combo(config, dev_info)?,
        "Thermostat" => thermostat(config, dev_info)?,
        "Lock" => lock(config, dev_info)?,
        "GenSceneAct" => scene_act(config, dev_info)?,
        other => {
            return Err(Error::Config(format!("unknown unit class '{other}'")));
        }
    };

    if dev_info.supports(CommandClass::Battery.id()) {
        let mut imp = BatteryImpl::new(format!("{}_Battery", config.name));
        imp.parse_extra_info(&dev_info.cc_extra_info(CommandClass::Battery.id(), None))?;
        build.impls.push(Box::new(imp));
    }
    if dev_info.supports(CommandClass::Meter.id()) {
        build
            .impls
            .push(Box::new(MeterImpl::new(format!("{}_Watts", config.name))));
    }
    if dev_info.supports(CommandClass::NodeNaming.id()) {
        build.impls.push(Box::new(NodeNamingImpl::new(format!(
            "{}_DevName",
            config.name
        ))));
    }

    Ok(build)
}

/// For profiles with a fixed endpoint span, the highest endpoint the
/// device must actually serve.
pub fn expected_endpoints(dev_info: &DevInfo) -> Option<u8> {
    if dev_info.unit_class != "NCHOutlet" {
        return None;
    }
    let class = outlet_class(dev_info).ok()?;
    let xinfo = dev_info.cc_extra_info(class.class().id(), None);
    let cnt = parse_num(find_xinfo(&xinfo, "Cnt")?)? as u8;
    let start = find_xinfo(&xinfo, "StartNum")
        .and_then(parse_num)
        .unwrap_or(1) as u8;
    Some(start + cnt - 1)
}

fn parse_sensor_type(text: &str) -> Result<SemanticType> {
    Ok(match text {
        "CO" => SemanticType::CO,
        "CO2" => SemanticType::CO2,
        "Door" => SemanticType::Door,
        "Glass" => SemanticType::Glass,
        "Heat" => SemanticType::Heat,
        "Intrusion" => SemanticType::Intrusion,
        "Motion" => SemanticType::Motion,
        "Smoke" => SemanticType::Smoke,
        "Tilt" => SemanticType::Tilt,
        "Water" => SemanticType::Water,
        other => {
            return Err(Error::ExtraInfo(format!("unknown sensor type '{other}'")));
        }
    })
}

fn sensor_suffix(semantic: SemanticType) -> &'static str {
    match semantic {
        SemanticType::CO => "CO",
        SemanticType::CO2 => "CO2",
        SemanticType::Door => "Door",
        SemanticType::Glass => "Glass",
        SemanticType::Heat => "Heat",
        SemanticType::Intrusion => "Intrusion",
        SemanticType::Motion => "Motion",
        SemanticType::Smoke => "Smoke",
        SemanticType::Tilt => "Tilt",
        SemanticType::Water => "Water",
        _ => "State",
    }
}

fn parse_bin_class(text: &str) -> Result<BinaryCarrier> {
    Ok(match text {
        "Basic" => BinaryCarrier::Basic,
        "BinSwitch" => BinaryCarrier::BinarySwitch,
        "BinSensor" => BinaryCarrier::BinarySensor,
        "MLSwitch" => BinaryCarrier::MultiLevelSwitch,
        other => {
            return Err(Error::ExtraInfo(format!("unknown carrier class '{other}'")));
        }
    })
}

/// One sensor impl: a plain binary carrier or the notification grammar.
fn build_sensor(
    name: String,
    class: &str,
    semantic: SemanticType,
    dev_info: &DevInfo,
    endpoint: Option<u8>,
) -> Result<Box<dyn CcImpl>> {
    if class == "Notification" {
        let mut imp = NotificationImpl::new(name, semantic);
        imp.parse_extra_info(&dev_info.cc_extra_info(CommandClass::Notification.id(), endpoint))?;
        Ok(Box::new(imp))
    } else {
        let carrier = parse_bin_class(class)?;
        let mut imp = BinaryImpl::new(carrier, name, semantic, AccessFlags::READ);
        if let Some(ep) = endpoint {
            imp = imp.with_endpoint(ep);
        }
        imp.parse_extra_info(&dev_info.cc_extra_info(carrier.class().id(), endpoint))?;
        Ok(Box::new(imp))
    }
}

/// A single binary or notification sensor driving one field.
fn bin_not_sensor(config: &UnitConfig, dev_info: &DevInfo) -> Result<ProfileBuild> {
    let class = dev_info.unit_extra_info("Class").unwrap_or("BinSensor");
    let semantic = parse_sensor_type(dev_info.unit_extra_info("Type").unwrap_or("Motion"))?;
    let name = format!("{}_{}", config.name, sensor_suffix(semantic));

    let mut build = ProfileBuild::new();
    build
        .impls
        .push(build_sensor(name, class, semantic, dev_info, None)?);
    Ok(build)
}

/// Two binary sensors without multi-channel: they must ride different
/// classes so routing by class alone keeps them apart.
fn dual_bin_sensor(config: &UnitConfig, dev_info: &DevInfo) -> Result<ProfileBuild> {
    let class1 = dev_info
        .unit_extra_info("Class1")
        .ok_or_else(|| Error::ExtraInfo("DualBinSensor requires Class1".into()))?;
    let class2 = dev_info
        .unit_extra_info("Class2")
        .ok_or_else(|| Error::ExtraInfo("DualBinSensor requires Class2".into()))?;
    if class1 == class2 {
        return Err(Error::ExtraInfo(
            "DualBinSensor classes must differ, routing is by class".into(),
        ));
    }
    let type1 = parse_sensor_type(
        dev_info
            .unit_extra_info("Type1")
            .ok_or_else(|| Error::ExtraInfo("DualBinSensor requires Type1".into()))?,
    )?;
    let type2 = parse_sensor_type(
        dev_info
            .unit_extra_info("Type2")
            .ok_or_else(|| Error::ExtraInfo("DualBinSensor requires Type2".into()))?,
    )?;

    let mut build = ProfileBuild::new();
    build.impls.push(build_sensor(
        format!("{}_{}", config.name, sensor_suffix(type1)),
        class1,
        type1,
        dev_info,
        None,
    )?);
    build.impls.push(build_sensor(
        format!("{}_{}", config.name, sensor_suffix(type2)),
        class2,
        type2,
        dev_info,
        None,
    )?);
    Ok(build)
}

fn gen_light_switch(config: &UnitConfig, dev_info: &DevInfo) -> Result<ProfileBuild> {
    let class = config
        .option("/UnitOpt/GenLightSwitch/SwitchType")
        .or_else(|| dev_info.unit_extra_info("SwitchCC"))
        .unwrap_or("BinSwitch");
    let carrier = parse_bin_class(class)?;

    let mut imp = BinaryImpl::new(
        carrier,
        format!("{}_Switch", config.name),
        SemanticType::Switch,
        AccessFlags::READ
            .or(AccessFlags::WRITE)
            .or(AccessFlags::READ_AFTER_WRITE),
    );
    imp.parse_extra_info(&dev_info.cc_extra_info(carrier.class().id(), None))?;

    let mut build = ProfileBuild::new();
    build.impls.push(Box::new(imp));
    Ok(build)
}

/// A dimmer is a switch impl plus a level impl. When both ride Basic the
/// level impl's polling is suppressed: one poll answers for both. A switch
/// in error drags the level impl with it.
fn gen_dimmer(config: &UnitConfig, dev_info: &DevInfo) -> Result<ProfileBuild> {
    let io_type = dev_info.unit_extra_info("IOType").unwrap_or("ReadWrite");
    let readable = match io_type {
        "ReadWrite" => true,
        "Write" => false,
        other => {
            return Err(Error::ExtraInfo(format!("bad IOType '{other}'")));
        }
    };

    let switch_cc = config
        .option("/UnitOpt/GenDimmer/SwitchType")
        .or_else(|| dev_info.unit_extra_info("SwitchCC"))
        .unwrap_or("BinSwitch");
    let dim_cc = config
        .option("/UnitOpt/GenDimmer/DimType")
        .or_else(|| dev_info.unit_extra_info("DimCC"))
        .unwrap_or("MLSwitch");

    let switch_carrier = parse_bin_class(switch_cc)?;
    let dim_carrier = match dim_cc {
        "Basic" => LevelCarrier::Basic,
        "MLSwitch" => LevelCarrier::MultiLevelSwitch,
        other => {
            return Err(Error::ExtraInfo(format!("bad DimCC '{other}'")));
        }
    };

    let mut access = AccessFlags::WRITE.or(AccessFlags::READ_AFTER_WRITE);
    if readable {
        access = access.or(AccessFlags::READ);
    }

    let mut switch = BinaryImpl::new(
        switch_carrier,
        format!("{}_Switch", config.name),
        SemanticType::Switch,
        access,
    );
    switch.parse_extra_info(&dev_info.cc_extra_info(switch_carrier.class().id(), None))?;

    let mut level = LevelImpl::new(dim_carrier, format!("{}_Dimmer", config.name), access);
    level.parse_extra_info(&dev_info.cc_extra_info(dim_carrier.class().id(), None))?;

    let mut build = ProfileBuild::new();
    build.impls.push(Box::new(switch));
    build.impls.push(Box::new(level));
    build.links.push(ImplLink::ErrorFollows { from: 0, to: 1 });
    if switch_carrier == BinaryCarrier::Basic && dim_carrier == LevelCarrier::Basic {
        build.suppress_poll.push(1);
    }
    Ok(build)
}

fn gen_rgbw(config: &UnitConfig, dev_info: &DevInfo) -> Result<ProfileBuild> {
    let mut build = gen_dimmer(config, dev_info)?;
    build
        .impls
        .push(Box::new(ColorSwitchImpl::new(format!("{}_Color", config.name))));
    Ok(build)
}

fn outlet_class(dev_info: &DevInfo) -> Result<BinaryCarrier> {
    let class = dev_info.unit_extra_info("Class").unwrap_or("BinSwitch");
    parse_bin_class(class)
}

/// One binary impl per outlet endpoint, each with its own field. The
/// outlet span comes from the outlet class's extra info; users can rename
/// individual outlets through unit options.
fn nch_outlet(config: &UnitConfig, dev_info: &DevInfo) -> Result<ProfileBuild> {
    let carrier = outlet_class(dev_info)?;
    let xinfo = dev_info.cc_extra_info(carrier.class().id(), None);

    let cnt = parse_num(
        find_xinfo(&xinfo, "Cnt")
            .ok_or_else(|| Error::ExtraInfo("NCHOutlet requires Cnt".into()))?,
    )
    .filter(|v| (1..=127).contains(v))
    .ok_or_else(|| Error::ExtraInfo("bad Cnt".into()))? as u8;
    let start = match find_xinfo(&xinfo, "StartNum") {
        Some(text) => parse_num(text)
            .filter(|v| (1..=127).contains(v))
            .ok_or_else(|| Error::ExtraInfo("bad StartNum".into()))? as u8,
        None => 1,
    };
    if start as u32 + cnt as u32 - 1 > 127 {
        return Err(Error::ExtraInfo(
            "StartNum + Cnt - 1 must not exceed 127".into(),
        ));
    }

    let mut build = ProfileBuild::new();
    for outlet in start..start + cnt {
        let name = config
            .option(&format!("/UnitOpt/Outlet/={outlet}/Name"))
            .map(|n| n.to_string())
            .unwrap_or_else(|| format!("{}_Outlet{outlet}", config.name));
        build.impls.push(Box::new(
            BinaryImpl::new(
                carrier,
                name,
                SemanticType::Switch,
                AccessFlags::READ.or(AccessFlags::WRITE),
            )
            .with_endpoint(outlet),
        ));
    }
    Ok(build)
}

/// The multi-channel combo / multi-sensor composite: a table of
/// `Sensor<i>` descriptors, each `type;primaryCC[;notifyCC]` with the
/// notification parameters appended when a notify impl rides along:
/// `type;primaryCC;Notification;nid-type;ev-type;not-id;off-evs;on-evs`.
/// The ExtraInfo entry's EndPnt attribute scopes the pair to an endpoint.
fn mch_combo(config: &UnitConfig, dev_info: &DevInfo) -> Result<ProfileBuild> {
    let mut build = ProfileBuild::new();

    for i in 1.. {
        let Some(item) = dev_info
            .extra_info
            .iter()
            .find(|x| x.name == format!("Sensor{i}"))
        else {
            break;
        };
        let parts: Vec<&str> = item.value.split(';').map(str::trim).collect();
        if parts.len() < 2 {
            return Err(Error::ExtraInfo(format!("bad Sensor{i} '{}'", item.value)));
        }
        let semantic = parse_sensor_type(parts[0])?;
        let carrier = parse_bin_class(parts[1])?;

        let field = match item.endpoint {
            Some(ep) => format!("{}_{}{}", config.name, sensor_suffix(semantic), ep),
            None => format!("{}_{}", config.name, sensor_suffix(semantic)),
        };

        let mut primary = BinaryImpl::new(carrier, field.clone(), semantic, AccessFlags::READ);
        if let Some(ep) = item.endpoint {
            primary = primary.with_endpoint(ep);
        }
        let primary_index = build.impls.len();
        build.impls.push(Box::new(primary));

        if parts.len() > 2 && parts[2] == "Notification" {
            if parts.len() < 8 {
                return Err(Error::ExtraInfo(format!(
                    "Sensor{i} notification descriptor needs nid-type;ev-type;not-id;off-evs;on-evs"
                )));
            }
            let mut notify = NotificationImpl::new(format!("{field}Note"), semantic);
            let synthetic = [
                ("NIdType", parts[3]),
                ("EvType", parts[4]),
                ("NotId", parts[5]),
                ("OffEvs", parts[6]),
                ("OnEvs", parts[7]),
            ]
            .into_iter()
            .map(|(name, value)| XInfoItem {
                name: name.into(),
                value: value.into(),
                endpoint: item.endpoint,
            })
            .collect::<Vec<_>>();
            notify.parse_extra_info(&synthetic)?;

            let notify_index = build.impls.len();
            build.impls.push(Box::new(notify));
            build.links.push(ImplLink::Mirror {
                a: primary_index,
                b: notify_index,
            });
        }
    }

    if build.impls.is_empty() {
        return Err(Error::ExtraInfo("MChCombo requires at least Sensor1".into()));
    }
    Ok(build)
}

fn temp_options(config: &UnitConfig, dev_info: &DevInfo) -> Result<(TempScale, Option<(f64, f64)>)> {
    let scale = match config
        .option("TempScale")
        .or_else(|| dev_info.unit_extra_info("TempScale"))
        .unwrap_or("F")
    {
        "F" => TempScale::Fahrenheit,
        "C" => TempScale::Celsius,
        other => {
            return Err(Error::Config(format!("bad TempScale '{other}'")));
        }
    };
    let min = config.option("CurTempMin").map(str::parse::<f64>);
    let max = config.option("CurTempMax").map(str::parse::<f64>);
    let range = match (min, max) {
        (Some(Ok(min)), Some(Ok(max))) if min < max => Some((min, max)),
        (None, None) => None,
        _ => {
            return Err(Error::Config("bad CurTempMin/CurTempMax".into()));
        }
    };
    Ok((scale, range))
}

/// Current temperature, optional set points, optional mode, all sharing
/// one scale and range.
fn thermostat(config: &UnitConfig, dev_info: &DevInfo) -> Result<ProfileBuild> {
    let (scale, range) = temp_options(config, dev_info)?;

    let mut build = ProfileBuild::new();
    let mut cur = MlSensorImpl::new(MlSensorKind::Temperature, format!("{}_CurTemp", config.name));
    cur.set_temp_options(scale, range);
    build.impls.push(Box::new(cur));

    if dev_info.supports(CommandClass::ThermostatSetPoint.id()) {
        let mut low =
            ThermostatSetPointImpl::new(format!("{}_LowSetPnt", config.name), SETPOINT_HEATING);
        low.set_temp_options(scale, range);
        build.impls.push(Box::new(low));

        let mut high =
            ThermostatSetPointImpl::new(format!("{}_HighSetPnt", config.name), SETPOINT_COOLING);
        high.set_temp_options(scale, range);
        build.impls.push(Box::new(high));
    }
    if dev_info.supports(CommandClass::ThermostatMode.id()) {
        build
            .impls
            .push(Box::new(ThermostatModeImpl::new(format!("{}_Mode", config.name))));
    }
    Ok(build)
}

/// A lock, with the notification impl mirroring state when the device
/// reports keypad events that way.
fn lock(config: &UnitConfig, dev_info: &DevInfo) -> Result<ProfileBuild> {
    let mut build = ProfileBuild::new();
    build
        .impls
        .push(Box::new(DoorLockImpl::new(format!("{}_Lock", config.name))));

    let notify_xinfo = dev_info.cc_extra_info(CommandClass::Notification.id(), None);
    if dev_info.supports(CommandClass::Notification.id())
        && find_xinfo(&notify_xinfo, "NotId").is_some()
    {
        let mut notify = NotificationImpl::new(
            format!("{}_LockEvent", config.name),
            SemanticType::LockState,
        );
        notify.parse_extra_info(&notify_xinfo)?;
        build.impls.push(Box::new(notify));
        build.links.push(ImplLink::Mirror { a: 0, b: 1 });
    }
    Ok(build)
}

fn scene_act(config: &UnitConfig, dev_info: &DevInfo) -> Result<ProfileBuild> {
    let on_change = config
        .option("/UnitOpt/SceneAct/OnChange")
        .or_else(|| dev_info.unit_extra_info("OnChange"))
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let mut build = ProfileBuild::new();
    build
        .impls
        .push(Box::new(SceneActivationImpl::new(on_change)));
    Ok(build)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device_info::DevInfo;
    use crate::fields::{EventTrigger, FieldStore, FieldValue, MemoryFieldStore};
    use crate::units::Unit;
    use std::time::Instant;
    use zwusb_cc::InMsg;

    fn app_cmd(src: u8, cc: &[u8]) -> InMsg {
        let mut msg = vec![0u8, 0x00, 0x04, 0x00, src, cc.len() as u8];
        msg.extend_from_slice(cc);
        msg[0] = msg.len() as u8;
        InMsg::from_message(&msg, Instant::now()).unwrap()
    }

    fn make_unit(xml: &str, node: u8) -> (Unit, MemoryFieldStore) {
        let store = MemoryFieldStore::new();
        let info = DevInfo::parse_xml(xml).unwrap();
        let config = UnitConfig::new(NodeId::new(node), "Unit", ListenerClass::AlwaysOn);
        let unit = Unit::prepare(config, info, &store).unwrap();
        (unit, store)
    }

    const DUAL_XML: &str = r#"
<Dev Name="DualSensor" ManIds="0x000100020003" UnitClass="DualBinSensor">
  <CCs>
    <CC N="0x20"/>
    <CC N="0x30"/>
  </CCs>
  <ExtraInfo Name="Class1" Value="Basic"/>
  <ExtraInfo Name="Type1" Value="Door"/>
  <ExtraInfo Name="Class2" Value="BinSensor"/>
  <ExtraInfo Name="Type2" Value="Motion"/>
</Dev>
"#;

    #[test]
    fn test_dual_sensor_routing_is_isolated() {
        let (mut unit, store) = make_unit(DUAL_XML, 0x09);
        let mut out = Vec::new();
        let now = Instant::now();

        // BASIC_SET 0xFF updates the door field only
        let basic = app_cmd(0x09, &[0x20, 0x01, 0xff]);
        assert!(unit.handle_app_cmd(&basic, &store, &mut out, now));
        assert_eq!(store.value_by_name("Unit_Door"), Some(FieldValue::Bool(true)));
        assert_eq!(store.value_by_name("Unit_Motion"), None);

        // SENSOR_BINARY_REPORT 0x00 updates the motion field only
        let sensor = app_cmd(0x09, &[0x30, 0x03, 0x00]);
        assert!(unit.handle_app_cmd(&sensor, &store, &mut out, now));
        assert_eq!(store.value_by_name("Unit_Motion"), Some(FieldValue::Bool(false)));
        assert_eq!(store.value_by_name("Unit_Door"), Some(FieldValue::Bool(true)));
    }

    #[test]
    fn test_dual_sensor_same_class_rejected() {
        let xml = DUAL_XML.replace(
            r#"<ExtraInfo Name="Class2" Value="BinSensor"/>"#,
            r#"<ExtraInfo Name="Class2" Value="Basic"/>"#,
        );
        let store = MemoryFieldStore::new();
        let info = DevInfo::parse_xml(&xml).unwrap();
        let config = UnitConfig::new(NodeId::new(9), "Unit", ListenerClass::AlwaysOn);
        assert!(Unit::prepare(config, info, &store).is_err());
    }

    const DIMMER_XML: &str = r#"
<Dev Name="Dimmer" ManIds="0x000100020004" UnitClass="GenDimmer">
  <CCs>
    <CC N="0x25"/>
    <CC N="0x26" V="2"/>
  </CCs>
  <ExtraInfo Name="IOType" Value="ReadWrite"/>
  <ExtraInfo Name="SwitchCC" Value="BinSwitch"/>
  <ExtraInfo Name="DimCC" Value="MLSwitch"/>
</Dev>
"#;

    #[test]
    fn test_dimmer_switch_error_forces_level_error() {
        let (mut unit, store) = make_unit(DIMMER_XML, 0x04);
        let now = Instant::now();

        // Three failed sends on the switch class
        for _ in 0..3 {
            unit.note_comm_failure(Some(0x25), &store, now);
        }
        assert!(unit.impls()[0].info().is_error());
        assert!(unit.impls()[1].info().is_error(), "level follows the switch");
    }

    #[test]
    fn test_management_failures_do_not_error_impls() {
        let (mut unit, store) = make_unit(DIMMER_XML, 0x04);
        let now = Instant::now();

        // Lost auto-config traffic: no impl carries these classes and
        // they say nothing about the data points
        for _ in 0..3 {
            unit.note_comm_failure(Some(0x70), &store, now);
            unit.note_comm_failure(Some(0x85), &store, now);
        }
        assert!(!unit.impls()[0].info().is_error());
        assert!(!unit.impls()[1].info().is_error());
        assert_eq!(unit.comm_failures(), 6, "the unit-level count still runs");
    }

    #[test]
    fn test_dimmer_both_on_basic_suppresses_level_poll() {
        let xml = DIMMER_XML
            .replace("BinSwitch", "Basic")
            .replace("MLSwitch", "Basic");
        let (unit, _) = make_unit(&xml, 0x04);
        assert!(unit.impls()[0].info().polls());
        assert!(!unit.impls()[1].info().polls());
    }

    const OUTLET_XML: &str = r#"
<Dev Name="Outlet" ManIds="0x000100020005" UnitClass="NCHOutlet">
  <CCs>
    <CC N="0x25">
      <ExtraInfo Name="Cnt" Value="3"/>
      <ExtraInfo Name="StartNum" Value="1"/>
    </CC>
    <CC N="0x60" V="2"/>
  </CCs>
</Dev>
"#;

    #[test]
    fn test_outlet_fields_and_write_routing() {
        let (mut unit, store) = make_unit(OUTLET_XML, 0x0b);
        assert!(store.id_of("Unit_Outlet1").is_some());
        assert!(store.id_of("Unit_Outlet2").is_some());
        assert!(store.id_of("Unit_Outlet3").is_some());

        let id = store.id_of("Unit_Outlet2").unwrap();
        let mut out = Vec::new();
        let res = unit.on_field_written(id, &FieldValue::Bool(true), &store, &mut out, Instant::now());
        assert_eq!(res, crate::fields::FieldWriteRes::Sent);

        // Multi-channel encap around BinarySwitch Set 0xFF to endpoint 2
        let bytes = out[0].as_bytes();
        assert_eq!(&bytes[5..12], &[0x60, 0x0d, 0x00, 0x02, 0x25, 0x01, 0xff]);
    }

    #[test]
    fn test_outlet_report_flips_only_its_field() {
        let (mut unit, store) = make_unit(OUTLET_XML, 0x0b);
        let mut out = Vec::new();
        let now = Instant::now();

        let encap = app_cmd(0x0b, &[0x60, 0x0d, 0x02, 0x00, 0x25, 0x03, 0xff]);
        let inner = encap.strip_multi_channel().unwrap();
        assert!(unit.handle_app_cmd(&inner, &store, &mut out, now));
        assert_eq!(store.value_by_name("Unit_Outlet2"), Some(FieldValue::Bool(true)));
        assert_eq!(store.value_by_name("Unit_Outlet1"), None);
        assert_eq!(store.value_by_name("Unit_Outlet3"), None);
    }

    #[test]
    fn test_outlet_span_validation() {
        let xml = OUTLET_XML.replace(
            r#"<ExtraInfo Name="StartNum" Value="1"/>"#,
            r#"<ExtraInfo Name="StartNum" Value="126"/>"#,
        );
        let store = MemoryFieldStore::new();
        let info = DevInfo::parse_xml(&xml).unwrap();
        let config = UnitConfig::new(NodeId::new(11), "Unit", ListenerClass::AlwaysOn);
        assert!(Unit::prepare(config, info, &store).is_err());
    }

    #[test]
    fn test_outlet_endpoint_count_mismatch_kills_unit() {
        let (mut unit, store) = make_unit(OUTLET_XML, 0x0b);
        let mut out = Vec::new();
        // Device advertises only 2 endpoints but the profile needs 3
        let report = app_cmd(0x0b, &[0x60, 0x08, 0x00, 0x02]);
        unit.handle_app_cmd(&report, &store, &mut out, Instant::now());
        assert!(!unit.is_viable());
    }

    const COMBO_XML: &str = r#"
<Dev Name="Combo" ManIds="0x000100020006" UnitClass="MChCombo">
  <CCs>
    <CC N="0x30"/>
    <CC N="0x71" V="4"/>
  </CCs>
  <ExtraInfo Name="Sensor1" Value="Motion;BinSensor;Notification;NotType;NotEvent;7;0;8"/>
</Dev>
"#;

    #[test]
    fn test_combo_mirrors_without_loops() {
        let (mut unit, store) = make_unit(COMBO_XML, 0x0c);
        let mut out = Vec::new();
        let now = Instant::now();

        // The notify impl sees motion; the primary must be pushed along
        // with source=Program
        let report = app_cmd(0x0c, &[0x71, 0x05, 0x00, 0x00, 0x00, 0xff, 0x07, 0x08, 0x00]);
        assert!(unit.handle_app_cmd(&report, &store, &mut out, now));
        assert_eq!(store.value_by_name("Unit_Motion"), Some(FieldValue::Bool(true)));
        assert_eq!(store.value_by_name("Unit_MotionNote"), Some(FieldValue::Bool(true)));

        // Exactly one trigger: the mirror tagged Program must not re-fire
        let motion_triggers: Vec<_> = store
            .triggers()
            .into_iter()
            .filter(|t| matches!(t, EventTrigger::Motion { .. }))
            .collect();
        assert_eq!(motion_triggers.len(), 1);

        // And the primary seeing a report mirrors into the notify impl
        let primary = app_cmd(0x0c, &[0x30, 0x03, 0x00]);
        unit.handle_app_cmd(&primary, &store, &mut out, now);
        assert_eq!(store.value_by_name("Unit_Motion"), Some(FieldValue::Bool(false)));
        assert_eq!(store.value_by_name("Unit_MotionNote"), Some(FieldValue::Bool(false)));
    }

    const THERMO_XML: &str = r#"
<Dev Name="Thermostat" ManIds="0x000100020007" UnitClass="Thermostat">
  <CCs>
    <CC N="0x31" V="5"/>
    <CC N="0x40"/>
    <CC N="0x43"/>
  </CCs>
</Dev>
"#;

    #[test]
    fn test_thermostat_fields() {
        let (_, store) = make_unit(THERMO_XML, 0x20);
        assert!(store.id_of("Unit_CurTemp").is_some());
        assert!(store.id_of("Unit_LowSetPnt").is_some());
        assert!(store.id_of("Unit_HighSetPnt").is_some());
        assert!(store.id_of("Unit_Mode").is_some());
    }

    const SCENE_XML: &str = r#"
<Dev Name="SceneController" ManIds="0x000100020008" UnitClass="GenSceneAct">
  <CCs>
    <CC N="0x2B"/>
  </CCs>
</Dev>
"#;

    #[test]
    fn test_scene_activator_no_fields() {
        let (mut unit, store) = make_unit(SCENE_XML, 0x03);
        assert_eq!(store.field_count(), 0);

        let mut out = Vec::new();
        let msg = app_cmd(0x03, &[0x2b, 0x01, 0x07, 0x00]);
        assert!(unit.handle_app_cmd(&msg, &store, &mut out, Instant::now()));
        assert_eq!(
            store.triggers(),
            vec![EventTrigger::UserAction {
                node: NodeId::new(3),
                action: 7
            }]
        );
    }

    #[test]
    fn test_battery_rides_along() {
        let xml = r#"
<Dev Name="Sensor" ManIds="0x000100020009" UnitClass="BinNotSensor">
  <CCs>
    <CC N="0x30"/>
    <CC N="0x80"/>
  </CCs>
  <ExtraInfo Name="Class" Value="BinSensor"/>
  <ExtraInfo Name="Type" Value="Water"/>
</Dev>
"#;
        let (_, store) = make_unit(xml, 0x15);
        assert!(store.id_of("Unit_Water").is_some());
        assert!(store.id_of("Unit_Battery").is_some());
    }

    #[test]
    fn test_unknown_unit_class_fails() {
        let xml = r#"
<Dev Name="X" ManIds="0x00010002000a" UnitClass="Quantum">
  <CCs><CC N="0x20"/></CCs>
</Dev>
"#;
        let store = MemoryFieldStore::new();
        let info = DevInfo::parse_xml(xml).unwrap();
        let config = UnitConfig::new(NodeId::new(2), "Unit", ListenerClass::AlwaysOn);
        assert!(Unit::prepare(config, info, &store).is_err());
    }
}
