//! Command ids within each command class. Only the commands the runtime
//! actually sends or decodes are listed.

use derive_try_from_primitive::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum BasicCmd {
    Set = 0x01,
    Get = 0x02,
    Report = 0x03,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum BinarySwitchCmd {
    Set = 0x01,
    Get = 0x02,
    Report = 0x03,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum MultiLevelSwitchCmd {
    Set = 0x01,
    Get = 0x02,
    Report = 0x03,
    StartLevelChange = 0x04,
    StopLevelChange = 0x05,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum SceneActivationCmd {
    Set = 0x01,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum BinarySensorCmd {
    Get = 0x02,
    Report = 0x03,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum MultiLevelSensorCmd {
    Get = 0x04,
    Report = 0x05,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum MeterCmd {
    Get = 0x01,
    Report = 0x02,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum ColorSwitchCmd {
    SupportedGet = 0x01,
    SupportedReport = 0x02,
    Get = 0x03,
    Report = 0x04,
    Set = 0x05,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum ThermostatModeCmd {
    Set = 0x01,
    Get = 0x02,
    Report = 0x03,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum ThermostatSetPointCmd {
    Set = 0x01,
    Get = 0x02,
    Report = 0x03,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum MultiChannelCmd {
    EndPointGet = 0x07,
    EndPointReport = 0x08,
    CapabilityGet = 0x09,
    CapabilityReport = 0x0a,
    CmdEncap = 0x0d,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum DoorLockCmd {
    OperationSet = 0x01,
    OperationGet = 0x02,
    OperationReport = 0x03,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum ConfigurationCmd {
    Set = 0x04,
    Get = 0x05,
    Report = 0x06,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum NotificationCmd {
    Get = 0x04,
    Report = 0x05,
    Set = 0x06,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum ManufacturerSpecificCmd {
    Get = 0x04,
    Report = 0x05,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum NodeNamingCmd {
    NameSet = 0x01,
    NameGet = 0x02,
    NameReport = 0x03,
    LocationSet = 0x04,
    LocationGet = 0x05,
    LocationReport = 0x06,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum BatteryCmd {
    Get = 0x02,
    Report = 0x03,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum WakeupCmd {
    IntervalSet = 0x04,
    IntervalGet = 0x05,
    IntervalReport = 0x06,
    Notification = 0x07,
    NoMoreInformation = 0x08,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum AssociationCmd {
    Set = 0x01,
    Get = 0x02,
    Report = 0x03,
    Remove = 0x04,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum MultiChannelAssociationCmd {
    Set = 0x01,
    Get = 0x02,
    Report = 0x03,
    Remove = 0x04,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum VersionCmd {
    Get = 0x11,
    Report = 0x12,
    CommandClassGet = 0x13,
    CommandClassReport = 0x14,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum SecurityCmd {
    CommandsSupportedGet = 0x02,
    CommandsSupportedReport = 0x03,
    SchemeGet = 0x04,
    SchemeReport = 0x05,
    NetworkKeySet = 0x06,
    NetworkKeyVerify = 0x07,
    NonceGet = 0x40,
    NonceReport = 0x80,
    MessageEncap = 0x81,
    MessageEncapNonceGet = 0xc1,
}
