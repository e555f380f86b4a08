use derive_try_from_primitive::*;

/// The Serial API function ids the runtime uses. The stick knows many more;
/// frames carrying an id outside this list are traced and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum FunctionType {
    GetSerialApiInitData = 0x02,
    SetApplicationNodeInformation = 0x03, // Set up the controller NIF
    ApplicationCommand = 0x04,            // A command class message from another node
    SetSerialApiTimeouts = 0x06,
    GetSerialApiCapabilities = 0x07,
    SendData = 0x13,
    SendDataMulticast = 0x14,
    GetControllerVersion = 0x15,
    GetControllerId = 0x20, // Home ID and controller node id from NVM
    GetNodeProtocolInfo = 0x41,
    ReplicationCommandComplete = 0x44,
    ReplicationSendData = 0x45,
    ApplicationUpdate = 0x49, // Node info frames and update notifications
    SetLearnMode = 0x50,
    RequestNodeInfo = 0x60,
}

impl FunctionType {
    pub fn id(&self) -> u8 {
        *self as u8
    }
}
