use derive_try_from_primitive::*;

/// Delivery outcome reported by the stick in a SEND_DATA callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum TransmitStatus {
    Ok = 0x00,
    NoAck = 0x01,
    Fail = 0x02,
    NotIdle = 0x03,
    NoRoute = 0x04,
}

impl TransmitStatus {
    /// Everything but Ok counts against the owning unit's failure budget.
    pub fn is_failure(&self) -> bool {
        !matches!(self, TransmitStatus::Ok)
    }
}
