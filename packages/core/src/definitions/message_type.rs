use derive_try_from_primitive::*;

/// The TYPE byte of a data frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum MessageType {
    Request = 0x00,
    Response = 0x01,
}
