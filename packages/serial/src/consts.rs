use std::time::Duration;

/// How long a data frame write waits for the stick's ACK/NAK/CAN.
pub const ACK_TIMEOUT: Duration = Duration::from_millis(1600);

/// Link-layer attempts per frame (first try plus retries).
pub const MAX_SEND_ATTEMPTS: u32 = 3;

/// Consecutive NAKs before the link is reported failed.
pub const MAX_CONSECUTIVE_NAKS: u32 = 3;

/// Randomized backoff window applied after a CAN.
pub const CAN_BACKOFF_MIN: Duration = Duration::from_millis(100);
pub const CAN_BACKOFF_MAX: Duration = Duration::from_millis(1500);

/// The serial link of the stick itself.
pub const BAUD_RATE: u32 = 115_200;
