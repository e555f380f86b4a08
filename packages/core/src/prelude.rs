pub use crate::checksum::xor_sum;
pub use crate::counters::{next_ack_id, next_callback_id};
pub use crate::definitions::*;
pub use crate::error::{Error, Result};
pub use crate::security::keys::{NetworkKey, SecurityKeys, NETWORK_KEY_SIZE};
pub use crate::security::nonce::{NonceTable, S0Nonce, S0_HALF_NONCE_SIZE};
