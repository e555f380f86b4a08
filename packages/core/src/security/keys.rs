use super::crypto::encrypt_aes_ecb;
use crate::error::{Error, Result};

pub const NETWORK_KEY_SIZE: usize = 16;
pub type NetworkKey = [u8; NETWORK_KEY_SIZE];

const AUTH_KEY_BASE: &[u8; NETWORK_KEY_SIZE] = &[0x55; NETWORK_KEY_SIZE];
const ENC_KEY_BASE: &[u8; NETWORK_KEY_SIZE] = &[0xaa; NETWORK_KEY_SIZE];

/// The pre-inclusion network key.
pub const DEFAULT_NETWORK_KEY: NetworkKey = [0; NETWORK_KEY_SIZE];

/// The working key pair derived from a network key. Derivation happens at
/// startup and again whenever the network key changes; everything else
/// treats the derived keys as read-only.
#[derive(Clone, PartialEq, Eq)]
pub struct SecurityKeys {
    enc_key: NetworkKey,
    auth_key: NetworkKey,
}

impl SecurityKeys {
    pub fn derive(network_key: &NetworkKey) -> Self {
        let mut enc_key = [0u8; NETWORK_KEY_SIZE];
        let mut auth_key = [0u8; NETWORK_KEY_SIZE];
        enc_key.copy_from_slice(&encrypt_aes_ecb(ENC_KEY_BASE, network_key));
        auth_key.copy_from_slice(&encrypt_aes_ecb(AUTH_KEY_BASE, network_key));
        Self { enc_key, auth_key }
    }

    pub fn derive_from_slice(network_key: &[u8]) -> Result<Self> {
        let key: NetworkKey = network_key
            .try_into()
            .map_err(|_| Error::InvalidKeyLength {
                expected: NETWORK_KEY_SIZE,
                actual: network_key.len(),
            })?;
        Ok(Self::derive(&key))
    }

    pub fn enc_key(&self) -> &[u8] {
        &self.enc_key
    }

    pub fn auth_key(&self) -> &[u8] {
        &self.auth_key
    }
}

impl Default for SecurityKeys {
    fn default() -> Self {
        Self::derive(&DEFAULT_NETWORK_KEY)
    }
}

impl std::fmt::Debug for SecurityKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material
        f.debug_struct("SecurityKeys").finish_non_exhaustive()
    }
}
