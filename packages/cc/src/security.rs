//! The S0 message-level engine: decrypting encapsulated inbound commands
//! and building the nonce-exchange messages. Outgoing encryption lives on
//! [crate::outmsg::OutMsg::encrypt]; this module owns the inbound side
//! because only here the nonce table and MAC verification come together.

use crate::commands::SecurityCmd;
use crate::inmsg::InMsg;
use crate::outmsg::OutMsg;
use std::time::Instant;
use zwusb_core::prelude::*;
use zwusb_core::security::crypto::{compute_mac, decrypt_aes_ofb};
use zwusb_core::security::keys::SecurityKeys;
use zwusb_core::security::nonce::{NonceTable, S0Nonce, S0_HALF_NONCE_SIZE};

const MAC_SIZE: usize = 8;

/// Why an encapsulated frame was dropped. Every variant is a silent drop
/// with one trace line; nothing propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptError {
    Malformed,
    NonceMissing,
    MacMismatch,
}

/// A successfully decrypted frame, plus whether the sender asked for a
/// fresh nonce along with it (MessageEncapNonceGet).
#[derive(Debug)]
pub struct Decrypted {
    pub msg: InMsg,
    pub wants_nonce: bool,
}

/// Unwrap an S0 security encapsulation. Looks up (and consumes) the nonce
/// this controller previously issued under the encapsulated nonce id,
/// verifies the MAC, decrypts, and re-frames the inner command bytes as if
/// they had arrived unencapsulated.
pub fn decrypt_in(
    msg: &InMsg,
    keys: &SecurityKeys,
    own_id: NodeId,
    nonces: &mut NonceTable,
    now: Instant,
) -> std::result::Result<Decrypted, DecryptError> {
    if !msg.is_security_encap() {
        return Err(DecryptError::Malformed);
    }
    let src = msg.src_node().ok_or(DecryptError::Malformed)?;
    let cc = msg.cc_bytes().ok_or(DecryptError::Malformed)?;

    // [class, sec_cmd, IV half, ciphertext.., nonce id, MAC]
    let overhead = 2 + S0_HALF_NONCE_SIZE + 1 + MAC_SIZE;
    if cc.len() < overhead + 3 {
        // The ciphertext must at least hold the reserved byte and an
        // inner class/command pair
        return Err(DecryptError::Malformed);
    }
    let sec_cmd = cc[1];
    let iv_half = &cc[2..2 + S0_HALF_NONCE_SIZE];
    let ciphertext = &cc[2 + S0_HALF_NONCE_SIZE..cc.len() - 1 - MAC_SIZE];
    let nonce_id = cc[cc.len() - 1 - MAC_SIZE];
    let mac = &cc[cc.len() - MAC_SIZE..];

    let own_nonce = nonces
        .take(src, nonce_id, now)
        .ok_or(DecryptError::NonceMissing)?;

    let mut iv = [0u8; 16];
    iv[..S0_HALF_NONCE_SIZE].copy_from_slice(iv_half);
    iv[S0_HALF_NONCE_SIZE..].copy_from_slice(own_nonce.bytes());

    let mut auth_data = Vec::with_capacity(16 + 4 + ciphertext.len());
    auth_data.extend_from_slice(&iv);
    auth_data.push(sec_cmd);
    auth_data.push(src.into());
    auth_data.push(own_id.into());
    auth_data.push(ciphertext.len() as u8);
    auth_data.extend_from_slice(ciphertext);
    let expected = compute_mac(&auth_data, keys.auth_key());
    if expected[..MAC_SIZE] != *mac {
        return Err(DecryptError::MacMismatch);
    }

    let plaintext = decrypt_aes_ofb(ciphertext, keys.enc_key(), &iv);
    // Drop the leading reserved byte
    let inner = &plaintext[1..];
    let msg = msg.with_inner_cc(inner).ok_or(DecryptError::Malformed)?;

    Ok(Decrypted {
        msg,
        wants_nonce: sec_cmd == SecurityCmd::MessageEncapNonceGet as u8,
    })
}

/// Ask a node for a nonce so a parked secure message can be encrypted.
pub fn build_nonce_get(target: NodeId) -> OutMsg {
    let mut msg = OutMsg::new_cc(
        target,
        CommandClass::Security,
        SecurityCmd::NonceGet as u8,
        SecurityCmd::NonceReport as u8,
        2,
        MessagePriority::SpecialCmd,
    );
    msg.append_transmit_options(true);
    msg.append_callback(false);
    msg.finalize(false, false, false);
    msg
}

/// Answer a node's Nonce Get with a freshly issued nonce. Goes out at
/// special priority so the peer's 10 s window isn't eaten by queued
/// traffic; no callback correlation is needed.
pub fn build_nonce_report(target: NodeId, nonce: &S0Nonce) -> OutMsg {
    let mut msg = OutMsg::new_cc(
        target,
        CommandClass::Security,
        SecurityCmd::NonceReport as u8,
        0,
        2 + S0_HALF_NONCE_SIZE as u8,
        MessagePriority::SpecialCmd,
    );
    msg.append_bytes(nonce.bytes());
    msg.append_transmit_options(true);
    msg.append_null_callback();
    msg.finalize(false, false, false);
    msg
}

/// Extract the nonce from a Nonce Report's CC bytes.
pub fn nonce_from_report(msg: &InMsg) -> Option<S0Nonce> {
    if msg.class_id() != Some(CommandClass::Security.id())
        || msg.cmd_id() != Some(SecurityCmd::NonceReport as u8)
    {
        return None;
    }
    S0Nonce::from_slice(msg.cc_bytes()?.get(2..2 + S0_HALF_NONCE_SIZE)?)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::inmsg::InMsg;

    fn app_cmd(src: u8, cc: &[u8]) -> InMsg {
        let mut msg = vec![0u8, 0x00, 0x04, 0x00, src, cc.len() as u8];
        msg.extend_from_slice(cc);
        msg[0] = msg.len() as u8;
        InMsg::from_message(&msg, Instant::now()).unwrap()
    }

    /// Encrypt with the builder, decrypt with the engine: the inner CC
    /// bytes must come back exactly.
    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let keys = SecurityKeys::default();
        let now = Instant::now();

        let controller = NodeId::new(0x01);
        let device = NodeId::new(0x0a);

        // The controller issues a nonce to the device...
        let mut nonces = NonceTable::new();
        let nonce = nonces.generate(device, now);

        // ...which the device uses to encrypt a Door Lock report to us.
        // Build it with our own builder playing the device's role.
        let mut out = OutMsg::new_cc(
            controller,
            CommandClass::DoorLock,
            0x03,
            0,
            3,
            MessagePriority::Command,
        );
        out.append_byte(0xff);
        out.append_transmit_options(true);
        out.append_null_callback();
        out.finalize(false, true, false);
        out.encrypt(&keys, device, &nonce);

        // Lift the secure CC bytes off the wire form and wrap them in an
        // inbound frame from the device
        let wire = out.as_bytes();
        let cc_count = wire[4] as usize;
        let secure_cc = &wire[5..5 + cc_count];
        let inbound = app_cmd(device.into(), secure_cc);

        let decrypted =
            decrypt_in(&inbound, &keys, controller, &mut nonces, now).expect("decrypt failed");
        assert!(!decrypted.wants_nonce);
        assert!(decrypted.msg.was_secure());
        assert_eq!(decrypted.msg.cc_bytes().unwrap(), &[0x62, 0x03, 0xff]);
        assert_eq!(decrypted.msg.src_node(), Some(device));
    }

    #[test]
    fn test_decrypt_rejects_missing_nonce() {
        let keys = SecurityKeys::default();
        let now = Instant::now();
        let mut nonces = NonceTable::new();

        let cc: Vec<u8> = [
            &[0x98, 0x81][..],
            &[0u8; 8][..],   // IV half
            &[1, 2, 3][..],  // ciphertext
            &[0x77][..],     // unknown nonce id
            &[0u8; 8][..],   // MAC
        ]
        .concat();
        let inbound = app_cmd(0x0a, &cc);

        assert_eq!(
            decrypt_in(&inbound, &keys, NodeId::new(1), &mut nonces, now).unwrap_err(),
            DecryptError::NonceMissing
        );
    }

    #[test]
    fn test_decrypt_rejects_bad_mac() {
        let keys = SecurityKeys::default();
        let now = Instant::now();

        let device = NodeId::new(0x0a);
        let mut nonces = NonceTable::new();
        let nonce = nonces.generate(device, now);

        let cc: Vec<u8> = [
            &[0x98, 0x81][..],
            &[0u8; 8][..],
            &[1, 2, 3][..],
            &[nonce.id()][..],
            &[0u8; 8][..], // wrong MAC
        ]
        .concat();
        let inbound = app_cmd(device.into(), &cc);

        assert_eq!(
            decrypt_in(&inbound, &keys, NodeId::new(1), &mut nonces, now).unwrap_err(),
            DecryptError::MacMismatch
        );
    }

    #[test]
    fn test_nonce_is_consumed_even_on_mac_failure() {
        let keys = SecurityKeys::default();
        let now = Instant::now();

        let device = NodeId::new(0x0a);
        let mut nonces = NonceTable::new();
        let nonce = nonces.generate(device, now);

        let cc: Vec<u8> = [
            &[0x98, 0x81][..],
            &[0u8; 8][..],
            &[1, 2, 3][..],
            &[nonce.id()][..],
            &[0u8; 8][..],
        ]
        .concat();
        let inbound = app_cmd(device.into(), &cc);
        let _ = decrypt_in(&inbound, &keys, NodeId::new(1), &mut nonces, now);

        // A replay with the same nonce id must now miss
        assert_eq!(
            decrypt_in(&inbound, &keys, NodeId::new(1), &mut nonces, now).unwrap_err(),
            DecryptError::NonceMissing
        );
    }

    #[test]
    fn test_nonce_get_layout() {
        let msg = build_nonce_get(NodeId::new(0x0a));
        let bytes = msg.as_bytes();
        assert_eq!(bytes[2], 0x13);
        assert_eq!(bytes[3], 0x0a);
        assert_eq!(bytes[4], 2);
        assert_eq!(&bytes[5..7], &[0x98, 0x40]);
        assert_eq!(bytes[7], 0x25);
        assert!(msg.needs_callback());
        assert_eq!(msg.priority(), MessagePriority::SpecialCmd);
        assert!(msg.expects_reply());
        assert!(msg.is_expected_reply(NodeId::new(0x0a), 0x98, 0x80));
    }

    #[test]
    fn test_nonce_report_layout_and_parse() {
        let nonce = S0Nonce::new([0x5c, 1, 2, 3, 4, 5, 6, 7]);
        let msg = build_nonce_report(NodeId::new(0x0a), &nonce);
        let bytes = msg.as_bytes();
        assert_eq!(bytes[4], 10);
        assert_eq!(&bytes[5..7], &[0x98, 0x80]);
        assert_eq!(&bytes[7..15], nonce.bytes());
        assert!(!msg.needs_callback());

        // And the inbound side picks the same nonce back out
        let cc = &bytes[5..5 + bytes[4] as usize];
        let inbound = app_cmd(0x0a, cc);
        assert_eq!(nonce_from_report(&inbound), Some(nonce));
    }
}
