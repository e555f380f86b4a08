//! Typed inbound messages. The codec hands over the message buffer of a
//! checksum-verified data frame (LEN, TYPE, FUNC, payload); this module
//! classifies it and strips the encapsulation layers the rest of the
//! runtime should not have to see.

use crate::commands::{MultiChannelCmd, SecurityCmd, WakeupCmd};
use bytes::Bytes;
use std::time::Instant;
use zwusb_core::prelude::*;

/// What an inbound data frame turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InMsgClass {
    /// The immediate response to a request we submitted.
    Response,
    /// A SEND_DATA transmit callback: delivery outcome for a callback id.
    TransAck,
    /// A command-class message from a node.
    AppCmd,
    /// A node info frame or update notification.
    AppUpdate,
    /// A request we don't model; surfaced for tracing only.
    OtherRequest,
}

#[derive(Clone)]
pub struct InMsg {
    msg_type: MessageType,
    function: u8,
    payload: Bytes,
    received: Instant,
    src_ep: u8,
    tar_ep: u8,
    secure: bool,
    original: Option<Box<InMsg>>,
}

impl InMsg {
    /// Build from a verified frame's message buffer. Returns None for
    /// buffers too short to carry TYPE and FUNC.
    pub fn from_message(msg: &[u8], received: Instant) -> Option<Self> {
        if msg.len() < 3 {
            return None;
        }
        let msg_type = MessageType::try_from(msg[1]).ok()?;
        Some(Self {
            msg_type,
            function: msg[2],
            payload: Bytes::copy_from_slice(&msg[3..]),
            received,
            src_ep: 0,
            tar_ep: 0,
            secure: false,
            original: None,
        })
    }

    pub fn classify(&self) -> InMsgClass {
        if self.msg_type == MessageType::Response {
            return InMsgClass::Response;
        }
        match FunctionType::try_from(self.function) {
            Ok(FunctionType::SendData) => InMsgClass::TransAck,
            Ok(FunctionType::ApplicationCommand) => InMsgClass::AppCmd,
            Ok(FunctionType::ApplicationUpdate) => InMsgClass::AppUpdate,
            _ => InMsgClass::OtherRequest,
        }
    }

    pub fn msg_type(&self) -> MessageType {
        self.msg_type
    }

    pub fn function_id(&self) -> u8 {
        self.function
    }

    pub fn function(&self) -> Option<FunctionType> {
        FunctionType::try_from(self.function).ok()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn received(&self) -> Instant {
        self.received
    }

    /// The endpoint the sender wrote from, when multi-channel encapsulated.
    pub fn src_endpoint(&self) -> u8 {
        self.src_ep
    }

    pub fn tar_endpoint(&self) -> u8 {
        self.tar_ep
    }

    /// Whether this payload arrived under security encapsulation.
    pub fn was_secure(&self) -> bool {
        self.secure
    }

    /// The encapsulated frame this one was unwrapped from.
    pub fn original(&self) -> Option<&InMsg> {
        self.original.as_deref()
    }

    // ------------------------------------------------------------------
    // TransAck accessors
    // ------------------------------------------------------------------

    /// The callback id of a transmit callback.
    pub fn trans_ack_callback(&self) -> Option<u8> {
        match self.classify() {
            InMsgClass::TransAck => self.payload.first().copied(),
            _ => None,
        }
    }

    /// The delivery outcome of a transmit callback.
    pub fn trans_ack_status(&self) -> Option<TransmitStatus> {
        match self.classify() {
            InMsgClass::TransAck => TransmitStatus::try_from(*self.payload.get(1)?).ok(),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Application command accessors
    // ------------------------------------------------------------------

    /// The sending node of an application command.
    pub fn src_node(&self) -> Option<NodeId> {
        match self.classify() {
            InMsgClass::AppCmd => Some(NodeId::new(*self.payload.get(1)?)),
            InMsgClass::AppUpdate => Some(NodeId::new(*self.payload.get(1)?)),
            _ => None,
        }
    }

    /// The command-class bytes of an application command: class, command,
    /// then the CC payload.
    pub fn cc_bytes(&self) -> Option<&[u8]> {
        if self.classify() != InMsgClass::AppCmd {
            return None;
        }
        let len = *self.payload.get(2)? as usize;
        self.payload.get(3..3 + len)
    }

    pub fn class_id(&self) -> Option<u8> {
        Some(*self.cc_bytes()?.first()?)
    }

    pub fn cmd_id(&self) -> Option<u8> {
        self.cc_bytes()?.get(1).copied()
    }

    /// A CC payload byte, indexed from the class byte.
    pub fn cc_byte_at(&self, index: usize) -> Option<u8> {
        self.cc_bytes()?.get(index).copied()
    }

    pub fn is_wakeup_notification(&self) -> bool {
        self.class_id() == Some(CommandClass::Wakeup.id())
            && self.cmd_id() == Some(WakeupCmd::Notification as u8)
    }

    pub fn is_node_info(&self) -> bool {
        self.classify() == InMsgClass::AppUpdate
    }

    /// Whether the CC payload is a multi-channel encapsulation wrapper.
    pub fn is_multi_channel_encap(&self) -> bool {
        self.class_id() == Some(CommandClass::MultiChannel.id())
            && self.cmd_id() == Some(MultiChannelCmd::CmdEncap as u8)
    }

    /// Whether the CC payload is an S0 security encapsulation.
    pub fn is_security_encap(&self) -> bool {
        self.class_id() == Some(CommandClass::Security.id())
            && matches!(
                self.cmd_id(),
                Some(c) if c == SecurityCmd::MessageEncap as u8
                    || c == SecurityCmd::MessageEncapNonceGet as u8
            )
    }

    /// Unwrap a multi-channel encapsulated command into the inner command,
    /// recording the endpoints. Returns None when the wrapper is malformed.
    pub fn strip_multi_channel(&self) -> Option<InMsg> {
        if !self.is_multi_channel_encap() {
            return None;
        }
        let cc = self.cc_bytes()?;
        let (src_ep, tar_ep) = (*cc.get(2)?, *cc.get(3)?);
        let inner = cc.get(4..)?;
        if inner.len() < 2 {
            return None;
        }

        let mut payload = Vec::with_capacity(3 + inner.len());
        payload.extend_from_slice(&self.payload[..2]);
        payload.push(inner.len() as u8);
        payload.extend_from_slice(inner);

        Some(InMsg {
            msg_type: self.msg_type,
            function: self.function,
            payload: payload.into(),
            received: self.received,
            src_ep,
            tar_ep,
            secure: self.secure,
            original: Some(Box::new(self.clone())),
        })
    }

    /// Rebuild this message around a decrypted inner CC payload. Used by
    /// the security engine only.
    pub fn with_inner_cc(&self, inner: &[u8]) -> Option<InMsg> {
        if inner.len() < 2 {
            return None;
        }
        let mut payload = Vec::with_capacity(3 + inner.len());
        payload.extend_from_slice(self.payload.get(..2)?);
        payload.push(inner.len() as u8);
        payload.extend_from_slice(inner);

        Some(InMsg {
            msg_type: self.msg_type,
            function: self.function,
            payload: payload.into(),
            received: self.received,
            src_ep: self.src_ep,
            tar_ep: self.tar_ep,
            secure: true,
            original: Some(Box::new(self.clone())),
        })
    }
}

impl std::fmt::Debug for InMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMsg")
            .field("type", &self.msg_type)
            .field("func", &format_args!("{:#04x}", self.function))
            .field("class", &self.classify())
            .field("payload", &hex::encode(&self.payload))
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn app_cmd(src: u8, cc: &[u8]) -> InMsg {
        let mut msg = vec![0u8, 0x00, 0x04, 0x00, src, cc.len() as u8];
        msg.extend_from_slice(cc);
        msg[0] = msg.len() as u8;
        InMsg::from_message(&msg, Instant::now()).unwrap()
    }

    #[test]
    fn test_classify_trans_ack() {
        // Request, SEND_DATA, callback 0x21, status 0x00
        let msg = InMsg::from_message(&[0x05, 0x00, 0x13, 0x21, 0x00], Instant::now()).unwrap();
        assert_eq!(msg.classify(), InMsgClass::TransAck);
        assert_eq!(msg.trans_ack_callback(), Some(0x21));
        assert_eq!(msg.trans_ack_status(), Some(TransmitStatus::Ok));
    }

    #[test]
    fn test_classify_response() {
        let msg = InMsg::from_message(&[0x04, 0x01, 0x13, 0x01], Instant::now()).unwrap();
        assert_eq!(msg.classify(), InMsgClass::Response);
    }

    #[test]
    fn test_app_cmd_accessors() {
        let msg = app_cmd(0x07, &[0x25, 0x03, 0xff]);
        assert_eq!(msg.classify(), InMsgClass::AppCmd);
        assert_eq!(msg.src_node(), Some(NodeId::new(0x07)));
        assert_eq!(msg.class_id(), Some(0x25));
        assert_eq!(msg.cmd_id(), Some(0x03));
        assert_eq!(msg.cc_byte_at(2), Some(0xff));
    }

    #[test]
    fn test_truncated_cc_is_rejected() {
        // Claims 5 CC bytes but carries 2
        let msg = InMsg::from_message(
            &[0x07, 0x00, 0x04, 0x00, 0x07, 0x05, 0x25, 0x03],
            Instant::now(),
        )
        .unwrap();
        assert_eq!(msg.cc_bytes(), None);
        assert_eq!(msg.class_id(), None);
    }

    #[test]
    fn test_wakeup_notification() {
        let msg = app_cmd(0x12, &[0x84, 0x07]);
        assert!(msg.is_wakeup_notification());
    }

    #[test]
    fn test_strip_multi_channel() {
        // src_ep 3, tar_ep 0, inner BinarySwitch Report 0xFF
        let msg = app_cmd(0x0b, &[0x60, 0x0d, 0x03, 0x00, 0x25, 0x03, 0xff]);
        assert!(msg.is_multi_channel_encap());

        let inner = msg.strip_multi_channel().unwrap();
        assert_eq!(inner.src_endpoint(), 3);
        assert_eq!(inner.tar_endpoint(), 0);
        assert_eq!(inner.class_id(), Some(0x25));
        assert_eq!(inner.cmd_id(), Some(0x03));
        assert_eq!(inner.cc_byte_at(2), Some(0xff));
        assert!(inner.original().is_some());
    }

    #[test]
    fn test_security_encap_detection() {
        let msg = app_cmd(0x0a, &[0x98, 0x81, 0x01, 0x02]);
        assert!(msg.is_security_encap());
        let msg = app_cmd(0x0a, &[0x98, 0xc1, 0x01, 0x02]);
        assert!(msg.is_security_encap());
        let msg = app_cmd(0x0a, &[0x98, 0x80, 0x01, 0x02]);
        assert!(!msg.is_security_encap());
    }
}
