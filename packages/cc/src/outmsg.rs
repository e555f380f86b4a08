//! The outgoing-message building block. A message is born in Working
//! state, has bytes appended, is finalized (which freezes its length byte
//! and decides whether it still needs encryption), and is then handed to
//! the scheduler. The buffer layout matches the Serial API: byte 0 is the
//! LEN byte, byte 1 the TYPE, byte 2 the function id. For command-class
//! messages byte 3 is the target node, byte 4 the CC byte count, byte 5
//! the class and byte 6 the command.

use crate::commands::{MultiChannelCmd, SecurityCmd};
use bytes::BytesMut;
use zwusb_core::prelude::*;
use zwusb_core::security::crypto::{compute_mac, encrypt_aes_ofb, random_bytes};
use zwusb_core::security::keys::SecurityKeys;
use zwusb_core::security::nonce::S0Nonce;

/// Where a message is in its build/encrypt lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OutMsgState {
    Working,
    WaitEncrypt,
    ReadyToSend,
}

/// Counters nest at most this deep.
const MAX_COUNTER_DEPTH: usize = 4;

/// The non-blocking callback marker: the stick will call back, but the
/// scheduler must not wait for it.
pub const CALLBACK_NON_BLOCKING: u8 = 0xff;

#[derive(Clone)]
pub struct OutMsg {
    data: BytesMut,
    state: OutMsgState,
    msg_type: MessageType,
    function: FunctionType,
    target: NodeId,
    is_cc: bool,
    reply_class: u8,
    reply_cmd: u8,
    priority: MessagePriority,
    secure: bool,
    req_nonce: bool,
    freq_listener: bool,
    callback_ofs: usize,
    trans_opts: u8,
    trans_opts_ofs: usize,
    counters: [usize; MAX_COUNTER_DEPTH],
    counter_depth: usize,
    ack_id: u32,
    send_cost: u32,
    send_count: u32,
    original: Option<Box<OutMsg>>,
}

impl OutMsg {
    /// A non-CC request or response carrying only a function id.
    pub fn new(function: FunctionType, msg_type: MessageType, priority: MessagePriority) -> Self {
        let mut msg = Self::empty(function, msg_type, priority);
        msg.push_header();
        msg
    }

    /// A non-CC message with a target node right after the function id.
    pub fn new_for_node(
        target: NodeId,
        function: FunctionType,
        msg_type: MessageType,
        priority: MessagePriority,
    ) -> Self {
        let mut msg = Self::empty(function, msg_type, priority);
        msg.target = target;
        msg.push_header();
        msg.data.extend_from_slice(&[target.into()]);
        msg
    }

    /// Begin a CC request whose expected reply reuses the outgoing class.
    pub fn new_cc(
        target: NodeId,
        class: CommandClass,
        cmd: u8,
        reply_cmd: u8,
        cc_byte_count: u8,
        priority: MessagePriority,
    ) -> Self {
        Self::new_cc_with_reply(target, class, cmd, class.id(), reply_cmd, cc_byte_count, priority)
    }

    /// Begin a CC request whose reply comes back under a different class.
    pub fn new_cc_with_reply(
        target: NodeId,
        class: CommandClass,
        cmd: u8,
        reply_class: u8,
        reply_cmd: u8,
        cc_byte_count: u8,
        priority: MessagePriority,
    ) -> Self {
        let mut msg = Self::empty(FunctionType::SendData, MessageType::Request, priority);
        msg.target = target;
        msg.is_cc = true;
        msg.reply_class = reply_class;
        msg.reply_cmd = reply_cmd;
        msg.push_header();
        msg.data.extend_from_slice(&[target.into()]);

        // The CC byte count, or a counter if the caller doesn't know it yet
        if cc_byte_count > 0 {
            msg.data.extend_from_slice(&[cc_byte_count]);
        } else {
            msg.start_counter();
        }

        msg.data.extend_from_slice(&[class.id(), cmd]);
        msg
    }

    /// The command no-op ping message, ready to send.
    pub fn make_ping(target: NodeId, priority: MessagePriority) -> Self {
        let mut msg = Self::new_cc(target, CommandClass::NoOperation, 0, 0, 2, priority);
        msg.append_transmit_options(true);
        msg.append_callback(false);
        msg.finalize(false, false, false);
        msg
    }

    fn empty(function: FunctionType, msg_type: MessageType, priority: MessagePriority) -> Self {
        Self {
            data: BytesMut::with_capacity(64),
            state: OutMsgState::Working,
            msg_type,
            function,
            target: NodeId::unspecified(),
            is_cc: false,
            reply_class: 0,
            reply_cmd: 0,
            priority,
            secure: false,
            req_nonce: false,
            freq_listener: false,
            callback_ofs: 0,
            trans_opts: 0,
            trans_opts_ofs: 0,
            counters: [0; MAX_COUNTER_DEPTH],
            counter_depth: 0,
            ack_id: next_ack_id(),
            send_cost: 0,
            send_count: 0,
            original: None,
        }
    }

    fn push_header(&mut self) {
        // LEN placeholder until finalize
        self.data
            .extend_from_slice(&[0, self.msg_type as u8, self.function.id()]);
    }

    // ------------------------------------------------------------------
    // Building
    // ------------------------------------------------------------------

    pub fn append_byte(&mut self, byte: u8) {
        assert!(
            self.state == OutMsgState::Working,
            "msg must be in working state to add bytes"
        );
        self.data.extend_from_slice(&[byte]);
    }

    pub fn append_bytes(&mut self, bytes: &[u8]) {
        assert!(
            self.state == OutMsgState::Working,
            "msg must be in working state to add bytes"
        );
        self.data.extend_from_slice(bytes);
    }

    /// Reserve a byte that will be backpatched with the number of bytes
    /// appended between here and the matching [Self::end_counter].
    pub fn start_counter(&mut self) {
        assert!(
            self.state == OutMsgState::Working,
            "msg must be in working state to start a counter"
        );
        assert!(
            self.counter_depth < MAX_COUNTER_DEPTH,
            "out msg counter stack is full"
        );
        self.counters[self.counter_depth] = self.data.len();
        self.counter_depth += 1;
        self.data.extend_from_slice(&[0]);
    }

    /// Close the innermost counter, writing the byte count into the
    /// reserved slot.
    pub fn end_counter(&mut self) {
        assert!(
            self.state == OutMsgState::Working,
            "msg must be in working state to end a counter"
        );
        assert!(self.counter_depth > 0, "no out msg counter to end");
        self.counter_depth -= 1;
        let at = self.counters[self.counter_depth];
        self.data[at] = (self.data.len() - at - 1) as u8;
    }

    /// Append the transmit options byte. Auto-route and explore are always
    /// on; the receipt ack bit is the caller's choice.
    pub fn append_transmit_options(&mut self, receipt_ack: bool) {
        let mut opts = DEFAULT_TRANSMIT_OPTIONS;
        if receipt_ack {
            opts |= TRANSMIT_OPTION_ACK;
        }
        self.trans_opts = opts;
        self.trans_opts_ofs = self.data.len();
        self.data.extend_from_slice(&[opts]);
    }

    /// Reserve the next callback id at the current offset. Non-blocking
    /// callers get 0xFF, which the scheduler treats as "callback will come,
    /// don't wait for it".
    pub fn append_callback(&mut self, non_blocking: bool) {
        let id = if non_blocking {
            CALLBACK_NON_BLOCKING
        } else {
            next_callback_id()
        };
        self.callback_ofs = self.data.len();
        self.data.extend_from_slice(&[id]);
    }

    /// For messages that require a callback byte but no correlation.
    pub fn append_null_callback(&mut self) {
        self.callback_ofs = self.data.len();
        self.data.extend_from_slice(&[0]);
    }

    /// Freeze the message: write the LEN byte and move to ReadyToSend, or
    /// to WaitEncrypt when the target expects this class secured.
    pub fn finalize(&mut self, freq_listener: bool, secure: bool, req_nonce: bool) {
        assert!(
            self.state == OutMsgState::Working,
            "msg must be in working state to finalize"
        );
        assert!(
            self.counter_depth == 0,
            "can't finalize out msg with active counters"
        );

        let len = self.data.len() as u8;
        self.data[0] = len;

        self.freq_listener = freq_listener;
        self.secure = secure;
        if secure {
            self.state = OutMsgState::WaitEncrypt;
            self.req_nonce = req_nonce;
        } else {
            self.state = OutMsgState::ReadyToSend;
            self.req_nonce = false;
        }
    }

    /// Wrap the CC payload in Multi-Channel encapsulation. Must happen
    /// after finalize and before encryption; it splices the four
    /// encapsulation bytes in front of the original class byte and fixes
    /// up the length, CC count and callback offsets.
    pub fn end_point_encap(&mut self, src_ep: u8, tar_ep: u8) {
        assert!(self.is_cc, "cannot end point encap a non-CC msg");
        assert!(
            self.cc_class() != CommandClass::MultiChannel.id(),
            "msg is already end point encapsulated"
        );
        assert!(
            self.state != OutMsgState::Working && self.original.is_none(),
            "cannot encap a msg that is in working state or already encrypted"
        );

        let encap = [
            CommandClass::MultiChannel.id(),
            MultiChannelCmd::CmdEncap as u8,
            src_ep,
            tar_ep,
        ];
        let tail = self.data.split_off(5);
        self.data.extend_from_slice(&encap);
        self.data.extend_from_slice(&tail);

        if self.callback_ofs != 0 {
            self.callback_ofs += 4;
        }
        if self.trans_opts_ofs != 0 {
            self.trans_opts_ofs += 4;
        }

        self.data[0] += 4; // overall length
        self.data[4] += 4; // CC byte count
    }

    /// Encrypt the CC payload in place per S0. The plaintext message is
    /// preserved on the new one so the scheduler can retry the handshake
    /// from scratch if needed.
    pub fn encrypt(&mut self, keys: &SecurityKeys, own_id: NodeId, target_nonce: &S0Nonce) {
        assert!(
            self.state == OutMsgState::WaitEncrypt,
            "only a msg in wait-encrypt state can be encrypted"
        );

        let cc_count = self.data[4] as usize;
        let callback_id = if self.callback_ofs != 0 {
            self.data[self.callback_ofs]
        } else {
            0
        };

        // Plaintext is a reserved zero byte plus the CC bytes
        let mut plaintext = Vec::with_capacity(cc_count + 1);
        plaintext.push(0);
        plaintext.extend_from_slice(&self.data[5..5 + cc_count]);

        // IV: our random half, then the target's nonce
        let rand_half: [u8; 8] = random_bytes();
        let mut iv = [0u8; 16];
        iv[..8].copy_from_slice(&rand_half);
        iv[8..].copy_from_slice(target_nonce.bytes());

        let ciphertext = encrypt_aes_ofb(&plaintext, keys.enc_key(), &iv);

        let sec_cmd = if self.req_nonce {
            SecurityCmd::MessageEncapNonceGet
        } else {
            SecurityCmd::MessageEncap
        } as u8;

        // MAC over the security command, the two node ids, and the
        // ciphertext, seeded with the IV
        let mut auth_data = Vec::with_capacity(16 + 4 + ciphertext.len());
        auth_data.extend_from_slice(&iv);
        auth_data.push(sec_cmd);
        auth_data.push(own_id.into());
        auth_data.push(self.target.into());
        auth_data.push(ciphertext.len() as u8);
        auth_data.extend_from_slice(&ciphertext);
        let mac = compute_mac(&auth_data, keys.auth_key());

        // Keep the plaintext original before rewriting ourselves
        self.original = Some(Box::new(self.clone_without_original()));

        // Rebuild from the CC count byte on
        self.data.truncate(4);
        self.data
            .extend_from_slice(&[(20 + cc_count) as u8, CommandClass::Security.id(), sec_cmd]);
        self.data.extend_from_slice(&iv[..8]);
        self.data.extend_from_slice(&ciphertext);
        self.data.extend_from_slice(&[target_nonce.id()]);
        self.data.extend_from_slice(&mac[..8]);

        if self.trans_opts_ofs != 0 {
            self.trans_opts_ofs = self.data.len();
            self.data.extend_from_slice(&[self.trans_opts]);
        }

        // CC msgs always carry a callback byte; restore the one we had
        self.callback_ofs = self.data.len();
        self.data.extend_from_slice(&[callback_id]);

        self.data[0] = self.data.len() as u8;

        // Encrypted now; the preserved original marks it as having been
        // secure all along
        self.secure = false;
        self.state = OutMsgState::ReadyToSend;
    }

    /// Swap in a fresh callback id for a scheduler-level resend.
    pub fn update_callback(&mut self) {
        if self.needs_callback() {
            let id = next_callback_id();
            self.data[self.callback_ofs] = id;
        }
    }

    fn clone_without_original(&self) -> OutMsg {
        let mut copy = self.clone();
        copy.original = None;
        copy
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn state(&self) -> OutMsgState {
        self.state
    }

    pub fn priority(&self) -> MessagePriority {
        self.priority
    }

    pub fn target(&self) -> NodeId {
        self.target
    }

    pub fn function(&self) -> FunctionType {
        self.function
    }

    pub fn msg_type(&self) -> MessageType {
        self.msg_type
    }

    pub fn ack_id(&self) -> u32 {
        self.ack_id
    }

    pub fn is_cc(&self) -> bool {
        self.is_cc
    }

    pub fn secure(&self) -> bool {
        self.secure
    }

    pub fn request_nonce(&self) -> bool {
        self.req_nonce
    }

    pub fn freq_listener(&self) -> bool {
        self.freq_listener
    }

    /// The CC class byte. Only meaningful for CC messages.
    pub fn cc_class(&self) -> u8 {
        assert!(self.is_cc, "not a command class msg");
        self.data[5]
    }

    pub fn cc_cmd(&self) -> u8 {
        assert!(self.is_cc, "not a command class msg");
        self.data[6]
    }

    /// The CC payload: class, command, then the command bytes. For an
    /// endpoint-encapsulated message this starts with the encapsulation
    /// wrapper.
    pub fn cc_bytes(&self) -> &[u8] {
        assert!(self.is_cc, "not a command class msg");
        let count = self.data[4] as usize;
        &self.data[5..5 + count]
    }

    /// A ping is a CC msg whose class and command are both zero.
    pub fn is_ping(&self) -> bool {
        self.is_cc && self.data[5] == 0 && self.data[6] == 0
    }

    /// The callback id currently in the message, if a slot was reserved.
    pub fn callback_id(&self) -> Option<u8> {
        if self.callback_ofs == 0 {
            None
        } else {
            Some(self.data[self.callback_ofs])
        }
    }

    /// Whether the scheduler should wait for a TransAck: a callback slot
    /// exists and holds a real id.
    pub fn needs_callback(&self) -> bool {
        match self.callback_id() {
            Some(id) => id != 0 && id != CALLBACK_NON_BLOCKING,
            None => false,
        }
    }

    /// Whether a specific CC reply resolves this message.
    pub fn expects_reply(&self) -> bool {
        self.reply_class != 0 && self.reply_cmd != 0
    }

    pub fn reply_class(&self) -> u8 {
        self.reply_class
    }

    pub fn reply_cmd(&self) -> u8 {
        self.reply_cmd
    }

    /// True when the given inbound CC identifies the reply this message
    /// is waiting for.
    pub fn is_expected_reply(&self, src: NodeId, class: u8, cmd: u8) -> bool {
        self.expects_reply() && src == self.target && class == self.reply_class && cmd == self.reply_cmd
    }

    /// The finalized buffer: LEN, TYPE, FUNC, payload. This is what the
    /// codec frames with SOF and checksum.
    pub fn as_bytes(&self) -> &[u8] {
        assert!(
            self.state == OutMsgState::ReadyToSend,
            "msg must be ready to send to access wire bytes"
        );
        &self.data
    }

    /// The plaintext message this one replaced when it was encrypted.
    pub fn original(&self) -> Option<&OutMsg> {
        self.original.as_deref()
    }

    pub fn was_encrypted(&self) -> bool {
        self.original.is_some()
    }

    pub fn send_count(&self) -> u32 {
        self.send_count
    }

    pub fn note_send(&mut self, cost: u32) {
        self.send_count += 1;
        self.send_cost += cost;
    }

    pub fn send_cost(&self) -> u32 {
        self.send_cost
    }
}

impl std::fmt::Debug for OutMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutMsg")
            .field("func", &self.function)
            .field("target", &self.target)
            .field("priority", &self.priority)
            .field("state", &self.state)
            .field("ack_id", &self.ack_id)
            .field("data", &hex::encode(&self.data))
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn binary_switch_set(target: u8, value: u8) -> OutMsg {
        let mut msg = OutMsg::new_cc(
            NodeId::new(target),
            CommandClass::BinarySwitch,
            0x01,
            0,
            3,
            MessagePriority::Command,
        );
        msg.append_byte(value);
        msg.append_transmit_options(true);
        msg.append_callback(false);
        msg.finalize(false, false, false);
        msg
    }

    #[test]
    fn test_binary_switch_set_layout() {
        let msg = binary_switch_set(0x07, 0xff);
        let bytes = msg.as_bytes();

        // LEN TYPE FUNC node count class cmd value opts callback
        assert_eq!(bytes.len(), 10);
        assert_eq!(bytes[0], 0x0a, "LEN covers TYPE..checksum");
        assert_eq!(bytes[1], 0x00, "request");
        assert_eq!(bytes[2], 0x13, "SEND_DATA");
        assert_eq!(bytes[3], 0x07);
        assert_eq!(bytes[4], 0x03, "3 CC bytes");
        assert_eq!(&bytes[5..8], &[0x25, 0x01, 0xff]);
        assert_eq!(bytes[8], 0x25, "ack | auto-route | explore");
        let cb = bytes[9];
        assert!(cb != 0 && cb != 0xff);
        assert_eq!(msg.callback_id(), Some(cb));
        assert!(msg.needs_callback());
    }

    #[test]
    fn test_len_invariant() {
        let msg = binary_switch_set(0x07, 0xff);
        assert_eq!(msg.as_bytes()[0] as usize, msg.as_bytes().len());
    }

    #[test]
    fn test_transmit_options_without_ack() {
        let mut msg = OutMsg::new_cc(
            NodeId::new(1),
            CommandClass::Basic,
            0x01,
            0,
            3,
            MessagePriority::Command,
        );
        msg.append_byte(0xff);
        msg.append_transmit_options(false);
        msg.append_null_callback();
        msg.finalize(false, false, false);
        assert_eq!(msg.as_bytes()[8], 0x24);
        assert!(!msg.needs_callback());
        assert_eq!(msg.callback_id(), Some(0));
    }

    #[test]
    fn test_counter_backpatch() {
        let mut msg = OutMsg::new_cc(
            NodeId::new(5),
            CommandClass::Configuration,
            0x04,
            0,
            0, // unknown up front -> counter
            MessagePriority::Command,
        );
        msg.append_bytes(&[0x20, 0x01, 0x7f]);
        msg.end_counter();
        msg.append_transmit_options(true);
        msg.append_callback(false);
        msg.finalize(false, false, false);

        // class + cmd + 3 payload bytes
        assert_eq!(msg.as_bytes()[4], 5);
    }

    #[test]
    #[should_panic(expected = "counter stack is full")]
    fn test_counter_depth_limit() {
        let mut msg = OutMsg::new(
            FunctionType::SendData,
            MessageType::Request,
            MessagePriority::Command,
        );
        for _ in 0..5 {
            msg.start_counter();
        }
    }

    #[test]
    #[should_panic(expected = "active counters")]
    fn test_finalize_with_open_counter_panics() {
        let mut msg = OutMsg::new(
            FunctionType::SendData,
            MessageType::Request,
            MessagePriority::Command,
        );
        msg.start_counter();
        msg.finalize(false, false, false);
    }

    #[test]
    fn test_end_point_encap() {
        let mut msg = binary_switch_set(0x09, 0xff);
        let before = msg.as_bytes().to_vec();
        let cb_before = msg.callback_id().unwrap();

        msg.end_point_encap(0, 2);
        let after = msg.as_bytes();

        // Exactly four bytes longer, callback intact and shifted by four
        assert_eq!(after.len(), before.len() + 4);
        assert_eq!(after[0], before[0] + 4);
        assert_eq!(after[4], before[4] + 4);
        assert_eq!(&after[5..9], &[0x60, 0x0d, 0x00, 0x02]);
        assert_eq!(&after[9..12], &[0x25, 0x01, 0xff]);
        assert_eq!(msg.callback_id(), Some(cb_before));
    }

    #[test]
    fn test_multi_channel_outlet_bytes() {
        // Outlet 2 of an N-channel outlet: MultiChannel encap around a
        // BinarySwitch Set 0xFF
        let mut msg = binary_switch_set(0x0b, 0xff);
        msg.end_point_encap(0, 2);
        let bytes = msg.as_bytes();
        assert_eq!(&bytes[5..12], &[0x60, 0x0d, 0x00, 0x02, 0x25, 0x01, 0xff]);
        assert_eq!(msg.cc_bytes(), &[0x60, 0x0d, 0x00, 0x02, 0x25, 0x01, 0xff]);
    }

    #[test]
    fn test_finalize_secure_goes_to_wait_encrypt() {
        let mut msg = OutMsg::new_cc(
            NodeId::new(0x0a),
            CommandClass::DoorLock,
            0x02,
            0x03,
            2,
            MessagePriority::Query,
        );
        msg.append_transmit_options(true);
        msg.append_callback(false);
        msg.finalize(false, true, false);
        assert_eq!(msg.state(), OutMsgState::WaitEncrypt);
        assert!(msg.secure());
    }

    #[test]
    fn test_encrypt_preserves_original_and_reframes() {
        let keys = SecurityKeys::default();
        let nonce = S0Nonce::new([0x5c, 1, 2, 3, 4, 5, 6, 7]);

        let mut msg = OutMsg::new_cc(
            NodeId::new(0x0a),
            CommandClass::DoorLock,
            0x02,
            0x03,
            2,
            MessagePriority::Query,
        );
        msg.append_transmit_options(true);
        msg.append_callback(false);
        msg.finalize(false, true, false);
        let plain_bytes = msg.data.to_vec();
        let cb = msg.callback_id().unwrap();

        msg.encrypt(&keys, NodeId::new(1), &nonce);

        assert_eq!(msg.state(), OutMsgState::ReadyToSend);
        assert!(!msg.secure(), "encrypted msgs no longer count as secure");
        assert!(msg.was_encrypted());
        assert_eq!(msg.original().unwrap().data.to_vec(), plain_bytes);

        let bytes = msg.as_bytes();
        // 2 CC bytes -> 22 byte secure payload
        assert_eq!(bytes[4], 22);
        assert_eq!(bytes[5], 0x98);
        assert_eq!(bytes[6], 0x81);
        // nonce id sits between ciphertext and MAC
        let nonce_id_ofs = 7 + 8 + 3; // after IV half and ciphertext (2 CC + reserved)
        assert_eq!(bytes[nonce_id_ofs], 0x5c);
        // callback survives at the end
        assert_eq!(*bytes.last().unwrap(), cb);
        assert_eq!(msg.callback_id(), Some(cb));
        assert_eq!(bytes[0] as usize, bytes.len());
    }

    #[test]
    fn test_update_callback_gets_fresh_id() {
        let mut msg = binary_switch_set(0x07, 0x00);
        let first = msg.callback_id().unwrap();
        msg.update_callback();
        let second = msg.callback_id().unwrap();
        assert_ne!(first, second);
        assert!(second != 0 && second != 0xff);
    }

    #[test]
    fn test_update_callback_leaves_null_callback_alone() {
        let mut msg = OutMsg::new_cc(
            NodeId::new(1),
            CommandClass::Basic,
            0x01,
            0,
            3,
            MessagePriority::Command,
        );
        msg.append_byte(0x00);
        msg.append_transmit_options(true);
        msg.append_null_callback();
        msg.finalize(false, false, false);

        msg.update_callback();
        assert_eq!(msg.callback_id(), Some(0));
    }

    #[test]
    fn test_ping() {
        let msg = OutMsg::make_ping(NodeId::new(3), MessagePriority::Async);
        assert!(msg.is_ping());
        assert_eq!(msg.state(), OutMsgState::ReadyToSend);
        let bytes = msg.as_bytes();
        assert_eq!(bytes[4], 2);
        assert_eq!(&bytes[5..7], &[0x00, 0x00]);
    }

    #[test]
    fn test_ack_ids_are_distinct() {
        let a = binary_switch_set(1, 0);
        let b = binary_switch_set(1, 0);
        assert_ne!(a.ack_id(), b.ack_id());
    }
}
