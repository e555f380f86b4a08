//! Builders for the administrative traffic that is not owned by any one
//! impl: unit bootstrap queries, auto-config writes, wakeup close-out and
//! the handful of controller-local Serial API requests.

use zwusb_cc::commands::{
    AssociationCmd, ConfigurationCmd, ManufacturerSpecificCmd, MultiChannelAssociationCmd,
    MultiChannelCmd, VersionCmd, WakeupCmd,
};
use zwusb_cc::OutMsg;
use zwusb_core::prelude::*;

pub fn build_manufacturer_specific_get(node: NodeId) -> OutMsg {
    let mut msg = OutMsg::new_cc(
        node,
        CommandClass::ManufacturerSpecific,
        ManufacturerSpecificCmd::Get as u8,
        ManufacturerSpecificCmd::Report as u8,
        2,
        MessagePriority::Query,
    );
    msg.append_transmit_options(true);
    msg.append_callback(false);
    msg.finalize(false, false, false);
    msg
}

pub fn build_version_cc_get(node: NodeId, class: u8) -> OutMsg {
    let mut msg = OutMsg::new_cc(
        node,
        CommandClass::Version,
        VersionCmd::CommandClassGet as u8,
        VersionCmd::CommandClassReport as u8,
        3,
        MessagePriority::Query,
    );
    msg.append_byte(class);
    msg.append_transmit_options(true);
    msg.append_callback(false);
    msg.finalize(false, false, false);
    msg
}

pub fn build_endpoint_count_get(node: NodeId) -> OutMsg {
    let mut msg = OutMsg::new_cc(
        node,
        CommandClass::MultiChannel,
        MultiChannelCmd::EndPointGet as u8,
        MultiChannelCmd::EndPointReport as u8,
        2,
        MessagePriority::Query,
    );
    msg.append_transmit_options(true);
    msg.append_callback(false);
    msg.finalize(false, false, false);
    msg
}

/// Tell a sleeper how often to wake up, and who to notify.
pub fn build_wakeup_interval_set(node: NodeId, interval_secs: u32, controller: NodeId) -> OutMsg {
    let mut msg = OutMsg::new_cc(
        node,
        CommandClass::Wakeup,
        WakeupCmd::IntervalSet as u8,
        0,
        6,
        MessagePriority::Command,
    );
    let be = interval_secs.to_be_bytes();
    msg.append_bytes(&[be[1], be[2], be[3], controller.into()]);
    msg.append_transmit_options(true);
    msg.append_callback(false);
    msg.finalize(false, false, false);
    msg
}

/// The close-out after a sleeper's queue has been drained.
pub fn build_no_more_information(node: NodeId) -> OutMsg {
    let mut msg = OutMsg::new_cc(
        node,
        CommandClass::Wakeup,
        WakeupCmd::NoMoreInformation as u8,
        0,
        2,
        MessagePriority::SpecialCmd,
    );
    msg.append_transmit_options(true);
    msg.append_null_callback();
    msg.finalize(false, false, false);
    msg
}

pub fn build_association_set(node: NodeId, group: u8, dest: NodeId) -> OutMsg {
    let mut msg = OutMsg::new_cc(
        node,
        CommandClass::Association,
        AssociationCmd::Set as u8,
        0,
        4,
        MessagePriority::Command,
    );
    msg.append_bytes(&[group, dest.into()]);
    msg.append_transmit_options(true);
    msg.append_callback(false);
    msg.finalize(false, false, false);
    msg
}

/// Multi-channel association targeting a specific endpoint of the
/// destination. The 0x00 marker separates node ids from endpoint pairs.
pub fn build_mc_association_set(node: NodeId, group: u8, dest: NodeId, endpoint: u8) -> OutMsg {
    let mut msg = OutMsg::new_cc(
        node,
        CommandClass::MultiChannelAssociation,
        MultiChannelAssociationCmd::Set as u8,
        0,
        6,
        MessagePriority::Command,
    );
    msg.append_bytes(&[group, 0x00, dest.into(), endpoint]);
    msg.append_transmit_options(true);
    msg.append_callback(false);
    msg.finalize(false, false, false);
    msg
}

pub fn build_configuration_set(node: NodeId, param: u8, value: i64, size: u8) -> OutMsg {
    let mut msg = OutMsg::new_cc(
        node,
        CommandClass::Configuration,
        ConfigurationCmd::Set as u8,
        0,
        0, // counted
        MessagePriority::Command,
    );
    msg.append_bytes(&[param, size]);
    let be = value.to_be_bytes();
    msg.append_bytes(&be[8 - size as usize..]);
    msg.end_counter();
    msg.append_transmit_options(true);
    msg.append_callback(false);
    msg.finalize(false, false, false);
    msg
}

// ----------------------------------------------------------------------
// Controller-local Serial API requests (no target node, immediate
// response frame instead of a transmit callback)
// ----------------------------------------------------------------------

pub fn build_get_controller_id() -> OutMsg {
    let mut msg = OutMsg::new(
        FunctionType::GetControllerId,
        MessageType::Request,
        MessagePriority::SpecialCmd,
    );
    msg.finalize(false, false, false);
    msg
}

pub fn build_get_init_data() -> OutMsg {
    let mut msg = OutMsg::new(
        FunctionType::GetSerialApiInitData,
        MessageType::Request,
        MessagePriority::SpecialCmd,
    );
    msg.finalize(false, false, false);
    msg
}

pub fn build_get_capabilities() -> OutMsg {
    let mut msg = OutMsg::new(
        FunctionType::GetSerialApiCapabilities,
        MessageType::Request,
        MessagePriority::SpecialCmd,
    );
    msg.finalize(false, false, false);
    msg
}

pub fn build_set_serial_api_timeouts(rx_ack_ticks: u8, rx_byte_ticks: u8) -> OutMsg {
    let mut msg = OutMsg::new(
        FunctionType::SetSerialApiTimeouts,
        MessageType::Request,
        MessagePriority::SpecialCmd,
    );
    msg.append_bytes(&[rx_ack_ticks, rx_byte_ticks]);
    msg.finalize(false, false, false);
    msg
}

/// Publish the controller's own NIF: generic controller, no device classes.
pub fn build_appl_node_information(listening: bool) -> OutMsg {
    let mut msg = OutMsg::new(
        FunctionType::SetApplicationNodeInformation,
        MessageType::Request,
        MessagePriority::SpecialCmd,
    );
    msg.append_bytes(&[if listening { 0x01 } else { 0x00 }, 0x02, 0x01]);
    msg.start_counter();
    msg.end_counter(); // zero supported classes advertised
    msg.finalize(false, false, false);
    msg
}

pub fn build_get_node_protocol_info(node: NodeId) -> OutMsg {
    let mut msg = OutMsg::new_for_node(
        node,
        FunctionType::GetNodeProtocolInfo,
        MessageType::Request,
        MessagePriority::SpecialCmd,
    );
    msg.finalize(false, false, false);
    msg
}

pub fn build_request_node_info(node: NodeId) -> OutMsg {
    let mut msg = OutMsg::new_for_node(
        node,
        FunctionType::RequestNodeInfo,
        MessageType::Request,
        MessagePriority::Query,
    );
    msg.finalize(false, false, false);
    msg
}

pub fn build_set_learn_mode(enable: bool) -> OutMsg {
    let mut msg = OutMsg::new(
        FunctionType::SetLearnMode,
        MessageType::Request,
        MessagePriority::SpecialCmd,
    );
    msg.append_byte(if enable { 0x01 } else { 0x00 });
    // Learn-mode callbacks arrive repeatedly; never block on them
    msg.append_callback(true);
    msg.finalize(false, false, false);
    msg
}

pub fn build_replication_send_data(node: NodeId, payload: &[u8]) -> OutMsg {
    let mut msg = OutMsg::new_for_node(
        node,
        FunctionType::ReplicationSendData,
        MessageType::Request,
        MessagePriority::SpecialCmd,
    );
    msg.start_counter();
    msg.append_bytes(payload);
    msg.end_counter();
    msg.append_transmit_options(true);
    msg.append_callback(true);
    msg.finalize(false, false, false);
    msg
}

pub fn build_replication_command_complete() -> OutMsg {
    let mut msg = OutMsg::new(
        FunctionType::ReplicationCommandComplete,
        MessageType::Request,
        MessagePriority::SpecialCmd,
    );
    msg.finalize(false, false, false);
    msg
}

/// Decode a GetNodeProtocolInfo response payload into the listener class.
pub fn decode_protocol_info(payload: &[u8]) -> Option<ListenerClass> {
    let capability = *payload.first()?;
    let security = *payload.get(1)?;
    Some(if capability & 0x80 != 0 {
        ListenerClass::AlwaysOn
    } else if security & 0x60 != 0 {
        // 250 ms or 1000 ms beam wakeup
        ListenerClass::FrequentListener
    } else {
        ListenerClass::Sleeper
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_wakeup_interval_set_layout() {
        let msg = build_wakeup_interval_set(NodeId::new(0x12), 3600, NodeId::new(1));
        let bytes = msg.as_bytes();
        assert_eq!(bytes[4], 6);
        assert_eq!(&bytes[5..7], &[0x84, 0x04]);
        assert_eq!(&bytes[7..10], &[0x00, 0x0e, 0x10]); // 3600 big-endian
        assert_eq!(bytes[10], 0x01);
    }

    #[test]
    fn test_no_more_information_layout() {
        let msg = build_no_more_information(NodeId::new(0x12));
        let bytes = msg.as_bytes();
        assert_eq!(&bytes[5..7], &[0x84, 0x08]);
        assert_eq!(msg.priority(), MessagePriority::SpecialCmd);
        assert!(!msg.needs_callback());
    }

    #[test]
    fn test_configuration_set_sizes() {
        let msg = build_configuration_set(NodeId::new(5), 80, 2, 1);
        let bytes = msg.as_bytes();
        // class, cmd, param, size, one value byte
        assert_eq!(bytes[4], 5);
        assert_eq!(&bytes[5..10], &[0x70, 0x04, 80, 1, 2]);

        let msg = build_configuration_set(NodeId::new(5), 10, 0x1234, 2);
        let bytes = msg.as_bytes();
        assert_eq!(bytes[4], 6);
        assert_eq!(&bytes[7..11], &[10, 2, 0x12, 0x34]);
    }

    #[test]
    fn test_mc_association_marker() {
        let msg = build_mc_association_set(NodeId::new(9), 1, NodeId::new(1), 2);
        let bytes = msg.as_bytes();
        assert_eq!(&bytes[5..11], &[0x8e, 0x01, 1, 0x00, 1, 2]);
    }

    #[test]
    fn test_controller_id_request() {
        let msg = build_get_controller_id();
        let bytes = msg.as_bytes();
        assert_eq!(bytes, &[0x03, 0x00, 0x20]);
    }

    #[test]
    fn test_learn_mode_is_non_blocking() {
        let msg = build_set_learn_mode(true);
        assert_eq!(msg.callback_id(), Some(0xff));
        assert!(!msg.needs_callback());
    }

    #[test]
    fn test_decode_protocol_info() {
        assert_eq!(decode_protocol_info(&[0x80, 0x00]), Some(ListenerClass::AlwaysOn));
        assert_eq!(
            decode_protocol_info(&[0x00, 0x40]),
            Some(ListenerClass::FrequentListener)
        );
        assert_eq!(decode_protocol_info(&[0x00, 0x00]), Some(ListenerClass::Sleeper));
    }
}
