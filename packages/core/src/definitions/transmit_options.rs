/// Transmit option bits for SEND_DATA.
pub const TRANSMIT_OPTION_ACK: u8 = 0x01;
pub const TRANSMIT_OPTION_LOW_POWER: u8 = 0x02;
pub const TRANSMIT_OPTION_AUTO_ROUTE: u8 = 0x04;
pub const TRANSMIT_OPTION_NO_ROUTE: u8 = 0x10;
pub const TRANSMIT_OPTION_EXPLORE: u8 = 0x20;

/// What every outgoing message asks for before the caller decides about
/// the receipt ack bit.
pub const DEFAULT_TRANSMIT_OPTIONS: u8 = TRANSMIT_OPTION_AUTO_ROUTE | TRANSMIT_OPTION_EXPLORE;

#[test]
fn test_default_options_with_ack() {
    // The well-known 0x25 seen in traces is default options plus ACK.
    assert_eq!(DEFAULT_TRANSMIT_OPTIONS | TRANSMIT_OPTION_ACK, 0x25);
}
