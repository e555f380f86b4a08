use derive_try_from_primitive::*;
use nom::{
    branch::alt,
    bytes::streaming::{tag, take, take_till1},
    combinator::{map, peek, value},
    error::context,
    number::streaming::be_u8,
    sequence::tuple,
    IResult,
};
use zwusb_core::checksum::xor_sum;

pub type Input<'a> = &'a [u8];
pub type ParseResult<'a, T> = IResult<Input<'a>, T>;

pub const ACK_BUFFER: [u8; 1] = [SerialControlByte::ACK as u8];
pub const NAK_BUFFER: [u8; 1] = [SerialControlByte::NAK as u8];
pub const CAN_BUFFER: [u8; 1] = [SerialControlByte::CAN as u8];

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum SerialControlByte {
    SOF = 0x01,
    ACK = 0x06,
    NAK = 0x15,
    CAN = 0x18,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SerialFrame {
    ACK,
    NAK,
    CAN,
    Data(SerialData),
    Garbage(Vec<u8>),
}

fn consume_garbage(i: Input) -> ParseResult<SerialFrame> {
    map(
        take_till1(|b| SerialControlByte::try_from(b).is_ok()),
        |g: &[u8]| SerialFrame::Garbage(g.to_vec()),
    )(i)
}

fn parse_control(i: Input) -> ParseResult<SerialFrame> {
    alt((
        value(SerialFrame::ACK, tag(&ACK_BUFFER)),
        value(SerialFrame::NAK, tag(&NAK_BUFFER)),
        value(SerialFrame::CAN, tag(&CAN_BUFFER)),
    ))(i)
}

fn parse_data(i: Input) -> ParseResult<SerialFrame> {
    // Ensure that the buffer contains at least 5 bytes
    peek(take(5usize))(i)?;

    // Ensure that it starts with a SOF byte and extract the length of the rest of the frame
    let (_, (_, len)) = peek(tuple((tag([SerialControlByte::SOF as u8]), be_u8)))(i)?;

    // Take the whole frame: SOF, LEN, and LEN more bytes
    let (i, data) = take(len as usize + 2)(i)?;

    Ok((i, SerialFrame::Data(SerialData::new(data.to_vec()))))
}

impl SerialFrame {
    /// A serial frame is either a control byte, data starting with SOF, or
    /// skipped garbage.
    pub fn parse(i: Input) -> ParseResult<Self> {
        context(
            "Serial Frame",
            alt((consume_garbage, parse_control, parse_data)),
        )(i)
    }
}

impl AsRef<[u8]> for SerialFrame {
    fn as_ref(&self) -> &[u8] {
        match &self {
            SerialFrame::ACK => &ACK_BUFFER,
            SerialFrame::NAK => &NAK_BUFFER,
            SerialFrame::CAN => &CAN_BUFFER,
            SerialFrame::Data(data) => data.as_ref(),
            SerialFrame::Garbage(data) => data,
        }
    }
}

/// A complete data frame as seen on the wire: SOF, LEN, TYPE, FUNC,
/// payload, checksum. LEN counts everything after the LEN byte up to and
/// including the checksum.
#[derive(Clone, Debug, PartialEq)]
pub struct SerialData {
    data: Vec<u8>,
}

impl SerialData {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Frame an outgoing message buffer (LEN byte already at offset 0):
    /// prepend SOF, append the checksum.
    pub fn for_message(msg: &[u8]) -> Self {
        let mut data = Vec::with_capacity(msg.len() + 2);
        data.push(SerialControlByte::SOF as u8);
        data.extend_from_slice(msg);
        data.push(xor_sum(msg));
        Self { data }
    }

    /// Everything between LEN and the checksum: TYPE, FUNC, payload.
    pub fn payload(&self) -> &[u8] {
        &self.data[2..self.data.len() - 1]
    }

    /// The message buffer as the codec hands it to the parser: LEN, TYPE,
    /// FUNC, payload (no SOF, no checksum).
    pub fn message(&self) -> &[u8] {
        &self.data[1..self.data.len() - 1]
    }

    pub fn checksum(&self) -> u8 {
        *self.data.last().expect("frames are never empty")
    }

    pub fn checksum_ok(&self) -> bool {
        xor_sum(self.message()) == self.checksum()
    }
}

impl AsRef<[u8]> for SerialData {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_garbage() {
        let data = hex::decode("07080901").unwrap();
        let expected = hex::decode("070809").unwrap();
        let remaining = hex::decode("01").unwrap();
        assert_eq!(
            consume_garbage(&data),
            Ok((remaining.as_slice(), SerialFrame::Garbage(expected)))
        );
    }

    #[test]
    fn test_control() {
        let data = hex::decode("0606151801").unwrap();
        let remaining = hex::decode("01").unwrap();
        assert_eq!(
            nom::multi::many0(parse_control)(&data),
            Ok((
                remaining.as_slice(),
                vec![
                    SerialFrame::ACK,
                    SerialFrame::ACK,
                    SerialFrame::NAK,
                    SerialFrame::CAN,
                ]
            )),
        );
    }

    #[test]
    fn test_data() {
        let data = hex::decode("01030008f406").unwrap();
        let expected = hex::decode("01030008f4").unwrap();
        let remaining = hex::decode("06").unwrap();
        assert_eq!(
            parse_data(&data),
            Ok((
                remaining.as_slice(),
                SerialFrame::Data(SerialData { data: expected }),
            ))
        );
    }

    #[test]
    fn test_incomplete_data_is_not_a_frame() {
        // LEN says 3 more bytes but only 2 are available yet
        let data = hex::decode("01030008").unwrap();
        assert!(parse_data(&data).is_err());
    }

    #[test]
    fn test_checksum() {
        let frame = SerialData::new(hex::decode("01030008f4").unwrap());
        assert!(frame.checksum_ok());

        let bad = SerialData::new(hex::decode("01030008f5").unwrap());
        assert!(!bad.checksum_ok());
    }

    #[test]
    fn test_encode_decode_round_trip() {
        // encode(decode(bytes)) == bytes for a well-formed frame
        let wire = hex::decode("01030008f4").unwrap();
        let (rest, frame) = SerialFrame::parse(&wire).unwrap();
        assert!(rest.is_empty());
        let SerialFrame::Data(data) = frame else {
            panic!("expected a data frame");
        };
        assert!(data.checksum_ok());
        assert_eq!(SerialData::for_message(data.message()), data);
    }

    #[test]
    fn test_many() {
        let data = hex::decode("01030008f406180000000801").unwrap();
        let expected = hex::decode("01030008f4").unwrap();
        let garbage = hex::decode("00000008").unwrap();

        let mut results: Vec<SerialFrame> = Vec::new();
        let mut input = data.as_slice();
        while let Ok((remaining, frame)) = SerialFrame::parse(input) {
            results.push(frame);
            input = remaining;
        }
        assert_eq!(input, vec![0x01]);
        assert_eq!(
            results,
            vec![
                SerialFrame::Data(SerialData { data: expected }),
                SerialFrame::ACK,
                SerialFrame::CAN,
                SerialFrame::Garbage(garbage),
            ]
        );
    }
}
