//! Protocol message types and their encoders/decoders

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::serializer::{ByteReader, ByteWriter};

pub const MIN_MESSAGE_SIZE: usize = 1;
pub const START_MESSAGE_SIZE: usize = 3;
pub const REPLY_MESSAGE_SIZE: usize = 1;
pub const ORDER_LIST_MESSAGE_SIZE: usize = 1;
pub const ORDER_MESSAGE_HEADER_SIZE: usize = 9;
/// Largest message the protocol can carry: an order with `u16::MAX` units.
pub const MAX_MESSAGE_SIZE: usize = ORDER_MESSAGE_HEADER_SIZE + 2 * u16::MAX as usize;

/// Kind of a wire message, encoded as the leading tag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum NetMessageType {
    Start = 0,
    Reply = 1,
    OrderList = 2,
    Order = 3,
}

impl NetMessageType {
    /// Number of message kinds; every valid tag is below this.
    pub const COUNT: u8 = 4;

    /// Wire value of this kind
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Maps a tag byte back to its kind
    ///
    /// Tags at or above [`COUNT`](Self::COUNT) are a protocol violation and
    /// come back as [`ProtocolError::UnknownMessageType`].
    pub fn from_tag(tag: u8) -> Result<Self, ProtocolError> {
        match tag {
            0 => Ok(Self::Start),
            1 => Ok(Self::Reply),
            2 => Ok(Self::OrderList),
            3 => Ok(Self::Order),
            _ => Err(ProtocolError::UnknownMessageType(tag)),
        }
    }
}

impl TryFrom<u8> for NetMessageType {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        Self::from_tag(tag)
    }
}

/// Tells a client how many players the session has and which seat is theirs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartMessage {
    pub player_count: u8,
    pub player_index: u8,
}

impl StartMessage {
    /// Builds a start message, rejecting counts that do not fit a byte.
    pub fn new(player_count: usize, player_index: usize) -> Result<Self, ProtocolError> {
        Ok(Self {
            player_count: narrow_u8("player_count", player_count)?,
            player_index: narrow_u8("player_index", player_index)?,
        })
    }
}

/// Marks a batch of orders. Carries no payload on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderListMessage {
    pub count: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub x: i16,
    pub y: i16,
}

/// Move/attack order for a group of units.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderMessage {
    pub target: Target,
    pub unit_ids: Vec<u16>,
}

impl OrderMessage {
    /// Builds an order from simulation-side values, narrowing each to its
    /// wire width. Fails instead of truncating.
    pub fn new(unit_ids: &[u32], target_x: i32, target_y: i32) -> Result<Self, ProtocolError> {
        narrow_u16("unit_count", unit_ids.len())?;
        let unit_ids = unit_ids
            .iter()
            .map(|&id| {
                u16::try_from(id).map_err(|_| ProtocolError::ValueOutOfRange {
                    field: "unit_id",
                    value: id.into(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            target: Target {
                x: narrow_i16("target_x", target_x)?,
                y: narrow_i16("target_y", target_y)?,
            },
            unit_ids,
        })
    }

    /// Size on the wire: the 9-byte header plus two bytes per unit
    pub fn encoded_len(&self) -> usize {
        ORDER_MESSAGE_HEADER_SIZE + 2 * self.unit_ids.len()
    }
}

/// Fixed-size prefix of an order, enough to learn its total length.
///
/// On the wire it is tag, unit count, target x, target y and a reserved
/// `u16` that is always zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderHeader {
    pub unit_count: u16,
    pub target: Target,
}

impl OrderHeader {
    /// Total size of the order this header introduces
    pub fn message_len(&self) -> usize {
        ORDER_MESSAGE_HEADER_SIZE + 2 * usize::from(self.unit_count)
    }
}

/// Any protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetMessage {
    Start(StartMessage),
    Reply,
    OrderList(OrderListMessage),
    Order(OrderMessage),
}

impl NetMessage {
    /// Kind tag this message is encoded with
    pub fn message_type(&self) -> NetMessageType {
        match self {
            NetMessage::Start(_) => NetMessageType::Start,
            NetMessage::Reply => NetMessageType::Reply,
            NetMessage::OrderList(_) => NetMessageType::OrderList,
            NetMessage::Order(_) => NetMessageType::Order,
        }
    }

    /// Exact number of bytes [`encode`](Self::encode) writes
    pub fn encoded_len(&self) -> usize {
        match self {
            NetMessage::Start(_) => START_MESSAGE_SIZE,
            NetMessage::Reply => REPLY_MESSAGE_SIZE,
            NetMessage::OrderList(_) => ORDER_LIST_MESSAGE_SIZE,
            NetMessage::Order(order) => order.encoded_len(),
        }
    }

    /// Serializes into `out`, returning the number of bytes written.
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, ProtocolError> {
        match self {
            NetMessage::Start(start) => encode_start(start, out),
            NetMessage::Reply => encode_reply(out),
            NetMessage::OrderList(_) => encode_order_list(out),
            NetMessage::Order(order) => encode_order(order, out),
        }
    }

    /// Encodes into a freshly allocated buffer of exactly
    /// [`encoded_len`](Self::encoded_len) bytes
    ///
    /// Fails only when a field cannot be represented on the wire, such as an
    /// order with more than `u16::MAX` units.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut out = vec![0u8; self.encoded_len()];
        let written = self.encode(&mut out)?;
        debug_assert_eq!(written, out.len());
        Ok(out)
    }
}

fn narrow_u8(field: &'static str, value: usize) -> Result<u8, ProtocolError> {
    u8::try_from(value).map_err(|_| ProtocolError::ValueOutOfRange {
        field,
        value: value as i128,
    })
}

fn narrow_u16(field: &'static str, value: usize) -> Result<u16, ProtocolError> {
    u16::try_from(value).map_err(|_| ProtocolError::ValueOutOfRange {
        field,
        value: value as i128,
    })
}

fn narrow_i16(field: &'static str, value: i32) -> Result<i16, ProtocolError> {
    i16::try_from(value).map_err(|_| ProtocolError::ValueOutOfRange {
        field,
        value: value.into(),
    })
}

fn check_output(needed: usize, out: &[u8]) -> Result<(), ProtocolError> {
    if out.len() < needed {
        return Err(ProtocolError::BufferTooSmall {
            needed,
            available: out.len(),
        });
    }
    Ok(())
}

fn expect_type(reader: &mut ByteReader<'_>, expected: NetMessageType) -> Result<(), ProtocolError> {
    let found = reader.read_u8()?;
    if found != expected.tag() {
        return Err(ProtocolError::UnexpectedMessageType { expected, found });
    }
    Ok(())
}

/// Encodes a start message: tag, player count, player index
pub fn encode_start(message: &StartMessage, out: &mut [u8]) -> Result<usize, ProtocolError> {
    check_output(START_MESSAGE_SIZE, out)?;
    let mut writer = ByteWriter::new(out);
    writer.write_u8(NetMessageType::Start.tag())?;
    writer.write_u8(message.player_count)?;
    writer.write_u8(message.player_index)?;
    debug_assert_eq!(writer.position(), START_MESSAGE_SIZE);
    Ok(writer.position())
}

/// Encodes a reply, which is the tag alone
pub fn encode_reply(out: &mut [u8]) -> Result<usize, ProtocolError> {
    check_output(REPLY_MESSAGE_SIZE, out)?;
    let mut writer = ByteWriter::new(out);
    writer.write_u8(NetMessageType::Reply.tag())?;
    Ok(writer.position())
}

/// Encodes an order list marker, which is the tag alone
pub fn encode_order_list(out: &mut [u8]) -> Result<usize, ProtocolError> {
    check_output(ORDER_LIST_MESSAGE_SIZE, out)?;
    let mut writer = ByteWriter::new(out);
    writer.write_u8(NetMessageType::OrderList.tag())?;
    Ok(writer.position())
}

/// Encodes an order. The unit count is taken from `unit_ids` and must fit
/// in a `u16`.
pub fn encode_order(message: &OrderMessage, out: &mut [u8]) -> Result<usize, ProtocolError> {
    let unit_count = narrow_u16("unit_count", message.unit_ids.len())?;
    check_output(message.encoded_len(), out)?;

    let mut writer = ByteWriter::new(out);
    writer.write_u8(NetMessageType::Order.tag())?;
    writer.write_u16(unit_count)?;
    writer.write_i16(message.target.x)?;
    writer.write_i16(message.target.y)?;
    writer.write_u16(0)?;
    debug_assert_eq!(writer.position(), ORDER_MESSAGE_HEADER_SIZE);
    for &id in &message.unit_ids {
        writer.write_u16(id)?;
    }
    Ok(writer.position())
}

/// Reads the leading tag and checks it names a known kind.
pub fn decode_message_type(input: &[u8]) -> Result<NetMessageType, ProtocolError> {
    let mut reader = ByteReader::new(input);
    NetMessageType::from_tag(reader.read_u8()?)
}

/// Decodes the 9-byte order header. A non-zero reserved field is rejected.
pub fn decode_order_header(input: &[u8]) -> Result<OrderHeader, ProtocolError> {
    let mut reader = ByteReader::new(input);
    expect_type(&mut reader, NetMessageType::Order)?;
    let unit_count = reader.read_u16()?;
    let x = reader.read_i16()?;
    let y = reader.read_i16()?;
    let reserved = reader.read_u16()?;
    if reserved != 0 {
        return Err(ProtocolError::ReservedNotZero(reserved));
    }
    Ok(OrderHeader {
        unit_count,
        target: Target { x, y },
    })
}

/// Returns whether `input` holds at least one complete message of kind
/// `message_type`. Safe to call repeatedly on partial data.
pub fn validate_message_length(input: &[u8], message_type: NetMessageType) -> bool {
    let required = match message_type {
        NetMessageType::Start => START_MESSAGE_SIZE,
        NetMessageType::Reply => REPLY_MESSAGE_SIZE,
        NetMessageType::OrderList => ORDER_LIST_MESSAGE_SIZE,
        NetMessageType::Order => {
            if input.len() < ORDER_MESSAGE_HEADER_SIZE {
                return false;
            }
            match decode_order_header(input) {
                Ok(header) => header.message_len(),
                Err(_) => return false,
            }
        }
    };
    required <= input.len()
}

/// Decodes a complete start message
pub fn decode_start(input: &[u8]) -> Result<StartMessage, ProtocolError> {
    let mut reader = ByteReader::new(input);
    expect_type(&mut reader, NetMessageType::Start)?;
    let player_count = reader.read_u8()?;
    let player_index = reader.read_u8()?;
    Ok(StartMessage {
        player_count,
        player_index,
    })
}

/// Checks that `input` starts with a reply; it carries nothing else
pub fn decode_reply(input: &[u8]) -> Result<(), ProtocolError> {
    let mut reader = ByteReader::new(input);
    expect_type(&mut reader, NetMessageType::Reply)
}

/// Decodes an order list marker. No count travels on the wire, so it is
/// always zero.
pub fn decode_order_list(input: &[u8]) -> Result<OrderListMessage, ProtocolError> {
    let mut reader = ByteReader::new(input);
    expect_type(&mut reader, NetMessageType::OrderList)?;
    Ok(OrderListMessage { count: 0 })
}

/// Decodes a complete order; the id vector is sized exactly to the count.
pub fn decode_order(input: &[u8]) -> Result<OrderMessage, ProtocolError> {
    let header = decode_order_header(input)?;
    let mut reader = ByteReader::new(&input[ORDER_MESSAGE_HEADER_SIZE..]);
    let mut unit_ids = Vec::with_capacity(usize::from(header.unit_count));
    for _ in 0..header.unit_count {
        unit_ids.push(reader.read_u16()?);
    }
    Ok(OrderMessage {
        target: header.target,
        unit_ids,
    })
}

/// Decodes the first message in `input` if it is complete.
///
/// Returns `Ok(None)` when more bytes are needed, or the message together
/// with the number of bytes it occupied.
pub fn try_decode_message(input: &[u8]) -> Result<Option<(NetMessage, usize)>, ProtocolError> {
    if input.len() < MIN_MESSAGE_SIZE {
        return Ok(None);
    }
    let message_type = decode_message_type(input)?;
    if message_type == NetMessageType::Order && input.len() >= ORDER_MESSAGE_HEADER_SIZE {
        // Surface a malformed header now; it would never become complete.
        decode_order_header(input)?;
    }
    if !validate_message_length(input, message_type) {
        return Ok(None);
    }

    let message = match message_type {
        NetMessageType::Start => NetMessage::Start(decode_start(input)?),
        NetMessageType::Reply => {
            decode_reply(input)?;
            NetMessage::Reply
        }
        NetMessageType::OrderList => NetMessage::OrderList(decode_order_list(input)?),
        NetMessageType::Order => NetMessage::Order(decode_order(input)?),
    };
    let consumed = message.encoded_len();
    debug_assert!(consumed <= input.len());
    Ok(Some((message, consumed)))
}

/// Test suite for message layouts, framing and checked narrowing
#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn sample_order(unit_count: usize) -> OrderMessage {
        OrderMessage {
            target: Target { x: -120, y: 345 },
            unit_ids: (0..unit_count as u16).map(|i| i * 3 + 1).collect(),
        }
    }

    #[test]
    fn test_message_type_tags() {
        assert_eq!(NetMessageType::Start.tag(), 0);
        assert_eq!(NetMessageType::Reply.tag(), 1);
        assert_eq!(NetMessageType::OrderList.tag(), 2);
        assert_eq!(NetMessageType::Order.tag(), 3);
        assert_eq!(NetMessageType::COUNT, 4);

        for tag in 0..NetMessageType::COUNT {
            assert_eq!(NetMessageType::from_tag(tag).unwrap().tag(), tag);
        }
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        assert_eq!(
            NetMessageType::try_from(4),
            Err(ProtocolError::UnknownMessageType(4))
        );
        assert_eq!(
            decode_message_type(&[255, 0, 0]),
            Err(ProtocolError::UnknownMessageType(255))
        );
        assert!(matches!(
            decode_message_type(&[]),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_start_message_layout() {
        let start = StartMessage::new(4, 2).unwrap();
        let mut buffer = [0u8; START_MESSAGE_SIZE];

        let written = encode_start(&start, &mut buffer).unwrap();

        assert_eq!(written, 3);
        assert_eq!(buffer, [0, 4, 2]);
        assert_eq!(decode_start(&buffer).unwrap(), start);
    }

    #[test]
    fn test_start_message_rejects_wide_values() {
        assert_eq!(
            StartMessage::new(256, 0),
            Err(ProtocolError::ValueOutOfRange {
                field: "player_count",
                value: 256
            })
        );
        assert!(StartMessage::new(2, 300).is_err());
        assert!(StartMessage::new(255, 255).is_ok());
    }

    #[test]
    fn test_single_byte_messages() {
        let mut buffer = [0u8; 1];
        assert_eq!(encode_reply(&mut buffer).unwrap(), 1);
        assert_eq!(buffer, [1]);
        assert!(decode_reply(&buffer).is_ok());

        assert_eq!(encode_order_list(&mut buffer).unwrap(), 1);
        assert_eq!(buffer, [2]);
        assert_eq!(decode_order_list(&buffer).unwrap().count, 0);
    }

    #[test]
    fn test_order_message_layout() {
        let order = OrderMessage {
            target: Target { x: 258, y: -1 },
            unit_ids: vec![7, 0x0102],
        };
        let bytes = NetMessage::Order(order.clone()).to_bytes().unwrap();

        assert_eq!(bytes, vec![3, 0, 2, 1, 2, 0xFF, 0xFF, 0, 0, 0, 7, 1, 2]);
        assert_eq!(bytes.len(), 13);
        assert_eq!(decode_order(&bytes).unwrap(), order);
    }

    #[test]
    fn test_order_decodes_handwritten_bytes() {
        let bytes = [
            3, // tag
            0, 3, // unit count
            0xFF, 0xFE, // x = -2
            0x01, 0x00, // y = 256
            0, 0, // reserved
            0, 10, 0, 20, 0, 30,
        ];

        let header = decode_order_header(&bytes).unwrap();
        assert_eq!(header.unit_count, 3);
        assert_eq!(header.message_len(), bytes.len());

        let order = decode_order(&bytes).unwrap();
        assert_eq!(order.target, Target { x: -2, y: 256 });
        assert_eq!(order.unit_ids, vec![10, 20, 30]);

        let (message, consumed) = try_decode_message(&bytes).unwrap().unwrap();
        assert_eq!(consumed, 15);
        assert_eq!(message, NetMessage::Order(order.clone()));
        assert_eq!(NetMessage::Order(order).to_bytes().unwrap(), bytes.to_vec());
    }

    #[test]
    fn test_order_rejects_reserved_bits() {
        let bytes = [3, 0, 0, 0, 0, 0, 0, 0, 1];

        assert_eq!(
            decode_order_header(&bytes),
            Err(ProtocolError::ReservedNotZero(1))
        );
        assert_eq!(
            try_decode_message(&bytes),
            Err(ProtocolError::ReservedNotZero(1))
        );
    }

    #[test]
    fn test_order_roundtrip_random() {
        let mut rng = rand::thread_rng();

        for unit_count in [0usize, 1, 2, 17, 500, 65535] {
            let order = OrderMessage {
                target: Target {
                    x: rng.gen(),
                    y: rng.gen(),
                },
                unit_ids: (0..unit_count).map(|_| rng.gen()).collect(),
            };

            let mut buffer = vec![0u8; order.encoded_len()];
            let written = encode_order(&order, &mut buffer).unwrap();
            assert_eq!(written, 9 + 2 * unit_count);

            let decoded = decode_order(&buffer).unwrap();
            assert_eq!(decoded.unit_ids.len(), unit_count);
            assert_eq!(decoded, order);
        }
    }

    #[test]
    fn test_order_rejects_too_many_units() {
        let order = OrderMessage {
            target: Target::default(),
            unit_ids: vec![0; 65536],
        };
        let mut buffer = vec![0u8; order.encoded_len()];

        assert_eq!(
            encode_order(&order, &mut buffer),
            Err(ProtocolError::ValueOutOfRange {
                field: "unit_count",
                value: 65536
            })
        );
        assert!(OrderMessage::new(&vec![1; 65536], 0, 0).is_err());
    }

    #[test]
    fn test_order_new_narrows_checked() {
        let order = OrderMessage::new(&[1, 2, 65535], -32768, 32767).unwrap();
        assert_eq!(order.unit_ids, vec![1, 2, 65535]);
        assert_eq!(order.target, Target { x: -32768, y: 32767 });

        assert_eq!(
            OrderMessage::new(&[65536], 0, 0),
            Err(ProtocolError::ValueOutOfRange {
                field: "unit_id",
                value: 65536
            })
        );
        assert!(OrderMessage::new(&[1], 40000, 0).is_err());
        assert!(OrderMessage::new(&[1], 0, -40000).is_err());
    }

    #[test]
    fn test_encode_into_short_buffer_fails() {
        let mut buffer = [0u8; 2];
        assert_eq!(
            encode_start(&StartMessage::new(2, 1).unwrap(), &mut buffer),
            Err(ProtocolError::BufferTooSmall {
                needed: 3,
                available: 2
            })
        );
        assert!(encode_order(&sample_order(1), &mut [0u8; 10]).is_err());
        assert!(encode_reply(&mut []).is_err());
    }

    #[test]
    fn test_validate_length_on_partial_order() {
        let bytes = NetMessage::Order(sample_order(3)).to_bytes().unwrap();
        assert_eq!(bytes.len(), 15);

        for len in 0..ORDER_MESSAGE_HEADER_SIZE {
            assert!(!validate_message_length(&bytes[..len], NetMessageType::Order));
        }
        assert!(!validate_message_length(&bytes[..9], NetMessageType::Order));
        assert!(!validate_message_length(&bytes[..14], NetMessageType::Order));
        assert!(validate_message_length(&bytes, NetMessageType::Order));
    }

    #[test]
    fn test_validate_length_fixed_sizes() {
        assert!(validate_message_length(&[1], NetMessageType::Reply));
        assert!(validate_message_length(&[2], NetMessageType::OrderList));
        assert!(!validate_message_length(&[0, 2], NetMessageType::Start));
        assert!(validate_message_length(&[0, 2, 1], NetMessageType::Start));

        let empty_order = NetMessage::Order(sample_order(0)).to_bytes().unwrap();
        assert!(validate_message_length(&empty_order, NetMessageType::Order));
    }

    #[test]
    fn test_decode_rejects_wrong_kind() {
        assert_eq!(
            decode_start(&[1, 0, 0]),
            Err(ProtocolError::UnexpectedMessageType {
                expected: NetMessageType::Start,
                found: 1
            })
        );
        assert!(decode_order_header(&[0; 9]).is_err());
    }

    #[test]
    fn test_try_decode_stream() {
        let mut stream = Vec::new();
        stream.extend(NetMessage::Reply.to_bytes().unwrap());
        stream.extend(
            NetMessage::Start(StartMessage::new(2, 0).unwrap())
                .to_bytes()
                .unwrap(),
        );
        stream.extend(NetMessage::Order(sample_order(2)).to_bytes().unwrap());
        stream.extend(NetMessage::OrderList(OrderListMessage::default()).to_bytes().unwrap());

        let mut decoded = Vec::new();
        let mut offset = 0;
        while let Some((message, consumed)) = try_decode_message(&stream[offset..]).unwrap() {
            decoded.push(message);
            offset += consumed;
        }

        assert_eq!(offset, stream.len());
        assert_eq!(decoded.len(), 4);
        assert_eq!(decoded[0], NetMessage::Reply);
        assert_eq!(decoded[2], NetMessage::Order(sample_order(2)));
        assert_eq!(decoded[3].message_type(), NetMessageType::OrderList);
    }

    #[test]
    fn test_try_decode_needs_more_bytes() {
        let bytes = NetMessage::Order(sample_order(4)).to_bytes().unwrap();

        assert_eq!(try_decode_message(&[]).unwrap(), None);
        assert_eq!(try_decode_message(&bytes[..5]).unwrap(), None);
        assert_eq!(try_decode_message(&bytes[..16]).unwrap(), None);

        let (message, consumed) = try_decode_message(&bytes).unwrap().unwrap();
        assert_eq!(consumed, 17);
        assert_eq!(message, NetMessage::Order(sample_order(4)));
    }

    #[test]
    fn test_try_decode_rejects_bad_tag() {
        assert_eq!(
            try_decode_message(&[9, 1, 2]),
            Err(ProtocolError::UnknownMessageType(9))
        );
    }

    #[test]
    fn test_message_bincode_roundtrip() {
        let message = NetMessage::Order(sample_order(3));
        let serialized = bincode::serialize(&message).unwrap();
        let deserialized: NetMessage = bincode::deserialize(&serialized).unwrap();
        assert_eq!(deserialized, message);
    }
}
