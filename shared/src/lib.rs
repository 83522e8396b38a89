//! # Lockstep Wire Protocol
//!
//! Message types and codec shared by the server and any peer that needs to
//! build or parse protocol buffers. Nothing here depends on the network loop.
//!
//! ## Wire format (version 1)
//!
//! Every message starts with a single type tag byte. Multi-byte integers are
//! big-endian.
//!
//! | Tag | Kind      | Layout                                                                         |
//! |-----|-----------|--------------------------------------------------------------------------------|
//! | 0   | Start     | tag, player_count `u8`, player_index `u8` (3 bytes)                            |
//! | 1   | Reply     | tag (1 byte)                                                                   |
//! | 2   | OrderList | tag (1 byte)                                                                   |
//! | 3   | Order     | tag, unit_count `u16`, x `i16`, y `i16`, reserved `u16`, unit ids `u16`\*count |
//!
//! An Order is `9 + 2 * unit_count` bytes long: a 9-byte header followed by
//! the ids. The reserved field is written as zero and any other value is
//! rejected on decode. Tags `>= 4` are rejected.
//!
//! ## Framing
//!
//! TCP hands bytes over in arbitrary chunks, so decoding is split in two:
//! [`validate_message_length`] is cheap and safe on partial data, and the
//! per-kind decoders assume a complete message. [`try_decode_message`]
//! combines both for stream reassembly.

pub mod error;
pub mod messages;
pub mod serializer;

pub use error::ProtocolError;
pub use messages::{
    decode_message_type, decode_order, decode_order_header, decode_order_list, decode_reply,
    decode_start, encode_order, encode_order_list, encode_reply, encode_start,
    try_decode_message, validate_message_length, NetMessage, NetMessageType, OrderHeader,
    OrderListMessage, OrderMessage, StartMessage, Target, MIN_MESSAGE_SIZE,
    MAX_MESSAGE_SIZE, ORDER_LIST_MESSAGE_SIZE, ORDER_MESSAGE_HEADER_SIZE, REPLY_MESSAGE_SIZE,
    START_MESSAGE_SIZE,
};
