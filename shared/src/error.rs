use thiserror::Error;

use crate::messages::NetMessageType;

/// Errors produced while encoding or decoding protocol messages.
///
/// Anything derived from bytes a peer sent ends up here rather than in a
/// panic, so the server can drop the offending connection and keep running.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The type tag is outside the known range of message kinds.
    #[error("unknown message type tag {0}")]
    UnknownMessageType(u8),

    /// A per-kind decoder was handed a buffer carrying another kind.
    #[error("expected {expected:?} message, found tag {found}")]
    UnexpectedMessageType {
        expected: NetMessageType,
        found: u8,
    },

    /// A value does not fit the width of its wire field.
    #[error("{field} value {value} does not fit its wire field")]
    ValueOutOfRange { field: &'static str, value: i128 },

    /// The output buffer cannot hold the message being encoded.
    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// The reserved field of an order header carried something other than zero.
    #[error("reserved order header field is {0}, expected 0")]
    ReservedNotZero(u16),

    /// The input ended before the message did.
    #[error("message truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
}
