//! The error taxonomy of the `coap` engine.
//!
//! Each layer gets its own closed error enum rather than one crate-wide
//! error, mirroring how the wire-level [`MessageError`] is kept separate
//! from the transport-level [`SocketError`] and the stream-level
//! [`StreamError`]: a parse failure and "the exchange could not
//! complete" are different kinds of facts.

use alloc::string::String;
use core::fmt;
#[cfg(feature = "std")]
use std::error;

/// Errors from parsing or building a single CoAP message.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum MessageError {
    InvalidHeader,
    InvalidPacketLength,
    InvalidTokenLength,
    InvalidOptionDelta,
    InvalidOptionLength,
    /// Option numbers must be non-decreasing; a lower number arrived out
    /// of order.
    OptionsOutOfOrder,
    /// A `0xFF` payload marker was the last byte of the message.
    TruncatedPayload,
    /// The buffer supplied to the builder was too small for the message.
    BufferTooSmall,
    /// More than one instance of an option expected to be unique.
    DuplicateOption(u16),
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MessageError::InvalidHeader => write!(f, "CoAP error: invalid header"),
            MessageError::InvalidPacketLength => {
                write!(f, "CoAP error: invalid packet length")
            }
            MessageError::InvalidTokenLength => {
                write!(f, "CoAP error: invalid token length")
            }
            MessageError::InvalidOptionDelta => {
                write!(f, "CoAP error: invalid option delta")
            }
            MessageError::InvalidOptionLength => {
                write!(f, "CoAP error: invalid option length")
            }
            MessageError::OptionsOutOfOrder => {
                write!(f, "CoAP error: option numbers not in ascending order")
            }
            MessageError::TruncatedPayload => {
                write!(f, "CoAP error: payload marker with no payload")
            }
            MessageError::BufferTooSmall => {
                write!(f, "CoAP error: output buffer too small for message")
            }
            MessageError::DuplicateOption(num) => {
                write!(f, "CoAP error: option {} present more than once", num)
            }
        }
    }
}

#[cfg(feature = "std")]
impl error::Error for MessageError {}

/// Errors constructing or decoding a Block1/Block2 option value.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum BlockError {
    /// `size_exponent` was 7 (on-wire size 2048), which RFC 7959 reserves.
    ReservedSizeExponent,
    /// `seq_num` did not fit in the 20 bits the Block option allows.
    SeqNumOverflow,
    /// The requested block size is not a power of two in `[16, 1024]`.
    InvalidSize(u16),
    /// The option's on-wire length was not 0, 1, 2 or 3 bytes.
    InvalidEncodingLength(usize),
    /// The MTU or buffer is too small to fit even the smallest block.
    MtuTooSmall,
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockError::ReservedSizeExponent => {
                write!(f, "block size exponent 7 is reserved")
            }
            BlockError::SeqNumOverflow => {
                write!(f, "block seq_num does not fit in 20 bits")
            }
            BlockError::InvalidSize(size) => {
                write!(f, "{} is not a valid block size", size)
            }
            BlockError::InvalidEncodingLength(len) => {
                write!(f, "block option length {} is invalid", len)
            }
            BlockError::MtuTooSmall => {
                write!(f, "MTU/buffer too small to carry one block")
            }
        }
    }
}

#[cfg(feature = "std")]
impl error::Error for BlockError {}

/// Errors raised while validating configured transmission parameters.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ConfigError {
    AckTimeoutTooSmall,
    AckRandomFactorTooSmall,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::AckTimeoutTooSmall => {
                write!(f, "ACK_TIMEOUT must be at least 1000 ms")
            }
            ConfigError::AckRandomFactorTooSmall => {
                write!(f, "ACK_RANDOM_FACTOR must be greater than 1.0")
            }
        }
    }
}

#[cfg(feature = "std")]
impl error::Error for ConfigError {}

/// Errors from the fixed-capacity duplicate-response cache.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CacheError {
    /// The message, including its entry overhead, cannot fit even in an
    /// empty cache.
    TooLargeForCache,
    /// An entry for this (endpoint, message-id) is already present.
    Duplicate,
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::TooLargeForCache => {
                write!(f, "message does not fit in the response cache")
            }
            CacheError::Duplicate => write!(f, "duplicate cache entry"),
        }
    }
}

#[cfg(feature = "std")]
impl error::Error for CacheError {}

/// The closed taxonomy the socket wrapper surfaces to its caller (§4.6).
#[derive(Debug, Clone)]
pub enum SocketError {
    Timeout,
    MsgMalformed(MessageError),
    Duplicate,
    MsgWasPing,
    Network(String),
}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketError::Timeout => write!(f, "receive timed out"),
            SocketError::MsgMalformed(e) => write!(f, "malformed message: {}", e),
            SocketError::Duplicate => write!(f, "duplicate request, cached response resent"),
            SocketError::MsgWasPing => write!(f, "message was an empty CON (ping)"),
            SocketError::Network(msg) => write!(f, "network error: {}", msg),
        }
    }
}

#[cfg(feature = "std")]
impl error::Error for SocketError {}

/// Errors from the block transfer engine (§4.7).
#[derive(Debug, Clone)]
pub enum BlockTransferError {
    Timeout,
    Reset,
    /// The peer's message could not be reconciled with the transfer in
    /// progress (mismatched seq_num, disallowed size change, mixed
    /// Block1/Block2, critical-option mismatch, ...).
    Aborted(&'static str),
    Codec(MessageError),
    Block(BlockError),
    Socket(SocketError),
}

impl fmt::Display for BlockTransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockTransferError::Timeout => write!(f, "block transfer timed out"),
            BlockTransferError::Reset => write!(f, "peer sent Reset"),
            BlockTransferError::Aborted(reason) => {
                write!(f, "block transfer aborted: {}", reason)
            }
            BlockTransferError::Codec(e) => write!(f, "{}", e),
            BlockTransferError::Block(e) => write!(f, "{}", e),
            BlockTransferError::Socket(e) => write!(f, "{}", e),
        }
    }
}

#[cfg(feature = "std")]
impl error::Error for BlockTransferError {}

impl From<MessageError> for BlockTransferError {
    fn from(e: MessageError) -> Self {
        BlockTransferError::Codec(e)
    }
}

impl From<BlockError> for BlockTransferError {
    fn from(e: BlockError) -> Self {
        BlockTransferError::Block(e)
    }
}

impl From<SocketError> for BlockTransferError {
    fn from(e: SocketError) -> Self {
        BlockTransferError::Socket(e)
    }
}

/// Errors surfaced by the client/server sub-streams and the stream facade.
#[derive(Debug, Clone)]
pub enum StreamError {
    /// A method was called while the stream was in a state that does not
    /// permit it (e.g. `write` on an `Idle` stream).
    UnexpectedState,
    ReceivedReset,
    Socket(SocketError),
    Block(BlockTransferError),
    Codec(MessageError),
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::UnexpectedState => write!(f, "operation not valid in current stream state"),
            StreamError::ReceivedReset => write!(f, "peer sent Reset"),
            StreamError::Socket(e) => write!(f, "{}", e),
            StreamError::Block(e) => write!(f, "{}", e),
            StreamError::Codec(e) => write!(f, "{}", e),
        }
    }
}

#[cfg(feature = "std")]
impl error::Error for StreamError {}

impl From<SocketError> for StreamError {
    fn from(e: SocketError) -> Self {
        StreamError::Socket(e)
    }
}

impl From<BlockTransferError> for StreamError {
    fn from(e: BlockTransferError) -> Self {
        StreamError::Block(e)
    }
}

impl From<MessageError> for StreamError {
    fn from(e: MessageError) -> Self {
        StreamError::Codec(e)
    }
}
