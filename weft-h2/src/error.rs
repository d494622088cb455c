//! Error codes and the engine error type (draft-ietf-httpbis-http2-06 Section 7).

use thiserror::Error;

/// Symbolic HTTP/2 error codes (draft 06 Section 7).
///
/// `EnhanceYourCalm` keeps the draft's original value of 420.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 420,
}

impl ErrorCode {
    pub fn from_u32(v: u32) -> Self {
        match v {
            0x0 => Self::NoError,
            0x1 => Self::ProtocolError,
            0x2 => Self::InternalError,
            0x3 => Self::FlowControlError,
            0x5 => Self::StreamClosed,
            0x6 => Self::FrameSizeError,
            0x7 => Self::RefusedStream,
            0x8 => Self::Cancel,
            0x9 => Self::CompressionError,
            0xa => Self::ConnectError,
            420 => Self::EnhanceYourCalm,
            _ => Self::InternalError,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// Errors produced by the engine.
///
/// `Connection` and `Stream` carry an explicit wire code; the remaining
/// variants are local failures (parse errors, misuse of the API) and map to
/// a wire code via [`H2Error::code`] when they escalate.
#[derive(Debug, Error)]
pub enum H2Error {
    /// A prefix integer ended in the middle of a continuation sequence.
    #[error("prefix integer ended mid-continuation")]
    MalformedInteger,
    /// Declared frame length disagrees with the payload shape.
    #[error("frame length does not match payload shape")]
    FrameSize,
    /// Unrecognized frame type code.
    #[error("unknown frame type 0x{0:02x}")]
    UnknownType(u8),
    /// A frame violates the protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// A header block could not be decoded.
    #[error("header block could not be decoded")]
    Compression,
    /// Flow control violation or use of a disabled flow-control mechanism.
    #[error("flow control violation")]
    FlowControl,
    /// Fatal connection-level failure.
    #[error("connection error: {0:?}")]
    Connection(ErrorCode),
    /// Failure scoped to a single stream.
    #[error("stream {0} error: {1:?}")]
    Stream(u32, ErrorCode),
    /// Operation attempted on a closed or draining connection.
    #[error("connection is closed or draining")]
    Closed,
    /// The peer's concurrent stream limit has been reached.
    #[error("concurrent stream limit reached")]
    StreamLimitReached,
    /// The stream does not accept this operation in its current state.
    #[error("stream {0} is not writable in its current state")]
    NotWritable(u32),
    /// No stream with this id exists on the connection.
    #[error("unknown stream {0}")]
    UnknownStream(u32),
}

impl H2Error {
    /// The wire error code this failure maps to.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::MalformedInteger | Self::Compression => ErrorCode::CompressionError,
            Self::FrameSize => ErrorCode::FrameSizeError,
            Self::UnknownType(_) | Self::Protocol(_) => ErrorCode::ProtocolError,
            Self::FlowControl => ErrorCode::FlowControlError,
            Self::Connection(code) | Self::Stream(_, code) => *code,
            Self::Closed | Self::StreamLimitReached => ErrorCode::RefusedStream,
            Self::NotWritable(_) | Self::UnknownStream(_) => ErrorCode::InternalError,
        }
    }
}
