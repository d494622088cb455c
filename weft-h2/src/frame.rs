//! Frame encoding/decoding (draft-ietf-httpbis-http2-06 Section 4).
//!
//! Every frame starts with a fixed 8-byte header:
//! ```text
//!  +----------------+----------------+
//!  |   Length (16)  | Type(8)|Flag(8)|
//!  +-+--------------+----------------+
//!  |R|        Stream Identifier (31) |
//!  +-+-------------------------------+
//!  |          Frame Payload ...      |
//!  +---------------------------------+
//! ```
//! The reserved bit of the stream identifier is masked off on parse and
//! cleared on emit.

use bytes::Bytes;

use crate::error::{ErrorCode, H2Error};
use crate::settings::Settings;

/// Frame header size in bytes.
pub const FRAME_HEADER_LEN: usize = 8;

/// Largest DATA payload the engine emits in a single frame.
pub const MAX_FRAME_PAYLOAD: usize = 16383;

// Frame type codes (draft 06 Section 6).
pub const FRAME_DATA: u8 = 0x0;
pub const FRAME_HEADERS: u8 = 0x1;
pub const FRAME_PRIORITY: u8 = 0x2;
pub const FRAME_RST_STREAM: u8 = 0x3;
pub const FRAME_SETTINGS: u8 = 0x4;
pub const FRAME_PUSH_PROMISE: u8 = 0x5;
pub const FRAME_PING: u8 = 0x6;
pub const FRAME_GOAWAY: u8 = 0x7;
pub const FRAME_WINDOW_UPDATE: u8 = 0x8;
pub const FRAME_CONTINUATION: u8 = 0x9;

// Flag bits.
pub const FLAG_END_STREAM: u8 = 0x1;
pub const FLAG_END_SEGMENT: u8 = 0x2;
pub const FLAG_ACK: u8 = 0x1;
pub const FLAG_END_HEADERS: u8 = 0x4;
pub const FLAG_PRIORITY: u8 = 0x8;
pub const FLAG_END_PUSH_PROMISE: u8 = 0x4;

/// An HTTP/2 frame.
///
/// A tagged sum over the ten draft-06 type codes; payload shape checks run
/// at parse time, so a malformed payload never constructs a `Frame`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// DATA (0x0): opaque body bytes.
    Data {
        stream_id: u32,
        payload: Bytes,
        end_stream: bool,
        end_segment: bool,
    },
    /// HEADERS (0x1): header-block fragment, optionally led by a 4-byte
    /// priority when the PRIORITY flag is set.
    Headers {
        stream_id: u32,
        fragment: Vec<u8>,
        priority: Option<u32>,
        end_stream: bool,
        end_headers: bool,
    },
    /// PRIORITY (0x2): 4-byte priority value.
    Priority { stream_id: u32, priority: u32 },
    /// RST_STREAM (0x3): abnormal stream termination.
    RstStream {
        stream_id: u32,
        error_code: ErrorCode,
    },
    /// SETTINGS (0x4): configuration pairs on stream 0.
    Settings { ack: bool, settings: Settings },
    /// PUSH_PROMISE (0x5): promised stream id plus header-block fragment.
    PushPromise {
        stream_id: u32,
        promised_stream_id: u32,
        fragment: Vec<u8>,
        end_push_promise: bool,
    },
    /// PING (0x6): 8 opaque bytes on stream 0.
    Ping { ack: bool, opaque_data: [u8; 8] },
    /// GOAWAY (0x7): graceful shutdown marker.
    GoAway {
        last_stream_id: u32,
        error_code: ErrorCode,
        debug_data: Vec<u8>,
    },
    /// WINDOW_UPDATE (0x8): flow-control credit increment.
    WindowUpdate { stream_id: u32, increment: u32 },
    /// CONTINUATION (0x9): header-block continuation fragment.
    Continuation {
        stream_id: u32,
        fragment: Vec<u8>,
        end_headers: bool,
    },
}

impl Frame {
    /// The stream this frame belongs to (0 for connection-scoped types).
    pub fn stream_id(&self) -> u32 {
        match self {
            Frame::Data { stream_id, .. }
            | Frame::Headers { stream_id, .. }
            | Frame::Priority { stream_id, .. }
            | Frame::RstStream { stream_id, .. }
            | Frame::PushPromise { stream_id, .. }
            | Frame::WindowUpdate { stream_id, .. }
            | Frame::Continuation { stream_id, .. } => *stream_id,
            Frame::Settings { .. } | Frame::Ping { .. } | Frame::GoAway { .. } => 0,
        }
    }

    /// Encode this frame into `buf` (header + payload).
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Frame::Data {
                stream_id,
                payload,
                end_stream,
                end_segment,
            } => {
                let mut flags = 0u8;
                if *end_stream {
                    flags |= FLAG_END_STREAM;
                }
                if *end_segment {
                    flags |= FLAG_END_SEGMENT;
                }
                encode_frame_header(buf, payload.len(), FRAME_DATA, flags, *stream_id);
                buf.extend_from_slice(payload);
            }
            Frame::Headers {
                stream_id,
                fragment,
                priority,
                end_stream,
                end_headers,
            } => {
                let mut flags = 0u8;
                if *end_stream {
                    flags |= FLAG_END_STREAM;
                }
                if *end_headers {
                    flags |= FLAG_END_HEADERS;
                }
                let mut len = fragment.len();
                if priority.is_some() {
                    flags |= FLAG_PRIORITY;
                    len += 4;
                }
                encode_frame_header(buf, len, FRAME_HEADERS, flags, *stream_id);
                if let Some(priority) = priority {
                    put_u31(buf, *priority);
                }
                buf.extend_from_slice(fragment);
            }
            Frame::Priority {
                stream_id,
                priority,
            } => {
                encode_frame_header(buf, 4, FRAME_PRIORITY, 0, *stream_id);
                put_u31(buf, *priority);
            }
            Frame::RstStream {
                stream_id,
                error_code,
            } => {
                encode_frame_header(buf, 4, FRAME_RST_STREAM, 0, *stream_id);
                buf.extend_from_slice(&error_code.as_u32().to_be_bytes());
            }
            Frame::Settings { ack, settings } => {
                let flags = if *ack { FLAG_ACK } else { 0 };
                let payload = settings.encode_to_vec();
                encode_frame_header(buf, payload.len(), FRAME_SETTINGS, flags, 0);
                buf.extend_from_slice(&payload);
            }
            Frame::PushPromise {
                stream_id,
                promised_stream_id,
                fragment,
                end_push_promise,
            } => {
                let flags = if *end_push_promise {
                    FLAG_END_PUSH_PROMISE
                } else {
                    0
                };
                encode_frame_header(buf, 4 + fragment.len(), FRAME_PUSH_PROMISE, flags, *stream_id);
                put_u31(buf, *promised_stream_id);
                buf.extend_from_slice(fragment);
            }
            Frame::Ping { ack, opaque_data } => {
                let flags = if *ack { FLAG_ACK } else { 0 };
                encode_frame_header(buf, 8, FRAME_PING, flags, 0);
                buf.extend_from_slice(opaque_data);
            }
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            } => {
                encode_frame_header(buf, 8 + debug_data.len(), FRAME_GOAWAY, 0, 0);
                put_u31(buf, *last_stream_id);
                buf.extend_from_slice(&error_code.as_u32().to_be_bytes());
                buf.extend_from_slice(debug_data);
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => {
                encode_frame_header(buf, 4, FRAME_WINDOW_UPDATE, 0, *stream_id);
                put_u31(buf, *increment);
            }
            Frame::Continuation {
                stream_id,
                fragment,
                end_headers,
            } => {
                let flags = if *end_headers { FLAG_END_HEADERS } else { 0 };
                encode_frame_header(buf, fragment.len(), FRAME_CONTINUATION, flags, *stream_id);
                buf.extend_from_slice(fragment);
            }
        }
    }
}

/// Decoded frame header.
pub struct FrameHeader {
    pub length: u16,
    pub frame_type: u8,
    pub flags: u8,
    pub stream_id: u32,
}

/// Encode the 8-byte frame header. `payload_len` must fit 16 bits; the
/// engine chunks DATA at [`MAX_FRAME_PAYLOAD`] to guarantee this.
pub fn encode_frame_header(
    buf: &mut Vec<u8>,
    payload_len: usize,
    frame_type: u8,
    flags: u8,
    stream_id: u32,
) {
    debug_assert!(payload_len <= u16::MAX as usize);
    buf.extend_from_slice(&(payload_len as u16).to_be_bytes());
    buf.push(frame_type);
    buf.push(flags);
    put_u31(buf, stream_id);
}

/// Decode the 8-byte frame header from the start of `buf`.
/// Returns `None` if the buffer is too short.
pub fn decode_frame_header(buf: &[u8]) -> Option<FrameHeader> {
    if buf.len() < FRAME_HEADER_LEN {
        return None;
    }
    Some(FrameHeader {
        length: u16::from_be_bytes([buf[0], buf[1]]),
        frame_type: buf[2],
        flags: buf[3],
        stream_id: get_u31(&buf[4..8]),
    })
}

/// Write a 32-bit field with the reserved top bit cleared.
fn put_u31(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&(value & 0x7fff_ffff).to_be_bytes());
}

/// Read a 32-bit field, masking the reserved top bit.
fn get_u31(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) & 0x7fff_ffff
}

/// Decode one frame from the start of `buf`.
///
/// Returns `Ok(Some((frame, bytes_consumed)))` on success, `Ok(None)` if the
/// buffer does not yet hold a complete frame, or `Err` on a malformed frame.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>, H2Error> {
    let Some(header) = decode_frame_header(buf) else {
        return Ok(None);
    };
    let total_len = FRAME_HEADER_LEN + header.length as usize;
    if buf.len() < total_len {
        return Ok(None);
    }

    let payload = &buf[FRAME_HEADER_LEN..total_len];
    let flags = header.flags;
    let stream_id = header.stream_id;

    let frame = match header.frame_type {
        FRAME_DATA => {
            require_stream(stream_id, "DATA")?;
            Frame::Data {
                stream_id,
                payload: Bytes::copy_from_slice(payload),
                end_stream: flags & FLAG_END_STREAM != 0,
                end_segment: flags & FLAG_END_SEGMENT != 0,
            }
        }
        FRAME_HEADERS => {
            require_stream(stream_id, "HEADERS")?;
            let (priority, fragment) = if flags & FLAG_PRIORITY != 0 {
                if payload.len() < 4 {
                    return Err(H2Error::Protocol("HEADERS priority field truncated".into()));
                }
                (Some(get_u31(&payload[..4])), &payload[4..])
            } else {
                (None, payload)
            };
            Frame::Headers {
                stream_id,
                fragment: fragment.to_vec(),
                priority,
                end_stream: flags & FLAG_END_STREAM != 0,
                end_headers: flags & FLAG_END_HEADERS != 0,
            }
        }
        FRAME_PRIORITY => {
            require_stream(stream_id, "PRIORITY")?;
            if payload.len() != 4 {
                return Err(H2Error::FrameSize);
            }
            Frame::Priority {
                stream_id,
                priority: get_u31(payload),
            }
        }
        FRAME_RST_STREAM => {
            require_stream(stream_id, "RST_STREAM")?;
            if payload.len() != 4 {
                return Err(H2Error::FrameSize);
            }
            Frame::RstStream {
                stream_id,
                error_code: ErrorCode::from_u32(u32::from_be_bytes([
                    payload[0], payload[1], payload[2], payload[3],
                ])),
            }
        }
        FRAME_SETTINGS => {
            require_connection(stream_id, "SETTINGS")?;
            let ack = flags & FLAG_ACK != 0;
            if ack {
                if !payload.is_empty() {
                    return Err(H2Error::FrameSize);
                }
                Frame::Settings {
                    ack: true,
                    settings: Settings::default(),
                }
            } else {
                Frame::Settings {
                    ack: false,
                    settings: Settings::decode(payload)?,
                }
            }
        }
        FRAME_PUSH_PROMISE => {
            require_stream(stream_id, "PUSH_PROMISE")?;
            if payload.len() < 4 {
                return Err(H2Error::Protocol("PUSH_PROMISE payload truncated".into()));
            }
            Frame::PushPromise {
                stream_id,
                promised_stream_id: get_u31(&payload[..4]),
                fragment: payload[4..].to_vec(),
                end_push_promise: flags & FLAG_END_PUSH_PROMISE != 0,
            }
        }
        FRAME_PING => {
            require_connection(stream_id, "PING")?;
            if payload.len() != 8 {
                return Err(H2Error::FrameSize);
            }
            let mut opaque_data = [0u8; 8];
            opaque_data.copy_from_slice(payload);
            Frame::Ping {
                ack: flags & FLAG_ACK != 0,
                opaque_data,
            }
        }
        FRAME_GOAWAY => {
            require_connection(stream_id, "GOAWAY")?;
            if payload.len() < 8 {
                return Err(H2Error::Protocol("GOAWAY payload truncated".into()));
            }
            Frame::GoAway {
                last_stream_id: get_u31(&payload[..4]),
                error_code: ErrorCode::from_u32(u32::from_be_bytes([
                    payload[4], payload[5], payload[6], payload[7],
                ])),
                debug_data: payload[8..].to_vec(),
            }
        }
        FRAME_WINDOW_UPDATE => {
            if payload.len() != 4 {
                return Err(H2Error::FrameSize);
            }
            Frame::WindowUpdate {
                stream_id,
                increment: get_u31(payload),
            }
        }
        FRAME_CONTINUATION => {
            require_stream(stream_id, "CONTINUATION")?;
            Frame::Continuation {
                stream_id,
                fragment: payload.to_vec(),
                end_headers: flags & FLAG_END_HEADERS != 0,
            }
        }
        other => return Err(H2Error::UnknownType(other)),
    };

    Ok(Some((frame, total_len)))
}

fn require_stream(stream_id: u32, name: &str) -> Result<(), H2Error> {
    if stream_id == 0 {
        return Err(H2Error::Protocol(format!("{name} on stream 0")));
    }
    Ok(())
}

fn require_connection(stream_id: u32, name: &str) -> Result<(), H2Error> {
    if stream_id != 0 {
        return Err(H2Error::Protocol(format!("{name} on non-zero stream")));
    }
    Ok(())
}
