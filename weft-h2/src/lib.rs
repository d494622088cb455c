//! Sans-IO HTTP/2 protocol engine (draft-ietf-httpbis-http2-06).
//!
//! This crate is a pure protocol state machine with zero runtime
//! dependencies: the caller feeds received bytes in via `recv()`, pulls
//! outgoing bytes via `take_pending_send()`, and drains structured events
//! with `poll_event()`. It owns no sockets, performs no TLS, and has no
//! timers; the embedder drives it from whatever transport and concurrency
//! model it likes.
//!
//! # Architecture
//!
//! ```text
//!   transport bytes
//!        |
//!   +----v----------+
//!   | weft-h2       |  framing + stream state machines + flow control
//!   | H2Connection  |  H2Event: Headers, Data, HalfClose, Close, ...
//!   +---------------+
//! ```
//!
//! Inbound, the framer turns bytes into [`Frame`] values, the connection
//! routes them (stream 0 and SETTINGS to connection management, everything
//! else to the owning stream), and streams emit semantic events. Outbound,
//! stream operations produce frames that the connection flow-gates (DATA
//! waits in a send queue when credit is short) and serializes into the
//! pending-send buffer.
//!
//! # Example
//!
//! ```rust
//! use weft_h2::{H2Connection, H2Event, HeaderField, Settings};
//!
//! let mut client = H2Connection::client(Settings::default());
//! let mut server = H2Connection::server(Settings::default());
//!
//! // Client handshake bytes (preface + SETTINGS) travel to the server.
//! server.recv(&client.take_pending_send()).unwrap();
//! // Server SETTINGS travel back.
//! client.recv(&server.take_pending_send()).unwrap();
//!
//! // Send a request.
//! let stream_id = client.new_stream(None).unwrap();
//! client.send_headers(stream_id, &[
//!     HeaderField::new(b":method", b"GET"),
//!     HeaderField::new(b":path", b"/"),
//! ], true).unwrap();
//! server.recv(&client.take_pending_send()).unwrap();
//!
//! while let Some(event) = server.poll_event() {
//!     match event {
//!         H2Event::Headers { stream_id, headers, end_stream } => { /* ... */ }
//!         H2Event::Data { stream_id, data, end_stream } => { /* ... */ }
//!         _ => {}
//!     }
//! }
//! ```
//!
//! Header-block compression tables are a collaborator, not part of the
//! engine: plug a real HPACK context in through [`HeaderCodec`]; the
//! built-in [`LiteralCodec`] covers table-free operation.

pub mod connection;
pub mod error;
pub mod flowcontrol;
pub mod frame;
pub mod hpack;
pub mod settings;
pub mod stream;

pub use connection::{ConnState, H2Connection, H2Event, Role, CONNECTION_PREFACE};
pub use error::{ErrorCode, H2Error};
pub use flowcontrol::Window;
pub use frame::Frame;
pub use hpack::{HeaderCodec, HeaderField, LiteralCodec};
pub use settings::Settings;
pub use stream::{CloseCause, StreamState, DEFAULT_PRIORITY};
