//! Connection state machine and frame routing.
//!
//! `H2Connection` is the sans-IO engine entry point. Feed bytes from the
//! transport via `recv()`, pull bytes to write via `take_pending_send()`,
//! and drain structured events with `poll_event()`. The connection owns the
//! stream registry outright; streams are addressed by id and never hold a
//! reference back.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;

use crate::error::{ErrorCode, H2Error};
use crate::flowcontrol::{PendingData, SendQueue, Window, DEFAULT_WINDOW_SIZE, MAX_WINDOW_SIZE};
use crate::frame::{self, Frame, MAX_FRAME_PAYLOAD};
use crate::hpack::{HeaderCodec, HeaderField, LiteralCodec};
use crate::settings::Settings;
use crate::stream::{CloseCause, Stream, StreamState, DEFAULT_PRIORITY};

/// The 24-byte constant a client sends before any frame.
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Cap on an assembled header block (HEADERS/PUSH_PROMISE + CONTINUATIONs).
const MAX_HEADER_BLOCK_SIZE: usize = 256 * 1024;

/// Which side of the connection this engine drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for the peer's opening SETTINGS.
    New,
    /// Handshake complete, streams may flow.
    Connected,
    /// GOAWAY sent or received; existing streams may finish.
    Draining,
    /// Terminal. Inbound bytes are discarded, nothing further is emitted.
    Closed,
}

/// Events produced by the engine for the embedder.
///
/// Events are queued in the wire order of the frames that triggered them;
/// `Active`, `HalfClose` and `Close` fire exactly once per stream.
#[derive(Debug)]
pub enum H2Event {
    /// A frame was serialized into the send buffer (structured mirror of the
    /// outgoing bytes, for logging).
    FrameSent(Frame),
    /// A frame was parsed off the wire.
    FrameReceived(Frame),
    /// The peer opened a new stream (server side).
    Stream { stream_id: u32 },
    /// The peer promised a new stream (client side).
    Promise {
        parent_id: u32,
        stream_id: u32,
        headers: Vec<HeaderField>,
    },
    /// The peer is going away.
    GoAway {
        last_stream_id: u32,
        error_code: ErrorCode,
        debug_data: Vec<u8>,
    },
    /// The peer answered one of our PINGs.
    PingAck { payload: [u8; 8] },
    /// A stream entered open or a half-closed state for the first time.
    Active { stream_id: u32 },
    /// A fully reassembled header block arrived on a stream.
    Headers {
        stream_id: u32,
        headers: Vec<HeaderField>,
        end_stream: bool,
    },
    /// DATA arrived on a stream. The engine does not buffer inbound DATA.
    Data {
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
    },
    /// END_STREAM was sent or received on the stream.
    HalfClose { stream_id: u32 },
    /// The stream reached its terminal state.
    Close { stream_id: u32, cause: CloseCause },
    /// The stream's priority changed.
    Priority { stream_id: u32, priority: u32 },
    /// A send window changed (stream id 0 is the connection window).
    Window { stream_id: u32, window: i64 },
}

/// A header block being reassembled across HEADERS/PUSH_PROMISE and
/// CONTINUATION frames. While one is pending, no other frame may arrive.
struct HeaderAssembly {
    stream_id: u32,
    end_stream: bool,
    fragment: Vec<u8>,
    promise: Option<Promise>,
}

struct Promise {
    parent_id: u32,
    promised_id: u32,
    /// Parent was reset locally: reassemble the block, then refuse.
    discard: bool,
}

enum Lookup {
    Live,
    Closed(CloseCause),
    Refused,
}

/// A sans-IO HTTP/2 connection for either role.
pub struct H2Connection {
    role: Role,
    state: ConnState,
    error: Option<ErrorCode>,
    local_settings: Settings,

    /// Per-stream state, keyed by stream id. Exclusively owned here.
    streams: HashMap<u32, Stream>,
    /// Close causes of departed streams, for classifying late frames.
    tombstones: HashMap<u32, CloseCause>,
    next_stream_id: u32,
    last_peer_stream_id: u32,
    /// Peer-advertised concurrent stream bound. `None` until told.
    stream_limit: Option<u32>,
    active_streams: u32,

    /// Peer-advertised initial window size. `None` = flow control disabled
    /// for the lifetime of the connection.
    window_limit: Option<i64>,
    send_window: Window,
    recv_window: Window,
    send_queue: SendQueue,

    assembly: Option<HeaderAssembly>,
    codec: Box<dyn HeaderCodec>,

    goaway_last_stream_id: Option<u32>,
    goaway_sent: bool,
    preface_pending: bool,

    recv_buf: Vec<u8>,
    send_buf: Vec<u8>,
    events: VecDeque<H2Event>,
}

impl H2Connection {
    /// Create a client-side connection. Queues the connection preface and
    /// the local SETTINGS into the send buffer.
    pub fn client(settings: Settings) -> Self {
        Self::new(Role::Client, settings)
    }

    /// Create a server-side connection. Queues the local SETTINGS; expects
    /// the client preface before any inbound frame.
    pub fn server(settings: Settings) -> Self {
        Self::new(Role::Server, settings)
    }

    fn new(role: Role, settings: Settings) -> Self {
        let local_recv = settings
            .initial_window_size
            .map(i64::from)
            .unwrap_or(DEFAULT_WINDOW_SIZE);
        let mut conn = Self {
            role,
            state: ConnState::New,
            error: None,
            local_settings: settings.clone(),
            streams: HashMap::new(),
            tombstones: HashMap::new(),
            next_stream_id: match role {
                Role::Client => 1,
                Role::Server => 2,
            },
            last_peer_stream_id: 0,
            stream_limit: None,
            active_streams: 0,
            window_limit: Some(DEFAULT_WINDOW_SIZE),
            send_window: Window::default(),
            recv_window: Window::new(local_recv),
            send_queue: SendQueue::default(),
            assembly: None,
            codec: Box::new(LiteralCodec),
            goaway_last_stream_id: None,
            goaway_sent: false,
            preface_pending: role == Role::Server,
            recv_buf: Vec::new(),
            send_buf: Vec::new(),
            events: VecDeque::new(),
        };
        if settings.disables_flow_control() {
            conn.window_limit = None;
        }
        if role == Role::Client {
            conn.send_buf.extend_from_slice(CONNECTION_PREFACE);
        }
        conn.send_frame(Frame::Settings {
            ack: false,
            settings,
        });
        conn
    }

    /// Swap in a real header-compression context (the default is the
    /// table-free literal codec).
    pub fn set_header_codec(&mut self, codec: Box<dyn HeaderCodec>) {
        self.codec = codec;
    }

    // -- Transport surface --

    /// Feed bytes received from the transport. A returned error is a
    /// connection error: the connection is closed and the transport should
    /// be torn down after flushing the pending send bytes.
    pub fn recv(&mut self, data: &[u8]) -> Result<(), H2Error> {
        if self.state == ConnState::Closed {
            return Ok(());
        }
        self.recv_buf.extend_from_slice(data);

        if self.preface_pending {
            if self.recv_buf.len() < CONNECTION_PREFACE.len() {
                if CONNECTION_PREFACE.starts_with(&self.recv_buf) {
                    return Ok(());
                }
                return Err(self.fail(H2Error::Protocol("bad connection preface".into())));
            }
            if self.recv_buf[..CONNECTION_PREFACE.len()] != *CONNECTION_PREFACE {
                return Err(self.fail(H2Error::Protocol("bad connection preface".into())));
            }
            self.recv_buf.drain(..CONNECTION_PREFACE.len());
            self.preface_pending = false;
        }

        loop {
            match frame::decode_frame(&self.recv_buf) {
                Ok(Some((frame, consumed))) => {
                    self.recv_buf.drain(..consumed);
                    self.handle_frame(frame)?;
                }
                Ok(None) => break,
                Err(e) => return Err(self.fail(e)),
            }
        }
        Ok(())
    }

    /// Take all pending bytes to write to the transport.
    pub fn take_pending_send(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.send_buf)
    }

    /// Whether bytes are waiting to be written.
    pub fn has_pending_send(&self) -> bool {
        !self.send_buf.is_empty()
    }

    /// Pop the next queued event, if any.
    pub fn poll_event(&mut self) -> Option<H2Event> {
        self.events.pop_front()
    }

    // -- Stream operations --

    /// Allocate the next outgoing stream id. The stream starts idle and
    /// activates when its first HEADERS goes out.
    pub fn new_stream(&mut self, priority: Option<u32>) -> Result<u32, H2Error> {
        if !matches!(self.state, ConnState::New | ConnState::Connected) {
            return Err(H2Error::Closed);
        }
        if let Some(limit) = self.stream_limit {
            if self.active_streams >= limit {
                return Err(H2Error::StreamLimitReached);
            }
        }
        let id = self.next_stream_id;
        self.next_stream_id += 2;
        let stream = Stream::new(
            id,
            priority.unwrap_or(DEFAULT_PRIORITY),
            self.initial_send_window(),
            self.initial_recv_window(),
        );
        self.streams.insert(id, stream);
        Ok(id)
    }

    /// Send a header block on a stream.
    pub fn send_headers(
        &mut self,
        id: u32,
        headers: &[HeaderField],
        end_stream: bool,
    ) -> Result<(), H2Error> {
        if self.state == ConnState::Closed {
            return Err(H2Error::Closed);
        }
        let (newly_active, priority) = {
            let Some(stream) = self.streams.get_mut(&id) else {
                return Err(H2Error::UnknownStream(id));
            };
            if stream.local_end_queued {
                return Err(H2Error::NotWritable(id));
            }
            match stream.state {
                StreamState::Idle => {
                    stream.state = StreamState::Open;
                    let priority =
                        (stream.priority != DEFAULT_PRIORITY).then_some(stream.priority);
                    (stream.activate(), priority)
                }
                StreamState::ReservedLocal => {
                    stream.state = StreamState::HalfClosedRemote;
                    (stream.activate(), None)
                }
                StreamState::Open | StreamState::HalfClosedRemote => (false, None),
                _ => return Err(H2Error::NotWritable(id)),
            }
        };
        if newly_active {
            self.active_streams += 1;
            self.events.push_back(H2Event::Active { stream_id: id });
        }
        let mut fragment = Vec::new();
        self.codec.encode(headers, &mut fragment);
        self.send_frame(Frame::Headers {
            stream_id: id,
            fragment,
            priority,
            end_stream,
            end_headers: true,
        });
        if end_stream {
            if let Some(stream) = self.streams.get_mut(&id) {
                stream.local_end_queued = true;
            }
            self.send_end_stream(id);
        }
        Ok(())
    }

    /// Send DATA on a stream, subject to flow control. Bytes that exceed the
    /// available credit wait in the send buffer until WINDOW_UPDATEs arrive.
    pub fn send_data(&mut self, id: u32, data: &[u8], end_stream: bool) -> Result<(), H2Error> {
        if self.state == ConnState::Closed {
            return Err(H2Error::Closed);
        }
        {
            let Some(stream) = self.streams.get_mut(&id) else {
                return Err(H2Error::UnknownStream(id));
            };
            if !stream.may_send_data() {
                return Err(H2Error::NotWritable(id));
            }
            if end_stream {
                stream.local_end_queued = true;
            }
        }

        let mut chunks = Vec::new();
        if data.is_empty() {
            chunks.push(PendingData {
                stream_id: id,
                payload: Bytes::new(),
                end_stream,
                end_segment: false,
            });
        } else {
            let mut rest = Bytes::copy_from_slice(data);
            while !rest.is_empty() {
                let take = rest.len().min(MAX_FRAME_PAYLOAD);
                let chunk = rest.split_to(take);
                chunks.push(PendingData {
                    stream_id: id,
                    payload: chunk,
                    end_stream: end_stream && rest.is_empty(),
                    end_segment: false,
                });
            }
        }

        if self.window_limit.is_none() {
            for chunk in chunks {
                self.emit_data(chunk);
            }
        } else {
            for chunk in chunks {
                self.send_queue.push(chunk);
            }
            self.drain();
        }
        Ok(())
    }

    /// Change a stream's priority, emitting a PRIORITY frame.
    pub fn set_priority(&mut self, id: u32, priority: u32) -> Result<(), H2Error> {
        if self.state == ConnState::Closed {
            return Err(H2Error::Closed);
        }
        let Some(stream) = self.streams.get_mut(&id) else {
            return Err(H2Error::UnknownStream(id));
        };
        stream.priority = priority;
        self.send_frame(Frame::Priority {
            stream_id: id,
            priority,
        });
        self.events.push_back(H2Event::Priority {
            stream_id: id,
            priority,
        });
        Ok(())
    }

    /// Replenish a stream's receive window (emits WINDOW_UPDATE).
    pub fn stream_window_update(&mut self, id: u32, increment: u32) -> Result<(), H2Error> {
        if self.state == ConnState::Closed {
            return Err(H2Error::Closed);
        }
        if self.window_limit.is_none() {
            return Err(H2Error::FlowControl);
        }
        if increment == 0 {
            return Err(H2Error::Protocol("zero window increment".into()));
        }
        let Some(stream) = self.streams.get_mut(&id) else {
            return Err(H2Error::UnknownStream(id));
        };
        stream.recv_window.increase(increment)?;
        self.send_frame(Frame::WindowUpdate {
            stream_id: id,
            increment,
        });
        Ok(())
    }

    /// Replenish the connection receive window (emits WINDOW_UPDATE).
    pub fn window_update(&mut self, increment: u32) -> Result<(), H2Error> {
        if self.state == ConnState::Closed {
            return Err(H2Error::Closed);
        }
        if self.window_limit.is_none() {
            return Err(H2Error::FlowControl);
        }
        if increment == 0 {
            return Err(H2Error::Protocol("zero window increment".into()));
        }
        self.recv_window.increase(increment)?;
        self.send_frame(Frame::WindowUpdate {
            stream_id: 0,
            increment,
        });
        Ok(())
    }

    /// Reset a stream (RST_STREAM). Defaults to CANCEL, the code for
    /// embedder-initiated cancellation.
    pub fn reset_stream(&mut self, id: u32, error_code: Option<ErrorCode>) -> Result<(), H2Error> {
        if self.state == ConnState::Closed {
            return Err(H2Error::Closed);
        }
        if !self.streams.contains_key(&id) {
            return Err(H2Error::UnknownStream(id));
        }
        self.stream_error(id, error_code.unwrap_or(ErrorCode::Cancel));
        Ok(())
    }

    /// Promise a stream on a parent (server role). Returns the promised id;
    /// the promised stream is reserved until its HEADERS go out.
    pub fn push_promise(
        &mut self,
        parent_id: u32,
        headers: &[HeaderField],
        priority: Option<u32>,
    ) -> Result<u32, H2Error> {
        if self.state == ConnState::Closed {
            return Err(H2Error::Closed);
        }
        if self.role != Role::Server {
            return Err(H2Error::Protocol("only servers may push".into()));
        }
        match self.streams.get(&parent_id).map(|s| s.state) {
            Some(StreamState::Open) | Some(StreamState::HalfClosedRemote) => {}
            Some(_) => return Err(H2Error::NotWritable(parent_id)),
            None => return Err(H2Error::UnknownStream(parent_id)),
        }
        if let Some(limit) = self.stream_limit {
            if self.active_streams >= limit {
                return Err(H2Error::StreamLimitReached);
            }
        }
        let promised_id = self.next_stream_id;
        self.next_stream_id += 2;
        let mut stream = Stream::new(
            promised_id,
            priority.unwrap_or(DEFAULT_PRIORITY),
            self.initial_send_window(),
            self.initial_recv_window(),
        );
        stream.state = StreamState::ReservedLocal;
        self.streams.insert(promised_id, stream);

        let mut fragment = Vec::new();
        self.codec.encode(headers, &mut fragment);
        self.send_frame(Frame::PushPromise {
            stream_id: parent_id,
            promised_stream_id: promised_id,
            fragment,
            end_push_promise: true,
        });
        Ok(promised_id)
    }

    // -- Connection operations --

    /// Send a PING with the given opaque payload.
    pub fn ping(&mut self, payload: [u8; 8]) -> Result<(), H2Error> {
        if self.state == ConnState::Closed {
            return Err(H2Error::Closed);
        }
        self.send_frame(Frame::Ping {
            ack: false,
            opaque_data: payload,
        });
        Ok(())
    }

    /// Send GOAWAY and stop accepting new streams.
    pub fn goaway(&mut self, error_code: ErrorCode, debug_data: &[u8]) -> Result<(), H2Error> {
        if self.state == ConnState::Closed {
            return Err(H2Error::Closed);
        }
        self.send_frame(Frame::GoAway {
            last_stream_id: self.last_peer_stream_id,
            error_code,
            debug_data: debug_data.to_vec(),
        });
        self.goaway_sent = true;
        self.state = ConnState::Draining;
        Ok(())
    }

    /// Send a SETTINGS frame advertising local parameters.
    pub fn send_settings(&mut self, settings: Settings) -> Result<(), H2Error> {
        if self.state == ConnState::Closed {
            return Err(H2Error::Closed);
        }
        if self.window_limit.is_none() && settings.touches_flow_control() {
            return Err(H2Error::FlowControl);
        }
        if let Some(new) = settings.initial_window_size {
            if i64::from(new) > MAX_WINDOW_SIZE {
                return Err(H2Error::FlowControl);
            }
            let old = self.initial_recv_window();
            let delta = i64::from(new) - old;
            if delta != 0 {
                for stream in self.streams.values_mut() {
                    stream
                        .recv_window
                        .adjust(delta)
                        .map_err(|_| H2Error::FlowControl)?;
                }
                self.recv_window.adjust(delta)?;
            }
            self.local_settings.initial_window_size = Some(new);
        }
        if let Some(v) = settings.max_concurrent_streams {
            self.local_settings.max_concurrent_streams = Some(v);
        }
        if let Some(v) = settings.flow_control_options {
            self.local_settings.flow_control_options = Some(v);
        }
        let disables = settings.disables_flow_control();
        self.send_frame(Frame::Settings {
            ack: false,
            settings,
        });
        if disables {
            self.window_limit = None;
            self.drain();
        }
        Ok(())
    }

    // -- Observable properties --

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// The error code recorded by a connection error, if any.
    pub fn error(&self) -> Option<ErrorCode> {
        self.error
    }

    /// Connection-level send credit.
    pub fn window(&self) -> i64 {
        self.send_window.window()
    }

    /// Connection-level receive credit.
    pub fn recv_window(&self) -> i64 {
        self.recv_window.window()
    }

    /// Bytes of DATA waiting for flow-control credit.
    pub fn buffered_amount(&self) -> usize {
        self.send_queue.buffered_amount()
    }

    /// Streams currently open or half-closed.
    pub fn active_stream_count(&self) -> u32 {
        self.active_streams
    }

    /// Peer-advertised concurrent stream bound (`None` = unbounded).
    pub fn stream_limit(&self) -> Option<u32> {
        self.stream_limit
    }

    /// False once SETTINGS_FLOW_CONTROL_OPTIONS has disabled flow control.
    pub fn flow_control_enabled(&self) -> bool {
        self.window_limit.is_some()
    }

    /// The last stream id the peer reported in GOAWAY.
    pub fn goaway_last_stream_id(&self) -> Option<u32> {
        self.goaway_last_stream_id
    }

    pub fn stream_state(&self, id: u32) -> Option<StreamState> {
        self.streams
            .get(&id)
            .map(|s| s.state)
            .or_else(|| self.tombstones.contains_key(&id).then_some(StreamState::Closed))
    }

    pub fn stream_priority(&self, id: u32) -> Option<u32> {
        self.streams.get(&id).map(|s| s.priority)
    }

    /// A stream's send credit.
    pub fn stream_window(&self, id: u32) -> Option<i64> {
        self.streams.get(&id).map(|s| s.send_window.window())
    }

    /// Bytes buffered for one stream in the send queue.
    pub fn stream_buffered(&self, id: u32) -> usize {
        self.send_queue.buffered_for(id)
    }

    // -- Inbound frame processing --

    fn handle_frame(&mut self, frame: Frame) -> Result<(), H2Error> {
        self.events.push_back(H2Event::FrameReceived(frame.clone()));

        if let Some(assembly) = &self.assembly {
            let expected = assembly.stream_id;
            let is_expected_continuation =
                matches!(&frame, Frame::Continuation { stream_id, .. } if *stream_id == expected);
            if !is_expected_continuation {
                return Err(self.fail(H2Error::Protocol(
                    "frame interleaved inside a header block".into(),
                )));
            }
        }

        if self.state == ConnState::New && !matches!(frame, Frame::Settings { ack: false, .. }) {
            return Err(self.fail(H2Error::Protocol(
                "expected SETTINGS to open the connection".into(),
            )));
        }

        match frame {
            Frame::Settings { ack, settings } => self.recv_settings(ack, settings),
            Frame::Ping { ack, opaque_data } => {
                if ack {
                    self.events.push_back(H2Event::PingAck {
                        payload: opaque_data,
                    });
                } else {
                    self.send_frame(Frame::Ping {
                        ack: true,
                        opaque_data,
                    });
                }
                Ok(())
            }
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            } => {
                self.goaway_last_stream_id = Some(last_stream_id);
                if self.state == ConnState::Connected {
                    self.state = ConnState::Draining;
                }
                self.events.push_back(H2Event::GoAway {
                    last_stream_id,
                    error_code,
                    debug_data,
                });
                Ok(())
            }
            Frame::WindowUpdate {
                stream_id: 0,
                increment,
            } => self.recv_connection_window_update(increment),
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => self.recv_stream_window_update(stream_id, increment),
            Frame::Headers {
                stream_id,
                fragment,
                priority,
                end_stream,
                end_headers,
            } => self.recv_headers(stream_id, fragment, priority, end_stream, end_headers),
            Frame::Continuation {
                stream_id: _,
                fragment,
                end_headers,
            } => self.recv_continuation(fragment, end_headers),
            Frame::Data {
                stream_id,
                payload,
                end_stream,
                end_segment: _,
            } => self.recv_data(stream_id, payload, end_stream),
            Frame::RstStream {
                stream_id,
                error_code: _,
            } => self.recv_rst(stream_id),
            Frame::Priority {
                stream_id,
                priority,
            } => self.recv_priority(stream_id, priority),
            Frame::PushPromise {
                stream_id,
                promised_stream_id,
                fragment,
                end_push_promise,
            } => self.recv_push_promise(stream_id, promised_stream_id, fragment, end_push_promise),
        }
    }

    fn recv_settings(&mut self, ack: bool, settings: Settings) -> Result<(), H2Error> {
        if ack {
            // Acknowledgements carry no payload and change no state.
            return Ok(());
        }
        if self.window_limit.is_none() && settings.touches_flow_control() {
            return Err(self.fail(H2Error::Connection(ErrorCode::FlowControlError)));
        }
        if let Some(limit) = settings.max_concurrent_streams {
            self.stream_limit = Some(limit);
        }
        if let (Some(old), Some(new)) = (self.window_limit, settings.initial_window_size) {
            let new = i64::from(new);
            let delta = new - old;
            if delta != 0 {
                let mut changed = Vec::new();
                let mut overflow = false;
                for stream in self.streams.values_mut() {
                    if stream.send_window.adjust(delta).is_err() {
                        overflow = true;
                        break;
                    }
                    changed.push((stream.id, stream.send_window.window()));
                }
                if overflow || self.send_window.adjust(delta).is_err() {
                    return Err(self.fail(H2Error::Connection(ErrorCode::FlowControlError)));
                }
                for (stream_id, window) in changed {
                    self.events.push_back(H2Event::Window { stream_id, window });
                }
            }
            self.window_limit = Some(new);
        }
        if settings.disables_flow_control() {
            self.window_limit = None;
        }
        if self.state == ConnState::New {
            self.state = ConnState::Connected;
        }
        self.drain();
        Ok(())
    }

    fn recv_connection_window_update(&mut self, increment: u32) -> Result<(), H2Error> {
        if self.window_limit.is_none() {
            return Err(self.fail(H2Error::Connection(ErrorCode::FlowControlError)));
        }
        if increment == 0 {
            return Err(self.fail(H2Error::Protocol(
                "WINDOW_UPDATE with zero increment".into(),
            )));
        }
        if self.send_window.increase(increment).is_err() {
            return Err(self.fail(H2Error::Connection(ErrorCode::FlowControlError)));
        }
        self.events.push_back(H2Event::Window {
            stream_id: 0,
            window: self.send_window.window(),
        });
        self.drain();
        Ok(())
    }

    fn recv_stream_window_update(&mut self, id: u32, increment: u32) -> Result<(), H2Error> {
        if self.window_limit.is_none() {
            return Err(self.fail(H2Error::Connection(ErrorCode::FlowControlError)));
        }
        match self.ensure_stream(id)? {
            Lookup::Refused | Lookup::Closed(_) => Ok(()), // late update for a dead stream
            Lookup::Live => {
                if increment == 0 {
                    self.stream_error(id, ErrorCode::ProtocolError);
                    return Ok(());
                }
                let updated = self
                    .streams
                    .get_mut(&id)
                    .map(|s| s.send_window.increase(increment).is_ok());
                match updated {
                    Some(false) => {
                        self.stream_error(id, ErrorCode::FlowControlError);
                    }
                    Some(true) => {
                        if let Some(window) = self.stream_window(id) {
                            self.events.push_back(H2Event::Window {
                                stream_id: id,
                                window,
                            });
                        }
                        self.drain();
                    }
                    None => {}
                }
                Ok(())
            }
        }
    }

    fn recv_headers(
        &mut self,
        id: u32,
        fragment: Vec<u8>,
        priority: Option<u32>,
        end_stream: bool,
        end_headers: bool,
    ) -> Result<(), H2Error> {
        match self.ensure_stream(id)? {
            Lookup::Refused => return Ok(()),
            Lookup::Closed(cause) => {
                self.closed_stream_error(id, cause);
                return Ok(());
            }
            Lookup::Live => {}
        }
        let newly_active: Option<bool> = {
            let Some(stream) = self.streams.get_mut(&id) else {
                return Ok(());
            };
            if let Some(priority) = priority {
                stream.priority = priority;
            }
            match stream.state {
                StreamState::Idle => {
                    stream.state = StreamState::Open;
                    Some(stream.activate())
                }
                StreamState::ReservedRemote => {
                    stream.state = StreamState::HalfClosedLocal;
                    Some(stream.activate())
                }
                StreamState::Open | StreamState::HalfClosedLocal => Some(false),
                StreamState::ReservedLocal
                | StreamState::HalfClosedRemote
                | StreamState::Closed => None,
            }
        };
        let Some(newly_active) = newly_active else {
            self.stream_error(id, ErrorCode::ProtocolError);
            return Ok(());
        };
        if newly_active {
            self.active_streams += 1;
            self.events.push_back(H2Event::Active { stream_id: id });
        }
        if fragment.len() > MAX_HEADER_BLOCK_SIZE {
            return Err(self.fail(H2Error::Connection(ErrorCode::EnhanceYourCalm)));
        }
        let assembly = HeaderAssembly {
            stream_id: id,
            end_stream,
            fragment,
            promise: None,
        };
        if end_headers {
            self.complete_header_block(assembly)
        } else {
            self.assembly = Some(assembly);
            Ok(())
        }
    }

    fn recv_continuation(&mut self, fragment: Vec<u8>, end_headers: bool) -> Result<(), H2Error> {
        // Stream-id mismatches were rejected in handle_frame.
        let Some(mut assembly) = self.assembly.take() else {
            return Err(self.fail(H2Error::Protocol(
                "CONTINUATION without a header block".into(),
            )));
        };
        if assembly.fragment.len() + fragment.len() > MAX_HEADER_BLOCK_SIZE {
            return Err(self.fail(H2Error::Connection(ErrorCode::EnhanceYourCalm)));
        }
        assembly.fragment.extend_from_slice(&fragment);
        if end_headers {
            self.complete_header_block(assembly)
        } else {
            self.assembly = Some(assembly);
            Ok(())
        }
    }

    fn complete_header_block(&mut self, assembly: HeaderAssembly) -> Result<(), H2Error> {
        let HeaderAssembly {
            stream_id,
            end_stream,
            fragment,
            promise,
        } = assembly;
        let headers = match self.codec.decode(&fragment) {
            Ok(headers) => headers,
            Err(_) => return Err(self.fail(H2Error::Connection(ErrorCode::CompressionError))),
        };
        match promise {
            Some(promise) if promise.discard => {
                // Parent was reset locally: refuse after reassembly.
                self.send_frame(Frame::RstStream {
                    stream_id: promise.promised_id,
                    error_code: ErrorCode::RefusedStream,
                });
                self.tombstones
                    .insert(promise.promised_id, CloseCause::LocalRst);
                Ok(())
            }
            Some(promise) => {
                let mut stream = Stream::new(
                    promise.promised_id,
                    DEFAULT_PRIORITY,
                    self.initial_send_window(),
                    self.initial_recv_window(),
                );
                stream.state = StreamState::ReservedRemote;
                self.streams.insert(promise.promised_id, stream);
                self.events.push_back(H2Event::Promise {
                    parent_id: promise.parent_id,
                    stream_id: promise.promised_id,
                    headers,
                });
                Ok(())
            }
            None => {
                self.events.push_back(H2Event::Headers {
                    stream_id,
                    headers,
                    end_stream,
                });
                if end_stream {
                    self.recv_end_stream(stream_id);
                }
                Ok(())
            }
        }
    }

    fn recv_data(&mut self, id: u32, payload: Bytes, end_stream: bool) -> Result<(), H2Error> {
        match self.ensure_stream(id)? {
            Lookup::Refused => return Ok(()),
            Lookup::Closed(cause) => {
                self.closed_stream_error(id, cause);
                return Ok(());
            }
            Lookup::Live => {}
        }
        let allowed = self
            .streams
            .get(&id)
            .map(|s| s.peer_may_send_data())
            .unwrap_or(false);
        if !allowed {
            self.stream_error(id, ErrorCode::ProtocolError);
            return Ok(());
        }
        if self.window_limit.is_some() && !payload.is_empty() {
            let len = payload.len() as u32;
            if self.recv_window.consume(len).is_err() {
                return Err(self.fail(H2Error::Connection(ErrorCode::FlowControlError)));
            }
            let within_stream_window = self
                .streams
                .get_mut(&id)
                .map(|s| s.recv_window.consume(len).is_ok())
                .unwrap_or(true);
            if !within_stream_window {
                self.stream_error(id, ErrorCode::FlowControlError);
                return Ok(());
            }
        }
        self.events.push_back(H2Event::Data {
            stream_id: id,
            data: payload,
            end_stream,
        });
        if end_stream {
            self.recv_end_stream(id);
        }
        Ok(())
    }

    fn recv_rst(&mut self, id: u32) -> Result<(), H2Error> {
        match self.ensure_stream(id)? {
            // A reset for an already-closed stream is observed idempotently.
            Lookup::Refused | Lookup::Closed(_) => Ok(()),
            Lookup::Live => {
                self.close_stream(id, CloseCause::RemoteRst);
                Ok(())
            }
        }
    }

    fn recv_priority(&mut self, id: u32, priority: u32) -> Result<(), H2Error> {
        match self.ensure_stream(id)? {
            Lookup::Refused | Lookup::Closed(_) => Ok(()),
            Lookup::Live => {
                if let Some(stream) = self.streams.get_mut(&id) {
                    stream.priority = priority;
                }
                self.events.push_back(H2Event::Priority {
                    stream_id: id,
                    priority,
                });
                Ok(())
            }
        }
    }

    fn recv_push_promise(
        &mut self,
        parent_id: u32,
        promised_id: u32,
        fragment: Vec<u8>,
        end_push_promise: bool,
    ) -> Result<(), H2Error> {
        if self.role == Role::Server {
            return Err(self.fail(H2Error::Protocol("PUSH_PROMISE from a client".into())));
        }
        if promised_id == 0 || promised_id % 2 != 0 || promised_id <= self.last_peer_stream_id {
            return Err(self.fail(H2Error::Protocol(
                "promised stream id is not a fresh server-initiated id".into(),
            )));
        }
        let discard = match self.streams.get(&parent_id).map(|s| s.state) {
            Some(StreamState::Open) | Some(StreamState::HalfClosedLocal) => false,
            Some(_) => {
                return Err(self.fail(H2Error::Protocol(
                    "PUSH_PROMISE on an unusable parent stream".into(),
                )))
            }
            None => match self.tombstones.get(&parent_id) {
                Some(CloseCause::LocalRst) => true,
                _ => {
                    return Err(self.fail(H2Error::Protocol(
                        "PUSH_PROMISE on an unusable parent stream".into(),
                    )))
                }
            },
        };
        self.last_peer_stream_id = promised_id;
        if fragment.len() > MAX_HEADER_BLOCK_SIZE {
            return Err(self.fail(H2Error::Connection(ErrorCode::EnhanceYourCalm)));
        }
        let assembly = HeaderAssembly {
            stream_id: parent_id,
            end_stream: false,
            fragment,
            promise: Some(Promise {
                parent_id,
                promised_id,
                discard,
            }),
        };
        if end_push_promise {
            self.complete_header_block(assembly)
        } else {
            self.assembly = Some(assembly);
            Ok(())
        }
    }

    // -- Stream bookkeeping --

    /// Resolve the stream a frame refers to, creating an idle stream for a
    /// fresh peer-initiated id (server side; pushed streams reach a client
    /// only through PUSH_PROMISE).
    fn ensure_stream(&mut self, id: u32) -> Result<Lookup, H2Error> {
        if self.streams.contains_key(&id) {
            return Ok(Lookup::Live);
        }
        if let Some(&cause) = self.tombstones.get(&id) {
            return Ok(Lookup::Closed(cause));
        }
        let peer_initiated = match self.role {
            Role::Server => id % 2 == 1,
            Role::Client => id % 2 == 0,
        };
        if !peer_initiated {
            return Err(self.fail(H2Error::Protocol(
                "frame on a stream this endpoint never opened".into(),
            )));
        }
        if self.role == Role::Client {
            return Err(self.fail(H2Error::Protocol(
                "peer stream without a preceding PUSH_PROMISE".into(),
            )));
        }
        if id <= self.last_peer_stream_id {
            return Err(self.fail(H2Error::Protocol("peer stream id is not increasing".into())));
        }
        self.last_peer_stream_id = id;
        if self.goaway_sent || self.over_local_stream_limit() {
            self.send_frame(Frame::RstStream {
                stream_id: id,
                error_code: ErrorCode::RefusedStream,
            });
            self.tombstones.insert(id, CloseCause::LocalRst);
            return Ok(Lookup::Refused);
        }
        let stream = Stream::new(
            id,
            DEFAULT_PRIORITY,
            self.initial_send_window(),
            self.initial_recv_window(),
        );
        self.streams.insert(id, stream);
        self.events.push_back(H2Event::Stream { stream_id: id });
        Ok(Lookup::Live)
    }

    /// Apply END_STREAM received from the peer.
    fn recv_end_stream(&mut self, id: u32) {
        enum After {
            HalfClosed,
            Closed,
            Nothing,
        }
        let after = {
            let Some(stream) = self.streams.get_mut(&id) else {
                return;
            };
            match stream.state {
                StreamState::Open => {
                    stream.state = StreamState::HalfClosedRemote;
                    After::HalfClosed
                }
                StreamState::HalfClosedLocal => After::Closed,
                _ => After::Nothing,
            }
        };
        match after {
            After::HalfClosed => self.events.push_back(H2Event::HalfClose { stream_id: id }),
            After::Closed => self.close_stream(id, CloseCause::RemoteFin),
            After::Nothing => {}
        }
    }

    /// Apply END_STREAM at the moment it is emitted locally.
    fn send_end_stream(&mut self, id: u32) {
        enum After {
            HalfClosed,
            Closed,
            Nothing,
        }
        let after = {
            let Some(stream) = self.streams.get_mut(&id) else {
                return;
            };
            match stream.state {
                StreamState::Open => {
                    stream.state = StreamState::HalfClosedLocal;
                    After::HalfClosed
                }
                StreamState::HalfClosedRemote => After::Closed,
                _ => After::Nothing,
            }
        };
        match after {
            After::HalfClosed => self.events.push_back(H2Event::HalfClose { stream_id: id }),
            After::Closed => self.close_stream(id, CloseCause::LocalFin),
            After::Nothing => {}
        }
    }

    /// Remove a stream from the registry on entry to closed. Decrements the
    /// active count exactly once and drops any DATA it still had queued.
    fn close_stream(&mut self, id: u32, cause: CloseCause) {
        let Some(mut stream) = self.streams.remove(&id) else {
            return;
        };
        stream.close(cause);
        self.tombstones.insert(id, cause);
        if stream.activated {
            self.active_streams -= 1;
        }
        self.send_queue.drop_stream(id);
        self.events.push_back(H2Event::Close {
            stream_id: id,
            cause,
        });
    }

    /// Remediate a stream error: RST_STREAM out, stream closed locally.
    fn stream_error(&mut self, id: u32, code: ErrorCode) {
        self.send_frame(Frame::RstStream {
            stream_id: id,
            error_code: code,
        });
        self.close_stream(id, CloseCause::LocalRst);
        // A stream that already closed keeps its original cause.
        self.tombstones.entry(id).or_insert(CloseCause::LocalRst);
    }

    /// A frame arrived for a stream that already finished.
    fn closed_stream_error(&mut self, id: u32, cause: CloseCause) {
        let code = if cause.is_local() {
            ErrorCode::StreamClosed
        } else {
            ErrorCode::ProtocolError
        };
        self.stream_error(id, code);
    }

    fn over_local_stream_limit(&self) -> bool {
        self.local_settings
            .max_concurrent_streams
            .is_some_and(|limit| self.active_streams >= limit)
    }

    fn initial_send_window(&self) -> i64 {
        self.window_limit.unwrap_or(DEFAULT_WINDOW_SIZE)
    }

    fn initial_recv_window(&self) -> i64 {
        self.local_settings
            .initial_window_size
            .map(i64::from)
            .unwrap_or(DEFAULT_WINDOW_SIZE)
    }

    // -- Outbound plumbing --

    /// Serialize a frame into the send buffer and mirror it as an event.
    fn send_frame(&mut self, frame: Frame) {
        frame.encode(&mut self.send_buf);
        self.events.push_back(H2Event::FrameSent(frame));
    }

    fn emit_data(&mut self, frame: PendingData) {
        let PendingData {
            stream_id,
            payload,
            end_stream,
            end_segment,
        } = frame;
        self.send_frame(Frame::Data {
            stream_id,
            payload,
            end_stream,
            end_segment,
        });
        if end_stream {
            self.send_end_stream(stream_id);
        }
    }

    /// Emit queued DATA while the head frame fits within both the connection
    /// and stream send windows, splitting the head when only part of it is
    /// covered. Order is preserved.
    fn drain(&mut self) {
        if self.state == ConnState::Closed {
            return;
        }
        if self.window_limit.is_none() {
            while let Some(frame) = self.send_queue.pop_front() {
                self.emit_data(frame);
            }
            return;
        }
        loop {
            let Some(head) = self.send_queue.front() else {
                break;
            };
            let id = head.stream_id;
            let len = head.payload.len() as i64;
            let Some(stream_window) = self.streams.get(&id).map(|s| s.send_window.window())
            else {
                // Stream closed while its DATA was blocked; forget it.
                self.send_queue.pop_front();
                continue;
            };
            let available = self.send_window.window().min(stream_window);
            if len <= available {
                let Some(frame) = self.send_queue.pop_front() else {
                    break;
                };
                self.debit_windows(id, len);
                self.emit_data(frame);
            } else if available > 0 {
                let Some(frame) = self.send_queue.split_front(available as usize) else {
                    break;
                };
                self.debit_windows(id, available);
                self.emit_data(frame);
            } else {
                break;
            }
        }
    }

    fn debit_windows(&mut self, id: u32, amount: i64) {
        if amount == 0 {
            return;
        }
        self.send_window.debit(amount);
        self.events.push_back(H2Event::Window {
            stream_id: 0,
            window: self.send_window.window(),
        });
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.send_window.debit(amount);
        }
        if let Some(window) = self.stream_window(id) {
            self.events.push_back(H2Event::Window {
                stream_id: id,
                window,
            });
        }
    }

    /// Fatal connection error: close, record the code, emit the terminal
    /// RST_STREAM(0) marker, and hand the failure outward.
    fn fail(&mut self, err: H2Error) -> H2Error {
        let code = err.code();
        self.state = ConnState::Closed;
        self.error = Some(code);
        self.send_queue.clear();
        self.assembly = None;
        self.send_frame(Frame::RstStream {
            stream_id: 0,
            error_code: code,
        });
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(frame: Frame) -> Vec<u8> {
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        buf
    }

    fn settings_frame(settings: Settings) -> Vec<u8> {
        encode(Frame::Settings {
            ack: false,
            settings,
        })
    }

    #[test]
    fn client_queues_preface_and_settings() {
        let mut conn = H2Connection::client(Settings::default());
        let send = conn.take_pending_send();
        assert!(send.starts_with(CONNECTION_PREFACE));
        let after_preface = &send[CONNECTION_PREFACE.len()..];
        let header = frame::decode_frame_header(after_preface).unwrap();
        assert_eq!(header.frame_type, frame::FRAME_SETTINGS);
        assert_eq!(header.stream_id, 0);
        assert_eq!(conn.state(), ConnState::New);
    }

    #[test]
    fn server_handshake_from_preface() {
        let mut server = H2Connection::server(Settings::default());
        let mut wire = CONNECTION_PREFACE.to_vec();
        wire.extend_from_slice(&settings_frame(Settings {
            max_concurrent_streams: Some(100),
            ..Default::default()
        }));
        server.recv(&wire).unwrap();

        assert_eq!(server.state(), ConnState::Connected);
        assert_eq!(server.stream_limit(), Some(100));

        // The server's own SETTINGS is its only output.
        let send = server.take_pending_send();
        let (frame, consumed) = frame::decode_frame(&send).unwrap().unwrap();
        assert!(matches!(frame, Frame::Settings { ack: false, .. }));
        assert_eq!(consumed, send.len());
    }

    #[test]
    fn bad_preface_is_a_connection_error() {
        let mut server = H2Connection::server(Settings::default());
        let err = server.recv(b"GET / HTTP/1.1\r\n").unwrap_err();
        assert!(matches!(err, H2Error::Protocol(_)));
        assert_eq!(server.state(), ConnState::Closed);
        assert_eq!(server.error(), Some(ErrorCode::ProtocolError));
    }

    #[test]
    fn frames_before_settings_are_rejected() {
        let mut client = H2Connection::client(Settings::default());
        let err = client
            .recv(&encode(Frame::Ping {
                ack: false,
                opaque_data: [0; 8],
            }))
            .unwrap_err();
        assert!(matches!(err, H2Error::Protocol(_)));
        assert_eq!(client.state(), ConnState::Closed);
    }

    #[test]
    fn connection_error_emits_terminal_marker() {
        let mut client = H2Connection::client(Settings::default());
        let _ = client.take_pending_send();
        client.recv(&settings_frame(Settings::default())).unwrap();
        let _ = client.take_pending_send();

        // Unknown frame type is a connection error.
        let mut bad = Vec::new();
        frame::encode_frame_header(&mut bad, 0, 0x66, 0, 1);
        let err = client.recv(&bad).unwrap_err();
        assert!(matches!(err, H2Error::UnknownType(0x66)));
        assert_eq!(client.state(), ConnState::Closed);

        // The terminal marker is RST_STREAM on stream 0, which the parser
        // refuses by design; check the header and payload bytes directly.
        let send = client.take_pending_send();
        let header = frame::decode_frame_header(&send).unwrap();
        assert_eq!(header.frame_type, frame::FRAME_RST_STREAM);
        assert_eq!(header.stream_id, 0);
        assert_eq!(header.length, 4);
        assert_eq!(
            &send[frame::FRAME_HEADER_LEN..],
            &ErrorCode::ProtocolError.as_u32().to_be_bytes()
        );

        // Closed connections discard further input.
        client.recv(&bad).unwrap();
    }

    #[test]
    fn stream_ids_are_odd_and_increasing() {
        let mut client = H2Connection::client(Settings::default());
        client.recv(&settings_frame(Settings::default())).unwrap();
        assert_eq!(client.new_stream(None).unwrap(), 1);
        assert_eq!(client.new_stream(None).unwrap(), 3);
        assert_eq!(client.new_stream(None).unwrap(), 5);
    }

    #[test]
    fn ping_is_answered_with_identical_payload() {
        let mut client = H2Connection::client(Settings::default());
        let _ = client.take_pending_send();
        client.recv(&settings_frame(Settings::default())).unwrap();
        let _ = client.take_pending_send();

        client
            .recv(&encode(Frame::Ping {
                ack: false,
                opaque_data: [9, 8, 7, 6, 5, 4, 3, 2],
            }))
            .unwrap();
        let send = client.take_pending_send();
        let (pong, _) = frame::decode_frame(&send).unwrap().unwrap();
        assert_eq!(
            pong,
            Frame::Ping {
                ack: true,
                opaque_data: [9, 8, 7, 6, 5, 4, 3, 2],
            }
        );
    }

    #[test]
    fn ping_ack_surfaces_as_event() {
        let mut client = H2Connection::client(Settings::default());
        client.recv(&settings_frame(Settings::default())).unwrap();
        client.ping([1; 8]).unwrap();
        client
            .recv(&encode(Frame::Ping {
                ack: true,
                opaque_data: [1; 8],
            }))
            .unwrap();
        let saw_ack = std::iter::from_fn(|| client.poll_event())
            .any(|e| matches!(e, H2Event::PingAck { payload } if payload == [1; 8]));
        assert!(saw_ack);
    }

    #[test]
    fn goaway_moves_to_draining_and_refuses_new_streams() {
        let mut client = H2Connection::client(Settings::default());
        client.recv(&settings_frame(Settings::default())).unwrap();
        client
            .recv(&encode(Frame::GoAway {
                last_stream_id: 0,
                error_code: ErrorCode::NoError,
                debug_data: Vec::new(),
            }))
            .unwrap();
        assert_eq!(client.state(), ConnState::Draining);
        assert_eq!(client.goaway_last_stream_id(), Some(0));
        assert!(matches!(client.new_stream(None), Err(H2Error::Closed)));
    }

    #[test]
    fn stream_limit_bounds_new_stream() {
        let mut client = H2Connection::client(Settings::default());
        client
            .recv(&settings_frame(Settings {
                max_concurrent_streams: Some(1),
                ..Default::default()
            }))
            .unwrap();
        let first = client.new_stream(None).unwrap();
        client
            .send_headers(first, &[HeaderField::new(b":method".as_slice(), b"GET".as_slice())], false)
            .unwrap();
        assert_eq!(client.active_stream_count(), 1);
        assert!(matches!(
            client.new_stream(None),
            Err(H2Error::StreamLimitReached)
        ));
    }

    #[test]
    fn flow_control_disable_is_forever() {
        let mut client = H2Connection::client(Settings::default());
        client
            .recv(&settings_frame(Settings {
                flow_control_options: Some(1),
                ..Default::default()
            }))
            .unwrap();
        assert!(!client.flow_control_enabled());

        // Any further flow-control-related frame is a connection error.
        let err = client
            .recv(&encode(Frame::WindowUpdate {
                stream_id: 0,
                increment: 100,
            }))
            .unwrap_err();
        assert!(matches!(
            err,
            H2Error::Connection(ErrorCode::FlowControlError)
        ));
        assert_eq!(client.error(), Some(ErrorCode::FlowControlError));
    }

    #[test]
    fn local_window_update_rejected_after_disable() {
        let mut client = H2Connection::client(Settings::default());
        client
            .recv(&settings_frame(Settings {
                flow_control_options: Some(1),
                ..Default::default()
            }))
            .unwrap();
        assert!(matches!(
            client.window_update(100),
            Err(H2Error::FlowControl)
        ));
    }

    #[test]
    fn zero_connection_window_increment_is_protocol_error() {
        let mut client = H2Connection::client(Settings::default());
        client.recv(&settings_frame(Settings::default())).unwrap();
        // Hand-build the frame: the parser masks but does not reject zero.
        let mut wire = Vec::new();
        frame::encode_frame_header(&mut wire, 4, frame::FRAME_WINDOW_UPDATE, 0, 0);
        wire.extend_from_slice(&0u32.to_be_bytes());
        let err = client.recv(&wire).unwrap_err();
        assert!(matches!(err, H2Error::Protocol(_)));
        assert_eq!(client.state(), ConnState::Closed);
    }
}
