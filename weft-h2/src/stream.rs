//! Per-stream state tracking (draft-ietf-httpbis-http2-06 Section 5.1).

use crate::flowcontrol::Window;

/// Default stream priority (2^30). Lower values are more urgent.
pub const DEFAULT_PRIORITY: u32 = 1 << 30;

/// State of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No HEADERS or PUSH_PROMISE has touched the stream yet.
    Idle,
    /// We promised this stream (PUSH_PROMISE sent).
    ReservedLocal,
    /// The peer promised this stream (PUSH_PROMISE received).
    ReservedRemote,
    /// Both directions open.
    Open,
    /// We sent END_STREAM; the peer may still send.
    HalfClosedLocal,
    /// The peer sent END_STREAM; we may still send.
    HalfClosedRemote,
    /// Terminal.
    Closed,
}

/// Why a stream reached [`StreamState::Closed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    /// We sent RST_STREAM.
    LocalRst,
    /// The peer sent RST_STREAM.
    RemoteRst,
    /// We finished with END_STREAM.
    LocalFin,
    /// The peer finished with END_STREAM.
    RemoteFin,
}

impl CloseCause {
    /// Whether closure was initiated on this side of the connection.
    pub fn is_local(self) -> bool {
        matches!(self, CloseCause::LocalRst | CloseCause::LocalFin)
    }
}

/// State and flow-control bookkeeping for a single stream.
///
/// Streams live in the connection's registry and never reference it back;
/// the connection drives every transition.
#[derive(Debug)]
pub(crate) struct Stream {
    pub id: u32,
    pub state: StreamState,
    pub priority: u32,
    pub send_window: Window,
    pub recv_window: Window,
    pub close_cause: Option<CloseCause>,
    /// Latch for the once-only `active` event.
    pub activated: bool,
    /// END_STREAM has been accepted for sending (it may still be sitting in
    /// the flow-control queue). No further local writes are allowed.
    pub local_end_queued: bool,
}

impl Stream {
    pub fn new(id: u32, priority: u32, send_window: i64, recv_window: i64) -> Self {
        Self {
            id,
            state: StreamState::Idle,
            priority,
            send_window: Window::new(send_window),
            recv_window: Window::new(recv_window),
            close_cause: None,
            activated: false,
            local_end_queued: false,
        }
    }

    /// Latch the once-only activation. Returns true the first time only.
    pub fn activate(&mut self) -> bool {
        if self.activated {
            return false;
        }
        self.activated = true;
        true
    }

    /// Whether the peer may send DATA in the current state.
    pub fn peer_may_send_data(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::HalfClosedLocal)
    }

    /// Whether this endpoint may send DATA in the current state.
    pub fn may_send_data(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::HalfClosedRemote)
            && !self.local_end_queued
    }

    /// Enter the terminal state. Returns true on first entry only.
    pub fn close(&mut self, cause: CloseCause) -> bool {
        if self.state == StreamState::Closed {
            return false;
        }
        self.state = StreamState::Closed;
        self.close_cause = Some(cause);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flowcontrol::DEFAULT_WINDOW_SIZE;

    fn stream() -> Stream {
        Stream::new(1, DEFAULT_PRIORITY, DEFAULT_WINDOW_SIZE, DEFAULT_WINDOW_SIZE)
    }

    #[test]
    fn starts_idle_with_default_priority() {
        let s = stream();
        assert_eq!(s.state, StreamState::Idle);
        assert_eq!(s.priority, 1 << 30);
        assert!(s.close_cause.is_none());
        assert!(!s.may_send_data());
        assert!(!s.peer_may_send_data());
    }

    #[test]
    fn activation_latches_once() {
        let mut s = stream();
        assert!(s.activate());
        assert!(!s.activate());
        assert!(!s.activate());
    }

    #[test]
    fn data_direction_predicates() {
        let mut s = stream();
        s.state = StreamState::Open;
        assert!(s.may_send_data());
        assert!(s.peer_may_send_data());

        s.state = StreamState::HalfClosedLocal;
        assert!(!s.may_send_data());
        assert!(s.peer_may_send_data());

        s.state = StreamState::HalfClosedRemote;
        assert!(s.may_send_data());
        assert!(!s.peer_may_send_data());

        s.local_end_queued = true;
        assert!(!s.may_send_data());
    }

    #[test]
    fn close_is_terminal_and_once_only() {
        let mut s = stream();
        s.state = StreamState::Open;
        assert!(s.close(CloseCause::RemoteRst));
        assert_eq!(s.state, StreamState::Closed);
        assert_eq!(s.close_cause, Some(CloseCause::RemoteRst));

        // Second close does not fire again or rewrite the cause.
        assert!(!s.close(CloseCause::LocalFin));
        assert_eq!(s.close_cause, Some(CloseCause::RemoteRst));
    }

    #[test]
    fn cause_locality() {
        assert!(CloseCause::LocalRst.is_local());
        assert!(CloseCause::LocalFin.is_local());
        assert!(!CloseCause::RemoteRst.is_local());
        assert!(!CloseCause::RemoteFin.is_local());
    }
}
