//! Flow-control credit accounting (draft-ietf-httpbis-http2-06 Section 6.9).
//!
//! Credit is tracked per connection and per stream by [`Window`]; DATA that
//! cannot be covered by both windows waits in the connection's [`SendQueue`]
//! until WINDOW_UPDATE frames replenish the credit.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::error::H2Error;

/// Default initial window size.
pub const DEFAULT_WINDOW_SIZE: i64 = 65535;

/// Largest legal window value (2^31 - 1).
pub const MAX_WINDOW_SIZE: i64 = 0x7fff_ffff;

/// A send or receive flow-control window.
///
/// The credit may go negative after a SETTINGS_INITIAL_WINDOW_SIZE shrink;
/// transmission resumes once WINDOW_UPDATEs restore it.
#[derive(Debug, Clone)]
pub struct Window {
    window: i64,
}

impl Window {
    pub fn new(initial: i64) -> Self {
        Self { window: initial }
    }

    /// Current credit in bytes.
    pub fn window(&self) -> i64 {
        self.window
    }

    /// Consume `amount` bytes of credit, failing if not enough is available.
    pub fn consume(&mut self, amount: u32) -> Result<(), H2Error> {
        let new = self.window - i64::from(amount);
        if new < 0 {
            return Err(H2Error::FlowControl);
        }
        self.window = new;
        Ok(())
    }

    /// Debit `amount` bytes the caller has already checked against the
    /// window. Used by the drain loop after a `min(conn, stream)` check.
    pub(crate) fn debit(&mut self, amount: i64) {
        debug_assert!(amount <= self.window);
        self.window -= amount;
    }

    /// Add `increment` bytes of credit (WINDOW_UPDATE).
    pub fn increase(&mut self, increment: u32) -> Result<(), H2Error> {
        let new = self.window + i64::from(increment);
        if new > MAX_WINDOW_SIZE {
            return Err(H2Error::FlowControl);
        }
        self.window = new;
        Ok(())
    }

    /// Shift the window after an initial-window-size change. `delta` is
    /// (new - old) and may be negative; the result may be negative too.
    pub fn adjust(&mut self, delta: i64) -> Result<(), H2Error> {
        let new = self.window + delta;
        if new > MAX_WINDOW_SIZE {
            return Err(H2Error::FlowControl);
        }
        self.window = new;
        Ok(())
    }
}

impl Default for Window {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}

/// A DATA frame waiting for flow-control credit.
#[derive(Debug)]
pub(crate) struct PendingData {
    pub stream_id: u32,
    pub payload: Bytes,
    pub end_stream: bool,
    pub end_segment: bool,
}

/// FIFO of flow-blocked DATA frames, with byte accounting.
///
/// Order is strict across streams: only the head is ever eligible to send,
/// so relative order among buffered frames is preserved.
#[derive(Debug, Default)]
pub(crate) struct SendQueue {
    queue: VecDeque<PendingData>,
    buffered: usize,
}

impl SendQueue {
    pub fn push(&mut self, frame: PendingData) {
        self.buffered += frame.payload.len();
        self.queue.push_back(frame);
    }

    pub fn front(&self) -> Option<&PendingData> {
        self.queue.front()
    }

    pub fn pop_front(&mut self) -> Option<PendingData> {
        let frame = self.queue.pop_front()?;
        self.buffered -= frame.payload.len();
        Some(frame)
    }

    /// Split `amount` bytes off the head frame, returning them as a frame of
    /// their own. END_STREAM/END_SEGMENT stay with the remainder.
    pub fn split_front(&mut self, amount: usize) -> Option<PendingData> {
        let head = self.queue.front_mut()?;
        debug_assert!(amount < head.payload.len());
        let payload = head.payload.split_to(amount);
        self.buffered -= amount;
        Some(PendingData {
            stream_id: head.stream_id,
            payload,
            end_stream: false,
            end_segment: false,
        })
    }

    /// Total bytes buffered.
    pub fn buffered_amount(&self) -> usize {
        self.buffered
    }

    /// Bytes buffered for one stream.
    pub fn buffered_for(&self, stream_id: u32) -> usize {
        self.queue
            .iter()
            .filter(|f| f.stream_id == stream_id)
            .map(|f| f.payload.len())
            .sum()
    }

    /// Drop all frames queued for `stream_id` (stream reset or closed).
    pub fn drop_stream(&mut self, stream_id: u32) {
        self.queue.retain(|f| f.stream_id != stream_id);
        self.buffered = self.queue.iter().map(|f| f.payload.len()).sum();
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.buffered = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_consume_and_increase() {
        let mut window = Window::default();
        assert_eq!(window.window(), 65535);
        window.consume(1000).unwrap();
        assert_eq!(window.window(), 64535);
        window.increase(500).unwrap();
        assert_eq!(window.window(), 65035);
    }

    #[test]
    fn consume_underflow() {
        let mut window = Window::new(100);
        assert!(window.consume(101).is_err());
        assert_eq!(window.window(), 100); // unchanged
    }

    #[test]
    fn increase_overflow() {
        let mut window = Window::new(MAX_WINDOW_SIZE);
        assert!(window.increase(1).is_err());
    }

    #[test]
    fn adjust_can_go_negative() {
        let mut window = Window::new(65535);
        window.adjust(-70000).unwrap();
        assert_eq!(window.window(), -4465);
        window.increase(5000).unwrap();
        assert_eq!(window.window(), 535);
    }

    #[test]
    fn adjust_overflow() {
        let mut window = Window::new(MAX_WINDOW_SIZE - 1);
        assert!(window.adjust(2).is_err());
    }

    #[test]
    fn queue_accounts_buffered_bytes() {
        let mut queue = SendQueue::default();
        queue.push(PendingData {
            stream_id: 1,
            payload: Bytes::from_static(b"0123456789"),
            end_stream: false,
            end_segment: false,
        });
        queue.push(PendingData {
            stream_id: 3,
            payload: Bytes::from_static(b"ab"),
            end_stream: true,
            end_segment: false,
        });
        assert_eq!(queue.buffered_amount(), 12);
        assert_eq!(queue.buffered_for(1), 10);
        assert_eq!(queue.buffered_for(3), 2);

        let head = queue.pop_front().unwrap();
        assert_eq!(head.stream_id, 1);
        assert_eq!(queue.buffered_amount(), 2);
    }

    #[test]
    fn split_front_keeps_end_stream_on_remainder() {
        let mut queue = SendQueue::default();
        queue.push(PendingData {
            stream_id: 1,
            payload: Bytes::from_static(b"0123456789AB"),
            end_stream: true,
            end_segment: false,
        });
        let first = queue.split_front(10).unwrap();
        assert_eq!(&first.payload[..], b"0123456789");
        assert!(!first.end_stream);
        assert_eq!(queue.buffered_amount(), 2);

        let rest = queue.pop_front().unwrap();
        assert_eq!(&rest.payload[..], b"AB");
        assert!(rest.end_stream);
        assert!(queue.is_empty());
    }

    #[test]
    fn drop_stream_removes_only_that_stream() {
        let mut queue = SendQueue::default();
        for (id, data) in [(1u32, "aaaa"), (3, "bb"), (1, "c")] {
            queue.push(PendingData {
                stream_id: id,
                payload: Bytes::copy_from_slice(data.as_bytes()),
                end_stream: false,
                end_segment: false,
            });
        }
        queue.drop_stream(1);
        assert_eq!(queue.buffered_amount(), 2);
        assert_eq!(queue.buffered_for(1), 0);
        assert_eq!(queue.front().unwrap().stream_id, 3);
    }
}
