//! SETTINGS parameters (draft-ietf-httpbis-http2-06 Section 6.5).
//!
//! Each setting travels as an 8-byte (key, value) pair of two 32-bit
//! big-endian integers. Only the three draft-06 keys the engine acts on are
//! modeled; unknown keys are ignored on receipt.

use crate::error::H2Error;
use crate::flowcontrol::MAX_WINDOW_SIZE;

const SETTINGS_MAX_CONCURRENT_STREAMS: u32 = 4;
const SETTINGS_INITIAL_WINDOW_SIZE: u32 = 7;
const SETTINGS_FLOW_CONTROL_OPTIONS: u32 = 10;

/// A settings snapshot. Absent fields are not transmitted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    /// SETTINGS_MAX_CONCURRENT_STREAMS (4).
    pub max_concurrent_streams: Option<u32>,
    /// SETTINGS_INITIAL_WINDOW_SIZE (7). At most 2^31 - 1.
    pub initial_window_size: Option<u32>,
    /// SETTINGS_FLOW_CONTROL_OPTIONS (10). Bit 0x1 disables flow control
    /// for the lifetime of the connection.
    pub flow_control_options: Option<u32>,
}

impl Settings {
    /// Whether the disable-flow-control bit is set.
    pub fn disables_flow_control(&self) -> bool {
        self.flow_control_options.is_some_and(|v| v & 0x1 != 0)
    }

    /// Whether the snapshot touches any flow-control machinery.
    pub(crate) fn touches_flow_control(&self) -> bool {
        self.initial_window_size.is_some() || self.flow_control_options.is_some()
    }

    /// Encode present settings as 8-byte pairs.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        if let Some(v) = self.max_concurrent_streams {
            encode_setting(buf, SETTINGS_MAX_CONCURRENT_STREAMS, v);
        }
        if let Some(v) = self.initial_window_size {
            encode_setting(buf, SETTINGS_INITIAL_WINDOW_SIZE, v);
        }
        if let Some(v) = self.flow_control_options {
            encode_setting(buf, SETTINGS_FLOW_CONTROL_OPTIONS, v);
        }
    }

    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }

    /// Decode a SETTINGS payload of 8-byte pairs.
    pub fn decode(buf: &[u8]) -> Result<Self, H2Error> {
        if buf.len() % 8 != 0 {
            return Err(H2Error::FrameSize);
        }
        let mut settings = Settings::default();
        let mut pos = 0;
        while pos + 8 <= buf.len() {
            let key = u32::from_be_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]);
            let value =
                u32::from_be_bytes([buf[pos + 4], buf[pos + 5], buf[pos + 6], buf[pos + 7]]);
            pos += 8;
            match key {
                SETTINGS_MAX_CONCURRENT_STREAMS => {
                    settings.max_concurrent_streams = Some(value);
                }
                SETTINGS_INITIAL_WINDOW_SIZE => {
                    if i64::from(value) > MAX_WINDOW_SIZE {
                        return Err(H2Error::FlowControl);
                    }
                    settings.initial_window_size = Some(value);
                }
                SETTINGS_FLOW_CONTROL_OPTIONS => {
                    settings.flow_control_options = Some(value);
                }
                // Unknown settings are ignored.
                _ => {}
            }
        }
        Ok(settings)
    }
}

fn encode_setting(buf: &mut Vec<u8>, key: u32, value: u32) {
    buf.extend_from_slice(&key.to_be_bytes());
    buf.extend_from_slice(&value.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let settings = Settings {
            max_concurrent_streams: Some(100),
            initial_window_size: Some(1_048_576),
            flow_control_options: Some(0),
        };
        let encoded = settings.encode_to_vec();
        assert_eq!(encoded.len(), 24);
        assert_eq!(Settings::decode(&encoded).unwrap(), settings);
    }

    #[test]
    fn absent_fields_are_not_encoded() {
        let settings = Settings {
            max_concurrent_streams: Some(8),
            ..Default::default()
        };
        assert_eq!(settings.encode_to_vec().len(), 8);
    }

    #[test]
    fn unknown_key_ignored() {
        let mut buf = Vec::new();
        encode_setting(&mut buf, 0xbeef, 42);
        assert_eq!(Settings::decode(&buf).unwrap(), Settings::default());
    }

    #[test]
    fn ragged_payload_rejected() {
        let settings = Settings {
            initial_window_size: Some(10),
            ..Default::default()
        };
        let encoded = settings.encode_to_vec();
        assert!(matches!(
            Settings::decode(&encoded[..5]),
            Err(H2Error::FrameSize)
        ));
    }

    #[test]
    fn oversized_window_rejected() {
        let mut buf = Vec::new();
        encode_setting(&mut buf, 7, 0x8000_0000);
        assert!(matches!(Settings::decode(&buf), Err(H2Error::FlowControl)));
    }

    #[test]
    fn flow_control_disable_bit() {
        let settings = Settings {
            flow_control_options: Some(1),
            ..Default::default()
        };
        assert!(settings.disables_flow_control());
        assert!(settings.touches_flow_control());
        assert!(!Settings::default().disables_flow_control());
    }
}
