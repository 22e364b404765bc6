//! Fixed-header frame codec for the control link.
//!
//! ## Layout
//!
//! ```text
//! offset 0..3      sync marker  A5 5A 4D 42
//! offset 4         event code
//! offset 5         payload length L
//! offset 6..7      check bits + reserved (written as zero, not verified)
//! offset 8..8+L-1  payload
//! ```
//!
//! The codec is transport-agnostic: it only looks at byte slices. Stream
//! reassembly and resynchronisation live in [`super::FrameAssembler`].

use super::FrameError;

/// Frame sync marker expected at the start of every frame.
pub const SYNC_MARKER: [u8; 4] = [0xA5, 0x5A, 0x4D, 0x42];

/// Bytes before the payload.
pub const HEADER_SIZE: usize = 8;

/// Largest frame (header + payload) the device firmware accepts.
pub const DEFAULT_MAX_FRAME_LEN: usize = 256;

const CODE_OFFSET: usize = 4;
const LEN_OFFSET: usize = 5;

/// Codec limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameConfig {
    pub max_frame_len: usize,
}

impl FrameConfig {
    /// Largest payload that still fits the frame limit and the 1-byte length field.
    pub fn max_payload(&self) -> usize {
        self.max_frame_len
            .saturating_sub(HEADER_SIZE)
            .min(u8::MAX as usize)
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub code: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(code: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            code,
            payload: payload.into(),
        }
    }
}

/// Result of looking at the start of a byte window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A full frame starts at offset 0 and spans `consumed` bytes.
    Frame { frame: Frame, consumed: usize },
    /// The window holds a plausible prefix; wait for more bytes.
    NeedMore,
    /// Offset 0 cannot start a frame; drop one byte and retry.
    Invalid,
}

/// Encode `payload` under `code`.
///
/// # Errors
/// `FrameError::PayloadTooLarge` when the frame would exceed the configured limit.
pub fn encode(config: &FrameConfig, code: u8, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let max = config.max_payload();
    if payload.len() > max {
        return Err(FrameError::PayloadTooLarge {
            len: payload.len(),
            max,
        });
    }

    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&SYNC_MARKER);
    out.push(code);
    out.push(payload.len() as u8);
    out.extend_from_slice(&[0, 0]);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Try to interpret the start of `window` as one frame.
pub fn try_decode(config: &FrameConfig, window: &[u8]) -> Decoded {
    if window.len() >= SYNC_MARKER.len() && window[..SYNC_MARKER.len()] != SYNC_MARKER {
        return Decoded::Invalid;
    }
    if window.len() < HEADER_SIZE {
        return Decoded::NeedMore;
    }

    let declared = window[LEN_OFFSET] as usize;
    let total = HEADER_SIZE + declared;
    if total > config.max_frame_len {
        return Decoded::Invalid;
    }

    let Some(payload) = window.get(HEADER_SIZE..total) else {
        return Decoded::NeedMore;
    };

    Decoded::Frame {
        frame: Frame::new(window[CODE_OFFSET], payload),
        consumed: total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> FrameConfig {
        FrameConfig::default()
    }

    #[test]
    fn encode_writes_header_fields() {
        let bytes = encode(&cfg(), 0x04, &[0x5A, 0x00]).unwrap();
        assert_eq!(bytes, vec![0xA5, 0x5A, 0x4D, 0x42, 0x04, 2, 0, 0, 0x5A, 0x00]);
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let small = FrameConfig { max_frame_len: 16 };
        assert_eq!(small.max_payload(), 8);
        assert!(encode(&small, 1, &[0; 8]).is_ok());
        let err = encode(&small, 1, &[0; 9]).unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { len: 9, max: 8 }));
    }

    #[test]
    fn payload_limit_respects_length_field() {
        let big = FrameConfig { max_frame_len: 4096 };
        assert_eq!(big.max_payload(), 255);
    }

    #[test]
    fn decode_round_trips_every_payload_length() {
        let config = cfg();
        for len in 0..=config.max_payload() {
            let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let bytes = encode(&config, 0x83, &payload).unwrap();
            match try_decode(&config, &bytes) {
                Decoded::Frame { frame, consumed } => {
                    assert_eq!(consumed, bytes.len());
                    assert_eq!(frame.code, 0x83);
                    assert_eq!(frame.payload, payload);
                }
                other => panic!("len {len}: unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn short_windows_need_more() {
        let bytes = encode(&cfg(), 0x82, b"hi\0").unwrap();
        for cut in 0..bytes.len() {
            assert_eq!(try_decode(&cfg(), &bytes[..cut]), Decoded::NeedMore, "cut={cut}");
        }
    }

    #[test]
    fn wrong_marker_is_invalid() {
        let mut bytes = encode(&cfg(), 0x81, &[]).unwrap();
        bytes[2] ^= 0xFF;
        assert_eq!(try_decode(&cfg(), &bytes), Decoded::Invalid);
    }

    #[test]
    fn oversized_declared_length_is_invalid() {
        let config = FrameConfig { max_frame_len: 32 };
        let mut bytes = SYNC_MARKER.to_vec();
        bytes.extend_from_slice(&[0x81, 200, 0, 0]);
        assert_eq!(try_decode(&config, &bytes), Decoded::Invalid);
    }

    #[test]
    fn trailing_bytes_are_not_consumed() {
        let mut bytes = encode(&cfg(), 0x83, &[1, 0]).unwrap();
        bytes.extend_from_slice(&[0xEE, 0xEE]);
        let Decoded::Frame { consumed, .. } = try_decode(&cfg(), &bytes) else {
            panic!("expected frame");
        };
        assert_eq!(consumed, 10);
    }
}
