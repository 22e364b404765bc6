//! Control-link wire protocol.
//!
//! `codec` turns single frames into bytes and back; `message` gives the frames
//! typed meaning; [`FrameAssembler`] reassembles frames from an unreliable
//! byte stream, resynchronising on the sync marker one byte at a time.

pub mod codec;
pub mod message;

pub use codec::{Decoded, Frame, FrameConfig, HEADER_SIZE, SYNC_MARKER};
pub use message::{DeviceEvent, HostCommand};

use thiserror::Error;

/// Errors raised while building or interpreting frames.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("payload of {len} bytes exceeds the {max}-byte limit")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("event 0x{code:02X} payload has {len} bytes, needs {needed}")]
    ShortPayload { code: u8, len: usize, needed: usize },

    #[error("indicator channel {0} does not fit the 16-bit mask")]
    IndicatorOutOfRange(u8),
}

/// Counters describing what the assembler has seen so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblerStats {
    pub frames: u64,
    pub discarded_bytes: u64,
}

/// Retains the unconsumed tail of a byte stream and carves frames out of it.
///
/// The retained tail never exceeds one maximum-size frame: anything longer
/// would already have been decoded or discarded.
#[derive(Debug)]
pub struct FrameAssembler {
    config: FrameConfig,
    pending: Vec<u8>,
    stats: AssemblerStats,
}

impl FrameAssembler {
    pub fn new(config: FrameConfig) -> Self {
        Self {
            config,
            pending: Vec::with_capacity(config.max_frame_len * 2),
            stats: AssemblerStats::default(),
        }
    }

    /// Append freshly read bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Decode every complete frame currently buffered, in order.
    ///
    /// On a sync mismatch or impossible length, exactly one byte is dropped
    /// and scanning restarts at the new offset 0. Stops at the first
    /// incomplete frame, keeping it for the next call.
    pub fn drain(&mut self, mut on_frame: impl FnMut(Frame)) -> usize {
        let mut offset = 0;
        let mut decoded = 0;

        while self.pending.len() - offset >= HEADER_SIZE {
            match codec::try_decode(&self.config, &self.pending[offset..]) {
                Decoded::Invalid => {
                    offset += 1;
                    self.stats.discarded_bytes += 1;
                }
                Decoded::NeedMore => break,
                Decoded::Frame { frame, consumed } => {
                    offset += consumed;
                    decoded += 1;
                    self.stats.frames += 1;
                    on_frame(frame);
                }
            }
        }

        self.pending.drain(..offset);
        decoded
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> AssemblerStats {
        self.stats
    }

    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_bytes(code: u8, payload: &[u8]) -> Vec<u8> {
        codec::encode(&FrameConfig::default(), code, payload).unwrap()
    }

    fn collect(asm: &mut FrameAssembler) -> Vec<Frame> {
        let mut out = Vec::new();
        asm.drain(|f| out.push(f));
        out
    }

    #[test]
    fn frame_after_garbage_decodes_byte_by_byte() {
        for garbage_len in [0usize, 1, 3, 7, 31, 200] {
            let mut asm = FrameAssembler::new(FrameConfig::default());
            let mut stream: Vec<u8> = (0..garbage_len).map(|i| (i * 37 + 11) as u8).collect();
            stream.extend(frame_bytes(0x83, &[0x2D, 0x00]));

            let mut frames = Vec::new();
            for b in stream {
                asm.push(&[b]);
                asm.drain(|f| frames.push(f));
            }
            assert_eq!(frames, vec![Frame::new(0x83, vec![0x2D, 0x00])], "garbage={garbage_len}");
            assert_eq!(asm.pending_len(), 0);
        }
    }

    #[test]
    fn corrupted_marker_costs_at_most_one_header() {
        for corrupt_at in 0..SYNC_MARKER.len() {
            let mut stream = frame_bytes(0x83, &[1, 0]);
            stream[corrupt_at] ^= 0x5A;
            let good = frame_bytes(0x85, &[90, 0, 1, 0]);
            stream.extend_from_slice(&good);

            let mut asm = FrameAssembler::new(FrameConfig::default());
            asm.push(&stream);
            let frames = collect(&mut asm);
            assert_eq!(frames, vec![Frame::new(0x85, vec![90, 0, 1, 0])]);
            assert!(asm.stats().discarded_bytes as usize <= HEADER_SIZE + 2);
            assert!(asm.stats().discarded_bytes >= 1);
        }
    }

    #[test]
    fn multiple_frames_in_one_read_all_dispatch() {
        let mut stream = frame_bytes(0x81, &[]);
        stream.extend(frame_bytes(0x82, b"ok\0"));
        stream.extend(frame_bytes(0x83, &[10, 0]));
        let mut asm = FrameAssembler::new(FrameConfig::default());
        asm.push(&stream);
        let codes: Vec<u8> = collect(&mut asm).iter().map(|f| f.code).collect();
        assert_eq!(codes, vec![0x81, 0x82, 0x83]);
    }

    #[test]
    fn split_frame_is_retained_across_reads() {
        let bytes = frame_bytes(0x84, &[0, 0, 60, 0, 120, 0]);
        let mut asm = FrameAssembler::new(FrameConfig::default());
        asm.push(&bytes[..5]);
        assert!(collect(&mut asm).is_empty());
        asm.push(&bytes[5..11]);
        assert!(collect(&mut asm).is_empty());
        assert_eq!(asm.pending_len(), 11);
        asm.push(&bytes[11..]);
        assert_eq!(collect(&mut asm).len(), 1);
    }

    #[test]
    fn oversized_length_discards_one_byte_and_resyncs() {
        let config = FrameConfig { max_frame_len: 32 };
        let mut stream = SYNC_MARKER.to_vec();
        stream.extend_from_slice(&[0x81, 250, 0, 0]);
        stream.extend(codec::encode(&config, 0x81, &[]).unwrap());

        let mut asm = FrameAssembler::new(config);
        asm.push(&stream);
        assert_eq!(collect(&mut asm), vec![Frame::new(0x81, vec![])]);
        assert_eq!(asm.stats().discarded_bytes, 8);
    }

    #[test]
    fn retained_tail_stays_bounded_under_noise() {
        let config = FrameConfig::default();
        let mut asm = FrameAssembler::new(config);
        for round in 0..50u32 {
            let noise: Vec<u8> = (0..97u32).map(|i| (i.wrapping_mul(round + 3)) as u8).collect();
            asm.push(&noise);
            asm.drain(|_| {});
            assert!(asm.pending_len() < config.max_frame_len);
        }
    }
}
