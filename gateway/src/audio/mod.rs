//! Audio codec adapter
//!
//! Translates between the wire representations (base64-encoded PCM16, mono,
//! 16 kHz or 24 kHz depending on the session) and the internal [`AudioFrame`]
//! type. No resampling happens on the fast path: a session is created pinned
//! to one sample rate and frames that disagree are rejected outright.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Duration of one internal audio frame in milliseconds.
pub const FRAME_MS: u64 = 20;

/// Bytes per PCM16 mono sample.
const BYTES_PER_SAMPLE: usize = 2;

/// Errors produced while decoding or framing wire audio.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid base64 audio payload: {0}")]
    InvalidBase64(String),

    #[error("sample rate {got} Hz does not match session rate {expected} Hz")]
    SampleRateMismatch { got: u32, expected: u32 },

    #[error("PCM payload of {0} bytes is not sample-aligned")]
    Misaligned(usize),
}

/// One immutable chunk of mono PCM16 audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub pcm: Bytes,
    pub sample_rate: u32,
    pub timestamp_us: u64,
    pub channel_count: u16,
    pub is_final: bool,
}

impl AudioFrame {
    pub fn new(pcm: Bytes, sample_rate: u32, timestamp_us: u64) -> Self {
        Self {
            pcm,
            sample_rate,
            timestamp_us,
            channel_count: 1,
            is_final: false,
        }
    }

    /// Number of PCM samples held by this frame.
    pub fn sample_count(&self) -> usize {
        self.pcm.len() / BYTES_PER_SAMPLE
    }

    /// Playback duration of this frame in microseconds.
    pub fn duration_us(&self) -> u64 {
        (self.sample_count() as u64 * 1_000_000) / self.sample_rate as u64
    }
}

/// Samples contained in one 20 ms frame at the given rate.
pub fn samples_per_frame(sample_rate: u32) -> usize {
    (sample_rate as u64 * FRAME_MS / 1000) as usize
}

/// Bytes contained in one 20 ms PCM16 frame at the given rate.
pub fn bytes_per_frame(sample_rate: u32) -> usize {
    samples_per_frame(sample_rate) * BYTES_PER_SAMPLE
}

/// Decode one base64 PCM payload from the wire into an [`AudioFrame`].
///
/// `declared_rate` is the rate the wire message claims (browser messages
/// carry an `sr` field; telephony sessions declare it at setup). The decode
/// rejects anything that disagrees with the session's pinned rate.
pub fn decode_frame(
    data: &str,
    declared_rate: u32,
    session_rate: u32,
    timestamp_us: u64,
) -> Result<AudioFrame, CodecError> {
    if declared_rate != session_rate {
        return Err(CodecError::SampleRateMismatch {
            got: declared_rate,
            expected: session_rate,
        });
    }

    let pcm = BASE64
        .decode(data)
        .map_err(|e| CodecError::InvalidBase64(e.to_string()))?;

    if pcm.len() % BYTES_PER_SAMPLE != 0 {
        return Err(CodecError::Misaligned(pcm.len()));
    }

    Ok(AudioFrame::new(Bytes::from(pcm), session_rate, timestamp_us))
}

/// Encode a frame back to the wire's base64 representation.
pub fn encode_frame(frame: &AudioFrame) -> String {
    BASE64.encode(&frame.pcm)
}

/// Groups arbitrary upstream PCM chunks into fixed 20 ms frames.
///
/// Synthesis providers emit chunks of whatever size their codec produced;
/// the transports only ever see uniform 20 ms frames. The chunker owns the
/// running timestamp so emitted frames stay contiguous.
pub struct FrameChunker {
    sample_rate: u32,
    frame_bytes: usize,
    buffer: BytesMut,
    next_timestamp_us: u64,
}

impl FrameChunker {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            frame_bytes: bytes_per_frame(sample_rate),
            buffer: BytesMut::new(),
            next_timestamp_us: 0,
        }
    }

    /// Append upstream PCM and drain every complete 20 ms frame.
    pub fn push(&mut self, pcm: &[u8]) -> Vec<AudioFrame> {
        self.buffer.extend_from_slice(pcm);

        let mut frames = Vec::new();
        while self.buffer.len() >= self.frame_bytes {
            let chunk = self.buffer.split_to(self.frame_bytes).freeze();
            frames.push(AudioFrame::new(
                chunk,
                self.sample_rate,
                self.next_timestamp_us,
            ));
            self.next_timestamp_us += FRAME_MS * 1000;
        }
        frames
    }

    /// Flush the remainder (shorter than one frame) as a final frame.
    pub fn flush(&mut self) -> Option<AudioFrame> {
        if self.buffer.is_empty() {
            return None;
        }
        let chunk = self.buffer.split().freeze();
        let mut frame = AudioFrame::new(chunk, self.sample_rate, self.next_timestamp_us);
        self.next_timestamp_us += frame.duration_us();
        frame.is_final = true;
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm_of(samples: usize) -> Vec<u8> {
        (0..samples * BYTES_PER_SAMPLE).map(|i| i as u8).collect()
    }

    #[test]
    fn test_samples_per_frame() {
        assert_eq!(samples_per_frame(16_000), 320);
        assert_eq!(samples_per_frame(24_000), 480);
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let pcm = pcm_of(320);
        let frame = AudioFrame::new(Bytes::from(pcm.clone()), 16_000, 40_000);

        let encoded = encode_frame(&frame);
        let decoded = decode_frame(&encoded, 16_000, 16_000, 40_000).unwrap();

        assert_eq!(decoded.pcm, frame.pcm);
        assert_eq!(decoded.sample_rate, 16_000);
        assert_eq!(decoded.timestamp_us, 40_000);
    }

    #[test]
    fn test_decode_rejects_rate_mismatch() {
        let encoded = BASE64.encode(pcm_of(480));
        let err = decode_frame(&encoded, 24_000, 16_000, 0).unwrap_err();
        match err {
            CodecError::SampleRateMismatch { got, expected } => {
                assert_eq!(got, 24_000);
                assert_eq!(expected, 16_000);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_decode_rejects_bad_base64() {
        let err = decode_frame("not-base64!!!", 16_000, 16_000, 0).unwrap_err();
        assert!(matches!(err, CodecError::InvalidBase64(_)));
    }

    #[test]
    fn test_decode_rejects_odd_length() {
        let encoded = BASE64.encode([0u8; 321]);
        let err = decode_frame(&encoded, 16_000, 16_000, 0).unwrap_err();
        assert!(matches!(err, CodecError::Misaligned(321)));
    }

    #[test]
    fn test_chunker_regroups_to_20ms() {
        let mut chunker = FrameChunker::new(16_000);
        let frame_bytes = bytes_per_frame(16_000);

        // One oversized chunk: 2.5 frames worth of PCM.
        let frames = chunker.push(&pcm_of(800));
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.pcm.len() == frame_bytes));
        assert_eq!(frames[0].timestamp_us, 0);
        assert_eq!(frames[1].timestamp_us, 20_000);

        // The half-frame remainder flushes as final.
        let tail = chunker.flush().unwrap();
        assert!(tail.is_final);
        assert_eq!(tail.sample_count(), 160);
        assert_eq!(tail.timestamp_us, 40_000);
    }

    #[test]
    fn test_chunker_accumulates_small_chunks() {
        let mut chunker = FrameChunker::new(16_000);

        // Dribble in 100 samples at a time; nothing emits until 320 accumulate.
        assert!(chunker.push(&pcm_of(100)).is_empty());
        assert!(chunker.push(&pcm_of(100)).is_empty());
        let frames = chunker.push(&pcm_of(150));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].sample_count(), 320);
    }

    #[test]
    fn test_chunker_flush_empty() {
        let mut chunker = FrameChunker::new(16_000);
        assert!(chunker.flush().is_none());
    }
}
