//! Binary audio frame codec.
//!
//! Layout (network byte order, 18-byte header):
//!
//! ```text
//! session_id:u32 | monotonic_ts_ns:u64 | seq:u16 | codec:u8 | flags:u8 | payload_len:u16 | payload
//! ```
//!
//! `payload_len` must equal the number of bytes that follow the header.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 18;

/// Structural frame decoding failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame truncated: {len} bytes is shorter than the {HEADER_LEN}-byte header")]
    Truncated { len: usize },

    #[error("payload length mismatch: header declares {declared} bytes, {actual} present")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("unknown codec tag {0}")]
    UnknownCodec(u8),

    #[error("reserved flag bits set: {0:#04x}")]
    ReservedFlags(u8),

    #[error("payload of {0} bytes exceeds the frame limit")]
    PayloadTooLarge(usize),
}

/// Audio codec carried in a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    Pcm16,
    Opus,
}

impl Codec {
    pub fn tag(self) -> u8 {
        match self {
            Self::Pcm16 => 0,
            Self::Opus => 1,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, FrameError> {
        match tag {
            0 => Ok(Self::Pcm16),
            1 => Ok(Self::Opus),
            other => Err(FrameError::UnknownCodec(other)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pcm16 => "pcm16",
            Self::Opus => "opus",
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frame flag bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Discontinuous transmission (silence) frame.
    pub const DTX: u8 = 0b0000_0001;
    /// Voice activity detected in this frame.
    pub const SPEECH: u8 = 0b0000_0010;

    const KNOWN: u8 = Self::DTX | Self::SPEECH;

    pub fn from_bits(bits: u8) -> Result<Self, FrameError> {
        if bits & !Self::KNOWN != 0 {
            return Err(FrameError::ReservedFlags(bits));
        }
        Ok(Self(bits))
    }

    pub fn new(dtx: bool, speech: bool) -> Self {
        let mut bits = 0;
        if dtx {
            bits |= Self::DTX;
        }
        if speech {
            bits |= Self::SPEECH;
        }
        Self(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_dtx(self) -> bool {
        self.0 & Self::DTX != 0
    }

    pub fn is_speech(self) -> bool {
        self.0 & Self::SPEECH != 0
    }
}

/// A single audio frame. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    session_id: u32,
    timestamp_ns: u64,
    seq: u16,
    codec: Codec,
    flags: FrameFlags,
    payload: Bytes,
}

impl AudioFrame {
    pub fn new(
        session_id: u32,
        timestamp_ns: u64,
        seq: u16,
        codec: Codec,
        flags: FrameFlags,
        payload: Bytes,
    ) -> Result<Self, FrameError> {
        if payload.len() > u16::MAX as usize {
            return Err(FrameError::PayloadTooLarge(payload.len()));
        }
        Ok(Self {
            session_id,
            timestamp_ns,
            seq,
            codec,
            flags,
            payload,
        })
    }

    /// Parse a frame from raw transport bytes.
    pub fn decode(mut data: Bytes) -> Result<Self, FrameError> {
        if data.len() < HEADER_LEN {
            return Err(FrameError::Truncated { len: data.len() });
        }

        let session_id = data.get_u32();
        let timestamp_ns = data.get_u64();
        let seq = data.get_u16();
        let codec = Codec::from_tag(data.get_u8())?;
        let flags = FrameFlags::from_bits(data.get_u8())?;
        let declared = data.get_u16() as usize;

        if declared != data.len() {
            return Err(FrameError::LengthMismatch {
                declared,
                actual: data.len(),
            });
        }

        Ok(Self {
            session_id,
            timestamp_ns,
            seq,
            codec,
            flags,
            payload: data,
        })
    }

    /// Serialize the frame to its wire representation.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u32(self.session_id);
        buf.put_u64(self.timestamp_ns);
        buf.put_u16(self.seq);
        buf.put_u8(self.codec.tag());
        buf.put_u8(self.flags.bits());
        // Checked at construction.
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn timestamp_ns(&self) -> u64 {
        self.timestamp_ns
    }

    pub fn seq(&self) -> u16 {
        self.seq
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn flags(&self) -> FrameFlags {
        self.flags
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn is_dtx(&self) -> bool {
        self.flags.is_dtx()
    }

    pub fn is_speech(&self) -> bool {
        self.flags.is_speech()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> AudioFrame {
        AudioFrame::new(
            0xDEAD_BEEF,
            1_234_567_890,
            65535,
            Codec::Opus,
            FrameFlags::new(false, true),
            Bytes::from_static(&[1, 2, 3, 4, 5]),
        )
        .unwrap()
    }

    #[test]
    fn test_header_layout_is_bit_exact() {
        let wire = sample_frame().encode();
        assert_eq!(wire.len(), HEADER_LEN + 5);
        assert_eq!(&wire[0..4], &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(&wire[4..12], &1_234_567_890u64.to_be_bytes());
        assert_eq!(&wire[12..14], &[0xFF, 0xFF]);
        assert_eq!(wire[14], 1); // opus
        assert_eq!(wire[15], 0b10); // speech
        assert_eq!(&wire[16..18], &[0, 5]);
        assert_eq!(&wire[18..], &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_decode_encoded_frame() {
        let frame = sample_frame();
        let decoded = AudioFrame::decode(frame.encode()).unwrap();
        assert_eq!(decoded, frame);
        assert!(decoded.is_speech());
        assert!(!decoded.is_dtx());
    }

    #[test]
    fn test_rejects_truncated_header() {
        let err = AudioFrame::decode(Bytes::from_static(&[0u8; 10])).unwrap_err();
        assert_eq!(err, FrameError::Truncated { len: 10 });
    }

    #[test]
    fn test_rejects_length_mismatch() {
        let mut wire = BytesMut::from(&sample_frame().encode()[..]);
        wire.truncate(HEADER_LEN + 3);
        let err = AudioFrame::decode(wire.freeze()).unwrap_err();
        assert_eq!(
            err,
            FrameError::LengthMismatch {
                declared: 5,
                actual: 3
            }
        );

        let mut wire = BytesMut::from(&sample_frame().encode()[..]);
        wire.put_u8(9);
        assert!(matches!(
            AudioFrame::decode(wire.freeze()),
            Err(FrameError::LengthMismatch { declared: 5, actual: 6 })
        ));
    }

    #[test]
    fn test_rejects_unknown_codec_and_reserved_flags() {
        let mut wire = BytesMut::from(&sample_frame().encode()[..]);
        wire[14] = 7;
        assert_eq!(
            AudioFrame::decode(wire.freeze()).unwrap_err(),
            FrameError::UnknownCodec(7)
        );

        let mut wire = BytesMut::from(&sample_frame().encode()[..]);
        wire[15] = 0b1000_0010;
        assert_eq!(
            AudioFrame::decode(wire.freeze()).unwrap_err(),
            FrameError::ReservedFlags(0b1000_0010)
        );
    }

    #[test]
    fn test_empty_payload_is_valid() {
        let frame = AudioFrame::new(1, 0, 0, Codec::Pcm16, FrameFlags::new(true, false), Bytes::new())
            .unwrap();
        let decoded = AudioFrame::decode(frame.encode()).unwrap();
        assert!(decoded.payload().is_empty());
        assert!(decoded.is_dtx());
    }

    #[test]
    fn test_payload_too_large() {
        let payload = Bytes::from(vec![0u8; u16::MAX as usize + 1]);
        let err = AudioFrame::new(1, 0, 0, Codec::Pcm16, FrameFlags::default(), payload)
            .unwrap_err();
        assert_eq!(err, FrameError::PayloadTooLarge(65536));
    }
}
