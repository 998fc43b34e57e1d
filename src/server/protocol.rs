//! Wire protocol between the stackchan firmware and the server.
//!
//! Every WebSocket binary message carries a 7-byte little-endian header
//! followed by exactly `payload_bytes` of payload:
//!
//! ```text
//! ┌─────────┬───────────┬───────────┬────────────┬────────────────┬────────────┐
//! │ Byte 0  │ Byte 1    │ Byte 2    │ Byte 3-4   │ Byte 5-6       │ Byte 7..N  │
//! │ kind    │ msg_type  │ reserved  │ seq        │ payload_bytes  │ payload    │
//! │ (uint8) │ (uint8)   │ (uint8)   │ (u16 LE)   │ (u16 LE)       │            │
//! └─────────┴───────────┴───────────┴────────────┴────────────────┴────────────┘
//! ```
//!
//! Uplink audio is fixed at 16 kHz mono 16-bit signed LE PCM. Downlink audio
//! parameters travel in each WAV/START payload as `<u32 sample_rate, u16 channels>`.

/// Size of the frame header in bytes.
pub const HEADER_SIZE: usize = 7;

/// WebSocket close code used for every protocol violation.
pub const CLOSE_PROTOCOL_ERROR: u16 = 1003;

/// Uplink capture sample rate in Hz.
pub const SAMPLE_RATE_HZ: u32 = 16000;
/// Uplink capture channel count.
pub const CHANNELS: u16 = 1;
/// Uplink capture sample width in bytes (16-bit PCM).
pub const SAMPLE_WIDTH: u16 = 2;

/// Frame kinds. PCM, WAKEWORD_EVT, STATE_EVT and SPEAK_DONE_EVT travel
/// firmware → server; WAV and STATE_CMD travel server → firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Pcm = 1,
    Wav = 2,
    StateCmd = 3,
    WakewordEvt = 4,
    StateEvt = 5,
    SpeakDoneEvt = 6,
}

impl FrameKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Pcm),
            2 => Some(Self::Wav),
            3 => Some(Self::StateCmd),
            4 => Some(Self::WakewordEvt),
            5 => Some(Self::StateEvt),
            6 => Some(Self::SpeakDoneEvt),
            _ => None,
        }
    }
}

/// Message types within a kind. Audio streams are START/DATA.../END;
/// events and commands use DATA only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Start = 1,
    Data = 2,
    End = 3,
}

impl MsgType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Start),
            2 => Some(Self::Data),
            3 => Some(Self::End),
            _ => None,
        }
    }
}

/// Visible firmware states, carried as a single-byte STATE_CMD payload.
/// The firmware is the source of truth for what it is actually doing;
/// the server only issues commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FirmwareState {
    Idle = 0,
    Listening = 1,
    Thinking = 2,
}

/// Protocol violations. Each maps 1:1 onto the close reason sent with
/// close code 1003; the session is torn down immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolViolation {
    HeaderTooShort,
    PayloadLengthMismatch,
    DataBeforeStart,
    EndBeforeStart,
    InvalidChunkLength,
    InvalidTailLength,
    InvalidAccumulatedPcm,
    UnknownPcmMsgType,
    UnsupportedKind,
}

impl ProtocolViolation {
    /// The ASCII reason sent with close code 1003.
    pub fn close_reason(self) -> &'static str {
        match self {
            Self::HeaderTooShort => "header too short",
            Self::PayloadLengthMismatch => "payload length mismatch",
            Self::DataBeforeStart => "data received before start",
            Self::EndBeforeStart => "end received before start",
            Self::InvalidChunkLength => "invalid pcm chunk length",
            Self::InvalidTailLength => "invalid pcm tail length",
            Self::InvalidAccumulatedPcm => "invalid accumulated pcm length",
            Self::UnknownPcmMsgType => "unknown PCM msg type",
            Self::UnsupportedKind => "unsupported kind",
        }
    }
}

impl std::fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.close_reason())
    }
}

impl std::error::Error for ProtocolViolation {}

/// A decoded frame. `kind` and `msg_type` stay raw so dispatch can
/// distinguish an unknown kind (close 1003) from a malformed buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: u8,
    pub msg_type: u8,
    pub seq: u16,
    pub payload: Vec<u8>,
}

/// Encode a frame for transmission. The reserved byte is always zero.
pub fn encode(kind: FrameKind, msg_type: MsgType, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.push(kind as u8);
    buf.push(msg_type as u8);
    buf.push(0);
    buf.extend_from_slice(&seq.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Decode a received binary message into a frame.
///
/// Fails when the buffer is shorter than the header or when the declared
/// `payload_bytes` disagrees with the remaining byte count. Sequence numbers
/// are not validated for gaps; they are advisory for firmware diagnostics.
pub fn decode(buf: &[u8]) -> Result<Frame, ProtocolViolation> {
    if buf.len() < HEADER_SIZE {
        return Err(ProtocolViolation::HeaderTooShort);
    }

    let kind = buf[0];
    let msg_type = buf[1];
    let seq = u16::from_le_bytes([buf[3], buf[4]]);
    let payload_bytes = u16::from_le_bytes([buf[5], buf[6]]) as usize;

    let payload = &buf[HEADER_SIZE..];
    if payload_bytes != payload.len() {
        return Err(ProtocolViolation::PayloadLengthMismatch);
    }

    Ok(Frame {
        kind,
        msg_type,
        seq,
        payload: payload.to_vec(),
    })
}

/// Build the 6-byte WAV/START payload `<u32 sample_rate, u16 channels>`.
pub fn wav_start_payload(sample_rate: u32, channels: u16) -> Vec<u8> {
    let mut payload = Vec::with_capacity(6);
    payload.extend_from_slice(&sample_rate.to_le_bytes());
    payload.extend_from_slice(&channels.to_le_bytes());
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_round_trip() {
        let payload = vec![1u8, 2, 3, 4];
        let bytes = encode(FrameKind::Pcm, MsgType::Data, 42, &payload);
        assert_eq!(bytes.len(), HEADER_SIZE + payload.len());

        let frame = decode(&bytes).unwrap();
        assert_eq!(frame.kind, FrameKind::Pcm as u8);
        assert_eq!(frame.msg_type, MsgType::Data as u8);
        assert_eq!(frame.seq, 42);
        assert_eq!(frame.payload, payload);

        let re_encoded = encode(
            FrameKind::from_u8(frame.kind).unwrap(),
            MsgType::from_u8(frame.msg_type).unwrap(),
            frame.seq,
            &frame.payload,
        );
        assert_eq!(re_encoded, bytes);
    }

    #[test]
    fn test_encode_empty_payload() {
        let bytes = encode(FrameKind::Wav, MsgType::End, 7, &[]);
        assert_eq!(bytes.len(), HEADER_SIZE);
        let frame = decode(&bytes).unwrap();
        assert!(frame.payload.is_empty());
        assert_eq!(frame.seq, 7);
    }

    #[test]
    fn test_decode_header_too_short() {
        assert_eq!(decode(&[1, 2, 0]), Err(ProtocolViolation::HeaderTooShort));
        assert_eq!(decode(&[]), Err(ProtocolViolation::HeaderTooShort));
    }

    #[test]
    fn test_decode_payload_length_mismatch() {
        // Header declares 4 payload bytes but only 2 follow
        let mut bytes = encode(FrameKind::Pcm, MsgType::Data, 0, &[9, 9, 9, 9]);
        bytes.truncate(HEADER_SIZE + 2);
        assert_eq!(decode(&bytes), Err(ProtocolViolation::PayloadLengthMismatch));

        // Trailing garbage beyond the declared length
        let mut bytes = encode(FrameKind::Pcm, MsgType::Data, 0, &[9, 9]);
        bytes.push(0);
        assert_eq!(decode(&bytes), Err(ProtocolViolation::PayloadLengthMismatch));
    }

    #[test]
    fn test_seq_little_endian() {
        let bytes = encode(FrameKind::StateCmd, MsgType::Data, 0x0102, &[0]);
        assert_eq!(bytes[3], 0x02);
        assert_eq!(bytes[4], 0x01);
    }

    #[test]
    fn test_unknown_kind_decodes_raw() {
        let mut bytes = encode(FrameKind::Pcm, MsgType::Data, 0, &[1]);
        bytes[0] = 99;
        let frame = decode(&bytes).unwrap();
        assert_eq!(frame.kind, 99);
        assert!(FrameKind::from_u8(frame.kind).is_none());
    }

    #[test]
    fn test_wav_start_payload_layout() {
        let payload = wav_start_payload(24000, 2);
        assert_eq!(payload.len(), 6);
        assert_eq!(u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]), 24000);
        assert_eq!(u16::from_le_bytes([payload[4], payload[5]]), 2);
    }

    #[test]
    fn test_close_reasons() {
        assert_eq!(ProtocolViolation::DataBeforeStart.to_string(), "data received before start");
        assert_eq!(ProtocolViolation::EndBeforeStart.to_string(), "end received before start");
        assert_eq!(ProtocolViolation::UnsupportedKind.to_string(), "unsupported kind");
        assert_eq!(ProtocolViolation::HeaderTooShort.to_string(), "header too short");
    }
}
