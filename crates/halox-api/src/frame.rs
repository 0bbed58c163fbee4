// ── Wire framing ──
//
// Every controller message is preceded by an 8-byte header frame:
// byte 0 is the fixed 0x03 marker, byte 1 the type discriminant, byte 2
// flags (bit 7: the length is an estimate and a definitive header
// follows), bytes 4..8 a little-endian payload length.

use crate::error::ApiError;

/// Fixed first byte of every header frame.
pub const FRAME_START: u8 = 0x03;

/// Length of the wire header.
pub const HEADER_LEN: usize = 8;

const ESTIMATED_FLAG: u8 = 0x80;

/// Frame type discriminant.
///
/// Types 2, 3, 4, and 7 are state broadcasts; 0 and 1 answer requests;
/// 5 announces a controller restart; 6 acknowledges a keep-alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    TextResponse,
    BinaryResponse,
    ValueState,
    TextState,
    DaytimerState,
    OutOfService,
    KeepaliveAck,
    WeatherState,
}

impl FrameKind {
    /// Map the wire discriminant; `None` for types this client does not
    /// know (those payloads are read and dropped).
    pub fn from_discriminant(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::TextResponse),
            1 => Some(Self::BinaryResponse),
            2 => Some(Self::ValueState),
            3 => Some(Self::TextState),
            4 => Some(Self::DaytimerState),
            5 => Some(Self::OutOfService),
            6 => Some(Self::KeepaliveAck),
            7 => Some(Self::WeatherState),
            _ => None,
        }
    }

    /// `true` for the broadcast types routed to the state channel.
    pub fn is_state(self) -> bool {
        matches!(
            self,
            Self::ValueState | Self::TextState | Self::DaytimerState | Self::WeatherState
        )
    }
}

/// A decoded header frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    kind: u8,
    flags: u8,
    payload_len: u32,
}

impl FrameHeader {
    pub fn parse(raw: &[u8]) -> Result<Self, ApiError> {
        if raw.len() < HEADER_LEN {
            return Err(ApiError::ShortHeader { len: raw.len() });
        }
        if raw[0] != FRAME_START {
            return Err(ApiError::BadHeader { first: raw[0] });
        }
        let mut len = [0u8; 4];
        len.copy_from_slice(&raw[4..8]);
        Ok(Self {
            kind: raw[1],
            flags: raw[2],
            payload_len: u32::from_le_bytes(len),
        })
    }

    pub fn kind(&self) -> Option<FrameKind> {
        FrameKind::from_discriminant(self.kind)
    }

    /// Raw discriminant, for logging unknown types.
    pub fn raw_kind(&self) -> u8 {
        self.kind
    }

    /// The length is an estimate; discard this header and await the
    /// definitive one.
    pub fn is_estimated(&self) -> bool {
        self.flags & ESTIMATED_FLAG != 0
    }

    pub fn payload_len(&self) -> u32 {
        self.payload_len
    }
}
