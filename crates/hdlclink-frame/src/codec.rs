use bytes::{BufMut, Bytes, BytesMut};

/// Frame delimiter.
pub const FLAG: u8 = 0x7E;

/// Escape marker; the following byte is XORed with [`ESCAPE_MASK`].
pub const ESCAPE: u8 = 0x7D;

/// Mask applied to escaped bytes.
pub const ESCAPE_MASK: u8 = 0x20;

/// Control byte of an unnumbered information (UI) frame.
pub const UI_FRAME_CONTROL: u8 = 0x03;

/// Unescaped content size of the smallest possible frame:
/// address (1) + control (1) + FCS (4).
pub const MIN_FRAME_SIZE: usize = 6;

/// Trailing frame check sequence size.
pub const FCS_SIZE: usize = 4;

/// Default maximum unescaped frame content size: 8 KiB.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 8 * 1024;

/// Outcome of decoding one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Ok,
    /// The frame check sequence did not match the content.
    FcsMismatch,
    /// The frame was truncated, oversized or had a broken escape sequence.
    FramingError,
}

impl FrameStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameStatus::Ok => "ok",
            FrameStatus::FcsMismatch => "fcs_mismatch",
            FrameStatus::FramingError => "framing_error",
        }
    }
}

/// A decoded HDLC frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The address this frame was sent to.
    pub address: u8,
    /// The control byte.
    pub control: u8,
    /// The frame payload, without address, control and FCS.
    pub payload: Bytes,
    /// Whether the frame decoded cleanly.
    pub status: FrameStatus,
}

impl Frame {
    /// Create a valid UI frame.
    pub fn new(address: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            address,
            control: UI_FRAME_CONTROL,
            payload: payload.into(),
            status: FrameStatus::Ok,
        }
    }

    /// True when the frame decoded without errors.
    pub fn is_valid(&self) -> bool {
        self.status == FrameStatus::Ok
    }

    /// Unescaped content size on the wire (address + control + payload + FCS).
    pub fn content_size(&self) -> usize {
        2 + self.payload.len() + FCS_SIZE
    }
}

/// Encode a UI frame into the wire format.
///
/// Wire format:
/// ```text
/// 0x7E │ address │ control │ payload … │ CRC-32 (LE) │ 0x7E
///      └──────────── escaped ────────────────────────┘
/// ```
pub fn encode_frame(address: u8, payload: &[u8], dst: &mut BytesMut) {
    encode_frame_with_control(address, UI_FRAME_CONTROL, payload, dst);
}

/// Encode a frame with an explicit control byte.
pub fn encode_frame_with_control(address: u8, control: u8, payload: &[u8], dst: &mut BytesMut) {
    let mut crc = crc32fast::Hasher::new();
    crc.update(&[address, control]);
    crc.update(payload);
    let fcs = crc.finalize().to_le_bytes();

    // Worst case every byte is escaped.
    dst.reserve(2 + 2 * (2 + payload.len() + FCS_SIZE));
    dst.put_u8(FLAG);
    escape_into(&[address, control], dst);
    escape_into(payload, dst);
    escape_into(&fcs, dst);
    dst.put_u8(FLAG);
}

/// Append `data` to `dst`, escaping flag and escape bytes.
pub fn escape_into(data: &[u8], dst: &mut BytesMut) {
    for &byte in data {
        if byte == FLAG || byte == ESCAPE {
            dst.put_u8(ESCAPE);
            dst.put_u8(byte ^ ESCAPE_MASK);
        } else {
            dst.put_u8(byte);
        }
    }
}

/// Configuration for the frame codec.
#[derive(Debug, Clone, Copy)]
pub struct FrameConfig {
    /// Maximum unescaped frame content size in bytes. Default: 8 KiB.
    pub max_frame_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}
