use bytes::BytesMut;
use tracing::trace;

use crate::codec::{
    Frame, FrameConfig, FrameStatus, ESCAPE, ESCAPE_MASK, FCS_SIZE, FLAG, MIN_FRAME_SIZE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Outside a frame, discarding bytes until the next flag.
    InterFrame,
    /// Collecting frame content.
    Frame,
    /// The previous byte was an escape marker.
    FrameEscape,
}

/// Streaming HDLC decoder.
///
/// Bytes are fed in arbitrary chunks; state carries over between calls, so a
/// frame split across reads decodes the same as one delivered whole. The
/// decoder never fails: corrupt input yields frames whose
/// [`status`](Frame::status) is not `Ok`, and decoding resynchronizes on the
/// next flag.
#[derive(Debug)]
pub struct FrameDecoder {
    state: State,
    content: BytesMut,
    /// Non-flag bytes seen since the last flag, including overflowed ones.
    raw_len: usize,
    overflow: bool,
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a decoder with default configuration.
    pub fn new() -> Self {
        Self::with_config(FrameConfig::default())
    }

    /// Create a decoder with explicit configuration.
    pub fn with_config(config: FrameConfig) -> Self {
        Self {
            state: State::InterFrame,
            content: BytesMut::with_capacity(config.max_frame_size.min(4096)),
            raw_len: 0,
            overflow: false,
            max_frame_size: config.max_frame_size,
        }
    }

    /// Decode bytes, returning every frame they complete, valid or not.
    pub fn process(&mut self, data: &[u8]) -> Vec<Frame> {
        data.iter()
            .filter_map(|&byte| self.process_byte(byte))
            .collect()
    }

    /// Decode bytes, returning only frames that decoded cleanly.
    pub fn process_valid(&mut self, data: &[u8]) -> Vec<Frame> {
        data.iter()
            .filter_map(|&byte| self.process_byte(byte))
            .filter(|frame| {
                if !frame.is_valid() {
                    trace!(status = frame.status.as_str(), "dropping invalid frame");
                }
                frame.is_valid()
            })
            .collect()
    }

    /// Feed a single byte.
    pub fn process_byte(&mut self, byte: u8) -> Option<Frame> {
        if byte != FLAG {
            self.raw_len += 1;
        }

        match self.state {
            State::InterFrame => {
                if byte == FLAG {
                    let out = (self.raw_len > 0).then(|| self.invalid(FrameStatus::FramingError));
                    self.restart();
                    return out;
                }
                None
            }
            State::Frame => {
                if byte == FLAG {
                    let out = (self.raw_len > 0).then(|| self.finish());
                    self.restart();
                    return out;
                }
                if byte == ESCAPE {
                    self.state = State::FrameEscape;
                } else {
                    self.push(byte);
                }
                None
            }
            State::FrameEscape => {
                if byte == FLAG {
                    let out = self.invalid(FrameStatus::FramingError);
                    self.restart();
                    return Some(out);
                }
                if byte == FLAG ^ ESCAPE_MASK || byte == ESCAPE ^ ESCAPE_MASK {
                    self.state = State::Frame;
                    self.push(byte ^ ESCAPE_MASK);
                } else {
                    // Not a legal escape; abandon the frame until the next flag.
                    self.state = State::InterFrame;
                    self.push(byte);
                }
                None
            }
        }
    }

    /// Discard any partially received frame.
    pub fn reset(&mut self) {
        self.state = State::InterFrame;
        self.content.clear();
        self.raw_len = 0;
        self.overflow = false;
    }

    /// Maximum unescaped frame content size.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn restart(&mut self) {
        self.state = State::Frame;
        self.content.clear();
        self.raw_len = 0;
        self.overflow = false;
    }

    fn push(&mut self, byte: u8) {
        if self.content.len() < self.max_frame_size {
            self.content.extend_from_slice(&[byte]);
        } else {
            self.overflow = true;
        }
    }

    fn finish(&mut self) -> Frame {
        if self.overflow || self.content.len() < MIN_FRAME_SIZE {
            return self.invalid(FrameStatus::FramingError);
        }

        let body_len = self.content.len() - FCS_SIZE;
        let mut fcs = [0u8; FCS_SIZE];
        fcs.copy_from_slice(&self.content[body_len..]);
        if crc32fast::hash(&self.content[..body_len]) != u32::from_le_bytes(fcs) {
            return self.invalid(FrameStatus::FcsMismatch);
        }

        let content = self.content.split().freeze();
        Frame {
            address: content[0],
            control: content[1],
            payload: content.slice(2..body_len),
            status: FrameStatus::Ok,
        }
    }

    fn invalid(&mut self, status: FrameStatus) -> Frame {
        let content = self.content.split().freeze();
        Frame {
            address: content.first().copied().unwrap_or(0),
            control: content.get(1).copied().unwrap_or(0),
            payload: if content.len() > 2 {
                content.slice(2..)
            } else {
                content.slice(0..0)
            },
            status,
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
