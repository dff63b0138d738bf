//! HDLC framing for embedded RPC links.
//!
//! Frames carry a one-byte address, a control byte, a payload and a CRC-32
//! frame check sequence, delimited by `0x7E` flags with byte stuffing. The
//! address multiplexes RPC traffic and device logs over one serial line.
//!
//! Decoding is a pure state machine ([`FrameDecoder`]) that never fails and
//! resynchronizes on the next flag after corruption.

pub mod address;
#[cfg(feature = "async")]
pub mod async_codec;
pub mod codec;
pub mod decoder;
pub mod error;
pub mod reader;
pub mod writer;

pub use address::{address_name, LOG_ADDRESS, RPC_ADDRESS};
#[cfg(feature = "async")]
pub use async_codec::HdlcCodec;
pub use codec::{
    encode_frame, encode_frame_with_control, Frame, FrameConfig, FrameStatus,
    DEFAULT_MAX_FRAME_SIZE, MIN_FRAME_SIZE, UI_FRAME_CONTROL,
};
pub use decoder::FrameDecoder;
pub use error::{FrameError, Result};
pub use reader::FrameReader;
pub use writer::{FrameWriter, LinkWriter};
