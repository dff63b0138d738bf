//! Tokio codec for HDLC frames.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{encode_frame, Frame, FrameConfig, FCS_SIZE};
use crate::decoder::FrameDecoder;
use crate::error::FrameError;

/// Adapts [`FrameDecoder`] to `tokio_util::codec`.
///
/// Yields only valid frames; corrupt input is skipped the same way the
/// blocking reader skips it.
#[derive(Debug)]
pub struct HdlcCodec {
    decoder: FrameDecoder,
    max_frame_size: usize,
}

impl HdlcCodec {
    pub fn new() -> Self {
        Self::with_config(FrameConfig::default())
    }

    pub fn with_config(config: FrameConfig) -> Self {
        Self {
            max_frame_size: config.max_frame_size,
            decoder: FrameDecoder::with_config(config),
        }
    }
}

impl Default for HdlcCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for HdlcCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        // Consume byte by byte so that bytes after a completed frame stay in
        // `src` for the next call.
        let mut consumed = 0;
        let mut found = None;
        for &byte in src.iter() {
            consumed += 1;
            if let Some(frame) = self.decoder.process_byte(byte) {
                if frame.is_valid() {
                    found = Some(frame);
                    break;
                }
            }
        }
        let _ = src.split_to(consumed);
        Ok(found)
    }
}

impl Encoder<Frame> for HdlcCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let size = 2 + frame.payload.len() + FCS_SIZE;
        if size > self.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }
        encode_frame(frame.address, &frame.payload, dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures_util::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    use super::*;

    #[tokio::test]
    async fn frames_cross_a_duplex_pipe() {
        let (host, device) = tokio::io::duplex(1024);
        let mut sink = FramedWrite::new(host, HdlcCodec::new());
        let mut stream = FramedRead::new(device, HdlcCodec::new());

        sink.send(Frame::new(b'R', &b"ping"[..])).await.unwrap();
        sink.send(Frame::new(1, &b"log line"[..])).await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!((first.address, first.payload.as_ref()), (b'R', b"ping".as_ref()));
        assert_eq!(second.payload.as_ref(), b"log line");
    }

    #[test]
    fn decode_leaves_trailing_bytes() {
        let mut src = BytesMut::new();
        encode_frame(1, b"a", &mut src);
        encode_frame(1, b"b", &mut src);

        let mut codec = HdlcCodec::new();
        let first = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(first.payload.as_ref(), b"a");
        assert!(!src.is_empty());

        let second = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(second.payload.as_ref(), b"b");
        assert!(codec.decode(&mut src).unwrap().is_none());
    }

    #[test]
    fn encode_rejects_oversized() {
        let mut codec = HdlcCodec::with_config(FrameConfig { max_frame_size: 8 });
        let mut dst = BytesMut::new();
        let err = codec
            .encode(Frame::new(1, vec![0u8; 16]), &mut dst)
            .unwrap_err();
        assert!(matches!(err, FrameError::FrameTooLarge { .. }));
    }
}
