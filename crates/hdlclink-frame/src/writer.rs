use std::io::{self, ErrorKind, Write};
use std::sync::Arc;

use bytes::BytesMut;
use hdlclink_transport::Link;

use crate::codec::{encode_frame, Frame, FrameConfig, FCS_SIZE};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 1024;

/// Writes complete HDLC frames to any `Write` stream.
pub struct FrameWriter<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Write> FrameWriter<T> {
    /// Create a new frame writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame writer with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Write a complete frame (blocking). The control byte is always UI.
    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.send(frame.address, frame.payload.as_ref()).map(|_| ())
    }

    /// Encode and send a payload to an address.
    ///
    /// Returns the number of bytes put on the wire.
    pub fn send(&mut self, address: u8, payload: &[u8]) -> Result<usize> {
        let size = 2 + payload.len() + FCS_SIZE;
        if size > self.config.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                size,
                max: self.config.max_frame_size,
            });
        }

        self.buf.clear();
        encode_frame(address, payload, &mut self.buf);

        let mut offset = 0usize;
        while offset < self.buf.len() {
            match self.inner.write(&self.buf[offset..]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }

        self.flush()?;
        Ok(self.buf.len())
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current frame writer configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

/// Adapts a shared [`Link`] to `std::io::Write`.
///
/// Each `write` pushes the whole buffer through [`Link::write_all`], which
/// bounds the wait for a congested device.
#[derive(Debug, Clone)]
pub struct LinkWriter {
    link: Arc<dyn Link>,
}

impl LinkWriter {
    pub fn new(link: Arc<dyn Link>) -> Self {
        Self { link }
    }
}

impl Write for LinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.link.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl FrameWriter<LinkWriter> {
    /// Create a frame writer on a shared link.
    pub fn for_link(link: Arc<dyn Link>, config: FrameConfig) -> Self {
        Self::with_config(LinkWriter::new(link), config)
    }
}
