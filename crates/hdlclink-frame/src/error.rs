/// Errors that can occur while encoding or transferring frames.
///
/// Decoding never fails: corrupt input shows up as invalid frames instead.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The encoded frame would exceed the configured maximum size.
    #[error("frame too large ({size} bytes, max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream reached EOF before another valid frame arrived.
    #[error("connection closed")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;
