use std::path::PathBuf;
use std::time::Duration;

/// Errors that can occur in device transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to open the device node.
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Another process holds the exclusive lock on the device node.
    #[error("{path} is locked by another process")]
    Locked { path: PathBuf },

    /// The device node opened but could not be configured.
    #[error("failed to configure {path}: {source}")]
    Configure {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The requested baud rate cannot drive a serial line.
    #[error("unsupported baud rate {0}")]
    UnsupportedBaudRate(u32),

    /// An I/O error occurred on the link.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The background reader did not exit within the join timeout.
    #[error("reader thread failed to join after {0:?}")]
    ShutdownTimeout(Duration),

    /// A reader from a previous session never exited; the transport cannot be reused.
    #[error("reader thread from a previous session is still running")]
    ReaderStuck,

    /// The background reader thread could not be spawned.
    #[error("failed to spawn reader thread: {0}")]
    Spawn(std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
