use std::fmt;
use std::time::Duration;

use bytes::Bytes;

use crate::error::Result;

/// Flags consulted by the component that owns a transport.
///
/// The transport itself never acts on these; an owner reads them to decide
/// whether to open at startup and whether to reopen after an unexpected close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportProperties {
    /// Reopen the transport if it is found closed unexpectedly.
    pub auto_reopen: bool,
    /// Open the transport when the owner starts.
    pub open_on_start: bool,
}

impl Default for TransportProperties {
    fn default() -> Self {
        Self {
            auto_reopen: false,
            open_on_start: true,
        }
    }
}

/// Lifecycle state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Closed,
    Opening,
    Open,
    Closing,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportState::Closed => "closed",
            TransportState::Opening => "opening",
            TransportState::Open => "open",
            TransportState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// The uniform device transport contract.
///
/// Implementors provide the `do_*` hooks; callers use the provided
/// [`open`](Transport::open), [`close`](Transport::close),
/// [`read`](Transport::read) and [`write`](Transport::write) wrappers, which
/// apply the shared open-state policy. All methods take `&self` so a
/// log-draining thread and a command-issuing thread can share one transport.
pub trait Transport: Send + Sync {
    /// Owner-facing configuration flags.
    fn properties(&self) -> TransportProperties;

    /// True only when the transport is fully usable.
    ///
    /// Must be cheap and free of side effects.
    fn is_open(&self) -> bool;

    /// Acquire all resources. On failure, everything acquired so far must be
    /// released before the error is returned.
    fn do_open(&self) -> Result<()>;

    /// Release all resources. Must be idempotent and must tolerate a
    /// partially-opened transport.
    fn do_close(&self) -> Result<()>;

    /// Read up to `size` bytes, waiting at most `timeout`.
    ///
    /// Returns empty bytes when nothing arrived in time.
    fn do_read(&self, size: usize, timeout: Duration) -> Result<Bytes>;

    /// Write `data`, waiting at most `timeout`. Returns the number of bytes written.
    fn do_write(&self, data: &[u8], timeout: Duration) -> Result<usize>;

    /// Open the transport unless it is already open.
    ///
    /// A transport that is not open may still hold leftovers from a previous
    /// session (for example a dead reader with an open descriptor); those are
    /// released before acquiring fresh resources.
    fn open(&self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        self.do_close()?;
        self.do_open()
    }

    /// Close the transport. Safe to call any number of times.
    fn close(&self) -> Result<()> {
        self.do_close()
    }

    /// Read from the transport, or `None` if it is not open.
    fn read(&self, size: usize, timeout: Duration) -> Result<Option<Bytes>> {
        if !self.is_open() {
            return Ok(None);
        }
        self.do_read(size, timeout).map(Some)
    }

    /// Write to the transport, or `None` if it is not open.
    fn write(&self, data: &[u8], timeout: Duration) -> Result<Option<usize>> {
        if !self.is_open() {
            return Ok(None);
        }
        self.do_write(data, timeout).map(Some)
    }
}
