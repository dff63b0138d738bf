use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::debug;

use crate::error::Result;
use crate::link::{fd, Link, LinkOpener};

/// A [`Link`] over one end of a connected Unix stream socket.
///
/// Used for loopback testing and for device simulators that speak the same
/// byte protocol as real hardware.
pub struct SocketLink {
    stream: UnixStream,
}

impl SocketLink {
    /// Upper bound on a single `write_all` call.
    pub const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

    /// Wrap a connected stream, switching it to non-blocking mode.
    pub fn new(stream: UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self { stream })
    }
}

impl Link for SocketLink {
    fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        fd::poll(self.stream.as_raw_fd(), libc::POLLIN, timeout)
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.stream).read(buf)
    }

    fn write_all(&self, data: &[u8]) -> io::Result<()> {
        fd::write_all(
            self.stream.as_raw_fd(),
            |chunk| (&self.stream).write(chunk),
            data,
            Self::WRITE_TIMEOUT,
        )
    }
}

impl std::fmt::Debug for SocketLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketLink")
            .field("fd", &self.stream.as_raw_fd())
            .finish()
    }
}

/// Opens in-process socket pairs in place of a device node.
///
/// Each open creates a fresh pair: the host end becomes the transport's link,
/// the device end is parked until a test or simulator claims it with
/// [`take_device_end`](LoopbackOpener::take_device_end). Clones share state,
/// so a caller can keep a clone after handing one to a transport.
#[derive(Clone, Default)]
pub struct LoopbackOpener {
    device_end: Arc<Mutex<Option<UnixStream>>>,
    opens: Arc<AtomicUsize>,
}

impl LoopbackOpener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the device side of the most recently opened pair.
    pub fn take_device_end(&self) -> Option<UnixStream> {
        self.device_end
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Number of links opened so far.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl LinkOpener for LoopbackOpener {
    fn open_link(&self) -> Result<Arc<dyn Link>> {
        let (host, device) = UnixStream::pair()?;
        let link = SocketLink::new(host)?;
        *self
            .device_end
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(device);
        let count = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(count, "opened loopback link");
        Ok(Arc::new(link))
    }

    fn address(&self) -> String {
        "loopback".to_string()
    }
}
