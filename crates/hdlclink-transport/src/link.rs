use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

/// A bidirectional byte connection to a device.
///
/// Links are shared between a background reader (which polls and reads) and
/// the thread issuing commands (which writes), so every method takes `&self`.
pub trait Link: Send + Sync + fmt::Debug {
    /// Wait until the link has bytes to read or `timeout` elapses.
    ///
    /// Returns `Ok(false)` on timeout or when interrupted.
    fn wait_readable(&self, timeout: Duration) -> io::Result<bool>;

    /// Read whatever is available without blocking.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write the whole buffer, waiting a bounded time for the link to drain.
    fn write_all(&self, data: &[u8]) -> io::Result<()>;

    /// Drop any OS-level claim on the device (locks) ahead of closing.
    fn release(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Opens fresh [`Link`]s for a transport.
///
/// A transport keeps its opener for its whole life and asks it for a new link
/// on every open.
pub trait LinkOpener: Send + Sync {
    /// Acquire the physical connection.
    fn open_link(&self) -> Result<Arc<dyn Link>>;

    /// Human-readable address of the device, for logs.
    fn address(&self) -> String;
}

#[cfg(unix)]
pub(crate) mod fd {
    use std::io;
    use std::os::fd::RawFd;
    use std::time::{Duration, Instant};

    /// Poll a single descriptor for `events`.
    pub(crate) fn poll(fd: RawFd, events: libc::c_short, timeout: Duration) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd,
            events,
            revents: 0,
        };
        let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

        // SAFETY: `pfd` is a valid, writable pollfd and we pass a count of exactly one.
        let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err);
        }
        if rc == 0 {
            return Ok(false);
        }
        if pfd.revents & libc::POLLNVAL != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "descriptor is not open",
            ));
        }
        Ok(pfd.revents & (events | libc::POLLHUP | libc::POLLERR) != 0)
    }

    /// Write all of `data` through a non-blocking `write`, polling for
    /// writability until `timeout` runs out.
    pub(crate) fn write_all<F>(
        fd: RawFd,
        mut write: F,
        data: &[u8],
        timeout: Duration,
    ) -> io::Result<()>
    where
        F: FnMut(&[u8]) -> io::Result<usize>,
    {
        let deadline = Instant::now() + timeout;
        let mut offset = 0usize;
        while offset < data.len() {
            match write(&data[offset..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => offset += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(io::Error::from(io::ErrorKind::TimedOut));
                    }
                    poll(fd, libc::POLLOUT, remaining)?;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}
