use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serialport::{SerialPort as _, TTYPort};
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::link::{fd, Link, LinkOpener};

/// A serial device node opened for exclusive, raw use.
///
/// Line setup (raw mode, baud rate, 8N1) is done by `serialport`. On top of
/// that the port takes an exclusive `flock` on the node so a second process
/// cannot attach to the same hardware; the lock is dropped by
/// [`Link::release`] or when the port is dropped.
///
/// The reader and writer halves are separate descriptors for the same open
/// file, so a background read never waits on a foreground write.
pub struct SerialPort {
    reader: Mutex<TTYPort>,
    writer: Mutex<TTYPort>,
    fd: RawFd,
    path: PathBuf,
    baud_rate: u32,
    locked: AtomicBool,
}

impl SerialPort {
    /// Default baud rate for embedded RPC consoles.
    pub const DEFAULT_BAUD_RATE: u32 = 115_200;
    /// Upper bound on a single `write_all` call.
    pub const WRITE_TIMEOUT: Duration = Duration::from_secs(1);
    /// Reads only happen after the link polled readable.
    const READ_TIMEOUT: Duration = Duration::from_millis(10);

    /// Open, lock and configure a device node.
    pub fn open(path: impl AsRef<Path>, baud_rate: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if baud_rate == 0 {
            return Err(TransportError::UnsupportedBaudRate(baud_rate));
        }

        let mut reader = serialport::new(path.to_string_lossy(), baud_rate)
            .timeout(Self::READ_TIMEOUT)
            .open_native()
            .map_err(|err| TransportError::Open {
                path: path.clone(),
                source: io::Error::from(err),
            })?;

        // Exclusivity is the flock below; TIOCEXCL would not stop root.
        reader
            .set_exclusive(false)
            .map_err(|err| configure_error(&path, err))?;

        let fd = reader.as_raw_fd();
        // The descriptor is closed by `reader`'s drop if locking fails.
        lock_exclusive(fd, &path)?;

        let writer = match clone_writer(&reader, &path) {
            Ok(writer) => writer,
            Err(err) => {
                // SAFETY: `fd` is owned by `reader`, which is still open here.
                unsafe { libc::flock(fd, libc::LOCK_UN) };
                return Err(err);
            }
        };

        // From here on, dropping `port` releases the lock as well.
        let port = Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            fd,
            path,
            baud_rate,
            locked: AtomicBool::new(true),
        };
        set_cloexec(port.fd).map_err(|source| TransportError::Configure {
            path: port.path.clone(),
            source,
        })?;

        info!(path = ?port.path, baud_rate, "opened serial device");
        Ok(port)
    }

    /// The device node path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The configured baud rate.
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn unlock(&self) -> io::Result<()> {
        if !self.locked.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        // SAFETY: the descriptor is owned by `self.reader` and open for the lifetime of `self`.
        let rc = unsafe { libc::flock(self.fd, libc::LOCK_UN) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        debug!(path = ?self.path, "released device lock");
        Ok(())
    }
}

impl Link for SerialPort {
    fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        fd::poll(self.fd, libc::POLLIN, timeout)
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut reader = self.reader.lock().unwrap_or_else(PoisonError::into_inner);
        match reader.read(buf) {
            Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                Err(io::Error::from(io::ErrorKind::WouldBlock))
            }
            other => other,
        }
    }

    fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(data)?;
        writer.flush()
    }

    fn release(&self) -> io::Result<()> {
        self.unlock()
    }
}

impl Drop for SerialPort {
    fn drop(&mut self) {
        if let Err(err) = self.unlock() {
            warn!(path = ?self.path, error = %err, "failed to release device lock");
        }
    }
}

impl std::fmt::Debug for SerialPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialPort")
            .field("path", &self.path)
            .field("baud_rate", &self.baud_rate)
            .finish()
    }
}

/// Opens [`SerialPort`]s for a fixed device path and baud rate.
#[derive(Debug, Clone)]
pub struct SerialOpener {
    path: PathBuf,
    baud_rate: u32,
}

impl SerialOpener {
    pub fn new(path: impl Into<PathBuf>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
        }
    }
}

impl LinkOpener for SerialOpener {
    fn open_link(&self) -> Result<Arc<dyn Link>> {
        let port = SerialPort::open(&self.path, self.baud_rate)?;
        Ok(Arc::new(port))
    }

    fn address(&self) -> String {
        self.path.display().to_string()
    }
}

fn clone_writer(reader: &TTYPort, path: &Path) -> Result<TTYPort> {
    let mut writer = reader
        .try_clone_native()
        .map_err(|err| configure_error(path, err))?;
    writer
        .set_timeout(SerialPort::WRITE_TIMEOUT)
        .map_err(|err| configure_error(path, err))?;
    set_cloexec(writer.as_raw_fd()).map_err(|source| TransportError::Configure {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(writer)
}

fn configure_error(path: &Path, err: serialport::Error) -> TransportError {
    TransportError::Configure {
        path: path.to_path_buf(),
        source: io::Error::from(err),
    }
}

fn lock_exclusive(fd: RawFd, path: &Path) -> Result<()> {
    // SAFETY: `fd` is an open descriptor owned by the caller.
    let rc = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock {
        return Err(TransportError::Locked {
            path: path.to_path_buf(),
        });
    }
    Err(TransportError::Open {
        path: path.to_path_buf(),
        source: err,
    })
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: F_GETFD/F_SETFD only inspect and update descriptor flags of an open fd.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: see above.
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
