use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use hdlclink_frame::FrameDecoder;
use hdlclink_transport::{Link, TransportError};
use tracing::{debug, error, warn};

use crate::router::FrameRouter;

/// Readiness poll timeout; also bounds how long a stop request goes unnoticed.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Bytes requested per read.
pub const READ_CHUNK_SIZE: usize = 4 * 1024;
/// Pause after a failed poll or read.
pub const ERROR_BACKOFF: Duration = Duration::from_millis(10);
/// How long [`ReaderLoop::stop`] waits for the worker.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Shared flag reporting whether a reader worker is still running.
///
/// Cleared when the worker exits for any reason, including a panic.
#[derive(Debug, Clone)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    pub fn new(alive: bool) -> Self {
        Self(Arc::new(AtomicBool::new(alive)))
    }

    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn mark_exited(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Lifecycle of the reader worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Stopped,
    Running,
    StopRequested,
}

struct Worker {
    handle: JoinHandle<()>,
    stop: Arc<AtomicBool>,
    done: mpsc::Receiver<()>,
    liveness: Liveness,
}

/// Background loop that reads a link, decodes frames and routes them.
///
/// Runs one named worker thread between [`start`](ReaderLoop::start) and
/// [`stop`](ReaderLoop::stop).
pub struct ReaderLoop {
    name: String,
    join_timeout: Duration,
    worker: Option<Worker>,
}

impl ReaderLoop {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            join_timeout: JOIN_TIMEOUT,
            worker: None,
        }
    }

    /// Override how long `stop` waits for the worker.
    pub fn with_join_timeout(mut self, join_timeout: Duration) -> Self {
        self.join_timeout = join_timeout;
        self
    }

    pub fn state(&self) -> ReaderState {
        match &self.worker {
            None => ReaderState::Stopped,
            Some(worker) if worker.handle.is_finished() => ReaderState::Stopped,
            Some(worker) if worker.stop.load(Ordering::Acquire) => ReaderState::StopRequested,
            Some(_) => ReaderState::Running,
        }
    }

    /// True while the worker thread is running and has not been asked to stop.
    pub fn is_alive(&self) -> bool {
        self.state() == ReaderState::Running
    }

    /// Spawn the worker. A running loop is left as is.
    ///
    /// Fails with [`TransportError::ReaderStuck`] if an earlier worker was
    /// asked to stop but never exited.
    pub fn start(
        &mut self,
        link: Arc<dyn Link>,
        decoder: FrameDecoder,
        router: FrameRouter,
    ) -> Result<Liveness, TransportError> {
        match self.state() {
            ReaderState::Running => {
                if let Some(worker) = &self.worker {
                    return Ok(worker.liveness.clone());
                }
            }
            ReaderState::StopRequested => return Err(TransportError::ReaderStuck),
            ReaderState::Stopped => self.reap(),
        }

        let stop = Arc::new(AtomicBool::new(false));
        let liveness = Liveness::new(true);
        let (done_tx, done_rx) = mpsc::channel();

        let handle = {
            let stop = Arc::clone(&stop);
            let liveness = liveness.clone();
            thread::Builder::new()
                .name(self.name.clone())
                .spawn(move || {
                    let _exit = ExitSignal {
                        done: done_tx,
                        liveness,
                    };
                    run(link.as_ref(), &stop, decoder, &router);
                })
                .map_err(TransportError::Spawn)?
        };
        debug!(reader = %self.name, "reader started");

        self.worker = Some(Worker {
            handle,
            stop,
            done: done_rx,
            liveness: liveness.clone(),
        });
        Ok(liveness)
    }

    /// Ask the worker to exit and wait for it.
    ///
    /// A worker that is still running after the join timeout is an error and
    /// stays registered, so a later `start` refuses to run alongside it. A
    /// worker that panicked is logged and otherwise treated as stopped.
    pub fn stop(&mut self) -> Result<(), TransportError> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        worker.stop.store(true, Ordering::Release);

        match worker.done.recv_timeout(self.join_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                join_worker(&self.name, worker.handle);
                debug!(reader = %self.name, "reader stopped");
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                error!(
                    reader = %self.name,
                    timeout = ?self.join_timeout,
                    "reader did not exit in time"
                );
                let timeout = self.join_timeout;
                self.worker = Some(worker);
                Err(TransportError::ShutdownTimeout(timeout))
            }
        }
    }

    // Join a worker that already exited on its own.
    fn reap(&mut self) {
        if let Some(worker) = self.worker.take() {
            join_worker(&self.name, worker.handle);
        }
    }
}

impl std::fmt::Debug for ReaderLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderLoop")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

fn join_worker(name: &str, handle: JoinHandle<()>) {
    if let Err(panic) = handle.join() {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!(reader = name, panic = %message, "reader worker panicked");
    }
}

struct ExitSignal {
    done: mpsc::Sender<()>,
    liveness: Liveness,
}

impl Drop for ExitSignal {
    fn drop(&mut self) {
        self.liveness.mark_exited();
        let _ = self.done.send(());
    }
}

fn run(link: &dyn Link, stop: &AtomicBool, mut decoder: FrameDecoder, router: &FrameRouter) {
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    while !stop.load(Ordering::Acquire) {
        match link.wait_readable(POLL_INTERVAL) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(err) => {
                warn!(error = %err, "link poll failed");
                thread::sleep(ERROR_BACKOFF);
                continue;
            }
        }

        match link.read(&mut buf) {
            Ok(0) => {
                // Readable with nothing to read: hangup or a spurious wakeup.
                thread::sleep(ERROR_BACKOFF);
            }
            Ok(n) => {
                for frame in decoder.process(&buf[..n]) {
                    router.route(frame);
                }
            }
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
            Err(err) => {
                warn!(error = %err, "link read failed");
                thread::sleep(ERROR_BACKOFF);
            }
        }
    }
    debug!("reader loop exiting");
}
