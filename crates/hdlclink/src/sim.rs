//! A simulated device for loopback links.
//!
//! [`DeviceSimulator`] sits on the device end of a
//! [`LoopbackOpener`](hdlclink_transport::LoopbackOpener) pair and behaves like
//! firmware running an RPC server with only the echo service: echo requests
//! are answered with their own payload, requests for anything else get a
//! `NOT_FOUND` server error. Log lines can be pushed at any time.

use std::io;
use std::os::unix::net::UnixStream;
use std::thread::{self, JoinHandle};

use hdlclink_frame::{FrameError, FrameReader, FrameWriter, LOG_ADDRESS, RPC_ADDRESS};
use hdlclink_rpc::schema::{echo_service, ECHO_METHOD};
use hdlclink_rpc::{ids, PacketType, RpcPacket, Status};

/// Firmware stand-in serving the echo service on one stream.
pub struct DeviceSimulator {
    stream: UnixStream,
    handle: Option<JoinHandle<io::Result<u64>>>,
}

impl DeviceSimulator {
    /// Start serving requests arriving on `stream`.
    pub fn spawn(stream: UnixStream) -> io::Result<Self> {
        // The host end may be non-blocking; the simulator reads in blocking mode.
        stream.set_nonblocking(false)?;
        let reader = stream.try_clone()?;
        let writer = stream.try_clone()?;
        let handle = thread::Builder::new()
            .name("hdlclink-sim".to_string())
            .spawn(move || serve(reader, writer))?;
        Ok(Self {
            stream,
            handle: Some(handle),
        })
    }

    /// Emit one line on the log address.
    pub fn send_log(&self, line: &str) -> io::Result<()> {
        FrameWriter::new(&self.stream)
            .send(LOG_ADDRESS, line.as_bytes())
            .map(|_| ())
            .map_err(frame_to_io)
    }

    /// Wait for the host to hang up. Returns the number of requests answered.
    pub fn join(mut self) -> io::Result<u64> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| io::Error::other("simulator thread panicked"))?,
            None => Ok(0),
        }
    }
}

impl std::fmt::Debug for DeviceSimulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSimulator")
            .field("running", &self.handle.as_ref().is_some_and(|h| !h.is_finished()))
            .finish()
    }
}

fn serve(reader: UnixStream, writer: UnixStream) -> io::Result<u64> {
    let echo_service_id = echo_service().id;
    let echo_method_id = ids::hash(ECHO_METHOD);
    let mut frames = FrameReader::new(reader);
    let mut out = FrameWriter::new(writer);
    let mut answered = 0u64;

    loop {
        let frame = match frames.read_frame() {
            Ok(frame) => frame,
            Err(FrameError::ConnectionClosed) => return Ok(answered),
            Err(err) => return Err(frame_to_io(err)),
        };
        if frame.address != RPC_ADDRESS {
            continue;
        }
        let Ok(request) = RpcPacket::decode(frame.payload) else {
            continue;
        };
        if request.packet_type != PacketType::Request {
            continue;
        }

        let known = request.service_id == echo_service_id && request.method_id == echo_method_id;
        let response = RpcPacket {
            packet_type: if known {
                PacketType::Response
            } else {
                PacketType::ServerError
            },
            status: if known { Status::Ok } else { Status::NotFound },
            payload: if known {
                request.payload.clone()
            } else {
                Default::default()
            },
            ..request
        };
        match out.send(RPC_ADDRESS, &response.encode()) {
            Ok(_) => answered += 1,
            Err(FrameError::Io(err)) if err.kind() == io::ErrorKind::BrokenPipe => {
                return Ok(answered)
            }
            Err(err) => return Err(frame_to_io(err)),
        }
    }
}

fn frame_to_io(err: FrameError) -> io::Error {
    match err {
        FrameError::Io(err) => err,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}
