use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use hdlclink_frame::{FrameConfig, FrameError, FrameWriter, LinkWriter};
use hdlclink_transport::Link;
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::packet::{PacketType, RpcPacket, Status};
use crate::reader::Liveness;
use crate::schema::{MethodSchema, ServiceSchema};

/// Outcome of one RPC call.
///
/// `ack` is true only when the server answered with an OK status; `payload`
/// then holds the encoded response message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcResponse {
    pub ack: bool,
    pub payload: Option<Bytes>,
}

impl RpcResponse {
    pub fn ok(payload: Bytes) -> Self {
        Self {
            ack: true,
            payload: Some(payload),
        }
    }

    pub fn nack() -> Self {
        Self {
            ack: false,
            payload: None,
        }
    }

    pub fn into_parts(self) -> (bool, Option<Bytes>) {
        (self.ack, self.payload)
    }
}

#[derive(Debug)]
struct PendingCall {
    channel_id: u32,
    service_id: u32,
    method_id: u32,
    call_id: u32,
    outcome: Option<RpcResponse>,
}

impl PendingCall {
    fn matches(&self, packet: &RpcPacket) -> bool {
        packet.channel_id == self.channel_id
            && packet.service_id == self.service_id
            && packet.method_id == self.method_id
            // Servers that predate call ids always send zero.
            && (packet.call_id == self.call_id || packet.call_id == 0)
    }
}

struct Attachment {
    writer: FrameWriter<LinkWriter>,
    liveness: Liveness,
}

/// Client side of the RPC protocol over one link.
///
/// One call is in flight at a time; concurrent callers queue on an internal
/// lock. Responses arrive from the reader thread through
/// [`process_packet`](RpcChannel::process_packet).
pub struct RpcChannel {
    channel_id: u32,
    rpc_address: u8,
    attachment: Mutex<Option<Attachment>>,
    pending: Mutex<Option<PendingCall>>,
    completed: Condvar,
    call_lock: Mutex<()>,
    next_call_id: AtomicU32,
}

impl RpcChannel {
    pub fn new(channel_id: u32, rpc_address: u8) -> Self {
        Self {
            channel_id,
            rpc_address,
            attachment: Mutex::new(None),
            pending: Mutex::new(None),
            completed: Condvar::new(),
            call_lock: Mutex::new(()),
            next_call_id: AtomicU32::new(1),
        }
    }

    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    /// Route outgoing requests to `link` while `liveness` reports the reader
    /// as running.
    pub fn attach(&self, link: Arc<dyn Link>, liveness: Liveness, config: FrameConfig) {
        *self.lock_attachment() = Some(Attachment {
            writer: FrameWriter::for_link(link, config),
            liveness,
        });
    }

    /// Stop sending. Calls made afterwards are refused.
    pub fn detach(&self) {
        self.lock_attachment().take();
    }

    /// Issue a unary call and wait up to `timeout` for its response.
    ///
    /// Returns a negative response, without writing anything, when no link is
    /// attached or the reader has stopped. Write failures and timeouts are
    /// also negative responses. Only a request too large to frame is an error.
    pub fn call(
        &self,
        service: &ServiceSchema,
        method: &MethodSchema,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<RpcResponse> {
        let _serial = self.call_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut attachment = self.lock_attachment();
        let Some(active) = attachment.as_mut() else {
            debug!(service = %service.full_name, method = %method.name, "no link attached");
            return Ok(RpcResponse::nack());
        };
        if !active.liveness.is_alive() {
            warn!(
                service = %service.full_name,
                method = %method.name,
                "reader is not running; refusing call"
            );
            return Ok(RpcResponse::nack());
        }

        let call_id = self.next_call_id();
        let packet = RpcPacket::request(self.channel_id, service.id, method.id, call_id, payload);

        // Installed before the write so a fast response cannot be missed.
        *self.lock_pending() = Some(PendingCall {
            channel_id: self.channel_id,
            service_id: service.id,
            method_id: method.id,
            call_id,
            outcome: None,
        });

        match active.writer.send(self.rpc_address, &packet.encode()) {
            Ok(_) => {}
            Err(err @ FrameError::FrameTooLarge { .. }) => {
                self.lock_pending().take();
                return Err(err.into());
            }
            Err(err) => {
                warn!(
                    service = %service.full_name,
                    method = %method.name,
                    error = %err,
                    "failed to send request"
                );
                self.lock_pending().take();
                return Ok(RpcResponse::nack());
            }
        }
        drop(attachment);
        debug!(service = %service.full_name, method = %method.name, call_id, "request sent");

        // A timeout past the end of the clock waits without a deadline.
        let deadline = Instant::now().checked_add(timeout);
        let mut pending = self.lock_pending();
        loop {
            if let Some(outcome) = pending.as_mut().and_then(|call| call.outcome.take()) {
                pending.take();
                return Ok(outcome);
            }

            let Some(deadline) = deadline else {
                pending = self
                    .completed
                    .wait(pending)
                    .unwrap_or_else(PoisonError::into_inner);
                continue;
            };

            let now = Instant::now();
            if now >= deadline {
                pending.take();
                debug!(
                    service = %service.full_name,
                    method = %method.name,
                    call_id,
                    ?timeout,
                    "call timed out"
                );
                return Ok(RpcResponse::nack());
            }

            let (guard, _) = self
                .completed
                .wait_timeout(pending, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            pending = guard;
        }
    }

    /// Handle an inbound packet from the reader thread.
    ///
    /// Completes the pending call if the packet answers it. A response on
    /// this channel that answers nothing is rejected with a
    /// `FAILED_PRECONDITION` client error so the server can drop the call.
    /// Everything else is logged and dropped.
    pub fn process_packet(&self, data: Bytes) {
        let packet = match RpcPacket::decode(data) {
            Ok(packet) => packet,
            Err(err) => {
                error!(error = %err, "failed to decode RPC packet");
                return;
            }
        };

        if !matches!(
            packet.packet_type,
            PacketType::Response | PacketType::ServerError
        ) {
            debug!(packet_type = ?packet.packet_type, "ignoring packet");
            return;
        }
        if packet.channel_id != self.channel_id {
            debug!(channel_id = packet.channel_id, "ignoring packet for another channel");
            return;
        }

        if !self.complete(&packet) && packet.packet_type == PacketType::Response {
            self.reject(&packet);
        }
    }

    /// Deliver `packet` to the pending call. Returns false if nothing was
    /// waiting for it.
    fn complete(&self, packet: &RpcPacket) -> bool {
        let mut pending = self.lock_pending();
        let Some(call) = pending.as_mut() else {
            debug!(
                service_id = packet.service_id,
                method_id = packet.method_id,
                call_id = packet.call_id,
                "discarding packet with no pending call"
            );
            return false;
        };
        if !call.matches(packet) || call.outcome.is_some() {
            debug!(
                service_id = packet.service_id,
                method_id = packet.method_id,
                call_id = packet.call_id,
                "discarding packet for another call"
            );
            return false;
        }

        let outcome = if packet.packet_type == PacketType::ServerError || !packet.status.is_ok() {
            warn!(
                service_id = packet.service_id,
                method_id = packet.method_id,
                status = %packet.status,
                "call failed on server"
            );
            RpcResponse::nack()
        } else {
            RpcResponse::ok(packet.payload.clone())
        };
        call.outcome = Some(outcome);
        self.completed.notify_all();
        true
    }

    // Takes the attachment lock; the pending lock must not be held.
    fn reject(&self, packet: &RpcPacket) {
        let reply = RpcPacket::client_error(packet, Status::FailedPrecondition);
        let mut attachment = self.lock_attachment();
        let Some(active) = attachment.as_mut() else {
            return;
        };
        if let Err(err) = active.writer.send(self.rpc_address, &reply.encode()) {
            warn!(error = %err, "failed to send client error");
        }
    }

    fn next_call_id(&self) -> u32 {
        loop {
            let id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    fn lock_attachment(&self) -> std::sync::MutexGuard<'_, Option<Attachment>> {
        self.attachment
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Option<PendingCall>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChannel")
            .field("channel_id", &self.channel_id)
            .field("rpc_address", &self.rpc_address)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::AtomicUsize;

    use hdlclink_frame::FrameDecoder;

    use super::*;
    use crate::schema::echo_service;

    /// Link that records writes and never has anything to read.
    #[derive(Debug, Default)]
    struct RecordingLink {
        written: Mutex<Vec<u8>>,
        writes: AtomicUsize,
        fail: bool,
    }

    impl Link for RecordingLink {
        fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
            std::thread::sleep(timeout);
            Ok(false)
        }

        fn read(&self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::WouldBlock))
        }

        fn write_all(&self, data: &[u8]) -> io::Result<()> {
            if self.fail {
                self.writes.fetch_add(1, Ordering::SeqCst);
                return Err(io::Error::from(io::ErrorKind::BrokenPipe));
            }
            self.written.lock().unwrap().extend_from_slice(data);
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn attached(link: Arc<RecordingLink>, alive: bool) -> (Arc<RpcChannel>, Liveness) {
        let channel = Arc::new(RpcChannel::new(1, b'R'));
        let liveness = Liveness::new(alive);
        channel.attach(link, liveness.clone(), FrameConfig::default());
        (channel, liveness)
    }

    fn sent_packets(link: &RecordingLink) -> Vec<RpcPacket> {
        let written = link.written.lock().unwrap().clone();
        FrameDecoder::new()
            .process_valid(&written)
            .into_iter()
            .map(|frame| {
                assert_eq!(frame.address, b'R');
                RpcPacket::decode(frame.payload).unwrap()
            })
            .collect()
    }

    fn sent_request(link: &RecordingLink) -> RpcPacket {
        let packets = sent_packets(link);
        assert_eq!(packets[0].packet_type, PacketType::Request);
        packets[0].clone()
    }

    fn reply_to(request: &RpcPacket, status: Status, payload: &'static [u8]) -> Bytes {
        RpcPacket {
            packet_type: PacketType::Response,
            channel_id: request.channel_id,
            service_id: request.service_id,
            method_id: request.method_id,
            payload: Bytes::from_static(payload),
            status,
            call_id: request.call_id,
        }
        .encode()
    }

    fn answer_after_send(
        channel: &Arc<RpcChannel>,
        link: &Arc<RecordingLink>,
        reply: impl FnOnce(&RpcPacket) -> Bytes + Send + 'static,
    ) -> std::thread::JoinHandle<()> {
        let channel = Arc::clone(channel);
        let link = Arc::clone(link);
        std::thread::spawn(move || {
            while link.writes.load(Ordering::SeqCst) == 0 {
                std::thread::sleep(Duration::from_millis(1));
            }
            let request = sent_request(&link);
            channel.process_packet(reply(&request));
        })
    }

    #[test]
    fn successful_call() {
        let link = Arc::new(RecordingLink::default());
        let (channel, _alive) = attached(Arc::clone(&link), true);
        let echo = echo_service();

        let responder = answer_after_send(&channel, &link, |req| {
            reply_to(req, Status::Ok, b"\x0a\x04pong")
        });
        let response = channel
            .call(&echo, &echo.methods[0], Bytes::from_static(b"\x0a\x04ping"), Duration::from_secs(1))
            .unwrap();
        responder.join().unwrap();

        assert_eq!(response, RpcResponse::ok(Bytes::from_static(b"\x0a\x04pong")));
        let request = sent_request(&link);
        assert_eq!(request.packet_type, PacketType::Request);
        assert_eq!(request.service_id, echo.id);
        assert_ne!(request.call_id, 0);
    }

    #[test]
    fn error_status_is_nack() {
        let link = Arc::new(RecordingLink::default());
        let (channel, _alive) = attached(Arc::clone(&link), true);
        let echo = echo_service();

        let responder =
            answer_after_send(&channel, &link, |req| reply_to(req, Status::NotFound, b""));
        let response = channel
            .call(&echo, &echo.methods[0], Bytes::new(), Duration::from_secs(1))
            .unwrap();
        responder.join().unwrap();

        assert_eq!(response, RpcResponse::nack());
    }

    #[test]
    fn legacy_zero_call_id_matches() {
        let link = Arc::new(RecordingLink::default());
        let (channel, _alive) = attached(Arc::clone(&link), true);
        let echo = echo_service();

        let responder = answer_after_send(&channel, &link, |req| {
            let mut legacy = RpcPacket::decode(reply_to(req, Status::Ok, b"ok")).unwrap();
            legacy.call_id = 0;
            legacy.encode()
        });
        let response = channel
            .call(&echo, &echo.methods[0], Bytes::new(), Duration::from_secs(1))
            .unwrap();
        responder.join().unwrap();

        assert!(response.ack);
    }

    #[test]
    fn times_out_without_response() {
        let link = Arc::new(RecordingLink::default());
        let (channel, _alive) = attached(Arc::clone(&link), true);
        let echo = echo_service();

        let timeout = Duration::from_millis(100);
        let started = Instant::now();
        let response = channel
            .call(&echo, &echo.methods[0], Bytes::new(), timeout)
            .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(response, RpcResponse::nack());
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_secs(1));
    }

    #[test]
    fn late_response_is_discarded() {
        let link = Arc::new(RecordingLink::default());
        let (channel, _alive) = attached(Arc::clone(&link), true);
        let echo = echo_service();

        let response = channel
            .call(&echo, &echo.methods[0], Bytes::new(), Duration::from_millis(20))
            .unwrap();
        assert!(!response.ack);

        let request = sent_request(&link);
        channel.process_packet(reply_to(&request, Status::Ok, b"late"));
        assert!(channel.lock_pending().is_none());

        let packets = sent_packets(&link);
        assert_eq!(packets.len(), 2);
        let rejection = &packets[1];
        assert_eq!(rejection.packet_type, PacketType::ClientError);
        assert_eq!(rejection.status, Status::FailedPrecondition);
        assert_eq!(rejection.service_id, request.service_id);
        assert_eq!(rejection.method_id, request.method_id);
        assert_eq!(rejection.call_id, request.call_id);
    }

    #[test]
    fn unmatched_server_error_is_not_rejected() {
        let link = Arc::new(RecordingLink::default());
        let (channel, _alive) = attached(Arc::clone(&link), true);

        let mut stray = RpcPacket::decode(reply_to(
            &RpcPacket::request(1, 5, 6, 7, Bytes::new()),
            Status::NotFound,
            b"",
        ))
        .unwrap();
        stray.packet_type = PacketType::ServerError;
        channel.process_packet(stray.encode());

        assert_eq!(link.writes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn response_for_another_channel_is_not_rejected() {
        let link = Arc::new(RecordingLink::default());
        let (channel, _alive) = attached(Arc::clone(&link), true);

        let request = RpcPacket::request(2, 5, 6, 7, Bytes::new());
        channel.process_packet(reply_to(&request, Status::Ok, b"x"));

        assert_eq!(link.writes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unbounded_timeout_waits_for_response() {
        let link = Arc::new(RecordingLink::default());
        let (channel, _alive) = attached(Arc::clone(&link), true);
        let echo = echo_service();

        let responder = answer_after_send(&channel, &link, |req| {
            reply_to(req, Status::Ok, b"\x0a\x02ok")
        });
        let response = channel
            .call(&echo, &echo.methods[0], Bytes::new(), Duration::MAX)
            .unwrap();
        responder.join().unwrap();

        assert_eq!(response, RpcResponse::ok(Bytes::from_static(b"\x0a\x02ok")));
    }

    #[test]
    fn mismatched_response_is_ignored() {
        let link = Arc::new(RecordingLink::default());
        let (channel, _alive) = attached(Arc::clone(&link), true);
        let echo = echo_service();

        let responder = answer_after_send(&channel, &link, |req| {
            let mut other = RpcPacket::decode(reply_to(req, Status::Ok, b"x")).unwrap();
            other.method_id ^= 1;
            other.encode()
        });
        let response = channel
            .call(&echo, &echo.methods[0], Bytes::new(), Duration::from_millis(100))
            .unwrap();
        responder.join().unwrap();

        assert!(!response.ack);
    }

    #[test]
    fn dead_reader_fails_fast_without_writing() {
        let link = Arc::new(RecordingLink::default());
        let (channel, _alive) = attached(Arc::clone(&link), false);
        let echo = echo_service();

        let started = Instant::now();
        let response = channel
            .call(&echo, &echo.methods[0], Bytes::new(), Duration::from_secs(5))
            .unwrap();

        assert_eq!(response, RpcResponse::nack());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(link.writes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn detached_channel_refuses_calls() {
        let link = Arc::new(RecordingLink::default());
        let (channel, _alive) = attached(Arc::clone(&link), true);
        channel.detach();
        let echo = echo_service();

        let response = channel
            .call(&echo, &echo.methods[0], Bytes::new(), Duration::from_secs(1))
            .unwrap();
        assert!(!response.ack);
        assert_eq!(link.writes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn write_failure_is_nack() {
        let link = Arc::new(RecordingLink {
            fail: true,
            ..RecordingLink::default()
        });
        let (channel, _alive) = attached(Arc::clone(&link), true);
        let echo = echo_service();

        let response = channel
            .call(&echo, &echo.methods[0], Bytes::new(), Duration::from_secs(1))
            .unwrap();
        assert!(!response.ack);
        assert!(channel.lock_pending().is_none());
    }

    #[test]
    fn oversized_request_is_error() {
        let link = Arc::new(RecordingLink::default());
        let channel = RpcChannel::new(1, b'R');
        channel.attach(link, Liveness::new(true), FrameConfig { max_frame_size: 32 });
        let echo = echo_service();

        let result = channel.call(
            &echo,
            &echo.methods[0],
            Bytes::from(vec![0u8; 64]),
            Duration::from_secs(1),
        );
        assert!(matches!(result, Err(crate::RpcError::Frame(_))));
    }

    #[test]
    fn garbage_packet_is_dropped() {
        let channel = RpcChannel::new(1, b'R');
        channel.process_packet(Bytes::from_static(&[0xFF, 0xFF, 0xFF]));
        assert!(channel.lock_pending().is_none());
    }
}
