//! End-to-end tests against a simulated device on a loopback link.

use std::io;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use hdlclink_frame::{FrameReader, FrameWriter, LOG_ADDRESS, RPC_ADDRESS};
use hdlclink_rpc::schema::decode_string_field;
use hdlclink_rpc::{
    HdlcRpcTransport, PacketType, RouteConfig, RpcArgs, RpcPacket, RpcResponse, ServiceRegistry,
    Status, Transport, TransportConfig,
};
use hdlclink_transport::{Link, LinkOpener, LoopbackOpener, TransportState};

const ECHO_DESCRIPTOR: &str = r#"{
    "package": "lab",
    "services": [
        { "name": "Echo", "methods": [
            { "name": "Echo", "request": [ { "name": "msg", "number": 1, "kind": "string" } ] }
        ] }
    ]
}"#;

fn registry() -> ServiceRegistry {
    let mut registry = ServiceRegistry::new();
    registry
        .register_json(ECHO_DESCRIPTOR, Path::new("echo.rpc.json"))
        .unwrap();
    registry
}

fn open_loopback(config: &TransportConfig) -> (HdlcRpcTransport, LoopbackOpener, UnixStream) {
    let opener = LoopbackOpener::new();
    let transport =
        HdlcRpcTransport::with_opener(Box::new(opener.clone()), registry(), config).unwrap();
    transport.open().unwrap();
    let device = opener.take_device_end().unwrap();
    (transport, opener, device)
}

fn response_to(request: &RpcPacket, status: Status, payload: &[u8]) -> RpcPacket {
    RpcPacket {
        packet_type: if status.is_ok() {
            PacketType::Response
        } else {
            PacketType::ServerError
        },
        channel_id: request.channel_id,
        service_id: request.service_id,
        method_id: request.method_id,
        payload: Bytes::copy_from_slice(payload),
        status,
        call_id: request.call_id,
    }
}

/// Answer RPC requests with `handler` until the host hangs up.
fn spawn_device<F>(device: &UnixStream, mut handler: F) -> JoinHandle<usize>
where
    F: FnMut(&RpcPacket) -> Option<RpcPacket> + Send + 'static,
{
    let mut reader = FrameReader::new(device.try_clone().unwrap());
    let mut writer = FrameWriter::new(device.try_clone().unwrap());
    thread::spawn(move || {
        let mut requests = 0;
        while let Ok(frame) = reader.read_frame() {
            if frame.address != RPC_ADDRESS {
                continue;
            }
            let request = RpcPacket::decode(frame.payload).unwrap();
            if request.packet_type != PacketType::Request {
                continue;
            }
            requests += 1;
            if let Some(response) = handler(&request) {
                if writer.send(RPC_ADDRESS, &response.encode()).is_err() {
                    break;
                }
            }
        }
        requests
    })
}

#[test]
fn rpc_round_trip_returns_device_payload() {
    let (transport, _opener, device) = open_loopback(&TransportConfig::default());
    let handle = spawn_device(&device, |request| {
        let msg = decode_string_field(&request.payload, 1).unwrap();
        assert_eq!(msg.as_deref(), Some("ping"));
        Some(response_to(request, Status::Ok, b"pong"))
    });

    let started = Instant::now();
    let response = transport
        .rpc("Echo", "Echo", &RpcArgs::new().arg("msg", "ping"))
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(response, RpcResponse::ok(Bytes::from_static(b"pong")));

    transport.close().unwrap();
    assert_eq!(handle.join().unwrap(), 1);
}

#[test]
fn echo_rpc_decodes_echoed_text() {
    let (transport, _opener, device) = open_loopback(&TransportConfig::default());
    let handle = spawn_device(&device, |request| {
        Some(response_to(request, Status::Ok, &request.payload))
    });

    assert_eq!(
        transport.echo_rpc("hello device").unwrap(),
        (true, Some("hello device".to_string()))
    );

    transport.close().unwrap();
    handle.join().unwrap();
}

#[test]
fn error_status_is_nack() {
    let (transport, _opener, device) = open_loopback(&TransportConfig::default());
    let handle = spawn_device(&device, |request| {
        Some(response_to(request, Status::Unimplemented, b""))
    });

    let response = transport
        .rpc("Echo", "Echo", &RpcArgs::new().arg("msg", "x"))
        .unwrap();
    assert_eq!(response, RpcResponse::nack());
    assert_eq!(transport.echo_rpc("x").unwrap(), (false, None));

    transport.close().unwrap();
    handle.join().unwrap();
}

#[test]
fn silent_device_times_out_within_bounds() {
    let (transport, _opener, device) = open_loopback(&TransportConfig::default());
    let handle = spawn_device(&device, |_| None);

    let timeout = Duration::from_millis(200);
    let started = Instant::now();
    let response = transport
        .rpc_with_timeout("Echo", "Echo", &RpcArgs::new().arg("msg", "x"), timeout)
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(response, RpcResponse::nack());
    assert!(elapsed >= timeout, "returned early after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");

    transport.close().unwrap();
    assert_eq!(handle.join().unwrap(), 1);
}

#[test]
fn late_response_does_not_answer_next_call() {
    let (transport, _opener, device) = open_loopback(&TransportConfig::default());
    let mut answered = 0;
    let handle = spawn_device(&device, move |request| {
        answered += 1;
        if answered == 1 {
            // First answer arrives after the caller gave up.
            thread::sleep(Duration::from_millis(150));
            Some(response_to(request, Status::Ok, b"stale"))
        } else {
            Some(response_to(request, Status::Ok, b"fresh"))
        }
    });

    let args = RpcArgs::new().arg("msg", "x");
    let first = transport
        .rpc_with_timeout("Echo", "Echo", &args, Duration::from_millis(50))
        .unwrap();
    assert!(!first.ack);

    thread::sleep(Duration::from_millis(200));
    let second = transport.rpc("Echo", "Echo", &args).unwrap();
    assert_eq!(second.payload.as_deref(), Some(b"fresh".as_ref()));

    transport.close().unwrap();
    handle.join().unwrap();
}

#[test]
fn unsolicited_response_is_rejected_to_device() {
    let (transport, _opener, device) = open_loopback(&TransportConfig::default());
    let mut writer = FrameWriter::new(device.try_clone().unwrap());
    let mut reader = FrameReader::new(device.try_clone().unwrap());

    let stray = RpcPacket {
        packet_type: PacketType::Response,
        channel_id: 1,
        service_id: 11,
        method_id: 12,
        payload: Bytes::from_static(b"unasked"),
        status: Status::Ok,
        call_id: 13,
    };
    writer.send(RPC_ADDRESS, &stray.encode()).unwrap();

    device
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let frame = reader.read_frame().unwrap();
    assert_eq!(frame.address, RPC_ADDRESS);
    let rejection = RpcPacket::decode(frame.payload).unwrap();
    assert_eq!(rejection.packet_type, PacketType::ClientError);
    assert_eq!(rejection.status, Status::FailedPrecondition);
    assert_eq!(
        (rejection.service_id, rejection.method_id, rejection.call_id),
        (11, 12, 13)
    );

    transport.close().unwrap();
}

#[test]
fn unbounded_timeouts_do_not_overflow() {
    let (transport, _opener, device) = open_loopback(&TransportConfig::default());
    let handle = spawn_device(&device, |request| {
        Some(response_to(request, Status::Ok, b"\x0a\x01x"))
    });

    let response = transport
        .rpc_with_timeout(
            "pw.rpc.EchoService",
            "Echo",
            &RpcArgs::new().arg("msg", "x"),
            Duration::from_secs(u64::MAX),
        )
        .unwrap();
    assert!(response.ack);

    let mut writer = FrameWriter::new(device.try_clone().unwrap());
    writer.send(LOG_ADDRESS, b"after").unwrap();
    assert_eq!(
        transport.read(64, Duration::MAX).unwrap(),
        Some(Bytes::from_static(b"after\n"))
    );

    transport.close().unwrap();
    assert_eq!(handle.join().unwrap(), 1);
}

#[test]
fn log_lines_arrive_in_order() {
    let (transport, _opener, device) = open_loopback(&TransportConfig::default());
    let mut writer = FrameWriter::new(device.try_clone().unwrap());
    for i in 0..50 {
        writer
            .send(LOG_ADDRESS, format!("line-{i}").as_bytes())
            .unwrap();
    }

    for i in 0..50 {
        let chunk = transport
            .read(1024, Duration::from_secs(1))
            .unwrap()
            .expect("transport should be open");
        assert_eq!(chunk, Bytes::from(format!("line-{i}\n")));
    }
    assert_eq!(
        transport.read(1024, Duration::from_millis(20)).unwrap(),
        Some(Bytes::new())
    );

    transport.close().unwrap();
}

#[test]
fn rpc_frames_never_reach_log_stream() {
    let (transport, _opener, device) = open_loopback(&TransportConfig::default());
    let mut writer = FrameWriter::new(device.try_clone().unwrap());

    let unsolicited = RpcPacket {
        packet_type: PacketType::Response,
        channel_id: 1,
        service_id: 7,
        method_id: 9,
        payload: Bytes::from_static(b"nobody asked"),
        status: Status::Ok,
        call_id: 3,
    };
    writer.send(RPC_ADDRESS, &unsolicited.encode()).unwrap();
    writer.send(0x42, b"unassigned").unwrap();
    writer.send(LOG_ADDRESS, b"only this").unwrap();

    assert_eq!(
        transport.read(64, Duration::from_secs(1)).unwrap(),
        Some(Bytes::from_static(b"only this\n"))
    );
    thread::sleep(Duration::from_millis(50));
    assert_eq!(transport.pending_logs(), 0);

    transport.close().unwrap();
}

#[test]
fn configured_routes_are_honored() {
    let config = TransportConfig {
        routes: RouteConfig {
            rpc_address: b'Q',
            log_addresses: vec![1, 2],
        },
        ..TransportConfig::default()
    };
    let (transport, _opener, device) = open_loopback(&config);
    let mut writer = FrameWriter::new(device.try_clone().unwrap());
    writer.send(2, b"second log").unwrap();

    assert_eq!(
        transport.read(64, Duration::from_secs(1)).unwrap(),
        Some(Bytes::from_static(b"second log\n"))
    );

    // Requests go out on the configured address.
    let mut reader = FrameReader::new(device.try_clone().unwrap());
    let caller = thread::spawn(move || {
        transport.rpc_with_timeout(
            "Echo",
            "Echo",
            &RpcArgs::new().arg("msg", "x"),
            Duration::from_millis(100),
        )
    });
    let frame = reader.read_frame().unwrap();
    assert_eq!(frame.address, b'Q');
    assert!(!caller.join().unwrap().unwrap().ack);
}

#[test]
fn logs_drain_while_calls_run() {
    let (transport, _opener, device) = open_loopback(&TransportConfig::default());
    let transport = Arc::new(transport);

    let log_stream = device.try_clone().unwrap();
    let handle = spawn_device(&device, move |request| {
        let mut writer = FrameWriter::new(log_stream.try_clone().unwrap());
        writer.send(LOG_ADDRESS, b"handling request").unwrap();
        Some(response_to(request, Status::Ok, b"done"))
    });

    let drain = {
        let transport = Arc::clone(&transport);
        thread::spawn(move || {
            let mut seen = 0;
            let deadline = Instant::now() + Duration::from_secs(5);
            while seen < 5 && Instant::now() < deadline {
                if let Some(chunk) = transport.read(64, Duration::from_millis(100)).unwrap() {
                    if !chunk.is_empty() {
                        seen += 1;
                    }
                }
            }
            seen
        })
    };

    for _ in 0..5 {
        let response = transport
            .rpc("Echo", "Echo", &RpcArgs::new().arg("msg", "x"))
            .unwrap();
        assert!(response.ack);
    }
    assert_eq!(drain.join().unwrap(), 5);

    transport.close().unwrap();
    assert_eq!(handle.join().unwrap(), 5);
}

#[test]
fn close_is_idempotent() {
    let (transport, _opener, _device) = open_loopback(&TransportConfig::default());
    transport.close().unwrap();
    transport.close().unwrap();
    assert!(!transport.is_open());
    assert_eq!(transport.state(), TransportState::Closed);
}

#[test]
fn reopen_uses_a_fresh_link() {
    let (transport, opener, device) = open_loopback(&TransportConfig::default());
    transport.close().unwrap();
    drop(device);

    transport.open().unwrap();
    assert_eq!(opener.open_count(), 2);
    let device = opener.take_device_end().unwrap();
    let handle = spawn_device(&device, |request| {
        Some(response_to(request, Status::Ok, &request.payload))
    });

    assert_eq!(
        transport.echo_rpc("again").unwrap(),
        (true, Some("again".to_string()))
    );

    transport.close().unwrap();
    handle.join().unwrap();
}

/// Link whose reader side fails hard and which counts writes.
#[derive(Debug, Default)]
struct BrokenLink {
    writes: AtomicUsize,
}

impl Link for BrokenLink {
    fn wait_readable(&self, _timeout: Duration) -> io::Result<bool> {
        panic!("device vanished");
    }

    fn read(&self, _buf: &mut [u8]) -> io::Result<usize> {
        Ok(0)
    }

    fn write_all(&self, _data: &[u8]) -> io::Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct BrokenOpener(Arc<BrokenLink>);

impl LinkOpener for BrokenOpener {
    fn open_link(&self) -> hdlclink_transport::Result<Arc<dyn Link>> {
        let link: Arc<dyn Link> = self.0.clone();
        Ok(link)
    }

    fn address(&self) -> String {
        "broken".to_string()
    }
}

#[test]
fn dead_reader_fails_fast_without_writing() {
    let link = Arc::new(BrokenLink::default());
    let transport = HdlcRpcTransport::with_opener(
        Box::new(BrokenOpener(Arc::clone(&link))),
        registry(),
        &TransportConfig::default(),
    )
    .unwrap();
    transport.open().unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while transport.is_open() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert!(!transport.is_open());

    let started = Instant::now();
    let response = transport
        .rpc("Echo", "Echo", &RpcArgs::new().arg("msg", "x"))
        .unwrap();
    assert_eq!(response, RpcResponse::nack());
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(link.writes.load(Ordering::SeqCst), 0);

    // A dead reader does not make close fail.
    transport.close().unwrap();
}
