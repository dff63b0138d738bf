use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use hdlclink_frame::{FrameConfig, FrameDecoder};
use hdlclink_transport::{
    Link, LinkOpener, SerialOpener, Transport, TransportProperties, TransportState,
};
use tracing::{debug, info, warn};

use crate::channel::{RpcChannel, RpcResponse};
use crate::config::TransportConfig;
use crate::error::{Result, RpcError};
use crate::reader::ReaderLoop;
use crate::registry::{RegistryConfig, ServiceRegistry};
use crate::router::{FrameRouter, LogQueue, RouteTable};
use crate::schema::{decode_string_field, ECHO_METHOD, ECHO_MSG_FIELD, ECHO_PACKAGE, ECHO_SERVICE};
use crate::value::RpcArgs;

/// Name given to the background reader thread.
pub const READER_THREAD_NAME: &str = "hdlclink-reader";

struct Session {
    state: TransportState,
    link: Option<Arc<dyn Link>>,
    reader: ReaderLoop,
}

/// Device transport carrying RPC calls and a log stream over one HDLC link.
///
/// While open, a background reader decodes inbound frames: RPC responses
/// complete the pending call, log frames queue up for [`Transport::read`].
/// All methods take `&self`, so one thread can drain logs while another
/// issues calls.
///
/// ```no_run
/// use hdlclink_rpc::{HdlcRpcTransport, RpcArgs, Transport, TransportConfig};
///
/// let config = TransportConfig {
///     comms_address: "/dev/ttyACM0".into(),
///     ..TransportConfig::default()
/// };
/// let transport = HdlcRpcTransport::new(&config)?;
/// transport.open()?;
/// let response = transport.rpc("EchoService", "Echo", &RpcArgs::new().arg("msg", "hi"))?;
/// println!("ack: {}", response.ack);
/// transport.close()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct HdlcRpcTransport {
    opener: Box<dyn LinkOpener>,
    registry: ServiceRegistry,
    properties: TransportProperties,
    routes: RouteTable,
    frame_config: FrameConfig,
    rpc_timeout: Duration,
    channel: Arc<RpcChannel>,
    logs: Arc<LogQueue>,
    session: Mutex<Session>,
}

impl HdlcRpcTransport {
    /// Build a transport for the serial device named by `config.comms_address`.
    ///
    /// Service descriptors listed in `config.protobufs` are loaded here, so a
    /// bad descriptor fails construction rather than the first call.
    pub fn new(config: &TransportConfig) -> Result<Self> {
        if config.comms_address.is_empty() {
            return Err(RpcError::Config("comms_address is required".into()));
        }
        let registry = ServiceRegistry::from_paths(&config.protobufs, RegistryConfig::default())?;
        let opener = SerialOpener::new(&config.comms_address, config.baud_rate);
        Self::with_opener(Box::new(opener), registry, config)
    }

    /// Build a transport over any link source with a prepared registry.
    ///
    /// `config.comms_address`, `baud_rate` and `protobufs` are ignored.
    pub fn with_opener(
        opener: Box<dyn LinkOpener>,
        mut registry: ServiceRegistry,
        config: &TransportConfig,
    ) -> Result<Self> {
        config.validate()?;
        if config.default_package.is_some() {
            registry.set_default_package(config.default_package.clone());
        }
        Ok(Self {
            opener,
            registry,
            properties: config.properties(),
            routes: config.route_table()?,
            frame_config: config.frame_config(),
            rpc_timeout: config.rpc_timeout(),
            channel: Arc::new(RpcChannel::new(config.channel_id, config.routes.rpc_address)),
            logs: Arc::new(LogQueue::new()),
            session: Mutex::new(Session {
                state: TransportState::Closed,
                link: None,
                reader: ReaderLoop::new(READER_THREAD_NAME),
            }),
        })
    }

    /// Device address, for logs and diagnostics.
    pub fn address(&self) -> String {
        self.opener.address()
    }

    pub fn state(&self) -> TransportState {
        self.lock_session().state
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }

    /// Log chunks received but not yet read.
    pub fn pending_logs(&self) -> usize {
        self.logs.len()
    }

    /// Call `service`/`method` with the default timeout.
    pub fn rpc(&self, service: &str, method: &str, args: &RpcArgs) -> Result<RpcResponse> {
        self.rpc_with_timeout(service, method, args, self.rpc_timeout)
    }

    /// Call `service`/`method`, waiting up to `timeout` for the response.
    ///
    /// Name and argument problems are errors even while the transport is
    /// closed; a closed transport, a dead reader, an error status or a
    /// timeout is a negative [`RpcResponse`].
    pub fn rpc_with_timeout(
        &self,
        service: &str,
        method: &str,
        args: &RpcArgs,
        timeout: Duration,
    ) -> Result<RpcResponse> {
        let (service, method) = self.registry.resolve(service, method)?;
        let payload = method.encode_request(args)?;
        self.channel.call(service, method, payload, timeout)
    }

    /// Round-trip `msg` through the device's echo service.
    ///
    /// Returns the acknowledgement and, when acknowledged, the echoed text.
    pub fn echo_rpc(&self, msg: &str) -> Result<(bool, Option<String>)> {
        self.echo_rpc_with_timeout(msg, self.rpc_timeout)
    }

    /// [`echo_rpc`](Self::echo_rpc) with an explicit timeout.
    pub fn echo_rpc_with_timeout(
        &self,
        msg: &str,
        timeout: Duration,
    ) -> Result<(bool, Option<String>)> {
        let service = format!("{ECHO_PACKAGE}.{ECHO_SERVICE}");
        let args = RpcArgs::new().arg("msg", msg);
        let response = self.rpc_with_timeout(&service, ECHO_METHOD, &args, timeout)?;
        match response.into_parts() {
            (true, Some(payload)) => {
                let echoed = decode_string_field(&payload, ECHO_MSG_FIELD)?;
                Ok((true, Some(echoed.unwrap_or_default())))
            }
            _ => Ok((false, None)),
        }
    }

    fn lock_session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transport for HdlcRpcTransport {
    fn properties(&self) -> TransportProperties {
        self.properties
    }

    fn is_open(&self) -> bool {
        let session = self.lock_session();
        session.state == TransportState::Open && session.link.is_some() && session.reader.is_alive()
    }

    fn do_open(&self) -> hdlclink_transport::Result<()> {
        let mut session = self.lock_session();
        session.state = TransportState::Opening;

        let link = match self.opener.open_link() {
            Ok(link) => link,
            Err(err) => {
                session.state = TransportState::Closed;
                return Err(err);
            }
        };

        let router = FrameRouter::new(
            self.routes.clone(),
            Arc::clone(&self.channel),
            Arc::clone(&self.logs),
        );
        let decoder = FrameDecoder::with_config(self.frame_config);
        let liveness = match session.reader.start(Arc::clone(&link), decoder, router) {
            Ok(liveness) => liveness,
            Err(err) => {
                if let Err(release_err) = link.release() {
                    warn!(error = %release_err, "failed to release link after reader start failure");
                }
                session.state = TransportState::Closed;
                return Err(err);
            }
        };

        self.channel
            .attach(Arc::clone(&link), liveness, self.frame_config);
        session.link = Some(link);
        session.state = TransportState::Open;
        info!(address = %self.opener.address(), "transport open");
        Ok(())
    }

    fn do_close(&self) -> hdlclink_transport::Result<()> {
        let mut session = self.lock_session();
        let was = session.state;
        session.state = TransportState::Closing;

        self.channel.detach();
        // Stays Closing if the reader cannot be stopped.
        session.reader.stop()?;

        if let Some(link) = session.link.take() {
            if let Err(err) = link.release() {
                warn!(error = %err, "failed to release link");
            }
        }
        session.state = TransportState::Closed;

        if was != TransportState::Closed {
            info!(address = %self.opener.address(), "transport closed");
        }
        Ok(())
    }

    fn do_read(&self, _size: usize, timeout: Duration) -> hdlclink_transport::Result<Bytes> {
        Ok(self.logs.pop_timeout(timeout).unwrap_or_default())
    }

    fn do_write(&self, data: &[u8], _timeout: Duration) -> hdlclink_transport::Result<usize> {
        debug!(len = data.len(), "raw writes are not supported; use rpc");
        Ok(0)
    }
}

impl Drop for HdlcRpcTransport {
    fn drop(&mut self) {
        if let Err(err) = self.do_close() {
            warn!(error = %err, "failed to close transport on drop");
        }
    }
}

impl std::fmt::Debug for HdlcRpcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HdlcRpcTransport")
            .field("address", &self.opener.address())
            .field("state", &self.state())
            .field("routes", &self.routes)
            .field("rpc_timeout", &self.rpc_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use hdlclink_transport::{LoopbackOpener, TransportError};

    use super::*;

    fn loopback() -> (HdlcRpcTransport, LoopbackOpener) {
        let opener = LoopbackOpener::new();
        let transport = HdlcRpcTransport::with_opener(
            Box::new(opener.clone()),
            ServiceRegistry::new(),
            &TransportConfig::default(),
        )
        .unwrap();
        (transport, opener)
    }

    /// Opener that always fails, for the partial-open path.
    struct RefusingOpener;

    impl LinkOpener for RefusingOpener {
        fn open_link(&self) -> hdlclink_transport::Result<Arc<dyn Link>> {
            Err(TransportError::Io(std::io::Error::from(
                std::io::ErrorKind::PermissionDenied,
            )))
        }

        fn address(&self) -> String {
            "refusing".to_string()
        }
    }

    #[test]
    fn new_requires_address() {
        let err = HdlcRpcTransport::new(&TransportConfig::default()).unwrap_err();
        assert!(matches!(err, RpcError::Config(_)));
    }

    #[test]
    fn new_does_not_open() {
        let config = TransportConfig {
            comms_address: "/nonexistent/hdlclink/ttyUSB9".into(),
            ..TransportConfig::default()
        };
        let transport = HdlcRpcTransport::new(&config).unwrap();
        assert_eq!(transport.state(), TransportState::Closed);
        assert_eq!(transport.address(), "/nonexistent/hdlclink/ttyUSB9");
        assert!(matches!(transport.open(), Err(TransportError::Open { .. })));
        assert_eq!(transport.state(), TransportState::Closed);
    }

    #[test]
    fn open_and_close() {
        let (transport, opener) = loopback();
        assert!(!transport.is_open());

        transport.open().unwrap();
        assert!(transport.is_open());
        assert_eq!(transport.state(), TransportState::Open);
        assert_eq!(opener.open_count(), 1);

        // Already open: no second link.
        transport.open().unwrap();
        assert_eq!(opener.open_count(), 1);

        transport.close().unwrap();
        assert!(!transport.is_open());
        assert_eq!(transport.state(), TransportState::Closed);
    }

    #[test]
    fn failed_open_leaves_closed() {
        let transport = HdlcRpcTransport::with_opener(
            Box::new(RefusingOpener),
            ServiceRegistry::new(),
            &TransportConfig::default(),
        )
        .unwrap();
        assert!(transport.open().is_err());
        assert!(!transport.is_open());
        assert_eq!(transport.state(), TransportState::Closed);
        transport.close().unwrap();
    }

    #[test]
    fn read_and_write_when_closed() {
        let (transport, _opener) = loopback();
        let timeout = Duration::from_millis(10);
        assert!(transport.read(64, timeout).unwrap().is_none());
        assert!(transport.write(b"x", timeout).unwrap().is_none());
    }

    #[test]
    fn write_is_noop_when_open() {
        let (transport, _opener) = loopback();
        transport.open().unwrap();
        assert_eq!(
            transport.write(b"ignored", Duration::from_millis(10)).unwrap(),
            Some(0)
        );
        transport.close().unwrap();
    }

    #[test]
    fn read_times_out_empty() {
        let (transport, _opener) = loopback();
        transport.open().unwrap();
        let chunk = transport.read(64, Duration::from_millis(20)).unwrap();
        assert_eq!(chunk.as_deref(), Some(b"".as_ref()));
        transport.close().unwrap();
    }

    #[test]
    fn rpc_on_closed_transport_is_nack() {
        let (transport, opener) = loopback();
        let response = transport
            .rpc("pw.rpc.EchoService", "Echo", &RpcArgs::new().arg("msg", "hi"))
            .unwrap();
        assert_eq!(response, RpcResponse::nack());
        assert_eq!(opener.open_count(), 0);
    }

    #[test]
    fn rpc_unknown_names_are_errors() {
        let (transport, _opener) = loopback();
        assert!(matches!(
            transport.rpc("NoSuchService", "Echo", &RpcArgs::new()),
            Err(RpcError::UnknownService(_))
        ));
        assert!(matches!(
            transport.rpc("EchoService", "Shout", &RpcArgs::new()),
            Err(RpcError::UnknownMethod { .. })
        ));
        assert!(matches!(
            transport.rpc("EchoService", "Echo", &RpcArgs::new().arg("text", "hi")),
            Err(RpcError::UnknownArgument { .. })
        ));
    }

    #[test]
    fn config_default_package_applied() {
        let config = TransportConfig {
            default_package: Some("pw.rpc".into()),
            ..TransportConfig::default()
        };
        let transport = HdlcRpcTransport::with_opener(
            Box::new(LoopbackOpener::new()),
            ServiceRegistry::new(),
            &config,
        )
        .unwrap();
        assert_eq!(transport.registry().default_package(), Some("pw.rpc"));
    }

    #[test]
    fn drop_closes_open_transport() {
        let (transport, opener) = loopback();
        transport.open().unwrap();
        let mut device = opener.take_device_end().unwrap();
        drop(transport);

        // The host end is gone once the transport is dropped.
        use std::io::Read;
        device
            .set_read_timeout(Some(Duration::from_secs(1)))
            .unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(device.read(&mut buf).unwrap(), 0);
    }
}
