//! Embedded RPC client and device log stream over one HDLC link.
//!
//! [`HdlcRpcTransport`] owns a [`Link`](hdlclink_transport::Link), runs a
//! background [`ReaderLoop`] that decodes inbound frames, and demultiplexes
//! them by address:
//! - RPC frames complete the pending call on the [`RpcChannel`]
//! - Log frames queue up for [`Transport::read`]
//!
//! Services and methods are resolved by name through a [`ServiceRegistry`]
//! loaded from JSON descriptors; keyword arguments ([`RpcArgs`]) are encoded
//! into the request message using the method's request schema.

pub mod channel;
pub mod config;
pub mod error;
pub mod packet;
pub mod reader;
pub mod registry;
pub mod router;
pub mod schema;
pub mod transport;
pub mod value;
pub mod wire;

pub use channel::{RpcChannel, RpcResponse};
pub use config::{RouteConfig, TransportConfig};
pub use error::{Result, RpcError};
pub use packet::{ids, PacketType, RpcPacket, Status, DEFAULT_CHANNEL_ID};
pub use reader::{Liveness, ReaderLoop, ReaderState};
pub use registry::{RegistryConfig, ServiceRegistry, DESCRIPTOR_SUFFIX};
pub use router::{FrameRouter, LogQueue, Route, RouteTable};
pub use schema::{FieldKind, FieldSchema, MethodSchema, ServiceSchema};
pub use transport::HdlcRpcTransport;
pub use value::{ProtoMessage, RpcArgs, RpcValue};

pub use hdlclink_transport::{Transport, TransportProperties, TransportState};
