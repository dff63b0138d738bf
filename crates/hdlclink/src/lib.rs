//! Embedded RPC and device log streaming over HDLC serial links.
//!
//! hdlclink drives a device's RPC server and reads its log stream over one
//! serial console, with HDLC frames demultiplexed by address.
//!
//! # Crate Structure
//!
//! - [`transport`]: Transport lifecycle contract, serial and loopback links
//! - [`frame`]: HDLC encoding, decoding and frame I/O
//! - [`rpc`]: RPC packets, service registry, reader loop and [`HdlcRpcTransport`]
//! - [`sim`]: Simulated device for loopback testing (Unix only)

/// Re-export transport types.
pub mod transport {
    pub use hdlclink_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use hdlclink_frame::*;
}

/// Re-export RPC types.
pub mod rpc {
    pub use hdlclink_rpc::*;
}

#[cfg(unix)]
pub mod sim;

pub use hdlclink_rpc::{
    HdlcRpcTransport, RpcArgs, RpcError, RpcResponse, ServiceRegistry, Transport, TransportConfig,
};
