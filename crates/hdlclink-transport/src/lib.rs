//! Transport lifecycle contract and physical links.
//!
//! Every device transport honors the same open/close/read/write surface
//! defined by [`Transport`]. Concrete transports own a [`Link`]:
//! - Serial device nodes (exclusive advisory lock, raw line discipline)
//! - In-process loopback socket pairs (tests, simulators)
//!
//! This is the lowest layer of hdlclink. Framing and RPC build on top of
//! the [`Link`] handles provided here.

pub mod error;
pub mod link;
pub mod traits;

#[cfg(unix)]
pub mod loopback;
#[cfg(unix)]
pub mod serial;

pub use error::{Result, TransportError};
pub use link::{Link, LinkOpener};
pub use traits::{Transport, TransportProperties, TransportState};

#[cfg(unix)]
pub use loopback::{LoopbackOpener, SocketLink};
#[cfg(unix)]
pub use serial::{SerialOpener, SerialPort};
