use std::path::PathBuf;

/// Errors raised by the RPC layer.
///
/// A call that simply gets no acknowledgement (timeout, error status, dead
/// reader) is not an error; it comes back as a negative
/// [`RpcResponse`](crate::RpcResponse). These variants cover misuse and
/// infrastructure failures.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] hdlclink_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] hdlclink_frame::FrameError),

    /// The service is not present in the registry.
    #[error("unknown service '{0}'")]
    UnknownService(String),

    /// A short service name matches services in more than one package.
    #[error("service '{service}' is ambiguous: {}", .candidates.join(", "))]
    AmbiguousService {
        service: String,
        candidates: Vec<String>,
    },

    /// The service exists but has no such method.
    #[error("unknown method '{method}' on service '{service}'")]
    UnknownMethod { service: String, method: String },

    /// A keyword argument does not name a request field.
    #[error("method '{method}' has no request field '{argument}'")]
    UnknownArgument { method: String, argument: String },

    /// A keyword argument value does not fit the request field.
    #[error("invalid value for '{argument}': {reason}")]
    InvalidArgument { argument: String, reason: String },

    /// An inbound packet could not be decoded.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// A service descriptor could not be read.
    #[error("failed to load service descriptor: {0}")]
    LoadFailed(String),

    /// A service descriptor was read but is not usable.
    #[error("invalid service descriptor {path}: {message}")]
    InvalidDescriptor { path: PathBuf, message: String },

    /// Transport configuration is inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RpcError>;
