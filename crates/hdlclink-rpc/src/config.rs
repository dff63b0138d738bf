use std::path::{Path, PathBuf};
use std::time::Duration;

use hdlclink_frame::{FrameConfig, DEFAULT_MAX_FRAME_SIZE, LOG_ADDRESS, MIN_FRAME_SIZE, RPC_ADDRESS};
use hdlclink_transport::TransportProperties;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RpcError};
use crate::packet::DEFAULT_CHANNEL_ID;
use crate::router::RouteTable;

/// Default time to wait for an RPC response.
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 1000;
/// Default console line speed.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Address assignment for inbound frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RouteConfig {
    pub rpc_address: u8,
    pub log_addresses: Vec<u8>,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            rpc_address: RPC_ADDRESS,
            log_addresses: vec![LOG_ADDRESS],
        }
    }
}

/// Construction-time settings for an [`HdlcRpcTransport`](crate::HdlcRpcTransport).
///
/// Every field has a default, so a JSON config only needs the keys it changes:
///
/// ```
/// use hdlclink_rpc::TransportConfig;
///
/// let config = TransportConfig::from_json_str(
///     r#"{ "comms_address": "/dev/ttyACM0", "rpc_timeout_ms": 250 }"#,
/// ).unwrap();
/// assert_eq!(config.baud_rate, 115_200);
/// assert_eq!(config.rpc_timeout().as_millis(), 250);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    /// Device node of the serial console.
    pub comms_address: String,
    pub baud_rate: u32,
    /// Service descriptor files or directories.
    pub protobufs: Vec<PathBuf>,
    pub auto_reopen: bool,
    pub open_on_start: bool,
    pub rpc_timeout_ms: u64,
    pub channel_id: u32,
    /// Package tried first for bare service names.
    pub default_package: Option<String>,
    pub routes: RouteConfig,
    pub max_frame_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            comms_address: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            protobufs: Vec::new(),
            auto_reopen: true,
            open_on_start: true,
            rpc_timeout_ms: DEFAULT_RPC_TIMEOUT_MS,
            channel_id: DEFAULT_CHANNEL_ID,
            default_package: None,
            routes: RouteConfig::default(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl TransportConfig {
    /// Parse and validate a JSON config document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON config file.
    ///
    /// Relative descriptor paths are resolved against the file's directory.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|err| RpcError::Config(format!("{}: {err}", path.display())))?;
        let mut config = Self::from_json_str(&content)?;
        if let Some(base) = path.parent() {
            for entry in &mut config.protobufs {
                if entry.is_relative() {
                    *entry = base.join(&*entry);
                }
            }
        }
        Ok(config)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.rpc_timeout_ms == 0 {
            return Err(RpcError::Config("rpc_timeout_ms must be positive".into()));
        }
        if self.channel_id == 0 {
            return Err(RpcError::Config("channel_id must be non-zero".into()));
        }
        if self.max_frame_size < MIN_FRAME_SIZE {
            return Err(RpcError::Config(format!(
                "max_frame_size must be at least {MIN_FRAME_SIZE}"
            )));
        }
        self.route_table().map(|_| ())
    }

    pub fn route_table(&self) -> Result<RouteTable> {
        RouteTable::new(self.routes.rpc_address, self.routes.log_addresses.clone())
    }

    pub fn properties(&self) -> TransportProperties {
        TransportProperties {
            auto_reopen: self.auto_reopen,
            open_on_start: self.open_on_start,
        }
    }

    pub fn frame_config(&self) -> FrameConfig {
        FrameConfig {
            max_frame_size: self.max_frame_size,
        }
    }
}
