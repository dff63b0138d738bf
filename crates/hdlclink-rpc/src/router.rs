use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use hdlclink_frame::{address_name, Frame, LOG_ADDRESS, RPC_ADDRESS};
use tracing::{trace, warn};

use crate::channel::RpcChannel;
use crate::error::{Result, RpcError};

/// Where frames for an address go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Rpc,
    Log,
}

/// Address-to-route mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTable {
    rpc_address: u8,
    log_addresses: Vec<u8>,
}

impl RouteTable {
    /// Build a table. The RPC address may not double as a log address.
    pub fn new(rpc_address: u8, log_addresses: Vec<u8>) -> Result<Self> {
        if log_addresses.contains(&rpc_address) {
            return Err(RpcError::Config(format!(
                "address {rpc_address} cannot carry both RPC and logs"
            )));
        }
        let mut log_addresses = log_addresses;
        log_addresses.sort_unstable();
        log_addresses.dedup();
        Ok(Self {
            rpc_address,
            log_addresses,
        })
    }

    pub fn route(&self, address: u8) -> Option<Route> {
        if address == self.rpc_address {
            Some(Route::Rpc)
        } else if self.log_addresses.contains(&address) {
            Some(Route::Log)
        } else {
            None
        }
    }

    pub fn rpc_address(&self) -> u8 {
        self.rpc_address
    }

    pub fn log_addresses(&self) -> &[u8] {
        &self.log_addresses
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self {
            rpc_address: RPC_ADDRESS,
            log_addresses: vec![LOG_ADDRESS],
        }
    }
}

/// FIFO of device log lines.
///
/// Filled by the reader thread, drained by [`read`](hdlclink_transport::Transport::read).
#[derive(Debug, Default)]
pub struct LogQueue {
    lines: Mutex<VecDeque<Bytes>>,
    available: Condvar,
}

impl LogQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, line: Bytes) {
        self.lock().push_back(line);
        self.available.notify_one();
    }

    /// Pop the oldest line, waiting up to `timeout` for one to arrive.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Bytes> {
        let deadline = Instant::now().checked_add(timeout);
        let mut lines = self.lock();
        loop {
            if let Some(line) = lines.pop_front() {
                return Some(line);
            }
            let Some(deadline) = deadline else {
                lines = self
                    .available
                    .wait(lines)
                    .unwrap_or_else(PoisonError::into_inner);
                continue;
            };
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .available
                .wait_timeout(lines, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            lines = guard;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Bytes>> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Dispatches decoded frames by address.
#[derive(Debug, Clone)]
pub struct FrameRouter {
    routes: RouteTable,
    channel: Arc<RpcChannel>,
    logs: Arc<LogQueue>,
}

impl FrameRouter {
    pub fn new(routes: RouteTable, channel: Arc<RpcChannel>, logs: Arc<LogQueue>) -> Self {
        Self {
            routes,
            channel,
            logs,
        }
    }

    pub fn route(&self, frame: Frame) {
        if !frame.is_valid() {
            trace!(
                address = frame.address,
                status = frame.status.as_str(),
                "dropping invalid frame"
            );
            return;
        }

        match self.routes.route(frame.address) {
            Some(Route::Rpc) => self.channel.process_packet(frame.payload),
            Some(Route::Log) => self.logs.push(log_line(&frame.payload)),
            None => warn!(
                address = frame.address,
                name = address_name(frame.address),
                len = frame.payload.len(),
                "dropping frame for unrouted address"
            ),
        }
    }
}

fn log_line(payload: &[u8]) -> Bytes {
    let mut line = BytesMut::with_capacity(payload.len() + 1);
    line.put_slice(payload);
    line.put_u8(b'\n');
    line.freeze()
}
