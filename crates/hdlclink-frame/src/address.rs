//! Reserved HDLC addresses.
//!
//! The device multiplexes RPC traffic and plain-text logs over one link by
//! address byte. Everything else is unassigned.

/// Address carrying RPC packets (`'R'`).
pub const RPC_ADDRESS: u8 = b'R';

/// Address carrying device log output (stdout).
pub const LOG_ADDRESS: u8 = 1;

/// Returns a human-readable name for an address.
pub fn address_name(address: u8) -> &'static str {
    match address {
        RPC_ADDRESS => "RPC",
        LOG_ADDRESS => "LOG",
        _ => "UNASSIGNED",
    }
}
