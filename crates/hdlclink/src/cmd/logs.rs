use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hdlclink_rpc::{HdlcRpcTransport, Transport};
use tracing::{info, warn};

use crate::cmd::{build_transport, close_transport, install_ctrlc_handler, LogsArgs};
use crate::exit::{transport_error, CliError, CliResult, SUCCESS, TRANSPORT_ERROR};
use crate::output::{print_log, OutputFormat};

const READ_SIZE: usize = 4096;
// Bounds how long a Ctrl-C goes unnoticed.
const READ_TIMEOUT: Duration = Duration::from_millis(200);
const REOPEN_BACKOFF: Duration = Duration::from_millis(500);

pub fn run(args: LogsArgs, format: OutputFormat) -> CliResult<i32> {
    let transport = build_transport(&args.device)?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let result = tail(&transport, &running, args.count, format);
    let closed = close_transport(&transport);
    let code = result?;
    closed?;
    Ok(code)
}

/// Print log lines until interrupted or `count` lines were printed.
///
/// Honors the transport's owner flags: `open_on_start` opens before the first
/// read (otherwise the open is deferred to it), and `auto_reopen` decides
/// whether a transport found closed mid-session is reopened or ends the tail.
fn tail(
    transport: &HdlcRpcTransport,
    running: &AtomicBool,
    count: Option<usize>,
    format: OutputFormat,
) -> CliResult<i32> {
    let device = transport.address();
    let props = transport.properties();
    let mut opened = false;

    if props.open_on_start {
        transport
            .open()
            .map_err(|err| transport_error("open failed", err))?;
        opened = true;
        info!(device = %device, "streaming device logs");
    }

    let mut printed = 0usize;
    while running.load(Ordering::SeqCst) {
        if !transport.is_open() {
            if opened && !props.auto_reopen {
                return Err(CliError::new(
                    TRANSPORT_ERROR,
                    format!("{device}: transport closed unexpectedly"),
                ));
            }
            match transport.open() {
                Ok(()) if opened => info!(device = %device, "transport reopened"),
                Ok(()) => info!(device = %device, "streaming device logs"),
                Err(err) if opened => {
                    warn!(device = %device, error = %err, "reopen failed; retrying");
                    std::thread::sleep(REOPEN_BACKOFF);
                    continue;
                }
                Err(err) => return Err(transport_error("open failed", err)),
            }
            opened = true;
        }

        let chunk = match transport.read(READ_SIZE, READ_TIMEOUT) {
            Ok(Some(chunk)) if !chunk.is_empty() => chunk,
            Ok(_) => continue,
            Err(err) => return Err(transport_error("read failed", err)),
        };

        print_log(&chunk, &device, format);
        printed = printed.saturating_add(1);
        if count.is_some_and(|count| printed >= count) {
            break;
        }
    }

    Ok(SUCCESS)
}
