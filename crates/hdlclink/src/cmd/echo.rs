use hdlclink_rpc::Transport;

use crate::cmd::{build_transport, close_transport, parse_timeout, EchoArgs};
use crate::exit::{rpc_error, transport_error, CliResult, FAILURE, SUCCESS};
use crate::output::{print_echo, OutputFormat};

pub fn run(args: EchoArgs, format: OutputFormat) -> CliResult<i32> {
    let transport = build_transport(&args.device)?;
    let timeout = match args.timeout.as_deref() {
        Some(timeout) => parse_timeout(timeout)?,
        None => transport.rpc_timeout(),
    };

    transport
        .open()
        .map_err(|err| transport_error("open failed", err))?;
    let result = transport.echo_rpc_with_timeout(&args.message, timeout);
    close_transport(&transport)?;
    let (ack, echoed) = result.map_err(|err| rpc_error("echo failed", err))?;

    print_echo(
        &transport.address(),
        &args.message,
        ack,
        echoed.as_deref(),
        format,
    );
    Ok(if ack { SUCCESS } else { FAILURE })
}
