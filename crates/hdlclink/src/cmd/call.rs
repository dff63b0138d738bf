use hdlclink_rpc::Transport;

use crate::cmd::{build_transport, close_transport, parse_pairs, parse_timeout, CallArgs};
use crate::exit::{rpc_error, transport_error, CliResult, FAILURE, SUCCESS};
use crate::output::{print_call, OutputFormat};

pub fn run(args: CallArgs, format: OutputFormat) -> CliResult<i32> {
    let transport = build_transport(&args.device)?;

    // Name and argument problems are reported before touching the device.
    let (_, method) = transport
        .registry()
        .resolve(&args.service, &args.method)
        .map_err(|err| rpc_error("call failed", err))?;
    let pairs = parse_pairs(&args.args)?;
    let rpc_args = method
        .parse_args(pairs.iter().map(|(name, value)| (name.as_str(), value.as_str())))
        .map_err(|err| rpc_error("call failed", err))?;
    let timeout = match args.timeout.as_deref() {
        Some(timeout) => parse_timeout(timeout)?,
        None => transport.rpc_timeout(),
    };

    transport
        .open()
        .map_err(|err| transport_error("open failed", err))?;
    let result = transport.rpc_with_timeout(&args.service, &args.method, &rpc_args, timeout);
    close_transport(&transport)?;
    let response = result.map_err(|err| rpc_error("call failed", err))?;

    print_call(
        &transport.address(),
        &args.service,
        &args.method,
        &response,
        format,
    );
    Ok(if response.ack { SUCCESS } else { FAILURE })
}
