//! Drive the echo service of a simulated device over a loopback link.
//!
//! Run with:
//!   cargo run -p hdlclink --example loopback-echo

use hdlclink::rpc::RpcArgs;
use hdlclink::sim::DeviceSimulator;
use hdlclink::transport::LoopbackOpener;
use hdlclink::{HdlcRpcTransport, ServiceRegistry, Transport, TransportConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opener = LoopbackOpener::new();
    let transport = HdlcRpcTransport::with_opener(
        Box::new(opener.clone()),
        ServiceRegistry::new(),
        &TransportConfig::default(),
    )?;
    transport.open()?;

    let device_end = opener
        .take_device_end()
        .ok_or("loopback opener did not park a device end")?;
    let device = DeviceSimulator::spawn(device_end)?;

    for word in ["ping", "hello", "goodbye"] {
        let (ack, echoed) = transport.echo_rpc(word)?;
        eprintln!("echo {word:?}: ack={ack} echoed={echoed:?}");
    }

    // The same call, addressed by service and method name.
    let response = transport.rpc(
        "pw.rpc.EchoService",
        "Echo",
        &RpcArgs::new().arg("msg", "by name"),
    )?;
    eprintln!("rpc by name: ack={}", response.ack);

    transport.close()?;
    eprintln!("device answered {} requests", device.join()?);
    Ok(())
}
