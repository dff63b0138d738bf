//! Tail log lines from a simulated device while issuing calls on another thread.
//!
//! Run with:
//!   cargo run -p hdlclink --example log-tail

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hdlclink::sim::DeviceSimulator;
use hdlclink::transport::LoopbackOpener;
use hdlclink::{HdlcRpcTransport, ServiceRegistry, Transport, TransportConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opener = LoopbackOpener::new();
    let transport = Arc::new(HdlcRpcTransport::with_opener(
        Box::new(opener.clone()),
        ServiceRegistry::new(),
        &TransportConfig::default(),
    )?);
    transport.open()?;

    let device = DeviceSimulator::spawn(
        opener
            .take_device_end()
            .ok_or("loopback opener did not park a device end")?,
    )?;
    for i in 0..5 {
        device.send_log(&format!("boot stage {i}"))?;
    }

    let caller = {
        let transport = Arc::clone(&transport);
        thread::spawn(move || {
            for i in 0..3 {
                match transport.echo_rpc(&format!("heartbeat {i}")) {
                    Ok((ack, _)) => eprintln!("heartbeat {i}: ack={ack}"),
                    Err(err) => eprintln!("heartbeat {i}: {err}"),
                }
            }
        })
    };

    // An empty chunk means nothing arrived within the timeout.
    while let Some(chunk) = transport.read(4096, Duration::from_millis(200))? {
        if chunk.is_empty() {
            break;
        }
        print!("{}", String::from_utf8_lossy(&chunk));
    }

    caller.join().map_err(|_| "caller thread panicked")?;
    transport.close()?;
    device.join()?;
    Ok(())
}
