//! Split a device byte stream into HDLC frames with tokio.
//!
//! The device side writes a few log lines, a corrupted frame and an RPC
//! frame; the host side decodes them with `HdlcCodec` and sorts by address.
//!
//! Run with:
//!   cargo run -p hdlclink --features async --example async-frames

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio_util::codec::{FramedRead, FramedWrite};

use hdlclink::frame::{address_name, Frame, HdlcCodec, LOG_ADDRESS, RPC_ADDRESS};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (host, device) = UnixStream::pair()?;

    let device_task = tokio::spawn(async move {
        let mut frames = FramedWrite::new(device, HdlcCodec::new());
        for i in 0..3 {
            frames
                .send(Frame::new(LOG_ADDRESS, Bytes::from(format!("boot stage {i}"))))
                .await?;
        }
        // Line noise: skipped by the decoder, which resyncs on the next flag.
        frames.get_mut().write_all(&[0x7E, 0x01, 0x03, 0xAA, 0x7E]).await?;
        frames
            .send(Frame::new(RPC_ADDRESS, Bytes::from_static(b"\x08\x01")))
            .await?;
        frames
            .send(Frame::new(LOG_ADDRESS, Bytes::from_static(b"ready")))
            .await?;
        Ok::<_, hdlclink::frame::FrameError>(())
    });

    let mut frames = FramedRead::new(host, HdlcCodec::new());
    let mut logs = 0;
    while logs < 4 {
        let Some(frame) = frames.next().await.transpose()? else {
            break;
        };
        if frame.address == LOG_ADDRESS {
            logs += 1;
            println!("{}", String::from_utf8_lossy(&frame.payload));
        } else {
            eprintln!(
                "{} frame, {} byte payload",
                address_name(frame.address),
                frame.payload.len()
            );
        }
    }

    device_task.await??;
    Ok(())
}
