//! Two nodes talking over an in-memory link.
//!
//! Run with `RUST_LOG=debug cargo run --example loopback` to watch the
//! acknowledgements go by.

use std::error::Error;

use log::info;
use rhserial::{BROADCAST_ADDRESS, Config, MemoryTransport, Node};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let (left, right) = MemoryTransport::pair();
    let server = Node::new(left, Config::new(0x01))?;
    let client = Node::new(right, Config::new(0x02))?;

    let mut server_events = server.take_events().ok_or("server events taken")?;
    server.init().await?;
    client.init().await?;

    client.send(0x01, b"Hello server!").await?;
    info!("Acknowledged after {} retransmissions", client.retransmissions());

    client.send(BROADCAST_ADDRESS, b"Hello everybody!").await?;

    let mut received = 0;
    while received < 2 {
        let Some(event) = server_events.recv().await else {
            break;
        };
        if let Some(msg) = event.into_message() {
            info!(
                "Server got {:?} from {:#04x} (id {})",
                String::from_utf8_lossy(&msg.data),
                msg.from(),
                msg.id()
            );
            received += 1;
        }
    }

    client.close().await?;
    server.close().await?;
    Ok(())
}
