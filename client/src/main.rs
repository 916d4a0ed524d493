use std::error::Error;
use std::time::Duration;

use clap::Parser;
use log::{error, info};
use rhserial::{Config, Event, Node, Target};

const SERVER_ADDRESS: u8 = 0x01;
const MESSAGE: &[u8] = b"Hello server!";
const SEND_COUNT: usize = 5;

/// Says hello to the server node five times.
#[derive(Parser)]
struct Args {
    /// Link to use: a serial port path, tcp://host:port, tcp-listen://addr:port or unix://path.
    target: Target,

    /// Baud rate of a serial port target (default 9600, or the `@baud` suffix).
    #[clap(long)]
    baud: Option<u32>,

    /// Address of this node.
    #[clap(long, default_value_t = 0x02)]
    address: u8,

    /// Send without waiting for acknowledgements.
    #[clap(long, default_value_t = false)]
    unreliable: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let target = match args.baud {
        Some(baud) => args.target.with_baud(baud),
        None => args.target,
    };
    let config = Config::new(args.address).with_reliable(!args.unreliable);
    let node = Node::new(target, config)?;
    let mut events = node.take_events().ok_or("event channel already taken")?;

    let receiver = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                Event::Message(msg) => info!(
                    "-> received {} bytes from {:#04x}: {:?}",
                    msg.len(),
                    msg.from(),
                    String::from_utf8_lossy(&msg.data)
                ),
                Event::Started => info!("* The receiver has been started."),
                Event::Stopped => {
                    info!("* The receiver has been stopped.");
                    break;
                }
                Event::Initialized => {}
                Event::Error(e) => error!("Link error: {}", e),
            }
        }
    });

    node.init().await?;
    info!("Client running. Sending hello to the server {} times...", SEND_COUNT);

    for sent in 1..=SEND_COUNT {
        match node.send(SERVER_ADDRESS, MESSAGE).await {
            Ok(()) => info!(
                "<- sent to {:#04x}: {:?}",
                SERVER_ADDRESS,
                String::from_utf8_lossy(MESSAGE)
            ),
            Err(e) => error!("<- ERROR {}", e),
        }
        if sent < SEND_COUNT {
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    tokio::time::sleep(Duration::from_secs(1)).await;
    info!("Retransmissions: {}", node.retransmissions());
    node.close().await?;
    let _ = receiver.await;

    info!("Client done.");
    Ok(())
}
