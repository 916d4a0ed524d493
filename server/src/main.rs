use std::error::Error;
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};
use rhserial::{Config, Event, Node, Target};

const ANSWER: &[u8] = b"Hello back to you, client!";

/// Answers every message it receives.
#[derive(Parser)]
struct Args {
    /// Link to use: a serial port path, tcp://host:port, tcp-listen://addr:port or unix://path.
    target: Target,

    /// Baud rate of a serial port target (default 9600, or the `@baud` suffix).
    #[clap(long)]
    baud: Option<u32>,

    /// Address of this node.
    #[clap(long, default_value_t = 0x01)]
    address: u8,

    /// Receive frames addressed to any node.
    #[clap(long, default_value_t = false)]
    promiscuous: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let target = match args.baud {
        Some(baud) => args.target.with_baud(baud),
        None => args.target,
    };
    let config = Config::new(args.address).with_promiscuous(args.promiscuous);
    let node = Arc::new(Node::new(target, config)?);
    let mut events = node.take_events().ok_or("event channel already taken")?;

    node.init().await?;
    info!("Server running at {:#04x}. Now start the client...", node.address());

    while let Some(event) = events.recv().await {
        match event {
            Event::Message(msg) => {
                let sender = msg.from();
                info!(
                    "-> received {} bytes from {:#04x}: {:?}",
                    msg.len(),
                    sender,
                    String::from_utf8_lossy(&msg.data)
                );

                if msg.to() != node.address() && !msg.header.is_broadcast() {
                    continue;
                }

                let node = node.clone();
                tokio::spawn(async move {
                    match node.send(sender, ANSWER).await {
                        Ok(()) => info!(
                            "<- sent to {:#04x}: {:?}",
                            sender,
                            String::from_utf8_lossy(ANSWER)
                        ),
                        Err(e) => warn!("<- ERROR {}", e),
                    }
                });
            }
            Event::Started => info!("* The receiver has been started."),
            Event::Stopped => {
                info!("* The receiver has been stopped.");
                break;
            }
            Event::Initialized => {}
            Event::Error(e) => error!("Link error: {}", e),
        }
    }

    node.close().await?;
    Ok(())
}
