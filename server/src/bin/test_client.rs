//! Headless load client: connects, pairs UDP, streams state updates and a few
//! reliable messages, then reports what the server relayed back.

use clap::Parser;
use log::{debug, info, warn};
use netplus_core::{DataItem, ItemFlags, Packet};
use netplus_server::client::{Client, ClientConfig};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server TCP address
    #[clap(short, long, env = "NETPLUS_SERVER", default_value = "127.0.0.1:8080")]
    server: SocketAddr,
    /// Concurrent clients to run
    #[clap(short, long, default_value = "1")]
    clients: usize,
    /// Unreliable state updates per client
    #[clap(short, long, default_value = "100")]
    updates: u32,
    /// Reliable messages per client
    #[clap(short, long, default_value = "10")]
    messages: u32,
    /// Pause between sends
    #[clap(long, default_value = "16")]
    interval_ms: u64,
    /// Payload bytes per item
    #[clap(long, default_value = "64")]
    payload: usize,
    /// Stay on TCP only
    #[clap(long)]
    no_udp: bool,
    /// How long to keep listening after the last send
    #[clap(long, default_value = "1000")]
    linger_ms: u64,
}

#[derive(Debug, Default)]
struct Report {
    sent: u32,
    received: u32,
    reliable: u32,
    udp_active: bool,
}

async fn run_client(index: usize, args: &Args) -> Result<Report, Box<dyn std::error::Error + Send + Sync>> {
    let config = ClientConfig {
        enable_udp: !args.no_udp,
        ..Default::default()
    };
    let mut client = Client::connect(args.server, config).await?;
    info!(
        "Client {} connected as {} (udp {})",
        index,
        client.id(),
        if client.udp_active() { "paired" } else { "off" }
    );

    let mut report = Report {
        udp_active: client.udp_active(),
        ..Default::default()
    };
    let pause = Duration::from_millis(args.interval_ms);
    let total = args.updates + args.messages;
    // spread the reliable messages evenly through the update stream
    let stride = if args.messages == 0 { 0 } else { (total / args.messages).max(1) };
    let mut reliable_left = args.messages;
    for n in 0..total {
        let mut payload = vec![0u8; args.payload];
        let stamp = 4.min(args.payload);
        payload[..stamp].copy_from_slice(&n.to_be_bytes()[..stamp]);
        let reliable = reliable_left > 0 && (stride > 0 && n % stride == 0 || total - n == reliable_left);
        let item = if reliable {
            reliable_left -= 1;
            DataItem::new(1, ItemFlags::NONE, payload)
        } else {
            DataItem::update(0, payload)
        };
        client.send(item)?;
        report.sent += 1;

        while let Some(packet) = client.recv_timeout(Duration::ZERO).await {
            tally(&mut report, &packet);
        }
        tokio::time::sleep(pause).await;
    }

    let linger_until = Instant::now() + Duration::from_millis(args.linger_ms);
    while let Some(left) = linger_until.checked_duration_since(Instant::now()) {
        match client.recv_timeout(left).await {
            Some(packet) => tally(&mut report, &packet),
            None => break,
        }
    }

    client.close().await?;
    Ok(report)
}

fn tally(report: &mut Report, packet: &Packet) {
    if let Packet::Data(item) = packet {
        report.received += 1;
        if !item.flags.is_unreliable() {
            report.reliable += 1;
        }
        debug!(
            "Item on channel {} from {:?}",
            item.channel,
            item.meta.map(|meta| meta.sender)
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = std::sync::Arc::new(Args::parse());

    let started = Instant::now();
    let mut handles = Vec::with_capacity(args.clients);
    for index in 0..args.clients {
        let args = std::sync::Arc::clone(&args);
        handles.push(tokio::spawn(async move { (index, run_client(index, &args).await) }));
    }

    for handle in handles {
        match handle.await? {
            (index, Ok(report)) => info!(
                "Client {}: sent {}, received {} ({} reliable), udp {}",
                index,
                report.sent,
                report.received,
                report.reliable,
                if report.udp_active { "on" } else { "off" }
            ),
            (index, Err(e)) => warn!("Client {} failed: {}", index, e),
        }
    }
    info!("Finished in {:?}", started.elapsed());
    Ok(())
}
