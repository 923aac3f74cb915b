use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use anyhow::bail;
use async_trait::async_trait;
use clap::Parser;
use clap_derive::Parser;
use seqrelay::config::ReliabilityConfig;
use seqrelay::message::{Message, Payload};
use seqrelay::message_dispatcher::MessageDispatcher;
use seqrelay::peer::Peer;
use seqrelay::sequence::SenderId;
use seqrelay::transport::LossyTransport;
use seqrelay::udp_transport::UdpTransport;
use tokio::time::{sleep, timeout, Instant};
use tracing::{info, warn, Level};

const KIND_DATA: u16 = 1;
const KIND_HEARTBEAT: u16 = 2;

const SERVER_ID: SenderId = SenderId(1);

/// Broadcasts a stream of numbered messages from a server to a number of clients over UDP on
///  localhost, simulating packet loss, and waits until every client received every message in
///  order.
#[derive(Parser)]
struct Args {
    #[clap(long, default_value_t = 3)]
    clients: u32,

    #[clap(long, default_value_t = 1000)]
    messages: u32,

    /// percentage of datagrams that are dropped by every sender
    #[clap(long, default_value_t = 10)]
    loss: u8,

    /// send each message separately instead of stacking them
    #[clap(long, default_value_t = false)]
    no_stacking: bool,

    #[clap(long, default_value_t = false)]
    per_client_sequences: bool,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

fn message_number(data: &[u8]) -> Option<u32> {
    data.get(..4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_be_bytes)
}

/// counts data messages, verifying they arrive in order
struct CountingDispatcher {
    client_id: SenderId,
    num_received: AtomicUsize,
}

#[async_trait]
impl MessageDispatcher for CountingDispatcher {
    async fn on_message(&self, message: &Message) {
        if let Payload::Application { kind: KIND_DATA, data, .. } = &message.payload {
            let number = match message_number(data) {
                Some(number) => number,
                None => {
                    warn!("client {} received a data message with {} bytes - skipping", self.client_id, data.len());
                    return;
                }
            };
            let expected = self.num_received.load(Ordering::Acquire) as u32;
            if number != expected {
                warn!("client {} received message {} out of order, expected {}", self.client_id, number, expected);
            }
            self.num_received.fetch_add(1, Ordering::AcqRel);
        }
    }
}

struct NoopDispatcher {}

#[async_trait]
impl MessageDispatcher for NoopDispatcher {
    async fn on_message(&self, _message: &Message) {}
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.loss >= 100 {
        bail!("loss percentage must be below 100");
    }

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let mut server_config = ReliabilityConfig::new(SERVER_ID);
    server_config.resolve_every_client_message = args.per_client_sequences;
    let server_config = Arc::new(server_config);

    let server_transport = Arc::new(UdpTransport::bind("127.0.0.1:0").await?);
    let server_addr = server_transport.local_addr()?;
    let server = Arc::new(Peer::new(
        server_config.clone(),
        Arc::new(LossyTransport::new(server_transport.clone(), args.loss)),
        Arc::new(NoopDispatcher {}),
    )?);
    server.spawn_active_loop();
    {
        let server_transport = server_transport.clone();
        let server = server.clone();
        tokio::spawn(async move { server_transport.recv_loop(server).await });
    }
    info!("server listening on {:?}", server_addr);

    let mut clients = Vec::new();
    for n in 0..args.clients {
        let client_id = SenderId(n + 2);
        let transport = Arc::new(UdpTransport::bind("127.0.0.1:0").await?);
        transport.register_peer(SERVER_ID, server_addr).await;

        let dispatcher = Arc::new(CountingDispatcher {
            client_id,
            num_received: AtomicUsize::new(0),
        });
        let client = Arc::new(Peer::new(
            Arc::new(ReliabilityConfig::new(client_id)),
            Arc::new(LossyTransport::new(transport.clone(), args.loss)),
            dispatcher.clone(),
        )?);
        client.spawn_active_loop();
        {
            let transport = transport.clone();
            let client = client.clone();
            tokio::spawn(async move { transport.recv_loop(client).await });
        }
        clients.push((client, dispatcher));
    }

    // clients announce themselves until the server knows all of them
    timeout(Duration::from_secs(10), async {
        while server.known_peers().await.len() < clients.len() {
            for (client, _) in &clients {
                client.send(Message::keep_alive().to(SERVER_ID)).await;
            }
            sleep(Duration::from_millis(20)).await;
        }
    }).await?;
    info!("all {} clients connected", clients.len());

    let start = Instant::now();
    for number in 0..args.messages {
        server.send(Message::reliable(KIND_DATA, !args.no_stacking, number.to_be_bytes().to_vec())).await;
    }
    server.flush_all().await;

    // the last messages may be lost, and only a later sequence id exposes the gap
    let all_received = timeout(Duration::from_secs(30), async {
        loop {
            let complete = clients.iter()
                .all(|(_, dispatcher)| dispatcher.num_received.load(Ordering::Acquire) >= args.messages as usize);
            if complete {
                break;
            }
            server.send(Message::reliable(KIND_HEARTBEAT, false, Vec::new())).await;
            sleep(Duration::from_millis(50)).await;
        }
    }).await;

    for (client, dispatcher) in &clients {
        info!("client {}: received {} of {} messages, {:?}", client.self_id(), dispatcher.num_received.load(Ordering::Acquire), args.messages, client.net_stats().snapshot());
    }
    info!("server: {:?}", server.net_stats().snapshot());

    if all_received.is_err() {
        bail!("not all messages were received");
    }
    info!("all messages received after {:?}", start.elapsed());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty(vec![], None)]
    #[case::too_short(vec![0, 0, 1], None)]
    #[case::exact(vec![0, 0, 1, 2], Some(258))]
    #[case::longer(vec![0, 0, 0, 7, 9], Some(7))]
    fn test_message_number(#[case] data: Vec<u8>, #[case] expected: Option<u32>) {
        assert_eq!(message_number(&data), expected);
    }
}
