use std::net::SocketAddr;
use std::sync::Arc;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::RwLock;
use tracing::{debug, error, trace, warn};
use crate::message::Message;
use crate::peer::Peer;
use crate::sequence::SenderId;
use crate::transport::MessageSender;
use crate::wire;

/// the maximum payload of a UDP datagram over IPV4
const MAX_DATAGRAM_SIZE: usize = 65507;

/// Sends messages as UDP datagrams, one message per datagram. Peers are addressed by their
///  registered socket address; a peer that sends a datagram is registered with its source
///  address automatically.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    peer_addrs: RwLock<FxHashMap<SenderId, SocketAddr>>,
}

impl UdpTransport {
    pub async fn bind(addr: impl ToSocketAddrs) -> anyhow::Result<UdpTransport> {
        let socket = UdpSocket::bind(addr).await?;
        debug!("bound UDP transport to {:?}", socket.local_addr());

        Ok(UdpTransport {
            socket: Arc::new(socket),
            peer_addrs: Default::default(),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn register_peer(&self, peer: SenderId, addr: SocketAddr) {
        if let Some(previous) = self.peer_addrs.write().await.insert(peer, addr) {
            if previous != addr {
                debug!("peer {} moved from {:?} to {:?}", peer, previous, addr);
            }
        }
    }

    pub async fn peer_addr(&self, peer: SenderId) -> Option<SocketAddr> {
        self.peer_addrs.read().await
            .get(&peer)
            .cloned()
    }

    /// Receives datagrams and feeds them to the peer, in the order they arrive. This function
    ///  never returns, it runs until it is taken out of dispatch.
    pub async fn recv_loop(&self, peer: Arc<Peer>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (num_read, from) = match self.socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };

            let message = match wire::decode(&buf[..num_read]) {
                Ok(message) => message,
                Err(e) => {
                    warn!("received undecodable datagram from {:?}, dropping: {}", from, e);
                    continue;
                }
            };

            let sender = message.sender_id;
            if self.peer_addr(sender).await != Some(from) {
                self.register_peer(sender, from).await;
                peer.register_peer(sender).await;
            }

            trace!("received {:?} #{} from {}", message.payload, message.sequence_id, sender);
            peer.on_message(message).await;
        }
    }

    async fn send_to(&self, datagram: &[u8], addr: SocketAddr) {
        if let Err(e) = self.socket.send_to(datagram, addr).await {
            error!("error sending datagram to {:?}: {}", addr, e);
        }
    }
}

#[async_trait]
impl MessageSender for UdpTransport {
    async fn send(&self, message: &Message) {
        let datagram = wire::encode(message);
        if datagram.len() > MAX_DATAGRAM_SIZE {
            error!("encoded {:?} has {} bytes which exceeds the maximum datagram size - dropping", message.payload, datagram.len());
            return;
        }

        let addrs = match message.receiver_id {
            Some(receiver) => match self.peer_addr(receiver).await {
                Some(addr) => vec![addr],
                None => {
                    warn!("no address registered for peer {} - dropping {:?}", receiver, message.payload);
                    return;
                }
            },
            None => self.peer_addrs.read().await
                .values()
                .cloned()
                .collect(),
        };

        for addr in addrs {
            self.send_to(&datagram, addr).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReliabilityConfig;
    use crate::message::Payload;
    use crate::message_dispatcher::MessageDispatcher;
    use crate::sequence::SequenceId;
    use std::time::Duration;
    use tokio::runtime::Builder;
    use tokio::sync::Mutex;

    struct CollectingMessageDispatcher {
        messages: Mutex<Vec<Message>>,
    }
    #[async_trait]
    impl MessageDispatcher for CollectingMessageDispatcher {
        async fn on_message(&self, message: &Message) {
            self.messages.lock().await.push(message.clone());
        }
    }

    async fn endpoint(self_id: u32) -> (Arc<UdpTransport>, Arc<Peer>, Arc<CollectingMessageDispatcher>) {
        let transport = Arc::new(UdpTransport::bind("127.0.0.1:0").await.unwrap());
        let dispatcher = Arc::new(CollectingMessageDispatcher { messages: Default::default() });
        let peer = Arc::new(Peer::new(
            Arc::new(ReliabilityConfig::new(SenderId(self_id))),
            transport.clone(),
            dispatcher.clone(),
        ).unwrap());

        let t = transport.clone();
        let p = peer.clone();
        tokio::spawn(async move { t.recv_loop(p).await });

        (transport, peer, dispatcher)
    }

    async fn await_messages(dispatcher: &CollectingMessageDispatcher, expected_len: usize) -> Vec<Message> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let messages = dispatcher.messages.lock().await.clone();
                if messages.len() >= expected_len {
                    return messages;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }).await.unwrap()
    }

    #[test]
    fn test_send_and_receive() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let (server_transport, server, _) = endpoint(1).await;
            let (client_transport, client, client_dispatcher) = endpoint(2).await;

            // only the client knows the server's address up front
            client_transport.register_peer(SenderId(1), server_transport.local_addr().unwrap()).await;

            client.send(Message::unreliable(1, vec![1]).to(SenderId(1))).await;
            // wait for the server to learn the client's address
            tokio::time::timeout(Duration::from_secs(5), async {
                while server.known_peers().await.is_empty() {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }).await.unwrap();
            assert_eq!(server.known_peers().await, vec![SenderId(2)]);
            assert_eq!(server_transport.peer_addr(SenderId(2)).await, Some(client_transport.local_addr().unwrap()));

            for n in 1..=5 {
                server.send(Message::reliable(7, false, vec![n])).await;
            }

            let received = await_messages(&client_dispatcher, 5).await;
            let data = received.iter()
                .map(|m| match &m.payload {
                    Payload::Application { data, .. } => data[0],
                    _ => 0,
                })
                .collect::<Vec<_>>();
            assert_eq!(data, vec![1, 2, 3, 4, 5]);
            assert!(received.iter().all(|m| m.sender_id == SenderId(1)));
        });
    }

    #[test]
    fn test_undecodable_datagram() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let (transport, _peer, dispatcher) = endpoint(1).await;
            let addr = transport.local_addr().unwrap();

            let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            raw.send_to(&[1, 2, 3], addr).await.unwrap();
            raw.send_to(&wire::encode(&Message::unreliable(1, vec![9]).sent_by(SenderId(5))), addr).await.unwrap();

            let received = await_messages(&dispatcher, 1).await;
            assert_eq!(received.len(), 1);
            assert_eq!(transport.peer_addr(SenderId(5)).await, Some(raw.local_addr().unwrap()));
        });
    }

    #[test]
    fn test_largest_request_fits_into_datagram() {
        let absent_ids = (0..wire::MAX_REQUESTED_IDS_PER_MESSAGE as u64)
            .map(|n| SequenceId::from_raw(u64::MAX - n))
            .collect();
        let mut request = Message::request_seq_ids(absent_ids, SenderId(u32::MAX)).sent_by(SenderId(u32::MAX));
        request.sequence_id = SequenceId::from_raw(u64::MAX);
        assert!(wire::encode(&request).len() <= MAX_DATAGRAM_SIZE);
    }

    #[test]
    fn test_send_to_unknown_peer() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let transport = UdpTransport::bind("127.0.0.1:0").await.unwrap();
            // dropped with a warning, no panic and no error
            transport.send(&Message::unreliable(1, vec![1]).to(SenderId(3))).await;
            transport.send(&Message::keep_alive()).await;
        });
    }
}
