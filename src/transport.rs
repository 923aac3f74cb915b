use std::sync::Arc;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rand::Rng;
use tracing::trace;
use crate::message::Message;

/// This is the abstraction of the unreliable transport: a message handed to it may be delivered,
///  delivered out of order, delivered twice, or silently dropped. It is introduced to facilitate
///  mocking the I/O part away for testing.
///
/// A message without receiver id is a broadcast to all peers known to the transport.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageSender: Send + Sync + 'static {
    async fn send(&self, message: &Message);
}

/// Simulates packet loss by dropping a given percentage of all messages before they reach the
///  wrapped transport.
pub struct LossyTransport {
    inner: Arc<dyn MessageSender>,
    loss_percentage: u8,
}

impl LossyTransport {
    pub fn new(inner: Arc<dyn MessageSender>, loss_percentage: u8) -> LossyTransport {
        LossyTransport {
            inner,
            loss_percentage: loss_percentage.min(100),
        }
    }
}

#[async_trait]
impl MessageSender for LossyTransport {
    async fn send(&self, message: &Message) {
        if rand::rng().random_range(0..100u8) < self.loss_percentage {
            trace!("simulated loss: dropping {:?} #{} to {:?}", message.payload, message.sequence_id, message.receiver_id);
            return;
        }
        self.inner.send(message).await;
    }
}
