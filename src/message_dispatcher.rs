use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use crate::message::Message;

/// Application side of the receive path: called for every message that is ready for
///  processing, in sequence order for sequenced messages. Elements of a stack are dispatched
///  individually.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    async fn on_message(&self, message: &Message);
}
