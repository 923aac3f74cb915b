use std::sync::Arc;
use tracing::{debug, error, info};
use crate::message::ReliableMode;
use crate::message_log::SentMessageLog;
use crate::net_stats::NetStats;
use crate::sequence::{AddressingMode, SenderId, SequenceId};
use crate::transport::MessageSender;

/// Answers a peer's request for missing sequence ids by re-sending them from the sent message
///  log.
pub struct ResendCoordinator {
    addressing_mode: AddressingMode,
    message_log: Arc<SentMessageLog>,
    transport: Arc<dyn MessageSender>,
    net_stats: Arc<NetStats>,
}

impl ResendCoordinator {
    pub fn new(
        addressing_mode: AddressingMode,
        message_log: Arc<SentMessageLog>,
        transport: Arc<dyn MessageSender>,
        net_stats: Arc<NetStats>,
    ) -> ResendCoordinator {
        ResendCoordinator {
            addressing_mode,
            message_log,
            transport,
            net_stats,
        }
    }

    /// Re-sends all requested messages that are still in the log, returning the number of
    ///  re-sent messages.
    ///
    /// NB: Ids that are not in the log (anymore) are skipped - this does not affect the
    ///      remaining ids, and it is not reported to the caller
    pub async fn on_request_seq_ids(&self, requester: SenderId, absent_ids: &[SequenceId]) -> usize {
        info!("resending absent ids {:?} to {}", absent_ids.iter().map(|id| id.to_raw()).collect::<Vec<_>>(), requester);

        let mut num_resent = 0;
        for &absent_id in absent_ids {
            let key = self.addressing_mode.key(ReliableMode::SequenceNumber, requester, absent_id);

            let message = match self.message_log.lookup(&key) {
                Some(message) => message,
                None => {
                    error!("requested message {} not in log", key);
                    self.net_stats.increment_missing_in_log();
                    continue;
                }
            };

            let resend = message.as_resend_to(requester);
            debug!("resending {:?} #{} to {}", resend.payload, resend.sequence_id, requester);
            self.transport.send(&resend).await;
            self.net_stats.increment_resent_messages();
            num_resent += 1;
        }
        num_resent
    }
}
