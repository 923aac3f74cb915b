use std::fmt::{Debug, Formatter};
use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::sequence::{SenderId, SequenceId};

/// The delivery guarantee of a message
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ReliableMode {
    /// fire and forget - no sequence id, not logged, never re-sent
    Unreliable = 0,
    /// ordered delivery: the message gets a sequence id, is logged by the sender, and gaps are
    ///  requested by the receiver
    SequenceNumber = 1,
}

#[derive(Clone, Eq, PartialEq)]
pub enum Payload {
    Application {
        /// application-defined message kind, opaque to this crate
        kind: u16,
        stackable: bool,
        data: Bytes,
    },
    KeepAlive,
    /// request to re-send sequenced messages that were not received. The receiver of the
    ///  *request* is the original sender of the missing messages.
    RequestSeqIds {
        absent_ids: Vec<SequenceId>,
    },
    /// tells the sender of stacked messages how far the stream was consumed
    StackAck {
        last_received_id: SequenceId,
    },
    /// a batch of stackable messages that shares a single sequence id
    Stack {
        elements: Vec<Message>,
    },
}

impl Debug for Payload {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Payload::Application { kind, stackable, data } => write!(f, "Application(kind={}, stackable={}, len={})", kind, stackable, data.len()),
            Payload::KeepAlive => write!(f, "KeepAlive"),
            Payload::RequestSeqIds { absent_ids } => write!(f, "RequestSeqIds({:?})", absent_ids.iter().map(|id| id.to_raw()).collect::<Vec<_>>()),
            Payload::StackAck { last_received_id } => write!(f, "StackAck({})", last_received_id),
            Payload::Stack { elements } => write!(f, "Stack(#{})", elements.len()),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Message {
    pub reliable_mode: ReliableMode,
    pub sender_id: SenderId,
    /// `None` means broadcast to all known peers
    pub receiver_id: Option<SenderId>,
    /// only meaningful for [ReliableMode::SequenceNumber], ZERO otherwise
    pub sequence_id: SequenceId,
    pub is_resend: bool,
    pub payload: Payload,
}

impl Message {
    fn new(reliable_mode: ReliableMode, payload: Payload) -> Message {
        Message {
            reliable_mode,
            sender_id: SenderId::default(),
            receiver_id: None,
            sequence_id: SequenceId::ZERO,
            is_resend: false,
            payload,
        }
    }

    /// a reliable application message
    pub fn reliable(kind: u16, stackable: bool, data: impl Into<Bytes>) -> Message {
        Self::new(ReliableMode::SequenceNumber, Payload::Application { kind, stackable, data: data.into() })
    }

    pub fn unreliable(kind: u16, data: impl Into<Bytes>) -> Message {
        Self::new(ReliableMode::Unreliable, Payload::Application { kind, stackable: false, data: data.into() })
    }

    pub fn keep_alive() -> Message {
        Self::new(ReliableMode::Unreliable, Payload::KeepAlive)
    }

    /// NB: Always unreliable - if it gets lost, the ids will be requested again
    pub fn request_seq_ids(absent_ids: Vec<SequenceId>, receiver_id: SenderId) -> Message {
        Self::new(ReliableMode::Unreliable, Payload::RequestSeqIds { absent_ids })
            .to(receiver_id)
    }

    pub fn stack_ack(last_received_id: SequenceId, receiver_id: SenderId) -> Message {
        Self::new(ReliableMode::Unreliable, Payload::StackAck { last_received_id })
            .to(receiver_id)
    }

    pub fn stack(elements: Vec<Message>) -> Message {
        Self::new(ReliableMode::SequenceNumber, Payload::Stack { elements })
    }

    pub fn to(mut self, receiver_id: SenderId) -> Message {
        self.receiver_id = Some(receiver_id);
        self
    }

    pub fn sent_by(mut self, sender_id: SenderId) -> Message {
        self.sender_id = sender_id;
        self
    }

    pub fn is_reliable(&self) -> bool {
        self.reliable_mode == ReliableMode::SequenceNumber
    }

    /// Stacks are sequenced, so only messages that are sequenced themselves can be stacked. Keep
    ///  alive messages are the exception: they may ride along in a stack if configured.
    pub fn is_stackable(&self, stack_keep_alive_messages: bool) -> bool {
        match &self.payload {
            Payload::Application { stackable, .. } => *stackable && self.is_reliable(),
            Payload::KeepAlive => stack_keep_alive_messages,
            Payload::RequestSeqIds { .. } |
            Payload::StackAck { .. } |
            Payload::Stack { .. } => false,
        }
    }

    /// a copy of this message, re-addressed to the requesting peer and flagged as a resend
    pub fn as_resend_to(&self, requester: SenderId) -> Message {
        let mut result = self.clone();
        result.receiver_id = Some(requester);
        result.is_resend = true;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::stackable(Message::reliable(1, true, vec![1]), false, true)]
    #[case::stackable_keep_alive_config(Message::reliable(1, true, vec![1]), true, true)]
    #[case::unstackable(Message::reliable(1, false, vec![1]), true, false)]
    #[case::unreliable(Message::unreliable(1, vec![1]), true, false)]
    #[case::unreliable_stackable_flag(Message { reliable_mode: ReliableMode::Unreliable, ..Message::reliable(1, true, vec![1]) }, true, false)]
    #[case::keep_alive_stacked(Message::keep_alive(), true, true)]
    #[case::keep_alive_not_stacked(Message::keep_alive(), false, false)]
    #[case::request(Message::request_seq_ids(vec![], SenderId(1)), true, false)]
    #[case::ack(Message::stack_ack(SequenceId::ZERO, SenderId(1)), true, false)]
    #[case::stack(Message::stack(vec![]), true, false)]
    fn test_is_stackable(#[case] message: Message, #[case] stack_keep_alive_messages: bool, #[case] expected: bool) {
        assert_eq!(message.is_stackable(stack_keep_alive_messages), expected);
    }

    #[test]
    fn test_protocol_messages_are_unreliable() {
        assert!(!Message::request_seq_ids(vec![SequenceId::from_raw(3)], SenderId(2)).is_reliable());
        assert!(!Message::stack_ack(SequenceId::from_raw(3), SenderId(2)).is_reliable());
        assert!(Message::stack(vec![]).is_reliable());
    }

    #[test]
    fn test_as_resend_to() {
        let mut original = Message::reliable(7, false, vec![1, 2, 3]);
        original.sender_id = SenderId(1);
        original.sequence_id = SequenceId::from_raw(9);

        let resend = original.as_resend_to(SenderId(4));
        assert_eq!(resend.receiver_id, Some(SenderId(4)));
        assert!(resend.is_resend);
        assert_eq!(resend.sequence_id, SequenceId::from_raw(9));
        assert_eq!(resend.sender_id, SenderId(1));
        assert!(!original.is_resend);
    }
}
