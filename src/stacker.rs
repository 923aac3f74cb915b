use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;
use crate::message::{Message, Payload};

/// Combines consecutive stackable messages into stacks, i.e. single sequenced transmission units.
///
/// A stack is sealed when it is full, when an unstackable message is offered (the stack is
///  sealed *before* that message), when a message for a different receiver is offered, or when
///  it is flushed explicitly or by age. Sealed units are returned in the order in which they must
///  get their sequence ids and be transmitted.
///
/// There is one stacker per addressing scope, so sealing order is sequence order.
pub struct Stacker {
    max_stack_size: usize,
    stack_keep_alive_messages: bool,
    open: Vec<Message>,
    opened_at: Option<Instant>,
}

impl Stacker {
    pub fn new(max_stack_size: usize, stack_keep_alive_messages: bool) -> Stacker {
        Stacker {
            max_stack_size,
            stack_keep_alive_messages,
            open: Vec::new(),
            opened_at: None,
        }
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    /// returns the units that are ready for transmission, in order
    pub fn offer(&mut self, message: Message, now: Instant) -> Vec<Message> {
        let mut result = Vec::new();

        let receiver_changed = self.open.first()
            .map(|m| m.receiver_id != message.receiver_id)
            .unwrap_or(false);
        if receiver_changed {
            trace!("message for a different receiver - sealing stack");
            result.extend(self.flush());
        }

        if !message.is_stackable(self.stack_keep_alive_messages) {
            result.extend(self.flush());
            result.push(message);
            return result;
        }

        if self.open.is_empty() {
            self.opened_at = Some(now);
        }
        self.open.push(message);

        if self.open.len() >= self.max_stack_size {
            trace!("stack reached maximum size of {} - sealing", self.max_stack_size);
            result.extend(self.flush());
        }
        result
    }

    /// seals the open stack, if there is one. An empty stack is not sent.
    pub fn flush(&mut self) -> Option<Message> {
        if self.open.is_empty() {
            return None;
        }
        self.opened_at = None;

        let elements = std::mem::take(&mut self.open);
        let receiver_id = elements[0].receiver_id;
        let sender_id = elements[0].sender_id;

        let mut stack = Message::stack(elements).sent_by(sender_id);
        stack.receiver_id = receiver_id;
        Some(stack)
    }

    pub fn seal_if_older_than(&mut self, max_age: Duration, now: Instant) -> Option<Message> {
        match self.opened_at {
            Some(opened_at) if now.saturating_duration_since(opened_at) >= max_age => {
                trace!("stack reached maximum age - sealing");
                self.flush()
            }
            _ => None,
        }
    }
}

/// the elements of a stack in their original order, or the message itself if it is no stack
pub fn unpack(message: Message) -> Vec<Message> {
    match message.payload {
        Payload::Stack { elements } => elements,
        _ => vec![message],
    }
}
