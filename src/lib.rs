//! This crate adds ordered, gap-recovering delivery on top of an unreliable datagram transport
//!  like UDP. It is designed for a server that pushes the same stream of messages to many clients
//!  (game state, market data and similar), where latency matters more than per-message
//!  acknowledgements.
//!
//! ## Design goals
//!
//! * Reliable messages get a sequence id and are delivered to the application in sequence order,
//!   exactly once
//! * There are no positive acknowledgements per message: the receiver detects gaps in the
//!   sequence and requests the missing ids (negative acknowledgement), and the sender re-sends
//!   them from a bounded log of sent messages
//! * Unreliable messages bypass all of this: no id, no log, no re-send
//! * Small messages can be *stacked*, i.e. batched into a single transmission unit that shares a
//!   single sequence id, reducing per-datagram overhead
//! * All state is owned by a [peer::Peer] instance, there are no process-wide singletons. The
//!   transport and the application are plugged in via traits ([transport::MessageSender],
//!   [message_dispatcher::MessageDispatcher])
//!
//! ## Addressing modes
//!
//! There are two scopes for sequence ids, selected by `resolve_every_client_message`:
//! * *per sender*: every peer has its own sequence of ids. The sent message log is keyed by the
//!   peer's id, and a broadcast is sent separately to every registered peer.
//! * *shared*: all peers share a single sequence of ids, and log keys are normalized to sender
//!   id 0. This is the typical setup for a server broadcasting identical traffic to all clients:
//!   every message is logged once, and any client can request it.
//!
//! NB: In shared mode, reliable traffic is expected to be broadcast. A reliable message sent to a
//!      single receiver consumes an id in the shared scope, which other receivers perceive as a
//!      gap - they request it and receive the re-sent message.
//!
//! ## Resend protocol
//!
//! The receiver tracks a *high-water mark* per sender, i.e. the highest id up to which all
//!  messages were delivered. A message with the next id is delivered, followed by all buffered
//!  messages that are contiguous with it. A message with a higher id is buffered, and the ids
//!  between the high-water mark and it are requested with a `RequestSeqIds` message. Ids that
//!  were requested recently are not requested again until `re_request_interval` passed, and a
//!  housekeeping tick re-requests overdue ids even if no further messages arrive.
//!
//! A single request carries at most `max_num_requested_ids` ids so that it fits into a datagram.
//!  Missing ids more than `receive_window_size` below the newest received id are given up on,
//!  which bounds the receive state, e.g. for a client that joins a shared stream late.
//!
//! Protocol messages (`RequestSeqIds`, `StackAck`) are sent unreliably: if they get lost, the
//!  gap is requested again.
//!
//! After delivering a stack, the receiver sends a `StackAck` with its high-water mark. With
//!  per-sender addressing, this allows the sender to release acknowledged log entries early.
//!
//! ## Wire format
//!
//! Each message is a single datagram. All numbers are big endian, 'varint' is the encoding of the
//!  `bytes-varint` crate.
//!
//! ```text
//!     0                   1                   2                   3
//!     0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//!    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  0 | CRC-32 checksum for the rest of the datagram                  |
//!    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  4 | protocol ver. | message kind  | reliable mode |     flags     |
//!    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  8 | sender id                                                     |
//!    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! 12 | receiver id (only if flag bit 1 is set)                       |
//!    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  * | sequence id (u64)                                             |
//!    |                                                               |
//!    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  * | payload, depending on the message kind                        |
//!    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Flags: bit 0 - the message is a re-send; bit 1 - a receiver id is present
//!
//! Message kinds and their payload:
//! * 0 application: application-defined kind (u16), stackable (u8), length of the data (varint),
//!   data
//! * 1 keep-alive: no payload
//! * 2 request sequence ids: number of ids (varint), ids (u64 each)
//! * 3 stack ack: last received id (u64)
//! * 4 stack: number of elements (varint), then for each element its length (varint) and the
//!   element encoded like a top-level message without the checksum. Stacks are not nested.
pub mod message_log;
pub mod gap_detector;
pub mod resend;
pub mod stacker;
pub mod sequence;
pub mod message;
pub mod config;
pub mod net_stats;
pub mod message_dispatcher;
pub mod transport;
pub mod udp_transport;
pub mod peer;
pub mod wire;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
