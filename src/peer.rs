use std::collections::BTreeSet;
use std::sync::{Arc, Mutex as StdMutex};
use rustc_hash::FxHashMap;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};
use crate::config::ReliabilityConfig;
use crate::gap_detector::GapDetector;
use crate::message::{Message, Payload, ReliableMode};
use crate::message_dispatcher::MessageDispatcher;
use crate::message_log::SentMessageLog;
use crate::net_stats::NetStats;
use crate::resend::ResendCoordinator;
use crate::sequence::{AddressingMode, SenderId, SequenceId, SequenceIdProvider};
use crate::stacker::{unpack, Stacker};
use crate::transport::MessageSender;

/// What happened to a received message
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ReceiveDecision {
    /// the message (and possibly buffered messages after it) was dispatched. The count is the
    ///  number of application messages handed to the dispatcher, with stacks unpacked.
    Delivered(usize),
    /// the message arrived out of order and is held back until the gap before it is filled
    Buffered { requested: Vec<SequenceId> },
    /// the message was received before and was dropped
    Duplicate,
    /// a protocol message that was processed internally
    Handled,
}

/// A peer is the session object of the reliability layer: it owns all sending and receiving
///  state of one participant and wires the components together.
///
/// Sending: `send()` assigns the sender id, passes the message through the stacker of its
///  addressing scope, allocates sequence ids for sealed reliable units (still under the stacker
///  lock, so sealing order is id order), records them in the sent message log and then hands
///  them to the transport.
///
/// Receiving: `on_message()` is fed by the transport's receive loop. Sequenced messages go
///  through the gap detector, which requests missing ids from their sender and releases
///  messages in sequence order.
pub struct Peer {
    config: Arc<ReliabilityConfig>,
    id_provider: SequenceIdProvider,
    message_log: Arc<SentMessageLog>,
    gap_detector: GapDetector,
    resend_coordinator: ResendCoordinator,
    /// one stacker per addressing scope, keyed by the normalized sender id
    stackers: Mutex<FxHashMap<SenderId, Stacker>>,
    known_peers: RwLock<BTreeSet<SenderId>>,
    /// highest id acknowledged by each peer via StackAck
    acknowledged: Mutex<FxHashMap<SenderId, SequenceId>>,
    /// serializes the sequenced receive path, so dispatch order is sequence order
    receive_lock: Mutex<()>,
    transport: Arc<dyn MessageSender>,
    message_dispatcher: Arc<dyn MessageDispatcher>,
    active_handle: StdMutex<Option<JoinHandle<()>>>,
}

impl Drop for Peer {
    fn drop(&mut self) {
        let active_handle = self.active_handle.get_mut()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = active_handle.take() {
            handle.abort();
        }
    }
}

impl Peer {
    pub fn new(
        config: Arc<ReliabilityConfig>,
        transport: Arc<dyn MessageSender>,
        message_dispatcher: Arc<dyn MessageDispatcher>,
    ) -> anyhow::Result<Peer> {
        config.validate()?;

        let addressing_mode = config.addressing_mode();
        let message_log = Arc::new(SentMessageLog::new(config.log_retention.clone()));
        let resend_coordinator = ResendCoordinator::new(
            addressing_mode,
            message_log.clone(),
            transport.clone(),
            config.net_stats.clone(),
        );

        debug!("initializing peer {} with addressing mode {:?}", config.self_id, addressing_mode);

        Ok(Peer {
            id_provider: SequenceIdProvider::new(addressing_mode),
            message_log,
            gap_detector: GapDetector::new(config.receive_window_size, config.max_num_requested_ids),
            resend_coordinator,
            stackers: Default::default(),
            known_peers: Default::default(),
            acknowledged: Default::default(),
            receive_lock: Default::default(),
            transport,
            message_dispatcher,
            active_handle: Default::default(),
            config,
        })
    }

    pub fn self_id(&self) -> SenderId {
        self.config.self_id
    }

    pub fn net_stats(&self) -> &Arc<NetStats> {
        &self.config.net_stats
    }

    fn addressing_mode(&self) -> AddressingMode {
        self.id_provider.addressing_mode()
    }

    pub async fn register_peer(&self, peer: SenderId) {
        if self.known_peers.write().await.insert(peer) {
            debug!("registered peer {}", peer);
        }
    }

    pub async fn known_peers(&self) -> Vec<SenderId> {
        self.known_peers.read().await
            .iter()
            .cloned()
            .collect()
    }

    /// Discards all state that is specific to a peer. A peer that connects again with the same
    ///  id starts over with fresh sequence ids.
    pub async fn on_disconnect(&self, peer: SenderId) {
        debug!("peer {} disconnected - discarding its state", peer);
        self.known_peers.write().await.remove(&peer);
        self.gap_detector.forget(peer).await;
        self.acknowledged.lock().await.remove(&peer);

        if self.addressing_mode() == AddressingMode::PerSender {
            // nobody else can request messages from a per-peer scope
            self.message_log.release_up_to(peer, self.id_provider.last_allocated(peer));
            self.stackers.lock().await.remove(&peer);
            self.id_provider.forget(peer);
        }
    }

    /// Sends a message. A message without receiver is a broadcast: with per-sender addressing,
    ///  it is sent separately to every registered peer, so that each copy gets an id in that
    ///  peer's scope.
    pub async fn send(&self, mut message: Message) {
        message.sender_id = self.config.self_id;

        let addressed = match (self.addressing_mode(), message.receiver_id) {
            (AddressingMode::PerSender, None) => {
                let known_peers = self.known_peers().await;
                if known_peers.is_empty() {
                    debug!("no registered peers - dropping broadcast {:?}", message.payload);
                }
                known_peers.into_iter()
                    .map(|peer| message.clone().to(peer))
                    .collect()
            }
            _ => vec![message],
        };

        for message in addressed {
            let scope = self.addressing_mode().key_sender_id(message.receiver_id.unwrap_or(SenderId::SHARED));
            let now = Instant::now();

            let units = {
                let mut stackers = self.stackers.lock().await;
                let stacker = stackers.entry(scope)
                    .or_insert_with(|| Stacker::new(self.config.max_stack_size, self.config.stack_keep_alive_messages));
                stacker.offer(message, now).into_iter()
                    .map(|unit| self.assign_sequence_id(unit, now))
                    .collect::<Vec<_>>()
            };

            self.transmit(units).await;
        }
    }

    /// Seals and sends all open stacks
    pub async fn flush_all(&self) {
        let now = Instant::now();
        let units = {
            let mut stackers = self.stackers.lock().await;
            stackers.values_mut()
                .flat_map(|stacker| stacker.flush())
                .map(|unit| self.assign_sequence_id(unit, now))
                .collect::<Vec<_>>()
        };
        self.transmit(units).await;
    }

    /// Must be called while holding the stacker lock
    fn assign_sequence_id(&self, mut unit: Message, now: Instant) -> Message {
        unit.sender_id = self.config.self_id;
        if !unit.is_reliable() {
            return unit;
        }

        let peer = unit.receiver_id.unwrap_or(SenderId::SHARED);
        unit.sequence_id = self.id_provider.allocate(peer);

        let key = self.addressing_mode().key(ReliableMode::SequenceNumber, peer, unit.sequence_id);
        trace!("logging {:?} as {}", unit.payload, key);
        self.message_log.record(key, Arc::new(unit.clone()), now);
        unit
    }

    async fn transmit(&self, units: Vec<Message>) {
        for unit in units {
            if let Payload::Stack { elements } = &unit.payload {
                trace!("sending stack #{} with {} elements", unit.sequence_id, elements.len());
                self.config.net_stats.increment_stacks_sent();
            }
            self.transport.send(&unit).await;
        }
    }

    pub async fn on_message(&self, message: Message) -> ReceiveDecision {
        match &message.payload {
            Payload::RequestSeqIds { absent_ids } => {
                self.resend_coordinator.on_request_seq_ids(message.sender_id, absent_ids).await;
                return ReceiveDecision::Handled;
            }
            Payload::StackAck { last_received_id } => {
                self.on_stack_ack(message.sender_id, *last_received_id).await;
                return ReceiveDecision::Handled;
            }
            _ => {}
        }

        if !message.is_reliable() {
            return match self.dispatch(message).await {
                0 => ReceiveDecision::Handled,
                n => ReceiveDecision::Delivered(n),
            };
        }

        let _receive_guard = self.receive_lock.lock().await;

        let sender = message.sender_id;
        let sequence_id = message.sequence_id;
        let result = self.gap_detector.on_sequenced(message, Instant::now(), self.config.re_request_interval).await;

        if result.is_duplicate {
            debug!("dropping duplicate #{} from {}", sequence_id, sender);
            self.config.net_stats.increment_duplicates_dropped();
            return ReceiveDecision::Duplicate;
        }

        if result.num_skipped > 0 {
            self.config.net_stats.add_skipped_ids(result.num_skipped);
        }
        if !result.absent_ids.is_empty() {
            self.request_seq_ids(sender, result.absent_ids.clone()).await;
        }

        let high_water_mark = match result.deliverable.last() {
            Some(last) => last.sequence_id,
            None => return ReceiveDecision::Buffered { requested: result.absent_ids },
        };

        let mut contains_stack = false;
        let mut num_delivered = 0;
        for unit in result.deliverable {
            contains_stack |= matches!(unit.payload, Payload::Stack { .. });
            num_delivered += self.dispatch(unit).await;
        }

        if contains_stack {
            self.transport.send(&Message::stack_ack(high_water_mark, sender)
                .sent_by(self.config.self_id)
            ).await;
        }

        ReceiveDecision::Delivered(num_delivered)
    }

    /// unpacks stacks, returning the number of messages handed to the dispatcher
    async fn dispatch(&self, unit: Message) -> usize {
        let mut num_dispatched = 0;
        for element in unpack(unit) {
            if let Payload::KeepAlive = element.payload {
                trace!("received keep-alive from {}", element.sender_id);
                continue;
            }
            self.message_dispatcher.on_message(&element).await;
            num_dispatched += 1;
        }
        num_dispatched
    }

    async fn request_seq_ids(&self, sender: SenderId, absent_ids: Vec<SequenceId>) {
        debug!("requesting {:?} from {}", absent_ids.iter().map(|id| id.to_raw()).collect::<Vec<_>>(), sender);
        self.config.net_stats.add_requested_ids(absent_ids.len());
        self.transport.send(&Message::request_seq_ids(absent_ids, sender)
            .sent_by(self.config.self_id)
        ).await;
    }

    async fn on_stack_ack(&self, peer: SenderId, last_received_id: SequenceId) {
        if last_received_id > self.id_provider.last_allocated(peer) {
            warn!("peer {} acknowledged id {} which was never sent - ignoring", peer, last_received_id);
            return;
        }

        {
            let mut acknowledged = self.acknowledged.lock().await;
            let previous = acknowledged.entry(peer).or_insert(SequenceId::ZERO);
            if last_received_id <= *previous {
                trace!("outdated ack {} from {} (previously {})", last_received_id, peer, previous);
                return;
            }
            *previous = last_received_id;
        }

        // with a shared scope, other peers may still request the acknowledged ids
        if self.addressing_mode() == AddressingMode::PerSender {
            let key_sender_id = self.addressing_mode().key_sender_id(peer);
            self.message_log.release_up_to(key_sender_id, last_received_id);
        }
    }

    pub async fn last_acknowledged(&self, peer: SenderId) -> SequenceId {
        self.acknowledged.lock().await
            .get(&peer)
            .cloned()
            .unwrap_or(SequenceId::ZERO)
    }

    /// Periodic housekeeping: seals stacks that reached their maximum age, requests missing ids
    ///  again if their previous request is overdue, and prunes the sent message log.
    pub async fn on_tick(&self) {
        let now = Instant::now();

        if let Some(max_stack_age) = self.config.max_stack_age {
            let units = {
                let mut stackers = self.stackers.lock().await;
                stackers.values_mut()
                    .flat_map(|stacker| stacker.seal_if_older_than(max_stack_age, now))
                    .map(|unit| self.assign_sequence_id(unit, now))
                    .collect::<Vec<_>>()
            };
            self.transmit(units).await;
        }

        for (sender, absent_ids) in self.gap_detector.due_requests(now, self.config.re_request_interval).await {
            self.request_seq_ids(sender, absent_ids).await;
        }

        self.message_log.prune_expired(now);
    }

    /// Spawns a task that calls [Peer::on_tick] every `housekeeping_interval`. The task stops
    ///  when the peer is dropped.
    pub fn spawn_active_loop(self: &Arc<Self>) {
        let peer = Arc::downgrade(self);
        let housekeeping_interval = self.config.housekeeping_interval;

        let handle = tokio::spawn(async move {
            let mut ticks = interval(housekeeping_interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                match peer.upgrade() {
                    Some(peer) => peer.on_tick().await,
                    None => break,
                }
            }
        });

        let previous = self.active_handle.lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}
