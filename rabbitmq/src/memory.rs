//! In-process broker with AMQP-like routing semantics.
//!
//! Used when no RabbitMQ is around (local development) and by the test suites. It honours
//! topic/direct/fanout routing, the default exchange, per-queue FIFO with round-robin
//! consumers, manual acknowledgement, message TTL, delivery limits and dead-lettering, and lets
//! callers inject faults (dropped connections, refused connects, withheld confirms).

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    oneshot,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    RabbitMQError,
    topology::{ExchangeKind, QueueArguments},
    transport::{BrokerChannel, Delivery, MessageProperties, PendingConfirm, Transport},
};

/// How the broker answers confirmed publishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfirmBehavior {
    /// Route the message and ack it
    #[default]
    Ack,
    /// Drop the message and nack it
    Nack,
    /// Drop the message and never answer
    Withhold,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    properties: MessageProperties,
    body: Vec<u8>,
    redelivered: bool,
    deliveries: u32,
    enqueued_at: Instant,
}

#[derive(Debug)]
struct ConsumerSlot {
    channel_id: u64,
    consumer_tag: String,
    tx: UnboundedSender<Delivery>,
}

#[derive(Debug, Default)]
struct MemoryQueue {
    arguments: QueueArguments,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

#[derive(Debug)]
struct Binding {
    exchange: String,
    queue: String,
    pattern: String,
}

#[derive(Debug)]
struct Unacked {
    channel_id: u64,
    queue: String,
    message: StoredMessage,
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeKind>,
    bindings: Vec<Binding>,
    queues: HashMap<String, MemoryQueue>,
    unacked: HashMap<u64, Unacked>,
    channels: HashMap<u64, CancellationToken>,
    withheld: Vec<oneshot::Sender<bool>>,
    confirm_behavior: ConfirmBehavior,
    refused_connects: u32,
    available: bool,
}

/// Shared broker state; clone the `Arc` to hand it to several transports
#[derive(Debug)]
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    next_channel_id: AtomicU64,
    next_delivery_tag: AtomicU64,
    connects: AtomicU64,
    published: AtomicU64,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BrokerState {
                available: true,
                ..BrokerState::default()
            }),
            next_channel_id: AtomicU64::new(1),
            next_delivery_tag: AtomicU64::new(1),
            connects: AtomicU64::new(0),
            published: AtomicU64::new(0),
        })
    }

    /// Transport opening channels on this broker
    pub fn transport(self: &Arc<Self>) -> MemoryTransport {
        MemoryTransport {
            broker: Arc::clone(self),
        }
    }

    /// Closes every live channel as if the broker went away; unacked messages are requeued
    pub fn sever_connections(&self) {
        let mut state = self.state.lock();
        let channel_ids: Vec<u64> = state.channels.keys().copied().collect();
        for channel_id in &channel_ids {
            self.close_channel_locked(&mut state, *channel_id);
        }
        state.withheld.clear();
        warn!(channels = channel_ids.len(), "memory broker severed all connections");
    }

    /// Refuses the next `count` connection attempts
    pub fn refuse_next_connects(&self, count: u32) {
        self.state.lock().refused_connects = count;
    }

    /// While unavailable every connection attempt is refused
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    pub fn set_confirm_behavior(&self, behavior: ConfirmBehavior) {
        self.state.lock().confirm_behavior = behavior;
    }

    /// Number of successful connection attempts so far
    pub fn connection_count(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    /// Number of messages accepted for routing so far
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.state.lock().exchanges.contains_key(name)
    }

    pub fn queue_arguments(&self, name: &str) -> Option<QueueArguments> {
        self.state
            .lock()
            .queues
            .get(name)
            .map(|queue| queue.arguments.clone())
    }

    /// Messages waiting in `queue` (not delivered to any consumer)
    pub fn ready_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |queue| queue.ready.len())
    }

    /// Delivered but not yet acknowledged messages across all queues
    pub fn unacked_count(&self) -> usize {
        self.state.lock().unacked.len()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |queue| queue.consumers.len())
    }

    /// Removes and returns the bodies waiting in `queue`
    pub fn drain(&self, queue: &str) -> Vec<Vec<u8>> {
        let mut state = self.state.lock();
        state
            .queues
            .get_mut(queue)
            .map(|queue| queue.ready.drain(..).map(|message| message.body).collect())
            .unwrap_or_default()
    }

    fn open_channel(&self) -> Result<(u64, CancellationToken), RabbitMQError> {
        let mut state = self.state.lock();
        if !state.available {
            return Err(RabbitMQError::ConnectionError(
                "memory broker unavailable".to_owned(),
            ));
        }
        if state.refused_connects > 0 {
            state.refused_connects -= 1;
            return Err(RabbitMQError::ConnectionError(
                "memory broker refused connection".to_owned(),
            ));
        }

        let channel_id = self.next_channel_id.fetch_add(1, Ordering::SeqCst);
        let closed = CancellationToken::new();
        state.channels.insert(channel_id, closed.clone());
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok((channel_id, closed))
    }

    fn close_channel_locked(&self, state: &mut BrokerState, channel_id: u64) {
        if let Some(closed) = state.channels.remove(&channel_id) {
            closed.cancel();
        }

        for queue in state.queues.values_mut() {
            queue.consumers.retain(|slot| slot.channel_id != channel_id);
        }

        let mut orphaned: Vec<u64> = state
            .unacked
            .iter()
            .filter(|(_, entry)| entry.channel_id == channel_id)
            .map(|(tag, _)| *tag)
            .collect();
        // highest tag first so the oldest delivery ends up at the head again
        orphaned.sort_unstable_by(|a, b| b.cmp(a));

        let mut touched = Vec::new();
        for tag in orphaned {
            if let Some(mut entry) = state.unacked.remove(&tag) {
                entry.message.redelivered = true;
                if let Some(queue) = state.queues.get_mut(&entry.queue) {
                    queue.ready.push_front(entry.message);
                    touched.push(entry.queue);
                }
            }
        }
        touched.sort();
        touched.dedup();
        for queue in touched {
            self.dispatch_locked(state, &queue);
        }
    }

    fn route_locked(
        &self,
        state: &mut BrokerState,
        exchange: &str,
        routing_key: &str,
        message: StoredMessage,
    ) -> Result<usize, RabbitMQError> {
        let mut targets: Vec<String> = if exchange.is_empty() {
            // default exchange routes straight to the queue named by the routing key
            state
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_owned())
                .into_iter()
                .collect()
        } else {
            let kind = *state.exchanges.get(exchange).ok_or_else(|| {
                RabbitMQError::PublishError(format!("no exchange '{exchange}'"))
            })?;
            state
                .bindings
                .iter()
                .filter(|b| b.exchange == exchange && kind.routes(&b.pattern, routing_key))
                .map(|b| b.queue.clone())
                .collect()
        };
        targets.sort();
        targets.dedup();

        for queue_name in &targets {
            if let Some(queue) = state.queues.get_mut(queue_name) {
                queue.ready.push_back(message.clone());
            }
            self.dispatch_locked(state, queue_name);
        }

        if targets.is_empty() {
            debug!(exchange, routing_key, "memory broker dropped unroutable message");
        }
        Ok(targets.len())
    }

    fn dead_letter_locked(&self, state: &mut BrokerState, queue_name: &str, message: StoredMessage) {
        let Some(arguments) = state.queues.get(queue_name).map(|q| q.arguments.clone()) else {
            return;
        };
        let Some(exchange) = arguments.dead_letter_exchange else {
            debug!(queue = queue_name, "message discarded without dead-letter exchange");
            return;
        };

        let routing_key = arguments
            .dead_letter_routing_key
            .unwrap_or_else(|| message.routing_key.clone());
        let message = StoredMessage {
            redelivered: false,
            deliveries: 0,
            enqueued_at: Instant::now(),
            ..message
        };
        if let Err(err) = self.route_locked(state, &exchange, &routing_key, message) {
            warn!(queue = queue_name, "dead-lettering failed: {}", err);
        }
    }

    /// Dead-letters expired messages at the head of `queue_name`
    fn expire_locked(&self, state: &mut BrokerState, queue_name: &str) {
        let mut expired = Vec::new();
        if let Some(queue) = state.queues.get_mut(queue_name) {
            if let Some(ttl) = queue.arguments.message_ttl {
                while queue
                    .ready
                    .front()
                    .is_some_and(|message| message.enqueued_at.elapsed() >= ttl)
                {
                    if let Some(message) = queue.ready.pop_front() {
                        expired.push(message);
                    }
                }
            }
        }

        for message in expired {
            debug!(queue = queue_name, "message expired");
            self.dead_letter_locked(state, queue_name, message);
        }
    }

    /// Hands ready messages to consumers, round-robin, until either runs out
    fn dispatch_locked(&self, state: &mut BrokerState, queue_name: &str) {
        self.expire_locked(state, queue_name);

        loop {
            let Some(queue) = state.queues.get_mut(queue_name) else {
                return;
            };
            if queue.consumers.is_empty() {
                return;
            }
            let Some(mut message) = queue.ready.pop_front() else {
                return;
            };

            let slot_index = queue.next_consumer % queue.consumers.len();
            queue.next_consumer = queue.next_consumer.wrapping_add(1);
            message.deliveries += 1;

            let delivery_tag = self.next_delivery_tag.fetch_add(1, Ordering::SeqCst);
            let delivery = Delivery {
                delivery_tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                properties: message.properties.clone(),
                body: message.body.clone(),
            };

            let channel_id = queue.consumers[slot_index].channel_id;
            if queue.consumers[slot_index].tx.send(delivery).is_err() {
                // consumer went away without cancelling
                queue.consumers.remove(slot_index);
                message.deliveries -= 1;
                queue.ready.push_front(message);
                continue;
            }

            state.unacked.insert(
                delivery_tag,
                Unacked {
                    channel_id,
                    queue: queue_name.to_owned(),
                    message,
                },
            );
        }
    }

    fn settle(
        &self,
        channel_id: u64,
        delivery_tag: u64,
        outcome: Settlement,
    ) -> Result<(), RabbitMQError> {
        let mut state = self.state.lock();
        if !state.channels.contains_key(&channel_id) {
            return Err(RabbitMQError::ChannelClosed);
        }

        let owned = state
            .unacked
            .get(&delivery_tag)
            .is_some_and(|entry| entry.channel_id == channel_id);
        let entry = if owned {
            state.unacked.remove(&delivery_tag)
        } else {
            None
        };
        let Some(Unacked {
            queue, mut message, ..
        }) = entry
        else {
            return Err(RabbitMQError::AckMessageError(format!(
                "unknown delivery tag {delivery_tag}"
            )));
        };

        match outcome {
            Settlement::Ack => {}
            Settlement::Reject => self.dead_letter_locked(&mut state, &queue, message),
            Settlement::Requeue => {
                let limit = state
                    .queues
                    .get(&queue)
                    .and_then(|q| q.arguments.delivery_limit);
                if limit.is_some_and(|limit| message.deliveries >= limit) {
                    debug!(queue = %queue, deliveries = message.deliveries, "delivery limit reached");
                    self.dead_letter_locked(&mut state, &queue, message);
                } else {
                    message.redelivered = true;
                    if let Some(q) = state.queues.get_mut(&queue) {
                        q.ready.push_front(message);
                    }
                }
            }
        }

        self.dispatch_locked(&mut state, &queue);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Settlement {
    Ack,
    Requeue,
    Reject,
}

/// [`Transport`] opening channels on a [`MemoryBroker`]
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    broker: Arc<MemoryBroker>,
}

impl MemoryTransport {
    pub fn broker(&self) -> &Arc<MemoryBroker> {
        &self.broker
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self) -> Result<Arc<dyn BrokerChannel>, RabbitMQError> {
        let (channel_id, closed) = self.broker.open_channel()?;
        Ok(Arc::new(MemoryChannel {
            broker: Arc::clone(&self.broker),
            channel_id,
            closed,
            confirm_tags: AtomicU64::new(0),
        }))
    }

    fn describe(&self) -> String {
        "memory://".to_owned()
    }
}

struct MemoryChannel {
    broker: Arc<MemoryBroker>,
    channel_id: u64,
    closed: CancellationToken,
    confirm_tags: AtomicU64,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), RabbitMQError> {
        if self.closed.is_cancelled() {
            return Err(RabbitMQError::ChannelClosed);
        }
        Ok(())
    }

    fn stored(
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: &MessageProperties,
    ) -> StoredMessage {
        StoredMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties: properties.clone(),
            body,
            redelivered: false,
            deliveries: 0,
            enqueued_at: Instant::now(),
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        _durable: bool,
    ) -> Result<(), RabbitMQError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock();
        match state.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(RabbitMQError::ExchangeDeclarationError(
                format!("exchange '{name}' already declared as {}", existing.as_str()),
            )),
            _ => {
                state.exchanges.insert(name.to_owned(), kind);
                Ok(())
            }
        }
    }

    async fn declare_queue(
        &self,
        name: &str,
        _durable: bool,
        arguments: &QueueArguments,
    ) -> Result<(), RabbitMQError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock();
        match state.queues.get(name) {
            Some(existing) if existing.arguments != *arguments => {
                Err(RabbitMQError::QueueDeclarationError(format!(
                    "queue '{name}' already declared with different arguments"
                )))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    name.to_owned(),
                    MemoryQueue {
                        arguments: arguments.clone(),
                        ..MemoryQueue::default()
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_pattern: &str,
    ) -> Result<(), RabbitMQError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock();
        if !state.queues.contains_key(queue) || !state.exchanges.contains_key(exchange) {
            return Err(RabbitMQError::QueueBindingError(format!(
                "cannot bind '{queue}' to '{exchange}'"
            )));
        }
        let exists = state.bindings.iter().any(|b| {
            b.queue == queue && b.exchange == exchange && b.pattern == routing_pattern
        });
        if !exists {
            state.bindings.push(Binding {
                exchange: exchange.to_owned(),
                queue: queue.to_owned(),
                pattern: routing_pattern.to_owned(),
            });
        }
        Ok(())
    }

    async fn set_prefetch(&self, _count: u16) -> Result<(), RabbitMQError> {
        self.ensure_open()
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: &MessageProperties,
    ) -> Result<(), RabbitMQError> {
        self.ensure_open()?;
        let message = Self::stored(exchange, routing_key, body, properties);
        let mut state = self.broker.state.lock();
        self.broker
            .route_locked(&mut state, exchange, routing_key, message)?;
        self.broker.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn publish_confirmed(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: &MessageProperties,
    ) -> Result<PendingConfirm, RabbitMQError> {
        self.ensure_open()?;
        let delivery_tag = self.confirm_tags.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();

        let mut state = self.broker.state.lock();
        match state.confirm_behavior {
            ConfirmBehavior::Ack => {
                let message = Self::stored(exchange, routing_key, body, properties);
                self.broker
                    .route_locked(&mut state, exchange, routing_key, message)?;
                self.broker.published.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(true);
            }
            ConfirmBehavior::Nack => {
                let _ = tx.send(false);
            }
            ConfirmBehavior::Withhold => state.withheld.push(tx),
        }

        Ok(PendingConfirm::new(delivery_tag, rx))
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<UnboundedReceiver<Delivery>, RabbitMQError> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.broker.state.lock();
        let Some(memory_queue) = state.queues.get_mut(queue) else {
            return Err(RabbitMQError::SubscriptionError(format!(
                "no queue '{queue}'"
            )));
        };
        memory_queue.consumers.push(ConsumerSlot {
            channel_id: self.channel_id,
            consumer_tag: consumer_tag.to_owned(),
            tx,
        });
        self.broker.dispatch_locked(&mut state, queue);
        Ok(rx)
    }

    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<(), RabbitMQError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock();
        for queue in state.queues.values_mut() {
            queue.consumers.retain(|slot| {
                slot.channel_id != self.channel_id || slot.consumer_tag != consumer_tag
            });
        }
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), RabbitMQError> {
        self.broker
            .settle(self.channel_id, delivery_tag, Settlement::Ack)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), RabbitMQError> {
        let outcome = if requeue {
            Settlement::Requeue
        } else {
            Settlement::Reject
        };
        self.broker.settle(self.channel_id, delivery_tag, outcome)
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    async fn close(&self) -> Result<(), RabbitMQError> {
        let mut state = self.broker.state.lock();
        self.broker.close_channel_locked(&mut state, self.channel_id);
        Ok(())
    }
}
