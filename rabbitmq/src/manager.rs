//! Broker connection manager.
//!
//! Owns the single channel the process uses, declares topology on every (re)connection and
//! supervises liveness. Publishers and consumers never hold a connection of their own: they borrow
//! the manager's current channel, which the supervisor swaps when it reconnects.
//!
//! ```text
//! Disconnected --connect()--> Connecting --ok--> Connected
//!                                  |                 |
//!                                 err          channel closed
//!                                  v                 v
//!                              Reconnecting <--------+
//!                                  |  ^
//!                                  |  +-- attempt failed, sleep reconnect_delay
//!                                  +-- topology + resubscribe ok --> Connected
//! ```

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use tokio::{
    select,
    sync::{Mutex as AsyncMutex, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    RabbitMQError,
    consumer::{MessageHandler, run_consumer},
    context::MessageContext,
    topology::{Topology, setup_topology},
    transport::{BrokerChannel, MessageProperties, PendingConfirm, Transport},
};

/// Default pause between two reconnection attempts
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Default number of unacknowledged deliveries per consumer
pub const DEFAULT_PREFETCH: u16 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Fixed delay between reconnection attempts
    pub reconnect_delay: Duration,
    pub prefetch: u16,
    /// Prefix of every consumer tag, usually the application id
    pub consumer_tag_prefix: String,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            prefetch: DEFAULT_PREFETCH,
            consumer_tag_prefix: "domain-relay".to_owned(),
        }
    }
}

struct Subscription {
    handler: Arc<dyn MessageHandler>,
    /// Stops the consumer currently serving this subscription
    cancel: CancellationToken,
}

struct Inner {
    transport: Arc<dyn Transport>,
    topology: Topology,
    settings: ConnectionSettings,
    channel: RwLock<Option<Arc<dyn BrokerChannel>>>,
    state: watch::Sender<ConnectionState>,
    subscriptions: RwLock<HashMap<String, Subscription>>,
    /// Serialises connect, subscribe, reconnect and close so a subscription registered while the
    /// supervisor is reconnecting is either re-bound by it or started on the fresh channel
    lifecycle: AsyncMutex<()>,
    shutdown: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// Handle to the broker connection; clones share the same connection
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("target", &self.inner.transport.describe())
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(
        transport: impl Transport,
        topology: Topology,
        settings: ConnectionSettings,
    ) -> Self {
        Self::from_shared(Arc::new(transport), topology, settings)
    }

    pub fn from_shared(
        transport: Arc<dyn Transport>,
        topology: Topology,
        settings: ConnectionSettings,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                transport,
                topology,
                settings,
                channel: RwLock::new(None),
                state,
                subscriptions: RwLock::new(HashMap::new()),
                lifecycle: AsyncMutex::new(()),
                shutdown: CancellationToken::new(),
                supervisor: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Connects, declares the topology and starts every registered subscription
    ///
    /// Makes a single attempt. Whatever the outcome, the background supervisor is running
    /// afterwards: on failure it keeps retrying every `reconnect_delay` until it succeeds or the
    /// manager is closed. Calling `connect` again once supervised is a no-op.
    ///
    /// # Errors
    /// The error of the failed attempt, or `Closed` after `close()`
    pub async fn connect(&self) -> Result<(), RabbitMQError> {
        let inner = &self.inner;
        inner.ensure_not_closed()?;
        let _lifecycle = inner.lifecycle.lock().await;
        inner.ensure_not_closed()?;

        if inner.supervisor.lock().is_some() {
            return match self.state() {
                ConnectionState::Connected => Ok(()),
                _ => Err(RabbitMQError::NotConnected),
            };
        }

        inner.set_state(ConnectionState::Connecting);
        info!(broker = %inner.transport.describe(), "connecting to broker");

        match inner.establish_and_resubscribe().await {
            Ok(channel) => {
                *inner.channel.write() = Some(channel);
                inner.set_state(ConnectionState::Connected);
                Inner::spawn_supervisor(inner, false);
                Ok(())
            }
            Err(err) => {
                error!(
                    retry_in_ms = inner.settings.reconnect_delay.as_millis() as u64,
                    "broker connection failed: {}", err
                );
                inner.set_state(ConnectionState::Reconnecting);
                Inner::spawn_supervisor(inner, true);
                Err(err)
            }
        }
    }

    /// Re-declares the topology on the current channel
    pub async fn setup_topology(&self) -> Result<(), RabbitMQError> {
        let channel = self.channel()?;
        setup_topology(channel.as_ref(), &self.inner.topology).await
    }

    /// Registers `handler` for `queue` and starts consuming when connected
    ///
    /// The pair is remembered and re-bound after every reconnection. While not connected the
    /// call succeeds and consumption starts once the supervisor is back. Subscribing to a queue
    /// again replaces its handler and stops the previous consumer.
    ///
    /// # Errors
    /// `Closed` after `close()`, or the broker's refusal to start the consumer (the
    /// registration is kept and retried on the next reconnection)
    pub async fn subscribe(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), RabbitMQError> {
        let inner = &self.inner;
        inner.ensure_not_closed()?;
        let _lifecycle = inner.lifecycle.lock().await;
        inner.ensure_not_closed()?;

        let previous = inner.subscriptions.write().insert(
            queue.to_owned(),
            Subscription {
                handler: Arc::clone(&handler),
                cancel: CancellationToken::new(),
            },
        );
        if let Some(previous) = previous {
            debug!(queue, "replacing existing subscription");
            previous.cancel.cancel();
        }

        let Some(channel) = inner.connected_channel() else {
            info!(queue, state = %self.state(), "subscription deferred until connected");
            return Ok(());
        };

        let cancel = inner.start_consumer(&channel, queue, handler).await?;
        if let Some(subscription) = inner.subscriptions.write().get_mut(queue) {
            subscription.cancel = cancel;
        }
        info!(queue, "subscribed");
        Ok(())
    }

    /// Stops consuming `queue` and forgets the subscription
    pub async fn unsubscribe(&self, queue: &str) -> bool {
        let _lifecycle = self.inner.lifecycle.lock().await;
        match self.inner.subscriptions.write().remove(queue) {
            Some(subscription) => {
                subscription.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Queues with a registered handler
    pub fn subscribed_queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self.inner.subscriptions.read().keys().cloned().collect();
        queues.sort();
        queues
    }

    /// Publishes one message on the current channel
    ///
    /// The tenant and trace ids of `ctx` are added to the headers unless already set.
    ///
    /// # Errors
    /// `NotConnected` unless connected (never blocks waiting for a reconnection), `Cancelled`
    /// or `DeadlineExceeded` from `ctx`, or the channel's publish error
    pub async fn publish(
        &self,
        ctx: &MessageContext,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: &MessageProperties,
    ) -> Result<(), RabbitMQError> {
        ctx.check()?;
        let channel = self.channel()?;
        let properties = with_context_headers(ctx, properties);
        select! {
            biased;
            err = ctx.interrupted() => Err(err),
            published = channel.publish(exchange, routing_key, body, &properties) => published,
        }
    }

    /// Publishes one message in confirm mode; await the returned confirmation separately
    ///
    /// Headers are filled from `ctx` the same way as [`publish`](Self::publish).
    pub async fn publish_confirmed(
        &self,
        ctx: &MessageContext,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: &MessageProperties,
    ) -> Result<PendingConfirm, RabbitMQError> {
        ctx.check()?;
        let channel = self.channel()?;
        let properties = with_context_headers(ctx, properties);
        select! {
            biased;
            err = ctx.interrupted() => Err(err),
            pending = channel.publish_confirmed(exchange, routing_key, body, &properties) => pending,
        }
    }

    /// Current channel, if connected
    pub fn channel(&self) -> Result<Arc<dyn BrokerChannel>, RabbitMQError> {
        self.inner.ensure_not_closed()?;
        self.inner
            .connected_channel()
            .ok_or(RabbitMQError::NotConnected)
    }

    /// Broker address for logs, without credentials
    pub fn target(&self) -> String {
        self.inner.transport.describe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Waits until the manager reaches `state`; `false` on timeout
    pub async fn wait_for(&self, state: ConnectionState, timeout: Duration) -> bool {
        let mut rx = self.inner.state.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(|current| *current == state)).await {
            Ok(reached) => reached.is_ok(),
            Err(_) => false,
        }
    }

    /// `Ok` when connected with a live channel
    pub fn health(&self) -> Result<(), RabbitMQError> {
        self.channel().map(|_| ())
    }

    pub fn topology(&self) -> &Topology {
        &self.inner.topology
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.inner.settings
    }

    /// Stops the supervisor and every consumer, then closes the channel
    ///
    /// Idempotent; later calls return immediately.
    pub async fn close(&self) -> Result<(), RabbitMQError> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        inner.shutdown.cancel();

        let supervisor = inner.supervisor.lock().take();
        if let Some(supervisor) = supervisor {
            if let Err(err) = supervisor.await {
                warn!("connection supervisor ended abnormally: {}", err);
            }
        }

        let _lifecycle = inner.lifecycle.lock().await;
        for subscription in inner.subscriptions.read().values() {
            subscription.cancel.cancel();
        }

        let channel = inner.channel.write().take();
        let result = match channel {
            Some(channel) => channel.close().await,
            None => Ok(()),
        };
        inner.set_state(ConnectionState::Disconnected);
        info!("broker connection closed");
        result
    }
}

impl Inner {
    fn ensure_not_closed(&self) -> Result<(), RabbitMQError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RabbitMQError::Closed);
        }
        Ok(())
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "connection state changed");
        }
    }

    fn connected_channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        if *self.state.borrow() != ConnectionState::Connected {
            return None;
        }
        self.channel
            .read()
            .as_ref()
            .filter(|channel| channel.is_open())
            .cloned()
    }

    /// Opens a channel, applies QoS, declares the topology and re-binds every subscription
    async fn establish_and_resubscribe(&self) -> Result<Arc<dyn BrokerChannel>, RabbitMQError> {
        let channel = self.transport.open().await?;

        let prepared = async {
            channel.set_prefetch(self.settings.prefetch).await?;
            setup_topology(channel.as_ref(), &self.topology).await?;
            self.resubscribe(&channel).await
        }
        .await;

        match prepared {
            Ok(()) => Ok(channel),
            Err(err) => {
                if let Err(close_err) = channel.close().await {
                    debug!("closing half-initialised channel failed: {}", close_err);
                }
                Err(err)
            }
        }
    }

    async fn resubscribe(&self, channel: &Arc<dyn BrokerChannel>) -> Result<(), RabbitMQError> {
        let registered: Vec<(String, Arc<dyn MessageHandler>)> = self
            .subscriptions
            .read()
            .iter()
            .map(|(queue, subscription)| (queue.clone(), Arc::clone(&subscription.handler)))
            .collect();

        for (queue, handler) in &registered {
            let cancel = self.start_consumer(channel, queue, Arc::clone(handler)).await?;
            if let Some(subscription) = self.subscriptions.write().get_mut(queue) {
                let previous = std::mem::replace(&mut subscription.cancel, cancel);
                previous.cancel();
            }
        }

        if !registered.is_empty() {
            info!(subscriptions = registered.len(), "subscriptions re-bound");
        }
        Ok(())
    }

    async fn start_consumer(
        &self,
        channel: &Arc<dyn BrokerChannel>,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<CancellationToken, RabbitMQError> {
        let consumer_tag = format!(
            "{}-{}-{}",
            self.settings.consumer_tag_prefix,
            queue,
            Uuid::new_v4().simple()
        );
        let deliveries = channel.consume(queue, &consumer_tag).await?;

        let cancel = self.shutdown.child_token();
        tokio::spawn(run_consumer(
            queue.to_owned(),
            consumer_tag,
            Arc::clone(channel),
            deliveries,
            handler,
            cancel.clone(),
        ));
        Ok(cancel)
    }

    fn spawn_supervisor(self: &Arc<Self>, lost: bool) {
        let mut slot = self.supervisor.lock();
        if slot.is_some() {
            return;
        }
        *slot = Some(tokio::spawn(supervise(
            Arc::downgrade(self),
            self.shutdown.clone(),
            self.settings.reconnect_delay,
            lost,
        )));
    }

    async fn reconnect(&self) -> Result<(), RabbitMQError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.ensure_not_closed()?;

        let channel = select! {
            _ = self.shutdown.cancelled() => return Err(RabbitMQError::Closed),
            established = self.establish_and_resubscribe() => established?,
        };
        *self.channel.write() = Some(channel);
        self.set_state(ConnectionState::Connected);
        info!(broker = %self.transport.describe(), "broker connection re-established");
        Ok(())
    }
}

/// Copy of `properties` with the tenant and trace ids of `ctx` filled in
fn with_context_headers(
    ctx: &MessageContext,
    properties: &MessageProperties,
) -> MessageProperties {
    let mut properties = properties.clone();
    ctx.fill_headers(&mut properties.headers);
    properties
}

/// Background task: waits for the channel to close, then reconnects with a fixed backoff
///
/// Holds the manager weakly so dropping every handle ends the task.
async fn supervise(
    inner: Weak<Inner>,
    shutdown: CancellationToken,
    reconnect_delay: Duration,
    mut lost: bool,
) {
    loop {
        if lost {
            select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(reconnect_delay) => {}
            }
        } else {
            let closed = {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                let closed = inner.channel.read().as_ref().map(|channel| channel.closed());
                closed
            };

            if let Some(closed) = closed {
                select! {
                    _ = shutdown.cancelled() => return,
                    _ = closed.cancelled() => {}
                }
            }

            let Some(inner) = inner.upgrade() else {
                return;
            };
            if shutdown.is_cancelled() {
                return;
            }
            warn!("broker connection lost, reconnecting");
            inner.channel.write().take();
            inner.set_state(ConnectionState::Reconnecting);
        }

        let Some(inner) = inner.upgrade() else {
            return;
        };
        match inner.reconnect().await {
            Ok(()) => lost = false,
            Err(RabbitMQError::Closed) => return,
            Err(err) => {
                warn!(
                    retry_in_ms = reconnect_delay.as_millis() as u64,
                    "reconnection attempt failed: {}", err
                );
                lost = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        consumer::handler_fn,
        memory::MemoryBroker,
        topology::QueueConfig,
        transport::Delivery,
    };

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            reconnect_delay: Duration::from_millis(20),
            ..ConnectionSettings::default()
        }
    }

    fn topology() -> Topology {
        Topology::new("test.events").with_queue(QueueConfig::new("process.events", "process.*"))
    }

    #[tokio::test]
    async fn connect_declares_topology() {
        let broker = MemoryBroker::new();
        let manager = ConnectionManager::new(broker.transport(), topology(), settings());

        manager.connect().await.unwrap();

        assert_eq!(manager.state(), ConnectionState::Connected);
        assert!(manager.health().is_ok());
        assert!(broker.has_exchange("test.events"));
        assert!(broker.has_exchange("test.events.dlx"));
        assert!(broker.queue_arguments("test.events.dead-letter").is_some());
        assert!(broker.queue_arguments("process.events").is_some());
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn publish_fails_fast_when_not_connected() {
        let broker = MemoryBroker::new();
        let manager = ConnectionManager::new(broker.transport(), topology(), settings());

        let err = manager
            .publish(
                &MessageContext::new(),
                "test.events",
                "process.created",
                vec![],
                &MessageProperties::json(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RabbitMQError::NotConnected));
    }

    #[tokio::test]
    async fn failed_connect_keeps_retrying_in_background() {
        let broker = MemoryBroker::new();
        broker.refuse_next_connects(2);
        let manager = ConnectionManager::new(broker.transport(), topology(), settings());

        assert!(manager.connect().await.is_err());
        assert_eq!(manager.state(), ConnectionState::Reconnecting);
        assert!(
            manager
                .wait_for(ConnectionState::Connected, Duration::from_secs(2))
                .await
        );
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_context_is_reported_as_cancelled() {
        let broker = MemoryBroker::new();
        let manager = ConnectionManager::new(broker.transport(), topology(), settings());
        manager.connect().await.unwrap();

        let ctx = MessageContext::new();
        ctx.cancel();
        let err = manager
            .publish(&ctx, "test.events", "process.created", vec![], &MessageProperties::json())
            .await
            .unwrap_err();
        assert!(matches!(err, RabbitMQError::Cancelled));
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn publish_carries_context_ids_without_overriding_explicit_headers() {
        let broker = MemoryBroker::new();
        let manager = ConnectionManager::new(broker.transport(), topology(), settings());
        manager.connect().await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        manager
            .subscribe(
                "process.events",
                handler_fn(move |_ctx: MessageContext, delivery: Delivery| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(delivery);
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();

        let ctx = MessageContext::new().with_tenant("acme").with_trace("trace-1");
        let properties = MessageProperties::json().with_header(crate::HEADER_TRACE_ID, "explicit");
        manager
            .publish(&ctx, "test.events", "process.created", b"{}".to_vec(), &properties)
            .await
            .unwrap();

        let delivery = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.properties.header(crate::HEADER_TENANT_ID), Some("acme"));
        assert_eq!(delivery.properties.header(crate::HEADER_TRACE_ID), Some("explicit"));
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_final() {
        let broker = MemoryBroker::new();
        let manager = ConnectionManager::new(broker.transport(), topology(), settings());
        manager.connect().await.unwrap();

        manager.close().await.unwrap();
        manager.close().await.unwrap();

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(matches!(manager.connect().await, Err(RabbitMQError::Closed)));
        assert!(matches!(manager.health(), Err(RabbitMQError::Closed)));
    }

    #[tokio::test]
    async fn resubscribing_replaces_the_consumer() {
        let broker = MemoryBroker::new();
        let manager = ConnectionManager::new(broker.transport(), topology(), settings());
        manager.connect().await.unwrap();

        let noop = || handler_fn(|_ctx: MessageContext, _delivery: Delivery| async { Ok(()) });
        manager.subscribe("process.events", noop()).await.unwrap();
        manager.subscribe("process.events", noop()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(broker.consumer_count("process.events"), 1);
        assert_eq!(manager.subscribed_queues(), vec!["process.events".to_owned()]);
        manager.close().await.unwrap();
    }
}
