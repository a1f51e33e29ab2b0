use std::time::Duration;

use tracing::{debug, info};

use crate::{RabbitMQError, transport::BrokerChannel};

/// Default lifetime of a message sitting in a feature queue before it is dead-lettered
pub const DEFAULT_MESSAGE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Routes by routing-key glob (`*` one word, `#` zero or more words)
    Topic,
    /// Routes on exact routing-key equality
    Direct,
    /// Routes to every bound queue
    Fanout,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Topic => "topic",
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
        }
    }

    /// Whether a message with `routing_key` goes to a queue bound with `pattern`
    pub fn routes(&self, pattern: &str, routing_key: &str) -> bool {
        match self {
            ExchangeKind::Topic => topic_matches(pattern, routing_key),
            ExchangeKind::Direct => pattern == routing_key,
            ExchangeKind::Fanout => true,
        }
    }
}

/// Broker-side policies declared with a queue
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueArguments {
    /// `x-message-ttl`
    pub message_ttl: Option<Duration>,
    /// `x-dead-letter-exchange`
    pub dead_letter_exchange: Option<String>,
    /// `x-dead-letter-routing-key`
    pub dead_letter_routing_key: Option<String>,
    /// `x-delivery-limit`, which also makes the queue a quorum queue
    pub delivery_limit: Option<u32>,
}

impl QueueArguments {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Static descriptor of one feature queue bound to the events exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub name: String,
    pub routing_key_pattern: String,
    pub durable: bool,
    /// Expire and dead-letter messages instead of keeping them forever
    pub dead_lettered: bool,
    /// Deliveries allowed before the broker dead-letters a message that keeps failing
    pub delivery_limit: Option<u32>,
}

impl QueueConfig {
    /// Durable, dead-lettered queue bound by `routing_key_pattern`
    pub fn new(name: impl Into<String>, routing_key_pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            routing_key_pattern: routing_key_pattern.into(),
            durable: true,
            dead_lettered: true,
            delivery_limit: None,
        }
    }

    pub fn with_delivery_limit(mut self, limit: u32) -> Self {
        self.delivery_limit = Some(limit);
        self
    }

    pub fn without_dead_letter(mut self) -> Self {
        self.dead_lettered = false;
        self
    }

    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }
}

/// The full set of exchanges and queues the manager declares on every (re)connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub dead_letter_exchange: String,
    pub dead_letter_queue: String,
    pub message_ttl: Option<Duration>,
    pub queues: Vec<QueueConfig>,
}

impl Topology {
    /// Topology with the DLX/DLQ named after `exchange` and no feature queues
    pub fn new(exchange: impl Into<String>) -> Self {
        let exchange = exchange.into();
        Self {
            dead_letter_exchange: format!("{exchange}.dlx"),
            dead_letter_queue: format!("{exchange}.dead-letter"),
            exchange,
            message_ttl: Some(DEFAULT_MESSAGE_TTL),
            queues: Vec::new(),
        }
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queues.push(queue);
        self
    }

    pub fn with_dead_letter_queue(mut self, name: impl Into<String>) -> Self {
        self.dead_letter_queue = name.into();
        self
    }

    pub fn with_message_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.message_ttl = ttl;
        self
    }

    /// Arguments declared for `queue`
    pub fn arguments_for(&self, queue: &QueueConfig) -> QueueArguments {
        if !queue.dead_lettered {
            return QueueArguments {
                delivery_limit: queue.delivery_limit,
                ..QueueArguments::default()
            };
        }

        QueueArguments {
            message_ttl: self.message_ttl,
            dead_letter_exchange: Some(self.dead_letter_exchange.clone()),
            dead_letter_routing_key: Some(queue.name.clone()),
            delivery_limit: queue.delivery_limit,
        }
    }

    /// Names of the queues a message published with `routing_key` lands in
    pub fn queues_for(&self, routing_key: &str) -> Vec<&str> {
        self.queues
            .iter()
            .filter(|q| topic_matches(&q.routing_key_pattern, routing_key))
            .map(|q| q.name.as_str())
            .collect()
    }
}

/// Declares the events exchange, the dead-letter exchange and queue, and every feature queue
///
/// # Errors
/// Returns the first declaration or binding error; nothing is rolled back
pub async fn setup_topology(
    channel: &dyn BrokerChannel,
    topology: &Topology,
) -> Result<(), RabbitMQError> {
    channel
        .declare_exchange(&topology.exchange, ExchangeKind::Topic, true)
        .await?;
    channel
        .declare_exchange(&topology.dead_letter_exchange, ExchangeKind::Topic, true)
        .await?;
    channel
        .declare_queue(&topology.dead_letter_queue, true, &QueueArguments::default())
        .await?;
    channel
        .bind_queue(
            &topology.dead_letter_queue,
            &topology.dead_letter_exchange,
            "#",
        )
        .await?;

    for queue in &topology.queues {
        let arguments = topology.arguments_for(queue);
        channel
            .declare_queue(&queue.name, queue.durable, &arguments)
            .await?;
        channel
            .bind_queue(&queue.name, &topology.exchange, &queue.routing_key_pattern)
            .await?;
        debug!(
            queue = %queue.name,
            pattern = %queue.routing_key_pattern,
            "queue declared and bound"
        );
    }

    info!(
        exchange = %topology.exchange,
        dead_letter_queue = %topology.dead_letter_queue,
        queues = topology.queues.len(),
        "topology declared"
    );
    Ok(())
}

/// AMQP topic matching: words are dot separated, `*` matches exactly one word and `#` matches
/// zero or more words
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| matches_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && matches_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && matches_words(rest, &key[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_matches_exactly_one_word() {
        assert!(topic_matches("process.*", "process.created"));
        assert!(!topic_matches("process.*", "process.sync.completed"));
        assert!(!topic_matches("process.*", "process"));
    }

    #[test]
    fn hash_matches_zero_or_more_words() {
        assert!(topic_matches("#", ""));
        assert!(topic_matches("#", "a.b.c"));
        assert!(topic_matches("process.#", "process"));
        assert!(topic_matches("process.#", "process.sync.batch.started"));
        assert!(topic_matches("#.completed", "process.sync.completed"));
        assert!(!topic_matches("movement.#", "process.created"));
    }

    #[test]
    fn literal_patterns_need_exact_keys() {
        assert!(topic_matches("movement.analyzed", "movement.analyzed"));
        assert!(!topic_matches("movement.analyzed", "movement.created"));
    }

    #[test]
    fn dead_lettered_queues_carry_ttl_and_dlx() {
        let topology = Topology::new("domain.events")
            .with_queue(QueueConfig::new("process.events", "process.*").with_delivery_limit(5));

        let args = topology.arguments_for(&topology.queues[0]);
        assert_eq!(args.message_ttl, Some(DEFAULT_MESSAGE_TTL));
        assert_eq!(args.dead_letter_exchange.as_deref(), Some("domain.events.dlx"));
        assert_eq!(args.dead_letter_routing_key.as_deref(), Some("process.events"));
        assert_eq!(args.delivery_limit, Some(5));
    }

    #[test]
    fn queues_for_follows_bindings() {
        let topology = Topology::new("domain.events")
            .with_queue(QueueConfig::new("process.events", "process.*"))
            .with_queue(QueueConfig::new("monitoring.events", "process.monitoring.*"));

        assert_eq!(topology.queues_for("process.created"), vec!["process.events"]);
        assert_eq!(
            topology.queues_for("process.monitoring.enabled"),
            vec!["monitoring.events"]
        );
    }
}
