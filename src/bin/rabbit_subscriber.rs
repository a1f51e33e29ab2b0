use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use rabbitmq::{ConnectionState, MessageContext};
use tracing::{info, warn};

use domain_relay::{
    Config, EnvelopeHandler, EventResult, EventSubscriber, ReceivedEvent, telemetry,
};

/// Consumes a queue and logs every event envelope it receives
#[derive(Parser, Debug)]
#[command(name = "rabbit_subscriber", version)]
struct Opt {
    /// Queues to consume
    #[arg(short, long, default_values_t = vec!["process.events".to_string()])]
    queue: Vec<String>,
}

struct EnvelopePrinter;

#[async_trait]
impl EnvelopeHandler for EnvelopePrinter {
    async fn handle(&self, ctx: &MessageContext, event: &ReceivedEvent) -> EventResult<()> {
        info!(
            event_type = event.event_type(),
            event_id = %event.event_id,
            aggregate_id = %event.envelope.aggregate_id,
            version = %event.envelope.event_version,
            occurred_at = %event.envelope.occurred_at,
            routing_key = %event.routing_key,
            redelivered = event.redelivered,
            tenant_id = ctx.tenant_id(),
            trace_id = ctx.trace_id(),
            payload = event.envelope.payload.get(),
            "Received event"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();

    // Initialize logging
    telemetry::init_tracing();

    let config = Config::try_from_env().context("failed to load configuration")?;
    let manager = config.connection_manager();
    info!("Connecting to RabbitMQ at: {}", manager.target());
    if let Err(err) = manager.connect().await {
        warn!("broker not reachable yet, retrying in background: {}", err);
    }

    let subscriber = EventSubscriber::new(manager.clone());
    let printer = Arc::new(EnvelopePrinter);
    for queue in &opt.queue {
        subscriber
            .subscribe(queue, printer.clone())
            .await
            .with_context(|| format!("failed to subscribe to {queue}"))?;
        info!(queue = %queue, "Waiting for events");
    }

    let mut state = manager.watch_state();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                if current == ConnectionState::Connected {
                    info!("connection (re)established");
                } else {
                    warn!(state = %current, "connection state changed");
                }
            }
        }
    }

    info!("shutting down");
    manager.close().await.context("failed to close broker connection")?;
    Ok(())
}
