use std::{sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use rabbitmq::MessageContext;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use domain_relay::{
    AsyncBatchingPublisher, Config, DomainEvent, EventDispatcher, EventLogger,
    InstrumentedPublisher, RabbitEventPublisher, RecorderMetrics, telemetry,
};

/// Event types the demo producer cycles through
const DEMO_EVENT_TYPES: &[&str] = &[
    "process.created",
    "movement.created",
    "party.added",
    "process.synced",
    "movement.important.detected",
];

/// Demo producer: publishes process service events locally and to the broker
#[derive(Parser, Debug)]
#[command(name = "domain-relay", version)]
struct Opt {
    /// Number of events to publish
    #[arg(short, long, default_value_t = 20)]
    events: usize,

    /// Pause between events in milliseconds
    #[arg(short, long, default_value_t = 250)]
    interval_ms: u64,

    /// Tenant id attached to every event
    #[arg(short, long, default_value = "demo-tenant")]
    tenant: String,

    /// Use the in-process broker instead of RabbitMQ
    #[arg(long)]
    memory: bool,

    /// Events kept by the local logger
    #[arg(long, default_value_t = 100)]
    history: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let opt = Opt::parse();

    // Initialize logging
    telemetry::init_tracing();

    dotenv::dotenv().ok();
    let config = Config::try_from_lookup(|key| {
        if opt.memory && key == "EVENTS_BROKER" {
            return Some("memory".to_string());
        }
        std::env::var(key).ok()
    })
    .context("failed to load configuration")?;

    info!(broker = ?config.broker, app_id = %config.app_id, "starting domain relay");

    let manager = config.connection_manager();
    if let Err(err) = manager.connect().await {
        // the supervisor keeps retrying in the background
        warn!("broker not reachable yet: {}", err);
    }

    // Broker publisher, instrumented, behind the batching buffer
    let rabbit = RabbitEventPublisher::new(manager.clone(), config.app_id.clone())
        .with_confirm_timeout(config.confirm_timeout);
    let instrumented = Arc::new(InstrumentedPublisher::new(rabbit, Arc::new(RecorderMetrics)));
    let batching = Arc::new(AsyncBatchingPublisher::new(
        instrumented.clone(),
        config.batching,
    ));

    // Set up the event system
    let logger = Arc::new(EventLogger::new(opt.history));
    let dispatcher = EventDispatcher::new().with_publisher(batching.clone());
    for event_type in DEMO_EVENT_TYPES {
        dispatcher.subscribe(*event_type, logger.clone()).await;
    }

    let trace_id = Uuid::new_v4().to_string();
    let ctx = MessageContext::new()
        .with_tenant(opt.tenant.clone())
        .with_trace(trace_id.clone());

    let producer = async {
        for n in 0..opt.events {
            let event = demo_event(n)?;
            dispatcher.publish(&ctx, &event).await?;
            tokio::time::sleep(Duration::from_millis(opt.interval_ms)).await;
        }
        anyhow::Ok(())
    };

    tokio::select! {
        result = producer => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            ctx.cancel();
        }
    }

    batching.close().await;
    dispatcher.wait_idle().await;

    let stats = instrumented.stats();
    info!(
        published = stats.total_published,
        failed = stats.total_failed,
        observed = logger.get_history().await.len(),
        trace_id = %trace_id,
        "demo finished"
    );

    manager.close().await.context("failed to close broker connection")?;
    Ok(())
}

fn demo_event(n: usize) -> anyhow::Result<DomainEvent> {
    let event_type = DEMO_EVENT_TYPES[n % DEMO_EVENT_TYPES.len()];
    let process_id = format!("process-{}", n / DEMO_EVENT_TYPES.len());

    let payload = match event_type {
        "process.created" => json!({ "process_id": process_id, "court": "TJSP" }),
        "movement.created" | "movement.important.detected" => {
            json!({ "process_id": process_id, "movement_id": Uuid::new_v4(), "sequence": n })
        }
        "party.added" => json!({ "process_id": process_id, "name": "ACME Ltda", "role": "plaintiff" }),
        _ => json!({ "process_id": process_id, "synced_movements": n }),
    };

    Ok(DomainEvent::json(event_type, process_id, &payload)?)
}
