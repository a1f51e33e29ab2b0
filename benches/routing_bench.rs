use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use tokio::runtime::Runtime;

use domain_relay::{
    DomainEvent, EventDispatcher, EventPublisher, RabbitEventPublisher, RoutingTable,
    config::process_service_topology, events::from_fn,
};
use rabbitmq::{ConnectionManager, ConnectionSettings, MemoryBroker, MessageContext, topic_matches};

const EVENT_TYPES: &[&str] = &[
    "process.created",
    "process.synced",
    "process.batch.sync.completed",
    "movement.important.detected",
    "party.updated",
    "billing.invoice.sent",
];

fn routing_benchmark(c: &mut Criterion) {
    let table = RoutingTable::process_service();
    let mut group = c.benchmark_group("routing");
    group.throughput(Throughput::Elements(EVENT_TYPES.len() as u64));

    group.bench_function("routing_key", |b| {
        b.iter(|| {
            for event_type in EVENT_TYPES {
                black_box(table.routing_key(black_box(event_type)));
            }
        });
    });

    let topology = process_service_topology("domain.events");
    group.bench_function("queues_for", |b| {
        b.iter(|| {
            for event_type in EVENT_TYPES {
                black_box(topology.queues_for(table.routing_key(event_type)));
            }
        });
    });

    group.finish();
}

fn topic_matching_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("topic_matches");
    let cases = [
        ("exact", "movement.analyzed", "movement.analyzed"),
        ("star", "process.sync.*", "process.sync.completed"),
        ("hash", "domain.#", "domain.process.sync.batch.completed"),
        ("miss", "party.*", "process.monitoring.enabled"),
    ];

    for (name, pattern, key) in cases {
        group.bench_with_input(BenchmarkId::from_parameter(name), &(pattern, key), |b, (p, k)| {
            b.iter(|| black_box(topic_matches(black_box(p), black_box(k))));
        });
    }

    group.finish();
}

// Publish path against the in-process broker, without network cost
fn publish_benchmark(c: &mut Criterion) {
    let rt = Runtime::new().expect("failed to build runtime");
    let broker = MemoryBroker::new();
    let publisher = rt.block_on(async {
        let manager = ConnectionManager::new(
            broker.transport(),
            process_service_topology("domain.events"),
            ConnectionSettings::default(),
        );
        manager.connect().await.expect("memory broker connects");
        RabbitEventPublisher::new(manager, "bench")
    });
    let ctx = MessageContext::new().with_tenant("bench").with_trace("bench");

    let mut group = c.benchmark_group("publish");
    group.sample_size(20);

    group.bench_function("single_event", |b| {
        b.iter(|| {
            rt.block_on(async {
                let event = DomainEvent::new("process.created", "p-1", b"{}".to_vec());
                publisher.publish(&ctx, &event).await.expect("publish");
            });
            broker.drain("process.events");
        });
    });

    for size in [10usize, 100] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("confirmed_batch", size), &size, |b, &size| {
            b.iter(|| {
                rt.block_on(async {
                    let events: Vec<DomainEvent> = (0..size)
                        .map(|i| DomainEvent::new("party.added", format!("x-{i}"), b"{}".to_vec()))
                        .collect();
                    publisher.publish_batch(&ctx, &events).await.expect("batch");
                });
                broker.drain("party.events");
            });
        });
    }

    group.finish();
}

fn dispatch_benchmark(c: &mut Criterion) {
    let rt = Runtime::new().expect("failed to build runtime");
    let dispatcher = Arc::new(EventDispatcher::new());
    rt.block_on(async {
        for n in 0..4 {
            dispatcher
                .subscribe(
                    "movement.created",
                    from_fn(format!("noop-{n}"), |_ctx, _event| async { Ok(()) }),
                )
                .await;
        }
    });
    let ctx = MessageContext::new();
    let event = DomainEvent::new("movement.created", "m-1", b"{}".to_vec());

    c.bench_function("dispatch_local_4_handlers", |b| {
        b.iter(|| {
            rt.block_on(async {
                black_box(dispatcher.dispatch_local(&ctx, &event).await);
                dispatcher.wait_idle().await;
            });
        });
    });
}

criterion_group!(
    benches,
    routing_benchmark,
    topic_matching_benchmark,
    publish_benchmark,
    dispatch_benchmark
);
criterion_main!(benches);
