//--------------------------------------------------------------------------------------------------
// STRUCTS & TRAITS
//--------------------------------------------------------------------------------------------------
// | Name                    | Description                                       | Key Methods       |
// |-------------------------|---------------------------------------------------|-------------------|
// | EventDispatcher         | Fans events out to local handlers, then forwards  | subscribe,        |
// |                         | them to the broker                                | publish           |
//--------------------------------------------------------------------------------------------------

use std::{collections::HashMap, panic::AssertUnwindSafe, sync::Arc, time::Instant};

use futures::FutureExt;
use rabbitmq::{MessageContext, panic_message};
use tokio::sync::RwLock;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use super::{
    handlers::EventHandler,
    publishers::EventPublisher,
    types::{DomainEvent, EventError, EventResult},
};

/// In-process publish/subscribe for domain events
///
/// Handlers run on their own tasks: `publish` returns once they have been started, not when they
/// finish, and a failing or panicking handler never affects its siblings or the caller. Create one
/// dispatcher at startup and share it.
pub struct EventDispatcher {
    /// Map of event types to handlers, in registration order
    handlers: RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
    /// Remote leg of `publish`
    publisher: Option<Arc<dyn EventPublisher>>,
    tasks: TaskTracker,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDispatcher {
    /// Dispatcher delivering locally only
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            publisher: None,
            tasks: TaskTracker::new(),
        }
    }

    /// Also forwards every published event through `publisher`
    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Registers a handler for `event_type`
    pub async fn subscribe(&self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) {
        let event_type = event_type.into();
        debug!(event_type = %event_type, handler = handler.name(), "handler registered");
        self.handlers
            .write()
            .await
            .entry(event_type)
            .or_default()
            .push(handler);
    }

    pub async fn handler_count(&self, event_type: &str) -> usize {
        self.handlers
            .read()
            .await
            .get(event_type)
            .map_or(0, Vec::len)
    }

    /// Delivers `event` to local handlers and forwards it to the broker
    ///
    /// Succeeds once local dispatch is started. A failed forward is logged as a warning and does
    /// not fail the call. Without handlers for the type the local leg is a no-op.
    ///
    /// # Errors
    /// `EventError::Cancelled` if `ctx` is already cancelled or expired
    pub async fn publish(&self, ctx: &MessageContext, event: &DomainEvent) -> EventResult<()> {
        if let Err(err) = ctx.check() {
            return Err(EventError::Cancelled(err.to_string()));
        }

        self.dispatch_local(ctx, event).await;

        if let Some(publisher) = &self.publisher {
            if let Err(err) = publisher.publish(ctx, event).await {
                warn!(
                    event_type = event.event_type(),
                    event_id = event.id(),
                    transient = err.is_transient(),
                    "remote delivery failed: {}",
                    err
                );
            }
        }
        Ok(())
    }

    /// Delivers `event` to local handlers only and returns how many were started
    ///
    /// Used for events that arrived from the broker, which must not be forwarded again.
    pub async fn dispatch_local(&self, ctx: &MessageContext, event: &DomainEvent) -> usize {
        // copy the handler list so no lock is held while user code runs
        let handlers = {
            let registry = self.handlers.read().await;
            registry.get(event.event_type()).cloned().unwrap_or_default()
        };

        if handlers.is_empty() {
            debug!(event_type = event.event_type(), "no handlers registered");
            return 0;
        }

        let event = Arc::new(event.clone());
        // handlers may outlive the caller; keep the ids, drop the cancellation
        let ctx = ctx.detached();
        for handler in &handlers {
            let handler = Arc::clone(handler);
            let event = Arc::clone(&event);
            let ctx = ctx.clone();
            self.tasks.spawn(async move {
                run_handler(handler, ctx, event).await;
            });
        }
        handlers.len()
    }

    /// Waits for every handler started so far to finish
    pub async fn wait_idle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }
}

async fn run_handler(handler: Arc<dyn EventHandler>, ctx: MessageContext, event: Arc<DomainEvent>) {
    let started = Instant::now();
    let outcome = AssertUnwindSafe(handler.handle_event(&ctx, &event))
        .catch_unwind()
        .await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(Ok(())) => debug!(
            event_type = event.event_type(),
            handler = handler.name(),
            elapsed_ms,
            "event handled"
        ),
        Ok(Err(err)) => error!(
            event_type = event.event_type(),
            event_id = event.id(),
            handler = handler.name(),
            tenant_id = ctx.tenant_id(),
            trace_id = ctx.trace_id(),
            "handler failed to process event: {}",
            err
        ),
        Err(panic) => error!(
            event_type = event.event_type(),
            event_id = event.id(),
            handler = handler.name(),
            tenant_id = ctx.tenant_id(),
            trace_id = ctx.trace_id(),
            "handler panicked: {}",
            panic_message(panic.as_ref())
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{handlers::from_fn, publishers::PublishError};
    use async_trait::async_trait;
    use mockall::mock;
    use rabbitmq::RabbitMQError;
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        time::Duration,
    };
    use tokio::sync::Notify;

    mock! {
        pub Publisher {}

        #[async_trait]
        impl EventPublisher for Publisher {
            async fn publish(&self, ctx: &MessageContext, event: &DomainEvent) -> Result<(), PublishError>;
            async fn publish_batch(&self, ctx: &MessageContext, events: &[DomainEvent]) -> Result<(), PublishError>;
        }
    }

    fn counting_handler(counter: &Arc<AtomicUsize>) -> Arc<dyn EventHandler> {
        let counter = Arc::clone(counter);
        from_fn("counter", move |_ctx, _event| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn every_handler_for_the_type_runs() {
        let dispatcher = EventDispatcher::new();
        let calls = Arc::new(AtomicUsize::new(0));
        dispatcher.subscribe("process.created", counting_handler(&calls)).await;
        dispatcher.subscribe("process.created", counting_handler(&calls)).await;
        dispatcher.subscribe("process.archived", counting_handler(&calls)).await;

        let event = DomainEvent::new("process.created", "p-1", b"{}".to_vec());
        dispatcher.publish(&MessageContext::new(), &event).await.unwrap();
        dispatcher.wait_idle().await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failing_handler_does_not_stop_siblings() {
        let dispatcher = EventDispatcher::new();
        let calls = Arc::new(AtomicUsize::new(0));
        dispatcher
            .subscribe(
                "party.added",
                from_fn("broken", |_ctx, _event| async {
                    Err(EventError::ProcessingError("storage down".into()))
                }),
            )
            .await;
        dispatcher.subscribe("party.added", counting_handler(&calls)).await;

        let event = DomainEvent::new("party.added", "x", b"{}".to_vec());
        assert_eq!(dispatcher.dispatch_local(&MessageContext::new(), &event).await, 2);
        dispatcher.wait_idle().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn remote_failure_is_only_a_warning() {
        let mut publisher = MockPublisher::new();
        publisher
            .expect_publish()
            .times(1)
            .returning(|_, _| Err(PublishError::Unavailable(RabbitMQError::NotConnected)));
        let dispatcher = EventDispatcher::new().with_publisher(Arc::new(publisher));

        let event = DomainEvent::new("process.created", "p-1", b"{}".to_vec());
        tokio_test::assert_ok!(dispatcher.publish(&MessageContext::new(), &event).await);
    }

    #[tokio::test]
    async fn local_only_dispatch_never_forwards() {
        let mut publisher = MockPublisher::new();
        publisher.expect_publish().never();
        let dispatcher = EventDispatcher::new().with_publisher(Arc::new(publisher));
        let calls = Arc::new(AtomicUsize::new(0));
        dispatcher.subscribe("movement.created", counting_handler(&calls)).await;

        let event = DomainEvent::new("movement.created", "m-1", b"{}".to_vec());
        dispatcher.dispatch_local(&MessageContext::new(), &event).await;
        dispatcher.wait_idle().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_context_is_rejected_before_dispatch() {
        let dispatcher = EventDispatcher::new();
        let calls = Arc::new(AtomicUsize::new(0));
        dispatcher.subscribe("process.created", counting_handler(&calls)).await;

        let ctx = MessageContext::new();
        ctx.cancel();
        let event = DomainEvent::new("process.created", "p-1", b"{}".to_vec());

        assert!(matches!(
            dispatcher.publish(&ctx, &event).await,
            Err(EventError::Cancelled(_))
        ));
        dispatcher.wait_idle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn publish_returns_before_handlers_finish() {
        let dispatcher = EventDispatcher::new();
        let release = Arc::new(Notify::new());
        let finished = Arc::new(AtomicBool::new(false));
        {
            let release = Arc::clone(&release);
            let finished = Arc::clone(&finished);
            dispatcher
                .subscribe(
                    "process.synced",
                    from_fn("blocked", move |_ctx, _event| {
                        let release = Arc::clone(&release);
                        let finished = Arc::clone(&finished);
                        async move {
                            release.notified().await;
                            finished.store(true, Ordering::SeqCst);
                            Ok(())
                        }
                    }),
                )
                .await;
        }

        let event = DomainEvent::new("process.synced", "p-1", b"{}".to_vec());
        let published = tokio::time::timeout(
            Duration::from_millis(200),
            dispatcher.publish(&MessageContext::new(), &event),
        )
        .await;

        assert!(matches!(published, Ok(Ok(()))));
        assert!(!finished.load(Ordering::SeqCst));

        release.notify_one();
        dispatcher.wait_idle().await;
        assert!(finished.load(Ordering::SeqCst));
    }
}
