//! In-process event bus with an explicit handler registry.
//!
//! # Guarantees
//!
//! - **At-most-once delivery**: handlers see events published while they are subscribed
//! - **Deterministic order**: handlers of a topic run one after another, in
//!   registration order
//! - **Isolation**: a failing or panicking handler does not stop delivery to the
//!   others, and the publisher never sees the failure
//!
//! For guaranteed processing, enqueue a job instead.

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, warn};

use super::{Event, EventError, Topic};
use crate::metrics::MetricsCollector;

/// Receives events for a topic.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

/// Transport that carries events beyond this process.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn forward(&self, event: &Event) -> Result<(), EventError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        (self.0)(event.clone()).await
    }
}

/// Wraps an async closure as an [`EventHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

struct Registration {
    id: SubscriptionId,
    name: String,
    handler: Arc<dyn EventHandler>,
}

/// What happened to one published event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Handlers that returned `Ok`.
    pub delivered: usize,
    /// Handlers that returned an error or panicked.
    pub failed: usize,
    /// Whether the event was handed to the cross-process sink.
    pub forwarded: bool,
}

impl PublishReport {
    pub fn attempted(&self) -> usize {
        self.delivered + self.failed
    }
}

/// Topic → handlers registry.
///
/// # Example
///
/// ```ignore
/// let bus = EventBus::new();
/// bus.subscribe(Topic::PostGenerated, "log", handler_fn(|event| async move {
///     tracing::info!(project = %event.project(), "Posts ready");
///     Ok(())
/// }));
/// bus.publish(event).await;
/// ```
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<BTreeMap<Topic, Vec<Registration>>>,
    next_id: AtomicU64,
    sink: RwLock<Option<Arc<dyn EventSink>>>,
    metrics: MetricsCollector,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `topic` for the lifetime of the bus (or until
    /// [`unsubscribe`](Self::unsubscribe)). `name` only appears in logs.
    pub fn subscribe(
        &self,
        topic: Topic,
        name: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let registration = Registration {
            id,
            name: name.into(),
            handler,
        };
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        handlers.entry(topic).or_default().push(registration);
        id
    }

    /// Returns `false` if the id was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for registrations in handlers.values_mut() {
            if let Some(pos) = registrations.iter().position(|r| r.id == id) {
                registrations.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&topic)
            .map_or(0, Vec::len)
    }

    /// Sends every event published from now on to `sink` as well.
    pub fn set_sink(&self, sink: Arc<dyn EventSink>) {
        *self
            .sink
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(sink);
    }

    /// Delivers to local handlers, then forwards to the sink if one is set.
    pub async fn publish(&self, event: Event) -> PublishReport {
        self.metrics.record_event(event.topic().as_str());
        let mut report = self.deliver_local(&event).await;

        let sink = self
            .sink
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(sink) = sink {
            match sink.forward(&event).await {
                Ok(()) => report.forwarded = true,
                Err(e) => {
                    warn!(topic = %event.topic(), error = %e, "Failed to forward event");
                }
            }
        }

        report
    }

    /// Delivers to local handlers only. Used for events arriving from another
    /// process, which must not be forwarded again.
    pub async fn deliver_local(&self, event: &Event) -> PublishReport {
        let topic = event.topic();
        // Snapshot so handlers may subscribe or publish without deadlocking.
        let targets: Vec<(String, Arc<dyn EventHandler>)> = self
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&topic)
            .map(|registrations| {
                registrations
                    .iter()
                    .map(|r| (r.name.clone(), Arc::clone(&r.handler)))
                    .collect()
            })
            .unwrap_or_default();

        let mut report = PublishReport::default();
        if targets.is_empty() {
            debug!(topic = %topic, "No subscribers for event");
            return report;
        }

        for (name, handler) in targets {
            match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!(topic = %topic, handler = %name, error = %format!("{:#}", e), "Event handler failed");
                }
                Err(_) => {
                    report.failed += 1;
                    warn!(topic = %topic, handler = %name, "Event handler panicked");
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{InsightNew, PostGenerated};
    use std::sync::Mutex;

    fn post_generated(project: &str) -> Event {
        Event::PostGenerated(PostGenerated {
            project: project.to_string(),
            count: 2,
        })
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, label: &'static str) -> Arc<dyn EventHandler> {
        let log = Arc::clone(log);
        handler_fn(move |event: Event| {
            let log = Arc::clone(&log);
            async move {
                log.lock()
                    .expect("log lock")
                    .push(format!("{}:{}", label, event.project()));
                Ok::<(), anyhow::Error>(())
            }
        })
    }

    struct PanickingHandler;

    #[async_trait]
    impl EventHandler for PanickingHandler {
        async fn handle(&self, _event: &Event) -> anyhow::Result<()> {
            panic!("bad handler");
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        let report = bus.publish(post_generated("p1")).await;
        assert_eq!(report, PublishReport::default());
    }

    #[tokio::test]
    async fn test_fan_out_in_registration_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(Topic::PostGenerated, "first", recorder(&log, "first"));
        bus.subscribe(Topic::PostGenerated, "second", recorder(&log, "second"));
        bus.subscribe(Topic::InsightNew, "other", recorder(&log, "other"));

        let report = bus.publish(post_generated("p1")).await;

        assert_eq!(report.delivered, 2);
        assert_eq!(
            *log.lock().expect("log lock"),
            vec!["first:p1".to_string(), "second:p1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_failing_handlers_do_not_block_others() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(
            Topic::InsightNew,
            "broken",
            handler_fn(|_event: Event| async { Err::<(), _>(anyhow::anyhow!("db down")) }),
        );
        bus.subscribe(Topic::InsightNew, "panics", Arc::new(PanickingHandler));
        bus.subscribe(Topic::InsightNew, "ok", recorder(&log, "ok"));

        let event = Event::InsightNew(InsightNew {
            project: "p1".to_string(),
            data: serde_json::json!([]),
        });
        let report = bus.publish(event).await;

        assert_eq!(report.failed, 2);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.attempted(), 3);
        assert_eq!(log.lock().expect("log lock").len(), 1);
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_events() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.publish(post_generated("early")).await;
        bus.subscribe(Topic::PostGenerated, "late", recorder(&log, "late"));
        bus.publish(post_generated("later")).await;

        assert_eq!(*log.lock().expect("log lock"), vec!["late:later".to_string()]);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = bus.subscribe(Topic::PostGenerated, "gone", recorder(&log, "gone"));

        assert_eq!(bus.subscriber_count(Topic::PostGenerated), 1);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.subscriber_count(Topic::PostGenerated), 0);

        bus.publish(post_generated("p1")).await;
        assert!(log.lock().expect("log lock").is_empty());
    }

    struct RecordingSink(Mutex<Vec<Topic>>);

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn forward(&self, event: &Event) -> Result<(), EventError> {
            self.0.lock().expect("sink lock").push(event.topic());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_sink_receives_published_but_not_local_only() {
        let bus = EventBus::new();
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        bus.set_sink(sink.clone());

        let report = bus.publish(post_generated("p1")).await;
        assert!(report.forwarded);

        bus.deliver_local(&post_generated("p2")).await;
        assert_eq!(*sink.0.lock().expect("sink lock"), vec![Topic::PostGenerated]);
    }
}
