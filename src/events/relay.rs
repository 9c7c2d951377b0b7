//! Redis pub/sub transport for the event bus.
//!
//! Each topic maps to one Redis channel, `{prefix}:events:{topic}`. Messages
//! carry the id of the process that sent them so a relay drops its own
//! events instead of delivering them twice. Redis pub/sub is not durable:
//! processes that are not connected when an event is sent never see it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::bus::{EventBus, EventSink};
use super::{Event, EventError, Topic};

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize, Deserialize)]
struct RelayEnvelope {
    origin: Uuid,
    event: Event,
}

enum ListenExit {
    Shutdown,
    Disconnected,
}

/// Forwards bus events to other processes and delivers theirs locally.
pub struct RedisEventRelay {
    client: redis::Client,
    publisher: ConnectionManager,
    prefix: String,
    origin: Uuid,
}

impl RedisEventRelay {
    /// Opens the publishing connection.
    pub async fn connect(redis_url: &str, prefix: &str) -> Result<Self, EventError> {
        let client = redis::Client::open(redis_url)?;
        let publisher = ConnectionManager::new(client.clone()).await?;

        Ok(Self {
            client,
            publisher,
            prefix: prefix.to_string(),
            origin: Uuid::new_v4(),
        })
    }

    /// Identifier stamped on every event this relay sends.
    pub fn origin(&self) -> Uuid {
        self.origin
    }

    fn channel(&self, topic: Topic) -> String {
        format!("{}:events:{}", self.prefix, topic)
    }

    /// Subscribes to every topic channel and delivers remote events to `bus`
    /// until `shutdown` fires. Reconnects after connection loss.
    pub fn spawn_listener(
        self: &Arc<Self>,
        bus: Arc<EventBus>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let relay = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match relay.listen(&bus, &mut shutdown).await {
                    Ok(ListenExit::Shutdown) => break,
                    Ok(ListenExit::Disconnected) => {
                        warn!("Event relay subscription closed, reconnecting");
                    }
                    Err(e) => {
                        warn!(error = %e, "Event relay subscription failed, reconnecting");
                    }
                }

                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
            debug!(origin = %relay.origin, "Event relay listener stopped");
        })
    }

    async fn listen(
        &self,
        bus: &EventBus,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<ListenExit, EventError> {
        let mut pubsub = self.client.get_async_connection().await?.into_pubsub();
        for topic in Topic::ALL {
            pubsub.subscribe(self.channel(topic)).await?;
        }
        info!(origin = %self.origin, prefix = %self.prefix, "Event relay subscribed");

        let mut messages = pubsub.on_message();
        loop {
            let msg = tokio::select! {
                _ = shutdown.recv() => return Ok(ListenExit::Shutdown),
                msg = messages.next() => msg,
            };
            let Some(msg) = msg else {
                return Ok(ListenExit::Disconnected);
            };

            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(channel = %msg.get_channel_name(), error = %e, "Unreadable relay message");
                    continue;
                }
            };

            match serde_json::from_str::<RelayEnvelope>(&payload) {
                Ok(envelope) if envelope.origin == self.origin => {}
                Ok(envelope) => {
                    bus.deliver_local(&envelope.event).await;
                }
                Err(e) => {
                    warn!(channel = %msg.get_channel_name(), error = %e, "Malformed relay message");
                }
            }
        }
    }
}

#[async_trait]
impl EventSink for RedisEventRelay {
    async fn forward(&self, event: &Event) -> Result<(), EventError> {
        let envelope = RelayEnvelope {
            origin: self.origin,
            event: event.clone(),
        };
        let payload = serde_json::to_string(&envelope)?;

        let mut conn = self.publisher.clone();
        let receivers: i64 = conn.publish(self.channel(event.topic()), payload).await?;
        debug!(topic = %event.topic(), receivers = receivers, "Event forwarded");
        Ok(())
    }
}
