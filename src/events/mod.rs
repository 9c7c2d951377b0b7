//! Fire-and-forget notifications between stages and processes.
//!
//! Unlike the job queues in [`crate::scheduler`], events are not stored,
//! retried or acknowledged. A handler that is not subscribed when an event is
//! published never sees it.

pub mod bus;
pub mod relay;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use bus::{handler_fn, EventBus, EventHandler, EventSink, PublishReport, SubscriptionId};
pub use relay::RedisEventRelay;

/// Errors raised by event transports.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown topic: {0}")]
    UnknownTopic(String),
}

/// Named channel for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Topic {
    ScrapeRequested,
    InsightNew,
    PostGenerated,
}

impl Topic {
    pub const ALL: [Topic; 3] = [Topic::ScrapeRequested, Topic::InsightNew, Topic::PostGenerated];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::ScrapeRequested => "scrape.requested",
            Topic::InsightNew => "insight.new",
            Topic::PostGenerated => "post.generated",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| EventError::UnknownTopic(s.to_string()))
    }
}

/// A project was added to a watchlist and should be scraped.
///
/// `request_id` is assigned where the request first enters the system and is
/// carried through the relay unchanged, so every process that receives the
/// same request agrees on its identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeRequested {
    #[serde(default = "Uuid::new_v4")]
    pub request_id: Uuid,
    pub project: String,
    pub fid: u64,
}

impl ScrapeRequested {
    pub fn new(project: impl Into<String>, fid: u64) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            project: project.into(),
            fid,
        }
    }
}

/// A scrape stored new insights. `data` is whatever the scraper reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightNew {
    pub project: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostGenerated {
    pub project: String,
    pub count: u64,
}

/// An event with its topic. Serialized as `{"topic": ..., "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", content = "payload")]
pub enum Event {
    #[serde(rename = "scrape.requested")]
    ScrapeRequested(ScrapeRequested),
    #[serde(rename = "insight.new")]
    InsightNew(InsightNew),
    #[serde(rename = "post.generated")]
    PostGenerated(PostGenerated),
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Event::ScrapeRequested(_) => Topic::ScrapeRequested,
            Event::InsightNew(_) => Topic::InsightNew,
            Event::PostGenerated(_) => Topic::PostGenerated,
        }
    }

    /// Builds an event from a topic name and a JSON payload.
    pub fn from_parts(topic: Topic, payload: serde_json::Value) -> Result<Self, EventError> {
        let event = match topic {
            Topic::ScrapeRequested => Event::ScrapeRequested(serde_json::from_value(payload)?),
            Topic::InsightNew => Event::InsightNew(serde_json::from_value(payload)?),
            Topic::PostGenerated => Event::PostGenerated(serde_json::from_value(payload)?),
        };
        Ok(event)
    }

    pub fn project(&self) -> &str {
        match self {
            Event::ScrapeRequested(e) => &e.project,
            Event::InsightNew(e) => &e.project,
            Event::PostGenerated(e) => &e.project,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_topic_names() {
        for topic in Topic::ALL {
            assert_eq!(topic.as_str().parse::<Topic>().expect("parse"), topic);
        }
        assert!(matches!(
            "insight.old".parse::<Topic>(),
            Err(EventError::UnknownTopic(_))
        ));
    }

    #[test]
    fn test_event_wire_format() {
        let request_id = Uuid::new_v4();
        let event = Event::ScrapeRequested(ScrapeRequested {
            request_id,
            project: "degen".to_string(),
            fid: 3621,
        });
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(
            value,
            json!({
                "topic": "scrape.requested",
                "payload": {"request_id": request_id.to_string(), "project": "degen", "fid": 3621}
            })
        );
        let decoded: Event = serde_json::from_value(value).expect("deserialize");
        assert_eq!(decoded, event);
        assert_eq!(event.topic(), Topic::ScrapeRequested);
        assert_eq!(event.project(), "degen");
    }

    #[test]
    fn test_event_from_parts() {
        let event = Event::from_parts(
            Topic::PostGenerated,
            json!({"project": "p1", "count": 4}),
        )
        .expect("valid payload");
        assert_eq!(
            event,
            Event::PostGenerated(PostGenerated {
                project: "p1".to_string(),
                count: 4
            })
        );

        assert!(Event::from_parts(Topic::ScrapeRequested, json!({"project": "p1"})).is_err());

        // A request without an id is given one where it is first parsed.
        let Event::ScrapeRequested(request) =
            Event::from_parts(Topic::ScrapeRequested, json!({"project": "p1", "fid": 1}))
                .expect("id is optional on input")
        else {
            panic!("expected scrape.requested");
        };
        assert!(!request.request_id.is_nil());
    }
}
