//! Real-time fan-out to connected clients
//!
//! Publishing never blocks and never fails: with no subscribers the event is
//! dropped, and a subscriber that falls behind skips what it missed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::TriageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Dashboard,
    Queue,
    Alerts,
    Patient,
}

/// What a connected client asked to receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientKind {
    Dashboard,
    Queue,
    Alerts,
    All,
}

impl ClientKind {
    /// Patient events only reach clients subscribed to everything.
    pub fn wants(self, topic: Topic) -> bool {
        match self {
            ClientKind::All => true,
            ClientKind::Dashboard => topic == Topic::Dashboard,
            ClientKind::Queue => topic == Topic::Queue,
            ClientKind::Alerts => topic == Topic::Alerts,
        }
    }
}

impl FromStr for ClientKind {
    type Err = TriageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "dashboard" => Ok(ClientKind::Dashboard),
            "queue" => Ok(ClientKind::Queue),
            "alerts" => Ok(ClientKind::Alerts),
            "all" => Ok(ClientKind::All),
            other => Err(TriageError::Validation(format!("unknown client type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub topic: Topic,
    #[serde(rename = "type")]
    pub event: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

pub trait Notifier: Send + Sync {
    fn publish(&self, topic: Topic, event: &str, data: serde_json::Value);
}

#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<Notification>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        BroadcastNotifier { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Notifier for BroadcastNotifier {
    fn publish(&self, topic: Topic, event: &str, data: serde_json::Value) {
        let notification = Notification {
            topic,
            event: event.to_string(),
            data,
            timestamp: Utc::now(),
        };
        // Err only means nobody is listening.
        if self.sender.send(notification).is_err() {
            trace!(?topic, event, "no subscribers");
        }
    }
}
