//! Fire-and-forget domain events.
//!
//! Events are published after the producing transaction commits. Payloads are
//! snapshots; listeners that need current state must re-read it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use super::context::Context;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Signup,
    Confirmed,
    Login,
    Logout,
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub kind: EventKind,
    pub user_id: Uuid,
    pub provider: Option<String>,
    pub ip_address: Option<String>,
    pub fields: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    #[must_use]
    pub fn new(kind: EventKind, ctx: &Context, user_id: Uuid) -> Self {
        Self {
            kind,
            user_id,
            provider: ctx.provider().map(ToString::to_string),
            ip_address: ctx.ip().map(|ip| ip.to_string()),
            fields: Map::new(),
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_provider(mut self, provider: &str) -> Self {
        self.provider = Some(provider.to_string());
        self
    }

    #[must_use]
    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }
}

#[derive(Debug, Clone)]
pub struct Dispatch {
    sender: Option<broadcast::Sender<Event>>,
}

impl Dispatch {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(DEFAULT_CAPACITY);
        Self {
            sender: Some(sender),
        }
    }

    /// Drops every event.
    #[must_use]
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    /// `None` when dispatch is disabled.
    #[must_use]
    pub fn subscribe(&self) -> Option<broadcast::Receiver<Event>> {
        self.sender.as_ref().map(broadcast::Sender::subscribe)
    }

    pub fn publish(&self, event: Event) {
        let Some(sender) = &self.sender else {
            return;
        };
        if sender.receiver_count() == 0 {
            debug!(kind = ?event.kind, "no event listeners");
            return;
        }
        if let Err(err) = sender.send(event) {
            debug!(kind = ?err.0.kind, "event dropped: listeners went away");
        }
    }
}

impl Default for Dispatch {
    fn default() -> Self {
        Self::new()
    }
}
