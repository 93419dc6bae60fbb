//! In-process event bus and the event types that flow over it.
//!
//! Every inbound trigger (Slack message, webhook delivery, scheduler
//! fire) and every outbound agent result is an [`Event`].  Components
//! subscribe per [`EventKind`]; `publish` dispatches directly and does
//! not return until every matching handler has run.  A failing handler
//! is logged and skipped so the remaining subscribers still see the
//! event; the publisher never observes handler errors.
//!
//! Events are not persisted: every state-changing fact is written to
//! the [`crate::storage::Database`] by the producing component before
//! it publishes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Event model
// ---------------------------------------------------------------------------

/// Fields shared by every event variant.
#[derive(Debug, Clone)]
pub struct EventMeta {
    /// Unique event id.
    pub id: String,
    /// Creation time (UTC).
    pub timestamp: DateTime<Utc>,
    /// Producing component, e.g. `"slack"`, `"scheduler"`, `"webhook"`.
    pub source: &'static str,
}

impl EventMeta {
    pub fn new(source: &'static str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            source,
        }
    }
}

/// A message from a Slack user.
#[derive(Debug, Clone)]
pub struct UserMessageEvent {
    pub meta: EventMeta,
    pub user_id: String,
    pub channel_id: String,
    pub text: String,
}

impl UserMessageEvent {
    pub fn new(
        user_id: impl Into<String>,
        channel_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            meta: EventMeta::new("slack"),
            user_id: user_id.into(),
            channel_id: channel_id.into(),
            text: text.into(),
        }
    }
}

/// An external webhook delivery (GitHub, Notion, ...).
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub meta: EventMeta,
    pub provider: String,
    pub event_type_name: String,
    pub payload: serde_json::Value,
}

/// A cron/scheduled trigger.
#[derive(Debug, Clone)]
pub struct ScheduledEvent {
    pub meta: EventMeta,
    pub job_id: String,
    pub job_name: String,
    pub prompt: String,
    pub working_directory: PathBuf,
    pub target_channel_ids: Vec<String>,
    pub skill_name: Option<String>,
}

/// An agent has produced a response to deliver.
///
/// An empty `channel_id` means "broadcast to the configured default
/// notification channels".
#[derive(Debug, Clone)]
pub struct AgentResponseEvent {
    pub meta: EventMeta,
    pub channel_id: String,
    pub text: String,
    pub originating_event_id: Option<String>,
}

/// Tagged union of everything that can cross the bus.
#[derive(Debug, Clone)]
pub enum Event {
    UserMessage(UserMessageEvent),
    Webhook(WebhookEvent),
    Scheduled(ScheduledEvent),
    AgentResponse(AgentResponseEvent),
}

/// Discriminant used for subscription matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    UserMessage,
    Webhook,
    Scheduled,
    AgentResponse,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::UserMessage(_) => EventKind::UserMessage,
            Event::Webhook(_) => EventKind::Webhook,
            Event::Scheduled(_) => EventKind::Scheduled,
            Event::AgentResponse(_) => EventKind::AgentResponse,
        }
    }

    pub fn meta(&self) -> &EventMeta {
        match self {
            Event::UserMessage(e) => &e.meta,
            Event::Webhook(e) => &e.meta,
            Event::Scheduled(e) => &e.meta,
            Event::AgentResponse(e) => &e.meta,
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// A subscriber on the bus.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

/// In-process publish/subscribe dispatcher.
///
/// Injectable (`Arc<EventBus>`), never a global.  Handlers for one
/// event run sequentially in registration order; no ordering is
/// promised between events of different kinds.
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<EventKind, Vec<Arc<dyn EventHandler>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for every published event of `kind`.
    pub async fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        self.handlers.write().await.entry(kind).or_default().push(handler);
    }

    /// Dispatch `event` to all matching handlers, in registration
    /// order, awaiting each.  Handler errors are logged and skipped.
    pub async fn publish(&self, event: Event) {
        // Clone the handler list up front so a handler may itself
        // publish without deadlocking on the registry lock.
        let matching = {
            let handlers = self.handlers.read().await;
            handlers.get(&event.kind()).cloned().unwrap_or_default()
        };

        debug!(
            kind = ?event.kind(),
            event_id = %event.meta().id,
            subscribers = matching.len(),
            "publishing event"
        );

        for handler in matching {
            if let Err(e) = handler.handle(&event).await {
                warn!(
                    kind = ?event.kind(),
                    event_id = %event.meta().id,
                    error = %e,
                    "event handler failed; continuing with remaining subscribers"
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
