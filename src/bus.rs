//! In-memory publish/subscribe bus for agent coordination
//!
//! Delivery is synchronous and in subscription order; subscribers that need
//! to do real work should forward the envelope into their own mailbox and
//! return, keeping the bus a thin delivery mechanism.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::protocol::Message;

/// A published message plus its delivery metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub channel: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Message,
}

type Handler = Arc<dyn Fn(&Envelope) -> anyhow::Result<()> + Send + Sync>;

struct Registration {
    id: u64,
    handler: Handler,
}

/// Handle returned by [`MessageBus::subscribe`], used to unsubscribe
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    channel: String,
    id: u64,
}

/// Named-channel message bus with append-only per-channel history
pub struct MessageBus {
    history: RwLock<HashMap<String, Vec<Envelope>>>,
    subscribers: RwLock<HashMap<String, Vec<Registration>>>,
    next_id: AtomicU64,
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            history: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Publish a message to a channel
    ///
    /// Appends a timestamped envelope to the channel history, then invokes
    /// every currently-registered subscriber in subscription order. A failing
    /// subscriber is logged and skipped; it never stops delivery to the rest
    /// nor reaches the publisher.
    pub fn publish(&self, channel: &str, message: Message) {
        let envelope = Envelope {
            channel: channel.to_string(),
            timestamp: Utc::now(),
            payload: message,
        };

        self.history
            .write()
            .entry(channel.to_string())
            .or_default()
            .push(envelope.clone());

        // Snapshot handlers outside the lock so a subscriber may itself publish.
        let handlers: Vec<(u64, Handler)> = self
            .subscribers
            .read()
            .get(channel)
            .map(|regs| {
                regs.iter()
                    .map(|r| (r.id, Arc::clone(&r.handler)))
                    .collect()
            })
            .unwrap_or_default();

        for (id, handler) in handlers {
            if let Err(error) = handler(&envelope) {
                warn!(
                    channel,
                    subscription = id,
                    error = %error,
                    "subscriber failed; continuing delivery"
                );
            }
        }
    }

    /// Register a handler for a channel
    pub fn subscribe<F>(&self, channel: &str, handler: F) -> SubscriptionHandle
    where
        F: Fn(&Envelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .entry(channel.to_string())
            .or_default()
            .push(Registration {
                id,
                handler: Arc::new(handler),
            });
        debug!(channel, subscription = id, "subscribed");
        SubscriptionHandle {
            channel: channel.to_string(),
            id,
        }
    }

    /// Remove a registration; returns false if it was already gone
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let mut subscribers = self.subscribers.write();
        let Some(regs) = subscribers.get_mut(&handle.channel) else {
            return false;
        };
        let before = regs.len();
        regs.retain(|r| r.id != handle.id);
        before != regs.len()
    }

    /// Read a channel's history, excluding envelopes at or before `since`
    pub fn history(&self, channel: &str, since: Option<DateTime<Utc>>) -> Vec<Envelope> {
        let history = self.history.read();
        let Some(entries) = history.get(channel) else {
            return Vec::new();
        };
        match since {
            Some(ts) => entries.iter().filter(|e| e.timestamp > ts).cloned().collect(),
            None => entries.clone(),
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}
