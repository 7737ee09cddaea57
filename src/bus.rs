//! In-Process Domain Event Bus
//!
//! Publish/subscribe coupling the pipeline stages. Publication is
//! synchronous with respect to the publisher: handlers run in registration
//! order on the publishing task. Handler chains are independent per event
//! kind, and a handler that fails is logged and skipped, never fatal.
//!
//! Subscribers are held as `Weak` references; the composition root owns the
//! `Arc`s. Dead subscribers are pruned on the next publish.

use crate::domain::events::{DomainEvent, EventKind};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Short name used in dispatch logs.
    fn name(&self) -> &str;

    async fn handle(&self, event: &DomainEvent) -> anyhow::Result<()>;
}

/// Process-wide event bus. Clone the `Arc` handle freely; subscriptions and
/// publications share one registry.
#[derive(Default)]
pub struct DomainEventBus {
    subscribers: RwLock<HashMap<EventKind, Vec<Weak<dyn EventHandler>>>>,
}

impl DomainEventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Append `handler` to the chain for `kind`. The bus keeps only a weak
    /// reference; the caller must keep the `Arc` alive.
    pub fn subscribe(&self, kind: EventKind, handler: &Arc<dyn EventHandler>) {
        let mut subs = self.subscribers.write();
        subs.entry(kind).or_default().push(Arc::downgrade(handler));
    }

    /// Dispatch `event` to its chain in registration order.
    pub async fn publish(&self, event: &DomainEvent) {
        let chain: Vec<Arc<dyn EventHandler>> = {
            let mut subs = self.subscribers.write();
            match subs.get_mut(&event.kind()) {
                Some(list) => {
                    list.retain(|w| w.strong_count() > 0);
                    list.iter().filter_map(Weak::upgrade).collect()
                }
                None => Vec::new(),
            }
        };

        if chain.is_empty() {
            debug!(kind = ?event.kind(), "no subscribers for event");
            return;
        }

        for handler in chain {
            if let Err(e) = handler.handle(event).await {
                warn!(
                    handler = handler.name(),
                    kind = ?event.kind(),
                    error = %e,
                    "event handler failed; continuing chain"
                );
            }
        }
    }

    /// Publish a batch in order (used to flush aggregate/job event queues).
    pub async fn publish_all(&self, events: &[DomainEvent]) {
        for event in events {
            self.publish(event).await;
        }
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscribers
            .read()
            .get(&kind)
            .map(|l| l.iter().filter(|w| w.strong_count() > 0).count())
            .unwrap_or(0)
    }
}
