//! Bus-to-observer fan-out.
//!
//! [`TransportBroadcaster`] subscribes to the real-time topics and forwards every
//! event, with its payload untouched, to each registered [`TransportSink`]. A sink that
//! fails a send is disconnected; observers that reconnect re-query the store for state
//! they missed.

use crate::constants::events::TRANSPORT_TOPICS;
use crate::error::{EventError, TransportError};
use crate::events::{Event, EventBus, EventHandler, SubscriptionId};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Envelope delivered to observers: `{"type": <topic>, "payload": {...}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub payload: Map<String, Value>,
}

impl TransportMessage {
    pub fn from_event(event: &Event) -> Self {
        Self {
            message_type: event.event_type.clone(),
            payload: event.payload.clone(),
        }
    }

    pub fn to_json(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(|err| TransportError::Encode(err.to_string()))
    }
}

/// One connected observer (a websocket session, an SSE stream, a test collector)
#[async_trait]
pub trait TransportSink: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, message: &TransportMessage) -> Result<(), TransportError>;
}

/// Handle for a registered sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

pub struct TransportBroadcaster {
    bus: Arc<EventBus>,
    sinks: DashMap<ConnectionId, Arc<dyn TransportSink>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl fmt::Debug for TransportBroadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportBroadcaster")
            .field("connections", &self.sinks.len())
            .field("subscribed", &!self.subscriptions.lock().is_empty())
            .finish()
    }
}

impl TransportBroadcaster {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            sinks: DashMap::new(),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to every real-time topic. Calling it again is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut subscriptions = self.subscriptions.lock();
        if !subscriptions.is_empty() {
            return;
        }
        for topic in TRANSPORT_TOPICS {
            let handler: Arc<dyn EventHandler> = Arc::clone(self) as Arc<dyn EventHandler>;
            subscriptions.push(self.bus.subscribe(topic, handler));
        }
        info!(topics = ?TRANSPORT_TOPICS, "Transport broadcaster started");
    }

    pub fn stop(&self) {
        for id in self.subscriptions.lock().drain(..) {
            self.bus.unsubscribe(id);
        }
    }

    pub fn connect(&self, sink: Arc<dyn TransportSink>) -> ConnectionId {
        let id = ConnectionId(Uuid::new_v4());
        debug!(connection_id = %id, sink = sink.name(), "Observer connected");
        self.sinks.insert(id, sink);
        id
    }

    pub fn disconnect(&self, id: ConnectionId) -> bool {
        self.sinks.remove(&id).is_some()
    }

    pub fn connection_count(&self) -> usize {
        self.sinks.len()
    }

    /// Deliver `event` to every sink. Returns how many sinks accepted it.
    pub async fn broadcast(&self, event: &Event) -> usize {
        let message = TransportMessage::from_event(event);
        let sinks: Vec<(ConnectionId, Arc<dyn TransportSink>)> = self
            .sinks
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();

        let results = join_all(sinks.iter().map(|(id, sink)| {
            let message = &message;
            async move { (*id, sink.name().to_string(), sink.send(message).await) }
        }))
        .await;

        let mut delivered = 0;
        for (id, name, result) in results {
            match result {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(connection_id = %id, sink = %name, error = %err, "Disconnecting observer");
                    self.sinks.remove(&id);
                }
            }
        }
        delivered
    }
}

#[async_trait]
impl EventHandler for TransportBroadcaster {
    fn name(&self) -> &str {
        "transport_broadcaster"
    }

    async fn handle(&self, event: Arc<Event>) -> Result<(), EventError> {
        self.broadcast(&event).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::events as topics;
    use serde_json::json;

    #[derive(Default)]
    struct Collector {
        messages: Mutex<Vec<TransportMessage>>,
        broken: bool,
    }

    #[async_trait]
    impl TransportSink for Collector {
        fn name(&self) -> &str {
            "collector"
        }

        async fn send(&self, message: &TransportMessage) -> Result<(), TransportError> {
            if self.broken {
                return Err(TransportError::Closed {
                    sink: self.name().to_string(),
                });
            }
            self.messages.lock().push(message.clone());
            Ok(())
        }
    }

    fn progress_event() -> Event {
        let payload = json!({"job_id": "m1", "status": "running", "progress_text": "1 pending, 0 running, 0 completed, 0 failed"});
        match payload {
            Value::Object(map) => Event::new(topics::JOB_PROGRESS, map),
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_payload_is_forwarded_untouched() {
        let broadcaster = TransportBroadcaster::new(Arc::new(EventBus::default()));
        let sink = Arc::new(Collector::default());
        broadcaster.connect(sink.clone());

        let event = progress_event();
        assert_eq!(broadcaster.broadcast(&event).await, 1);

        let messages = sink.messages.lock();
        assert_eq!(messages[0].message_type, "job.progress");
        assert_eq!(messages[0].payload, event.payload);
        let encoded = messages[0].to_json().unwrap();
        assert!(encoded.starts_with(r#"{"type":"job.progress","payload":"#));
    }

    #[tokio::test]
    async fn test_failing_sink_is_disconnected() {
        let broadcaster = TransportBroadcaster::new(Arc::new(EventBus::default()));
        broadcaster.connect(Arc::new(Collector {
            broken: true,
            ..Default::default()
        }));
        let healthy = Arc::new(Collector::default());
        broadcaster.connect(healthy.clone());

        assert_eq!(broadcaster.broadcast(&progress_event()).await, 1);
        assert_eq!(broadcaster.connection_count(), 1);
        assert_eq!(healthy.messages.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_started_broadcaster_receives_bus_events() {
        let bus = Arc::new(EventBus::default());
        let broadcaster = Arc::new(TransportBroadcaster::new(Arc::clone(&bus)));
        broadcaster.start();
        let sink = Arc::new(Collector::default());
        broadcaster.connect(sink.clone());

        bus.publish(progress_event());
        bus.publish(Event::new("job.unrelated", Map::new()));

        for _ in 0..100 {
            if !sink.messages.lock().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let messages = sink.messages.lock();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message_type, "job.progress");
    }
}
