//! TinyBus — the in-process message bus decoupling session injection, chat
//! handling, conversation logging, and outbound peer delivery (spec §4.7).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

/// Broadcast channel capacity for bus observability events. Lagging
/// subscribers drop old events rather than block publishers.
const EVENT_BROADCAST_CAP: usize = 256;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("tinybus has not been started")]
    NotStarted,
    #[error("provider '{0}' is already registered")]
    DuplicateProvider(String),
    #[error("unknown destination provider '{0}'")]
    UnknownDestination(String),
}

/// A message routed through the bus. `destination` is `None` for broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    pub id: Uuid,
    pub source: String,
    pub destination: Option<String>,
    pub message_type: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl BusMessage {
    pub fn broadcast(source: impl Into<String>, message_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            destination: None,
            message_type: message_type.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn directed(
        source: impl Into<String>,
        destination: impl Into<String>,
        message_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            destination: Some(destination.into()),
            message_type: message_type.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Observability events emitted by the bus (spec §4.7).
#[derive(Debug, Clone)]
pub enum BusEvent {
    Started,
    Stopped,
    MessageInbound(BusMessage),
    MessageOutbound(BusMessage),
    MessageRouted { message: BusMessage, provider: String },
    MessageDropped { message: BusMessage, reason: String },
    MessageError { message: BusMessage, provider: Option<String>, error: String },
}

/// A participant on the bus. Providers are identified by a stable id and
/// declare which message types they handle; routing by type is additional
/// to the directed/broadcast split.
#[async_trait]
pub trait Provider: Send + Sync {
    fn id(&self) -> &str;
    async fn start(&self) -> anyhow::Result<()>;
    async fn stop(&self) -> anyhow::Result<()>;
    fn is_ready(&self) -> bool;
    /// Delivers a message to this provider. Stands in for the `onMessage`
    /// handler registration of a callback-based bus: here the provider
    /// itself is the handler.
    async fn receive(&self, message: BusMessage) -> anyhow::Result<()>;
    fn message_types(&self) -> Vec<String>;
}

#[derive(Default)]
struct BusState {
    providers: HashMap<String, Arc<dyn Provider>>,
    started: bool,
}

pub struct TinyBus {
    state: Mutex<BusState>,
    events: broadcast::Sender<BusEvent>,
}

impl Default for TinyBus {
    fn default() -> Self {
        Self::new()
    }
}

impl TinyBus {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BROADCAST_CAP);
        Self { state: Mutex::new(BusState::default()), events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: BusEvent) {
        let _ = self.events.send(event);
    }

    pub async fn register(&self, provider: Arc<dyn Provider>) -> Result<(), BusError> {
        let mut state = self.state.lock().await;
        let id = provider.id().to_string();
        if state.providers.contains_key(&id) {
            return Err(BusError::DuplicateProvider(id));
        }
        state.providers.insert(id, provider);
        Ok(())
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        let providers: Vec<Arc<dyn Provider>> = {
            let mut state = self.state.lock().await;
            state.started = true;
            state.providers.values().cloned().collect()
        };
        for provider in providers {
            provider.start().await?;
        }
        self.emit(BusEvent::Started);
        Ok(())
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        let providers: Vec<Arc<dyn Provider>> = {
            let mut state = self.state.lock().await;
            state.started = false;
            state.providers.values().cloned().collect()
        };
        for provider in providers {
            if let Err(error) = provider.stop().await {
                warn!(provider = provider.id(), %error, "provider failed to stop cleanly");
            }
        }
        self.emit(BusEvent::Stopped);
        Ok(())
    }

    /// Routes `message` to its `destination` provider, or fans it out to
    /// every other registered provider when `destination` is `None`.
    pub async fn publish(&self, message: BusMessage) -> Result<(), BusError> {
        let (started, providers) = {
            let state = self.state.lock().await;
            (state.started, state.providers.clone())
        };
        if !started {
            return Err(BusError::NotStarted);
        }

        self.emit(BusEvent::MessageInbound(message.clone()));

        match &message.destination {
            Some(destination) => {
                let Some(provider) = providers.get(destination).cloned() else {
                    self.emit(BusEvent::MessageDropped {
                        message: message.clone(),
                        reason: format!("unknown destination '{destination}'"),
                    });
                    return Err(BusError::UnknownDestination(destination.clone()));
                };
                self.deliver(&message, provider).await;
            }
            None => {
                for (id, provider) in providers {
                    if id == message.source {
                        continue;
                    }
                    self.deliver(&message, provider).await;
                }
            }
        }

        self.emit(BusEvent::MessageOutbound(message));
        Ok(())
    }

    async fn deliver(&self, message: &BusMessage, provider: Arc<dyn Provider>) {
        let provider_id = provider.id().to_string();
        match provider.receive(message.clone()).await {
            Ok(()) => self.emit(BusEvent::MessageRouted { message: message.clone(), provider: provider_id }),
            Err(error) => {
                debug!(provider = %provider_id, %error, "provider failed to handle message");
                self.emit(BusEvent::MessageError {
                    message: message.clone(),
                    provider: Some(provider_id),
                    error: error.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct RecordingProvider {
        id: String,
        ready: AtomicBool,
        received: std::sync::Mutex<Vec<BusMessage>>,
        fail: AtomicBool,
        start_calls: AtomicUsize,
    }

    impl RecordingProvider {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                ready: AtomicBool::new(false),
                received: std::sync::Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
                start_calls: AtomicUsize::new(0),
            })
        }

        fn failing(id: &str) -> Arc<Self> {
            let provider = Self::new(id);
            provider.fail.store(true, Ordering::SeqCst);
            provider
        }
    }

    #[async_trait]
    impl Provider for RecordingProvider {
        fn id(&self) -> &str {
            &self.id
        }

        async fn start(&self) -> anyhow::Result<()> {
            self.start_calls.fetch_add(1, Ordering::SeqCst);
            self.ready.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> anyhow::Result<()> {
            self.ready.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }

        async fn receive(&self, message: BusMessage) -> anyhow::Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("simulated provider failure");
            }
            self.received.lock().unwrap().push(message);
            Ok(())
        }

        fn message_types(&self) -> Vec<String> {
            vec!["test".to_string()]
        }
    }

    #[tokio::test]
    async fn publish_before_start_fails() {
        let bus = TinyBus::new();
        let msg = BusMessage::broadcast("a", "ping", serde_json::json!({}));
        assert!(matches!(bus.publish(msg).await, Err(BusError::NotStarted)));
    }

    #[tokio::test]
    async fn duplicate_provider_registration_fails() {
        let bus = TinyBus::new();
        bus.register(RecordingProvider::new("a")).await.unwrap();
        let err = bus.register(RecordingProvider::new("a")).await.unwrap_err();
        assert!(matches!(err, BusError::DuplicateProvider(id) if id == "a"));
    }

    #[tokio::test]
    async fn directed_message_reaches_only_destination() {
        let bus = TinyBus::new();
        let a = RecordingProvider::new("a");
        let b = RecordingProvider::new("b");
        bus.register(a.clone()).await.unwrap();
        bus.register(b.clone()).await.unwrap();
        bus.start().await.unwrap();

        let msg = BusMessage::directed("a", "b", "ping", serde_json::json!({"n": 1}));
        bus.publish(msg).await.unwrap();

        assert_eq!(a.received.lock().unwrap().len(), 0);
        assert_eq!(b.received.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn broadcast_message_reaches_everyone_but_source() {
        let bus = TinyBus::new();
        let a = RecordingProvider::new("a");
        let b = RecordingProvider::new("b");
        let c = RecordingProvider::new("c");
        bus.register(a.clone()).await.unwrap();
        bus.register(b.clone()).await.unwrap();
        bus.register(c.clone()).await.unwrap();
        bus.start().await.unwrap();

        let msg = BusMessage::broadcast("a", "announce", serde_json::json!({}));
        bus.publish(msg).await.unwrap();

        assert_eq!(a.received.lock().unwrap().len(), 0);
        assert_eq!(b.received.lock().unwrap().len(), 1);
        assert_eq!(c.received.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_destination_is_dropped_and_errors() {
        let bus = TinyBus::new();
        bus.register(RecordingProvider::new("a")).await.unwrap();
        bus.start().await.unwrap();

        let msg = BusMessage::directed("a", "ghost", "ping", serde_json::json!({}));
        let err = bus.publish(msg).await.unwrap_err();
        assert!(matches!(err, BusError::UnknownDestination(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn provider_error_is_surfaced_as_event_and_does_not_abort_fanout() {
        let bus = TinyBus::new();
        let a = RecordingProvider::new("a");
        let failing = RecordingProvider::failing("b");
        let c = RecordingProvider::new("c");
        bus.register(a.clone()).await.unwrap();
        bus.register(failing.clone()).await.unwrap();
        bus.register(c.clone()).await.unwrap();
        bus.start().await.unwrap();

        let mut events = bus.subscribe();
        let msg = BusMessage::broadcast("a", "announce", serde_json::json!({}));
        bus.publish(msg).await.unwrap();

        assert_eq!(c.received.lock().unwrap().len(), 1);

        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            if let BusEvent::MessageError { provider: Some(provider), .. } = event {
                if provider == "b" {
                    saw_error = true;
                }
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn start_and_stop_emit_lifecycle_events() {
        let bus = TinyBus::new();
        let mut events = bus.subscribe();
        bus.start().await.unwrap();
        bus.stop().await.unwrap();

        let first = events.recv().await.unwrap();
        let second = events.recv().await.unwrap();
        assert!(matches!(first, BusEvent::Started));
        assert!(matches!(second, BusEvent::Stopped));
    }
}
