//! In-memory transport for tests.
//!
//! Enabled with the `test-support` feature. Every publish is recorded in a
//! log shared by all transports from the same factory, and tests can push
//! inbound messages or transport errors at will.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use udmi_schema::EndpointConfiguration;

use crate::{
    AckSender, BoxFuture, ErrorHandler, InboundMessage, MessageHandler, PublishAck, Transport,
    TransportError, TransportFactory, device_topic, suffix_matches,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub client_id: Option<String>,
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Published {
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.payload).ok()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

#[derive(Clone)]
struct Recorder {
    log: Arc<Mutex<Vec<Published>>>,
    events: broadcast::Sender<Published>,
    failing_clients: Arc<Mutex<HashSet<String>>>,
}

impl Recorder {
    fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            log: Arc::new(Mutex::new(Vec::new())),
            events,
            failing_clients: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn record(&self, published: Published) {
        if let Ok(mut log) = self.log.lock() {
            log.push(published.clone());
        }
        let _ = self.events.send(published);
    }

    fn published(&self) -> Vec<Published> {
        self.log.lock().map(|l| l.clone()).unwrap_or_default()
    }

    fn is_failing(&self, client_id: Option<&str>) -> bool {
        let Some(client_id) = client_id else {
            return false;
        };
        self.failing_clients
            .lock()
            .map(|f| f.contains(client_id))
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// MockTransport
// ---------------------------------------------------------------------------

pub struct MockTransport {
    endpoint: EndpointConfiguration,
    device_id: String,
    on_error: ErrorHandler,
    recorder: Recorder,
    handlers: Mutex<Vec<(String, MessageHandler)>>,
    active: AtomicBool,
    hold_acks: AtomicBool,
    held_acks: Mutex<Vec<AckSender>>,
    config_on_connect: Mutex<Option<Vec<u8>>>,
    connects: AtomicUsize,
    closes: AtomicUsize,
}

impl MockTransport {
    /// A standalone transport with its own publish log.
    pub fn new(device_id: &str) -> Arc<Self> {
        Arc::new(Self::build(
            EndpointConfiguration::default(),
            device_id,
            Arc::new(|_| {}),
            Recorder::new(),
            None,
        ))
    }

    fn build(
        endpoint: EndpointConfiguration,
        device_id: &str,
        on_error: ErrorHandler,
        recorder: Recorder,
        config_on_connect: Option<Vec<u8>>,
    ) -> Self {
        Self {
            endpoint,
            device_id: device_id.to_owned(),
            on_error,
            recorder,
            handlers: Mutex::new(Vec::new()),
            active: AtomicBool::new(false),
            hold_acks: AtomicBool::new(false),
            held_acks: Mutex::new(Vec::new()),
            config_on_connect: Mutex::new(config_on_connect),
            connects: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        }
    }

    pub fn endpoint(&self) -> &EndpointConfiguration {
        &self.endpoint
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Deliver an inbound message to the handler registered for `suffix`.
    /// Returns false when no handler matches.
    pub fn deliver(&self, suffix: &str, payload: impl Into<Vec<u8>>) -> bool {
        let handler = self.handlers.lock().ok().and_then(|handlers| {
            handlers
                .iter()
                .find(|(key, _)| suffix_matches(key, suffix))
                .map(|(_, h)| Arc::clone(h))
        });
        match handler {
            Some(handler) => {
                handler(InboundMessage {
                    topic: device_topic(&self.device_id, suffix),
                    payload: payload.into(),
                });
                true
            }
            None => false,
        }
    }

    /// Drop the connection and report `error` through the error handler.
    pub fn fail(&self, error: TransportError) {
        self.active.store(false, Ordering::SeqCst);
        (self.on_error)(error);
    }

    pub fn set_config_on_connect(&self, payload: Option<Vec<u8>>) {
        if let Ok(mut slot) = self.config_on_connect.lock() {
            *slot = payload;
        }
    }

    /// Stop firing acks until [`MockTransport::release_acks`].
    pub fn hold_acks(&self, hold: bool) {
        self.hold_acks.store(hold, Ordering::SeqCst);
    }

    pub fn release_acks(&self) {
        let held: Vec<AckSender> = self
            .held_acks
            .lock()
            .map(|mut h| h.drain(..).collect())
            .unwrap_or_default();
        for ack in held {
            ack.fire();
        }
    }

    pub fn published(&self) -> Vec<Published> {
        self.recorder.published()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Published> {
        self.recorder.events.subscribe()
    }
}

impl Transport for MockTransport {
    fn connect<'a>(&'a self) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.recorder.is_failing(self.endpoint.client_id.as_deref()) {
                return Err(TransportError::Connect(format!(
                    "refused {}",
                    self.endpoint.client_id.as_deref().unwrap_or("")
                )));
            }
            self.active.store(true, Ordering::SeqCst);
            let config = self.config_on_connect.lock().ok().and_then(|c| c.clone());
            if let Some(config) = config {
                self.deliver("config", config);
            }
            Ok(())
        })
    }

    fn publish(&self, topic_suffix: &str, payload: Vec<u8>) -> Result<PublishAck, TransportError> {
        if !self.is_active() {
            return Err(TransportError::NotConnected);
        }
        self.recorder.record(Published {
            client_id: self.endpoint.client_id.clone(),
            topic: device_topic(&self.device_id, topic_suffix),
            payload,
        });
        let (tx, ack) = PublishAck::pair();
        if self.hold_acks.load(Ordering::SeqCst) {
            if let Ok(mut held) = self.held_acks.lock() {
                held.push(tx);
            }
        } else {
            tx.fire();
        }
        Ok(ack)
    }

    fn register_handler(&self, topic_suffix: &str, handler: MessageHandler) {
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers.retain(|(key, _)| key != topic_suffix);
            handlers.push((topic_suffix.to_owned(), handler));
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn close<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.active.store(false, Ordering::SeqCst);
        })
    }
}

// ---------------------------------------------------------------------------
// MockTransportFactory
// ---------------------------------------------------------------------------

/// Factory handing out [`MockTransport`]s that share one publish log.
#[derive(Clone)]
pub struct MockTransportFactory {
    recorder: Recorder,
    created: Arc<Mutex<Vec<Arc<MockTransport>>>>,
    config_on_connect: Arc<Mutex<Option<Vec<u8>>>>,
}

impl Default for MockTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self {
            recorder: Recorder::new(),
            created: Arc::new(Mutex::new(Vec::new())),
            config_on_connect: Arc::new(Mutex::new(None)),
        }
    }

    /// Every transport created afterwards delivers `config` right after
    /// connecting.
    pub fn with_config_on_connect(self, config: serde_json::Value) -> Self {
        if let Ok(mut slot) = self.config_on_connect.lock() {
            *slot = serde_json::to_vec(&config).ok();
        }
        self
    }

    /// Refuse connections for `client_id` from now on.
    pub fn fail_client(&self, client_id: &str) {
        if let Ok(mut failing) = self.recorder.failing_clients.lock() {
            failing.insert(client_id.to_owned());
        }
    }

    pub fn heal_client(&self, client_id: &str) {
        if let Ok(mut failing) = self.recorder.failing_clients.lock() {
            failing.remove(client_id);
        }
    }

    pub fn created(&self) -> Vec<Arc<MockTransport>> {
        self.created.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn latest(&self) -> Option<Arc<MockTransport>> {
        self.created.lock().ok().and_then(|c| c.last().cloned())
    }

    pub fn published(&self) -> Vec<Published> {
        self.recorder.published()
    }

    /// Published messages whose topic ends with `/{suffix}`.
    pub fn published_on(&self, suffix: &str) -> Vec<Published> {
        let tail = format!("/{suffix}");
        self.published()
            .into_iter()
            .filter(|p| p.topic.ends_with(&tail))
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Published> {
        self.recorder.events.subscribe()
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(
        &self,
        endpoint: &EndpointConfiguration,
        device_id: &str,
        on_error: ErrorHandler,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let config = self.config_on_connect.lock().ok().and_then(|c| c.clone());
        let transport = Arc::new(MockTransport::build(
            endpoint.clone(),
            device_id,
            on_error,
            self.recorder.clone(),
            config,
        ));
        if let Ok(mut created) = self.created.lock() {
            created.push(Arc::clone(&transport));
        }
        Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn publish_requires_connection() {
        let transport = MockTransport::new("AHU-1");
        assert_eq!(
            transport.publish("state", b"{}".to_vec()).err(),
            Some(TransportError::NotConnected)
        );
        transport.connect().await.unwrap();
        let ack = transport.publish("state", b"{}".to_vec()).unwrap();
        ack.wait(Duration::from_millis(10)).await.unwrap();
        assert_eq!(transport.published()[0].topic, "/devices/AHU-1/state");
    }

    #[tokio::test]
    async fn failing_client_refuses_connect() {
        let factory = MockTransportFactory::new();
        factory.fail_client("bad");
        let endpoint = EndpointConfiguration {
            client_id: Some("bad".to_owned()),
            ..EndpointConfiguration::default()
        };
        let transport = factory.create(&endpoint, "d", Arc::new(|_| {})).unwrap();
        assert!(transport.connect().await.is_err());
        assert!(!transport.is_active());
    }

    #[tokio::test]
    async fn config_on_connect_reaches_handler() {
        let factory =
            MockTransportFactory::new().with_config_on_connect(serde_json::json!({"version": "1"}));
        let transport = factory
            .create(&EndpointConfiguration::default(), "d", Arc::new(|_| {}))
            .unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        transport.register_handler(
            "config",
            Arc::new(move |msg: InboundMessage| sink.lock().unwrap().push(msg.topic)),
        );
        transport.connect().await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["/devices/d/config".to_owned()]);
    }
}
