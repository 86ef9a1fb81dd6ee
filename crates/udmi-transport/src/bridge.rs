//! WebSocket bridge transport.
//!
//! Connects to `ws[s]://{hostname}:{port}/bridge/{client_id}` and exchanges
//! JSON text frames of the form `{"topic": ..., "payload": ...}`. Outbound
//! frames go through a writer task so `publish` never blocks; the ack for a
//! publish fires once its frame has been written to the socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};
use udmi_schema::{EndpointConfiguration, TransportKind};

use crate::{
    AckSender, BoxFuture, ErrorHandler, InboundMessage, MessageHandler, PublishAck, Transport,
    TransportError, TransportFactory, device_topic, split_device_topic, suffix_matches,
};

// ---------------------------------------------------------------------------
// Wire frame
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeFrame {
    pub topic: String,
    pub payload: serde_json::Value,
}

impl BridgeFrame {
    /// Payload bytes that are not valid JSON travel as a JSON string.
    pub fn new(topic: String, payload: &[u8]) -> Self {
        let payload = serde_json::from_slice(payload).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(payload).into_owned())
        });
        BridgeFrame { topic, payload }
    }

    pub fn payload_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.payload).unwrap_or_default()
    }
}

/// Bridge URL for an endpoint.
pub fn bridge_url(endpoint: &EndpointConfiguration) -> Result<String, TransportError> {
    let hostname = endpoint
        .hostname
        .as_deref()
        .ok_or_else(|| TransportError::InvalidEndpoint("missing hostname".to_owned()))?;
    let client_id = endpoint
        .client_id
        .as_deref()
        .ok_or_else(|| TransportError::InvalidEndpoint("missing client_id".to_owned()))?;
    let (scheme, default_port) = match endpoint.transport {
        Some(TransportKind::Ssl) => ("wss", 443),
        Some(TransportKind::Tcp) | None => ("ws", 80),
    };
    let port = endpoint.port.unwrap_or(default_port);
    Ok(format!("{scheme}://{hostname}:{port}/bridge/{client_id}"))
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

type Outbound = (Message, Option<AckSender>);

struct Shared {
    handlers: Mutex<Vec<(String, MessageHandler)>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    active: AtomicBool,
    closing: AtomicBool,
}

pub struct WsBridgeTransport {
    url: String,
    device_id: String,
    on_error: ErrorHandler,
    shared: Arc<Shared>,
}

impl WsBridgeTransport {
    pub fn new(url: String, device_id: &str, on_error: ErrorHandler) -> Self {
        Self {
            url,
            device_id: device_id.to_owned(),
            on_error,
            shared: Arc::new(Shared {
                handlers: Mutex::new(Vec::new()),
                outbound: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                active: AtomicBool::new(false),
                closing: AtomicBool::new(false),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn open(&self) -> Result<(), TransportError> {
        let (ws, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut write, mut read) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

        self.shared.closing.store(false, Ordering::SeqCst);
        self.shared.active.store(true, Ordering::SeqCst);
        if let Ok(mut outbound) = self.shared.outbound.lock() {
            *outbound = Some(tx);
        }

        let writer_shared = Arc::clone(&self.shared);
        let writer_error = Arc::clone(&self.on_error);
        let writer = tokio::spawn(async move {
            while let Some((message, ack)) = rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = write.send(message).await {
                    if !writer_shared.closing.load(Ordering::SeqCst) {
                        warn!(error = %e, "bridge write failed");
                        writer_shared.active.store(false, Ordering::SeqCst);
                        writer_error(TransportError::ConnectionClosed);
                    }
                    break;
                }
                if let Some(ack) = ack {
                    ack.fire();
                }
                if closing {
                    break;
                }
            }
        });

        let reader_shared = Arc::clone(&self.shared);
        let reader_error = Arc::clone(&self.on_error);
        let reader = tokio::spawn(async move {
            loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let frame: BridgeFrame = match serde_json::from_str(&text) {
                            Ok(frame) => frame,
                            Err(e) => {
                                warn!(error = %e, "dropping malformed bridge frame");
                                continue;
                            }
                        };
                        dispatch(&reader_shared, frame);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!(error = %e, "bridge read error");
                        break;
                    }
                }
            }
            if !reader_shared.closing.load(Ordering::SeqCst) {
                reader_shared.active.store(false, Ordering::SeqCst);
                reader_error(TransportError::ConnectionClosed);
            }
        });

        if let Ok(mut tasks) = self.shared.tasks.lock() {
            tasks.push(writer);
            tasks.push(reader);
        }
        info!(url = %self.url, "bridge connected");
        Ok(())
    }
}

fn dispatch(shared: &Shared, frame: BridgeFrame) {
    let Some((_, suffix)) = split_device_topic(&frame.topic) else {
        warn!(topic = %frame.topic, "bridge frame with unexpected topic");
        return;
    };
    let handler = shared.handlers.lock().ok().and_then(|handlers| {
        handlers
            .iter()
            .find(|(key, _)| suffix_matches(key, suffix))
            .map(|(_, h)| Arc::clone(h))
    });
    match handler {
        Some(handler) => handler(InboundMessage {
            payload: frame.payload_bytes(),
            topic: frame.topic,
        }),
        None => debug!(topic = %frame.topic, "no handler for bridge frame"),
    }
}

impl Transport for WsBridgeTransport {
    fn connect<'a>(&'a self) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(self.open())
    }

    fn publish(&self, topic_suffix: &str, payload: Vec<u8>) -> Result<PublishAck, TransportError> {
        if !self.is_active() {
            return Err(TransportError::NotConnected);
        }
        let frame = BridgeFrame::new(device_topic(&self.device_id, topic_suffix), &payload);
        let json =
            serde_json::to_string(&frame).map_err(|e| TransportError::Publish(e.to_string()))?;
        let (tx, ack) = PublishAck::pair();
        let outbound = self
            .shared
            .outbound
            .lock()
            .map_err(|_| TransportError::NotConnected)?;
        match outbound.as_ref() {
            Some(sender) => sender
                .send((Message::Text(json.into()), Some(tx)))
                .map_err(|_| TransportError::ConnectionClosed)?,
            None => return Err(TransportError::NotConnected),
        }
        Ok(ack)
    }

    fn register_handler(&self, topic_suffix: &str, handler: MessageHandler) {
        if let Ok(mut handlers) = self.shared.handlers.lock() {
            handlers.retain(|(key, _)| key != topic_suffix);
            handlers.push((topic_suffix.to_owned(), handler));
        }
    }

    fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    fn close<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.shared.closing.store(true, Ordering::SeqCst);
            self.shared.active.store(false, Ordering::SeqCst);
            let sender = self.shared.outbound.lock().ok().and_then(|mut o| o.take());
            if let Some(sender) = sender {
                let _ = sender.send((Message::Close(None), None));
            }
            let tasks: Vec<JoinHandle<()>> = self
                .shared
                .tasks
                .lock()
                .map(|mut t| t.drain(..).collect())
                .unwrap_or_default();
            for task in tasks {
                task.abort();
            }
            info!(url = %self.url, "bridge closed");
        })
    }
}

/// Builds [`WsBridgeTransport`]s from endpoint configurations.
#[derive(Debug, Clone, Default)]
pub struct WsBridgeFactory;

impl TransportFactory for WsBridgeFactory {
    fn create(
        &self,
        endpoint: &EndpointConfiguration,
        device_id: &str,
        on_error: ErrorHandler,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let url = bridge_url(endpoint)?;
        Ok(Arc::new(WsBridgeTransport::new(url, device_id, on_error)))
    }
}
