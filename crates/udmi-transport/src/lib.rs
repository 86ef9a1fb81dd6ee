//! Transport contracts between the device engine and a message broker.
//!
//! A [`Transport`] is one connection for one client identity. It publishes
//! to topic suffixes (`state`, `events/pointset`, ...) and dispatches inbound
//! messages to handlers registered by suffix (`config`, `commands`,
//! `errors`). A [`TransportFactory`] builds transports from an
//! [`EndpointConfiguration`], which lets the engine rebuild its connection
//! when redirected.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use udmi_schema::EndpointConfiguration;

pub mod bridge;
#[cfg(any(test, feature = "test-support"))]
pub mod mock;

pub use bridge::{BridgeFrame, WsBridgeFactory, WsBridgeTransport};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Inbound message with its full topic (`/devices/{id}/{suffix}`).
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

pub type MessageHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(TransportError) + Send + Sync>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("connection error: {0}")]
    Connect(String),
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("transport not connected")]
    NotConnected,
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("timeout waiting for publish ack")]
    AckTimeout,
    #[error("connection closed")]
    ConnectionClosed,
}

// ---------------------------------------------------------------------------
// Publish acknowledgement
// ---------------------------------------------------------------------------

/// Completion signal for one publish. The sending half is consumed when it
/// fires, so a publish is acknowledged at most once.
#[derive(Debug)]
pub struct PublishAck {
    rx: oneshot::Receiver<()>,
}

#[derive(Debug)]
pub struct AckSender {
    tx: oneshot::Sender<()>,
}

impl AckSender {
    pub fn fire(self) {
        let _ = self.tx.send(());
    }
}

impl PublishAck {
    pub fn pair() -> (AckSender, PublishAck) {
        let (tx, rx) = oneshot::channel();
        (AckSender { tx }, PublishAck { rx })
    }

    /// An ack that has already fired.
    pub fn acked() -> PublishAck {
        let (tx, ack) = PublishAck::pair();
        tx.fire();
        ack
    }

    pub async fn wait(self, timeout: Duration) -> Result<(), TransportError> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Err(_) => Err(TransportError::AckTimeout),
        }
    }
}

// ---------------------------------------------------------------------------
// Contracts
// ---------------------------------------------------------------------------

pub trait Transport: Send + Sync {
    fn connect<'a>(&'a self) -> BoxFuture<'a, Result<(), TransportError>>;

    /// Queue `payload` for `topic_suffix`. Never blocks on the network.
    fn publish(&self, topic_suffix: &str, payload: Vec<u8>) -> Result<PublishAck, TransportError>;

    fn register_handler(&self, topic_suffix: &str, handler: MessageHandler);

    fn is_active(&self) -> bool;

    fn close<'a>(&'a self) -> BoxFuture<'a, ()>;
}

pub trait TransportFactory: Send + Sync {
    /// Build an unconnected transport publishing as `device_id`.
    /// `on_error` receives asynchronous failures such as a dropped connection.
    fn create(
        &self,
        endpoint: &EndpointConfiguration,
        device_id: &str,
        on_error: ErrorHandler,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Full topic for a device and suffix.
pub fn device_topic(device_id: &str, suffix: &str) -> String {
    format!("/devices/{device_id}/{suffix}")
}

/// Split `/devices/{id}/{suffix}` into `(id, suffix)`.
pub fn split_device_topic(topic: &str) -> Option<(&str, &str)> {
    let rest = topic.strip_prefix("/devices/")?;
    rest.split_once('/')
}

/// True when `suffix` falls under the handler key `key` (`commands` matches
/// `commands/discovery`).
pub fn suffix_matches(key: &str, suffix: &str) -> bool {
    suffix == key
        || suffix
            .strip_prefix(key)
            .is_some_and(|rest| rest.starts_with('/'))
}
