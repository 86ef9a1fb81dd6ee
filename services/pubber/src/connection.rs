//! Connection lifecycle: bounded-retry connect with a config gate, reset on
//! redirection, and recovery after a mid-run transport failure.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use udmi_schema::{EndpointConfiguration, SystemMode};
use udmi_transport::{ErrorHandler, InboundMessage, Transport, TransportError};

use crate::engine::{Engine, Inbound, locked};

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("no endpoint configured")]
    NoEndpoint,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Configuration sync failed after {}s", .0.as_secs())]
    ConfigTimeout(Duration),
    #[error("connection failed after {attempts} attempts")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<ConnectionError>,
    },
}

impl Engine {
    fn initialize_transport(&self) -> Result<Arc<dyn Transport>, ConnectionError> {
        let endpoint = self.current_endpoint().ok_or(ConnectionError::NoEndpoint)?;
        let epoch = self.transport_epoch.fetch_add(1, Ordering::SeqCst) + 1;

        let tx = self.inbound.clone();
        let on_error: ErrorHandler = Arc::new(move |error| {
            let _ = tx.send(Inbound::TransportFailed { epoch, error });
        });
        let transport = self
            .factory
            .create(&endpoint, &self.config.device_id, on_error)?;

        let tx = self.inbound.clone();
        transport.register_handler(
            "config",
            Arc::new(move |message: InboundMessage| {
                let _ = tx.send(Inbound::Config(message.payload));
            }),
        );
        let tx = self.inbound.clone();
        transport.register_handler(
            "errors",
            Arc::new(move |message: InboundMessage| {
                let _ = tx.send(Inbound::Errors(message.payload));
            }),
        );
        tracing::info!(
            epoch,
            hostname = endpoint.hostname.as_deref().unwrap_or(""),
            client_id = endpoint.client_id.as_deref().unwrap_or(""),
            "transport initialized"
        );
        self.set_transport(Some(Arc::clone(&transport)));
        Ok(transport)
    }

    pub(crate) async fn disconnect_transport(&self) {
        let old = self.set_transport(None);
        self.transport_epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(transport) = old {
            transport.close().await;
        }
    }

    /// Connect with the retry budget. The budget is refilled after every
    /// successful attempt.
    pub(crate) async fn start_connection(&self) -> Result<(), ConnectionError> {
        let budget = self.config.timing.connect_retries;
        self.session.retries.store(budget, Ordering::SeqCst);
        loop {
            match self.attempt_connection().await {
                Ok(()) => {
                    self.session.retries.store(budget, Ordering::SeqCst);
                    self.set_operation_mode(SystemMode::Active).await;
                    return Ok(());
                }
                Err(e) => {
                    self.logger.error_with("While waiting for connection start", &e);
                    let remaining = self
                        .session
                        .retries
                        .fetch_sub(1, Ordering::SeqCst)
                        .saturating_sub(1);
                    if remaining == 0 {
                        return Err(ConnectionError::RetriesExhausted {
                            attempts: budget,
                            last: Box::new(e),
                        });
                    }
                    tracing::info!(remaining, "retrying connection");
                    tokio::time::sleep(self.config.timing.retry_backoff).await;
                }
            }
        }
    }

    /// One connect plus config gate.
    async fn attempt_connection(&self) -> Result<(), ConnectionError> {
        self.config_received.send_replace(false);
        self.docs.lock().await.state.system.operation.mode = Some(SystemMode::Initial);

        let transport = match self.current_transport().filter(|t| t.is_active()) {
            Some(transport) => transport,
            None => {
                self.disconnect_transport().await;
                self.initialize_transport()?
            }
        };
        let mut received = self.config_received.subscribe();
        transport.connect().await?;

        let wait = self.config.timing.config_wait;
        if !matches!(
            tokio::time::timeout(wait, received.wait_for(|r| *r)).await,
            Ok(Ok(_))
        ) {
            transport.close().await;
            return Err(ConnectionError::ConfigTimeout(wait));
        }
        locked(&self.redirect).working = self.current_endpoint();
        tracing::info!("connection established with config");
        Ok(())
    }

    /// Switch to `endpoint` and connect to it with a fresh retry budget.
    pub(crate) async fn reset_connection(
        &self,
        endpoint: Option<EndpointConfiguration>,
    ) -> Result<(), ConnectionError> {
        *locked(&self.endpoint) = endpoint;
        self.disconnect_transport().await;
        self.start_connection().await
    }

    /// Rebuild the connection after the live transport reported `error`.
    /// Exhausting the retry budget terminates the run.
    pub(crate) async fn recover_connection(self: Arc<Self>, error: TransportError) {
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        if self.session.recovering.swap(true, Ordering::SeqCst) {
            tracing::debug!(error = %error, "recovery already running");
            return;
        }
        self.logger
            .error_with("Connection error, attempting reconnect", &error);
        self.disconnect_transport().await;
        let result = self.start_connection().await;
        self.session.recovering.store(false, Ordering::SeqCst);
        if let Err(e) = result {
            self.logger.error_with("Connection recovery failed", &e);
            self.system_lifecycle(SystemMode::Terminate).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn exhausted_retries_keep_last_failure() {
        let err = ConnectionError::RetriesExhausted {
            attempts: 3,
            last: Box::new(ConnectionError::ConfigTimeout(Duration::from_secs(10))),
        };
        assert_eq!(err.to_string(), "connection failed after 3 attempts");
        assert_eq!(
            err.source().map(|s| s.to_string()).as_deref(),
            Some("Configuration sync failed after 10s")
        );
    }
}
