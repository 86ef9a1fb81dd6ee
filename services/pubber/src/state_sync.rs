//! State synchronization: dirty tracking, throttled publishing, and the
//! asynchronous and synchronous publish paths.
//!
//! The async path never waits for the state lock; contention or an open
//! throttle window turns into a deferred flush. The sync path blocks on the
//! lock and sleeps out the throttle window before sending.

use std::sync::Weak;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::time::Instant;
use udmi_transport::TransportError;

use crate::engine::{DeviceDocs, Engine, locked};
use crate::router::{DeviceMessage, RouterError};
use crate::scheduler::Job;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error("Timeout waiting for state send")]
    Timeout(#[source] TransportError),
}

fn flush_job(weak: Weak<Engine>) -> Job {
    Box::pin(async move {
        if let Some(engine) = weak.upgrade() {
            engine.flush_dirty().await;
        }
    })
}

impl Engine {
    /// Mark state dirty, optionally scheduling a flush after `flush_after`.
    /// `None` leaves flushing to the next tick or pending timer.
    pub(crate) fn mark_dirty(&self, flush_after: Option<Duration>) {
        self.dirty.store(true, Ordering::SeqCst);
        if let Some(delay) = flush_after {
            self.schedule(delay, flush_job(self.weak.clone()));
        }
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub(crate) async fn flush_dirty(&self) {
        if self.is_dirty() {
            self.publish_async().await;
        }
    }

    /// Time left in the throttle window.
    pub(crate) fn throttle_remaining(&self) -> Duration {
        locked(&self.last_state_publish)
            .map(|last| {
                (last + self.config.timing.state_throttle).saturating_duration_since(Instant::now())
            })
            .unwrap_or(Duration::ZERO)
    }

    /// Push the throttle window so the next state goes out no earlier than
    /// the forced state time from now.
    pub(crate) fn delay_next_state(&self) {
        let timing = &self.config.timing;
        let forced = Instant::now() + timing.forced_state_time.saturating_sub(timing.state_throttle);
        let mut last = locked(&self.last_state_publish);
        *last = Some(last.map_or(forced, |l| l.max(forced)));
    }

    pub(crate) async fn publish_async(&self) {
        let Ok(mut docs) = self.docs.try_lock() else {
            tracing::debug!("state lock busy, leaving state dirty");
            self.mark_dirty(None);
            return;
        };
        let wait = self.throttle_remaining();
        if !wait.is_zero() {
            tracing::debug!(defer_ms = wait.as_millis() as u64, "state update deferred");
            self.mark_dirty(Some(wait));
            return;
        }
        if let Err(e) = self.publish_state_locked(&mut docs).await {
            self.logger.error_with("While publishing state", &e);
        }
    }

    pub(crate) async fn publish_sync(&self) -> Result<(), StateError> {
        let mut docs = self.docs.lock().await;
        self.publish_state_locked(&mut docs).await
    }

    pub(crate) async fn publish_state_locked(&self, docs: &mut DeviceDocs) -> Result<(), StateError> {
        if !self.state_gate_open() {
            return Ok(());
        }
        self.dirty.store(false, Ordering::SeqCst);
        docs.state.timestamp = Some(self.clock.now());
        self.publish_state_message(DeviceMessage::State(Box::new(docs.state.clone())))
            .await
    }

    fn state_gate_open(&self) -> bool {
        if *self.config_received.borrow() {
            return true;
        }
        self.logger.warn("Dropping state update until config received...");
        false
    }

    /// Send a state-topic message. The caller holds the state lock.
    pub(crate) async fn publish_state_message(&self, message: DeviceMessage) -> Result<(), StateError> {
        if !self.state_gate_open() {
            return Ok(());
        }
        let Some(transport) = self.current_transport().filter(|t| t.is_active()) else {
            tracing::warn!("publisher not active, state deferred");
            self.mark_dirty(None);
            return Ok(());
        };

        let wait = self.throttle_remaining();
        if !wait.is_zero() {
            tracing::debug!(defer_ms = wait.as_millis() as u64, "state update defer");
            tokio::time::sleep(wait).await;
        }

        *locked(&self.last_state_publish) = Some(Instant::now());
        let ack = match self.router.route(Some(transport.as_ref()), message) {
            Ok(ack) => ack,
            Err(RouterError::NotConnected) => {
                self.mark_dirty(None);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if let Some(ack) = ack {
            ack.wait(self.config.timing.publish_wait)
                .await
                .map_err(StateError::Timeout)?;
            *locked(&self.last_state_publish) = Some(Instant::now());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use udmi_schema::EndpointConfiguration;
    use udmi_transport::mock::MockTransportFactory;

    use super::*;
    use crate::{Pubber, PubberConfig};

    async fn started(dir: &std::path::Path) -> (Pubber, Arc<MockTransportFactory>) {
        let mut config = PubberConfig::for_device("AHU-1");
        config.persist_dir = Some(dir.to_path_buf());
        config.out_dir = dir.join("out");
        config.report_interval = Duration::from_secs(3600);
        config.endpoint = Some(EndpointConfiguration {
            hostname: Some("mqtt.example.com".to_owned()),
            client_id: Some("projects/p/locations/us-central1/registries/ZZ/devices/AHU-1".to_owned()),
            ..Default::default()
        });
        let factory = Arc::new(
            MockTransportFactory::new()
                .with_config_on_connect(json!({ "timestamp": "2024-05-01T12:00:00Z" })),
        );
        let pubber = Pubber::builder(config).factory(factory.clone()).build().unwrap();
        pubber.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        (pubber, factory)
    }

    #[tokio::test(start_paused = true)]
    async fn contended_lock_leaves_state_dirty_until_tick() {
        let dir = tempfile::tempdir().unwrap();
        let (pubber, factory) = started(dir.path()).await;
        let before = factory.published_on("state").len();

        {
            let _held = pubber.engine.docs.lock().await;
            pubber.engine.publish_async().await;
        }
        assert!(pubber.is_dirty());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(factory.published_on("state").len(), before, "no timer armed");

        pubber.tick().await.unwrap();
        assert_eq!(factory.published_on("state").len(), before + 1);
        assert!(!pubber.is_dirty());
    }

    #[tokio::test(start_paused = true)]
    async fn open_throttle_window_defers_to_timer() {
        let dir = tempfile::tempdir().unwrap();
        let (pubber, factory) = started(dir.path()).await;
        let before = factory.published_on("state").len();

        pubber.engine.publish_async().await;
        assert_eq!(factory.published_on("state").len(), before + 1);
        pubber.engine.publish_async().await;
        assert!(pubber.is_dirty());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(factory.published_on("state").len(), before + 2);
        assert!(!pubber.is_dirty());
    }
}
