//! Shared device engine.
//!
//! One [`Engine`] is owned by a [`crate::Pubber`] handle. Components add
//! behavior through `impl Engine` blocks in their own modules; this module
//! holds the shared fields, inbound delivery, and the periodic tick.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use chrono::TimeDelta;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use udmi_log::EntryLogger;
use udmi_schema::{
    Config, DevicePersistent, EndpointConfiguration, Metadata, State, SystemEvent, SystemMode,
};
use udmi_transport::{Transport, TransportError, TransportFactory};

use crate::PubberError;
use crate::clock::DeviceClock;
use crate::config::PubberConfig;
use crate::redirect::RedirectError;
use crate::router::{DeviceMessage, MessageRouter, RouterError};
use crate::scheduler::{Job, PeriodicHandle, Scheduler};
use crate::site_model::SiteModel;
use crate::storage::PersistentStore;

/// Cap on log entries waiting for the next system event.
pub const MAX_PENDING_ENTRIES: usize = 100;

pub(crate) fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Documents guarded by the state lock.
#[derive(Debug, Default)]
pub(crate) struct DeviceDocs {
    pub state: State,
    pub config: Config,
}

pub(crate) enum Inbound {
    Config(Vec<u8>),
    Errors(Vec<u8>),
    TransportFailed { epoch: u64, error: TransportError },
}

/// Endpoints tracked across redirection attempts.
#[derive(Debug, Default)]
pub(crate) struct RedirectState {
    pub extracted: Option<EndpointConfiguration>,
    pub attempted: Option<EndpointConfiguration>,
    pub working: Option<EndpointConfiguration>,
}

#[derive(Debug, Default)]
pub(crate) struct ConnectionSession {
    pub retries: AtomicU32,
    pub recovering: AtomicBool,
}

pub(crate) struct Engine {
    pub weak: Weak<Engine>,
    pub config: PubberConfig,
    pub clock: DeviceClock,
    pub logger: EntryLogger,
    pub scheduler: Scheduler,
    pub router: MessageRouter,
    pub factory: Arc<dyn TransportFactory>,
    pub site_model: Option<Arc<dyn SiteModel>>,
    pub metadata: Metadata,
    pub store: PersistentStore,
    pub persistent: Mutex<DevicePersistent>,

    pub docs: tokio::sync::Mutex<DeviceDocs>,
    pub dirty: AtomicBool,
    pub last_state_publish: Mutex<Option<Instant>>,
    pub config_received: watch::Sender<bool>,

    pub transport: RwLock<Option<Arc<dyn Transport>>>,
    pub transport_epoch: AtomicU64,
    pub endpoint: Mutex<Option<EndpointConfiguration>>,
    pub redirect: Mutex<RedirectState>,
    pub session: ConnectionSession,
    pub inbound: mpsc::UnboundedSender<Inbound>,

    pub periodic: Mutex<Option<PeriodicHandle>>,
    pub ticks: AtomicU64,
    pub event_count: AtomicU64,
    pub lifecycle: watch::Sender<Option<SystemMode>>,
    pub stopping: AtomicBool,
}

impl Engine {
    pub(crate) fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_transport(&self, transport: Option<Arc<dyn Transport>>) -> Option<Arc<dyn Transport>> {
        let mut slot = self
            .transport
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, transport)
    }

    pub(crate) fn current_endpoint(&self) -> Option<EndpointConfiguration> {
        locked(&self.endpoint).clone()
    }

    /// Schedule on the worker; a stopped scheduler drops the job.
    pub(crate) fn schedule(&self, delay: Duration, job: Job) {
        if let Err(e) = self.scheduler.schedule(delay, job) {
            tracing::debug!(error = %e, "scheduled job dropped");
        }
    }

    /// Publish a non-state message. Failures are logged and reported as
    /// `false`; events are never retried.
    pub(crate) fn publish_event(&self, message: DeviceMessage) -> bool {
        let topic = message.topic_suffix().to_owned();
        match self.router.route(self.current_transport().as_deref(), message) {
            Ok(_) => true,
            Err(RouterError::NotConnected) => {
                tracing::warn!(topic = %topic, "publisher not active, dropping message");
                false
            }
            Err(e) => {
                tracing::warn!(topic = %topic, error = %e, "failed to publish device message");
                false
            }
        }
    }

    fn handle_errors_topic(&self, payload: &[u8]) {
        let text = String::from_utf8_lossy(payload);
        self.logger.error(format!("Received error message: {text}"));
    }

    // -----------------------------------------------------------------------
    // Periodic tick
    // -----------------------------------------------------------------------

    pub(crate) async fn run_tick(&self) {
        if let Err(e) = self.periodic_update().await {
            self.logger.error_with("Fatal error during execution", &e);
            if matches!(e, PubberError::Redirect(RedirectError::Fatal(_))) {
                self.system_lifecycle(SystemMode::Terminate).await;
            }
        }
    }

    pub(crate) async fn periodic_update(&self) -> Result<(), PubberError> {
        let tick = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
        if self.smoke_check_expired() {
            self.logger.error("Smoke check time exceeded, terminating");
            self.system_lifecycle(SystemMode::Terminate).await;
            return Ok(());
        }
        self.maybe_restart_system().await;
        self.maybe_redirect_endpoint().await?;
        self.maybe_inject_fault(tick).await;
        self.send_pointset_event().await;
        self.flush_log_entries().await;
        self.flush_dirty().await;
        Ok(())
    }

    fn smoke_check_expired(&self) -> bool {
        self.config.options.smoke_check
            && self.clock.now() - self.clock.start_time() > TimeDelta::minutes(5)
    }

    async fn flush_log_entries(&self) {
        let logentries = self.logger.drain();
        if logentries.is_empty() {
            return;
        }
        let last_config = self.docs.lock().await.state.system.last_config;
        let event = SystemEvent {
            last_config,
            logentries,
            event_count: Some(self.event_count.fetch_add(1, Ordering::SeqCst) + 1),
            ..Default::default()
        };
        self.publish_event(DeviceMessage::SystemEvent(event));
    }

    /// Restart the fixed-rate tick when the period changes.
    pub(crate) fn maybe_restart_executor(&self, period: Duration) {
        let mut periodic = locked(&self.periodic);
        if periodic.as_ref().is_some_and(|p| p.period() == period) {
            return;
        }
        if let Some(old) = periodic.take() {
            old.cancel();
        }
        let weak = self.weak.clone();
        match self
            .scheduler
            .schedule_periodic(period, Arc::new(move || tick_job(weak.clone())))
        {
            Ok(handle) => {
                tracing::info!(period_sec = period.as_secs(), "periodic update scheduled");
                *periodic = Some(handle);
            }
            Err(e) => tracing::warn!(error = %e, "periodic update not scheduled"),
        }
    }
}

pub(crate) fn tick_job(weak: Weak<Engine>) -> Job {
    Box::pin(async move {
        if let Some(engine) = weak.upgrade() {
            engine.run_tick().await;
        }
    })
}

/// Drain transport callbacks in arrival order. Runs until the engine is
/// dropped.
pub(crate) async fn deliver_inbound(weak: Weak<Engine>, mut rx: mpsc::UnboundedReceiver<Inbound>) {
    while let Some(inbound) = rx.recv().await {
        let Some(engine) = weak.upgrade() else {
            break;
        };
        match inbound {
            Inbound::Config(payload) => engine.handle_config(&payload).await,
            Inbound::Errors(payload) => engine.handle_errors_topic(&payload),
            Inbound::TransportFailed { epoch, error } => {
                if epoch == engine.transport_epoch.load(Ordering::SeqCst) {
                    tokio::spawn(engine.recover_connection(error));
                } else {
                    tracing::debug!(error = %error, "ignoring error from retired transport");
                }
            }
        }
    }
}
