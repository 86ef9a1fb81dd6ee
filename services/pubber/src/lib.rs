// pubber: UDMI reference device engine.
//
// Connects to a cloud endpoint through a pluggable transport, applies
// inbound config, keeps device state in sync under a publish throttle,
// runs discovery scans, and follows endpoint redirection.

pub mod clock;
pub mod config;
pub mod connection;
pub mod discovery;
mod engine;
pub mod faults;
pub mod features;
pub mod pointset;
pub mod reconciler;
pub mod redirect;
pub mod router;
pub mod scheduler;
pub mod site_model;
pub mod state_sync;
pub mod storage;
pub mod system;

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::{mpsc, watch};
use udmi_log::EntryLogger;
use udmi_schema::{
    Config, EndpointConfiguration, Metadata, PointsetState, SchemaVersion, State, SystemMode,
    SystemState,
};
use udmi_transport::{TransportFactory, WsBridgeFactory};

pub use crate::clock::DeviceClock;
pub use crate::config::{ConfigError, PubberConfig, PubberOptions, TimingConfig};
pub use crate::connection::ConnectionError;
pub use crate::redirect::RedirectError;
pub use crate::router::{Downgrader, RouterError, VersionStamp};
pub use crate::scheduler::SchedulerError;
pub use crate::site_model::{
    CloudIotConfig, LoadedSiteModel, SiteModel, SiteModelError, make_endpoint_config,
};
pub use crate::state_sync::StateError;
pub use crate::storage::{PersistentStore, StoreError};

use crate::engine::{DeviceDocs, Engine, MAX_PENDING_ENTRIES, deliver_inbound, locked};
use crate::router::{MessageRouter, TraceWriter};
use crate::scheduler::Scheduler;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum PubberError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    SiteModel(#[from] SiteModelError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("endpoint redirection")]
    Redirect(#[from] RedirectError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Router(#[from] RouterError),
}

/// Input to [`Pubber::update`].
#[derive(Debug, Clone, PartialEq)]
pub enum StateUpdate {
    /// Replace the pointset block.
    Pointset(Option<PointsetState>),
    /// Replace the system block.
    System(SystemState),
    /// Publish state now, waiting on the lock and the throttle.
    PublishSync,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct PubberBuilder {
    config: PubberConfig,
    factory: Option<Arc<dyn TransportFactory>>,
    site_model: Option<Arc<dyn SiteModel>>,
    downgrader: Arc<dyn Downgrader>,
    clock: Option<DeviceClock>,
}

impl PubberBuilder {
    pub fn new(config: PubberConfig) -> Self {
        Self {
            config,
            factory: None,
            site_model: None,
            downgrader: Arc::new(VersionStamp),
            clock: None,
        }
    }

    pub fn factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn site_model(mut self, site_model: Arc<dyn SiteModel>) -> Self {
        self.site_model = Some(site_model);
        self
    }

    pub fn downgrader(mut self, downgrader: Arc<dyn Downgrader>) -> Self {
        self.downgrader = downgrader;
        self
    }

    pub fn clock(mut self, clock: DeviceClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Load the site model and persistent record and assemble the engine.
    /// Must run inside a tokio runtime.
    pub fn build(self) -> Result<Pubber, PubberError> {
        let config = self.config;
        let site_model = match (self.site_model, &config.site_path) {
            (Some(model), _) => Some(model),
            (None, Some(path)) => Some(Arc::new(LoadedSiteModel::load_dir(path)?) as Arc<dyn SiteModel>),
            (None, None) => None,
        };
        let metadata = match &site_model {
            Some(model) => model
                .metadata(&config.device_id)
                .ok_or_else(|| SiteModelError::UnknownDevice(config.device_id.clone()))?,
            None => {
                tracing::warn!(device_id = %config.device_id, "no site model, using default metadata");
                Metadata::default()
            }
        };
        let configured_endpoint = config.endpoint.clone().or_else(|| {
            let model = site_model.as_ref()?;
            let project = config.iot_project.as_deref()?;
            let cloud = model.cloud_iot_config()?;
            Some(make_endpoint_config(project, &cloud, &config.device_id))
        });

        let store = PersistentStore::resolve(&config);
        let mut persistent = if config.options.no_persist {
            tracing::info!(path = %store.path().display(), "resetting persistent store");
            Default::default()
        } else {
            store.load()?
        };
        let restart_count = persistent.restart_count.unwrap_or(0) + 1;
        persistent.restart_count = Some(restart_count);
        if persistent.endpoint.is_none() {
            match configured_endpoint {
                Some(endpoint) => {
                    tracing::info!("Loading endpoint into persistent data from configuration");
                    persistent.endpoint = Some(endpoint);
                }
                None => tracing::error!(
                    "Neither configuration nor persistent data supplies endpoint configuration"
                ),
            }
        }
        let endpoint = persistent.endpoint.clone();
        store.save(&persistent)?;
        tracing::info!(restart_count, path = %store.path().display(), "persistent store updated");

        let clock = self
            .clock
            .unwrap_or_else(|| DeviceClock::new(config.options.skew_clock));
        let logger_clock = clock.clone();
        let logger = EntryLogger::new(MAX_PENDING_ENTRIES).with_clock(move || logger_clock.now());

        let target = match metadata.device_version.as_deref() {
            Some(raw) => match raw.parse::<SchemaVersion>() {
                Ok(version) => Some(version),
                Err(e) => {
                    tracing::warn!(device_version = raw, error = %e, "ignoring device version");
                    None
                }
            },
            None => None,
        };
        let router = MessageRouter::new(
            clock.clone(),
            TraceWriter::new(config.trace_dir(), config.options.message_trace),
        )
        .with_bad_version(config.options.bad_version)
        .with_no_state(config.options.no_state)
        .with_target(target, self.downgrader);

        let factory = self
            .factory
            .unwrap_or_else(|| Arc::new(WsBridgeFactory) as Arc<dyn TransportFactory>);
        let state = system::initial_state(&config, &clock, &metadata, Some(restart_count));
        let (inbound, inbound_rx) = mpsc::unbounded_channel();

        let engine = Arc::new_cyclic(|weak| Engine {
            weak: weak.clone(),
            config,
            clock,
            logger,
            scheduler: Scheduler::new(),
            router,
            factory,
            site_model,
            metadata,
            store,
            persistent: Mutex::new(persistent),
            docs: tokio::sync::Mutex::new(DeviceDocs {
                state,
                config: Config::default(),
            }),
            dirty: AtomicBool::new(false),
            last_state_publish: Mutex::new(None),
            config_received: watch::channel(false).0,
            transport: RwLock::new(None),
            transport_epoch: AtomicU64::new(0),
            endpoint: Mutex::new(endpoint),
            redirect: Mutex::new(Default::default()),
            session: Default::default(),
            inbound,
            periodic: Mutex::new(None),
            ticks: AtomicU64::new(0),
            event_count: AtomicU64::new(0),
            lifecycle: watch::channel(None).0,
            stopping: AtomicBool::new(false),
        });
        tokio::spawn(deliver_inbound(Arc::downgrade(&engine), inbound_rx));
        Ok(Pubber { engine })
    }
}

// ---------------------------------------------------------------------------
// Pubber
// ---------------------------------------------------------------------------

/// Handle to a running device engine.
pub struct Pubber {
    engine: Arc<Engine>,
}

impl Pubber {
    pub fn builder(config: PubberConfig) -> PubberBuilder {
        PubberBuilder::new(config)
    }

    /// Connect and wait for the first config.
    pub async fn start(&self) -> Result<(), PubberError> {
        tracing::info!(device_id = %self.engine.config.device_id, "starting device");
        self.engine.start_connection().await?;
        Ok(())
    }

    /// Apply a local state change. Every update marks state dirty.
    pub async fn update(&self, update: StateUpdate) -> Result<(), PubberError> {
        match update {
            StateUpdate::Pointset(pointset) => {
                self.engine.docs.lock().await.state.pointset = pointset;
            }
            StateUpdate::System(system) => {
                self.engine.docs.lock().await.state.system = system;
            }
            StateUpdate::PublishSync => {
                self.engine.mark_dirty(None);
                return Ok(self.engine.publish_sync().await?);
            }
        }
        self.engine.mark_dirty(None);
        Ok(())
    }

    pub async fn publish_state(&self) -> Result<(), PubberError> {
        Ok(self.engine.publish_sync().await?)
    }

    /// Run one periodic update immediately.
    pub async fn tick(&self) -> Result<(), PubberError> {
        self.engine.periodic_update().await
    }

    pub async fn state(&self) -> State {
        self.engine.docs.lock().await.state.clone()
    }

    pub async fn device_config(&self) -> Config {
        self.engine.docs.lock().await.config.clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.engine.is_dirty()
    }

    pub fn endpoint(&self) -> Option<EndpointConfiguration> {
        self.engine.current_endpoint()
    }

    pub fn restart_count(&self) -> u32 {
        locked(&self.engine.persistent).restart_count.unwrap_or(0)
    }

    pub fn persistent_path(&self) -> &Path {
        self.engine.store.path()
    }

    pub fn logger(&self) -> &EntryLogger {
        &self.engine.logger
    }

    pub fn clock(&self) -> &DeviceClock {
        &self.engine.clock
    }

    /// Lifecycle transitions requested by the device (`restart`,
    /// `terminate`, `shutdown`).
    pub fn lifecycle(&self) -> watch::Receiver<Option<SystemMode>> {
        self.engine.lifecycle.subscribe()
    }

    /// Orderly shutdown: stop timers, announce `shutdown` state, close the
    /// transport.
    pub async fn terminate(&self) -> Result<(), PubberError> {
        tracing::info!("terminating device");
        self.engine.stopping.store(true, Ordering::SeqCst);
        if let Some(periodic) = locked(&self.engine.periodic).take() {
            periodic.cancel();
        }
        let drained = self
            .engine
            .scheduler
            .shutdown(self.engine.config.timing.shutdown_wait)
            .await;
        self.engine.set_operation_mode(SystemMode::Shutdown).await;
        if let Err(e) = self.engine.publish_sync().await {
            self.engine.logger.error_with("While publishing shutdown state", &e);
        }
        self.engine.disconnect_transport().await;
        drained?;
        Ok(())
    }

    /// Stop without announcing a final state.
    pub async fn stop(&self) -> Result<(), PubberError> {
        self.engine.stopping.store(true, Ordering::SeqCst);
        if let Some(periodic) = locked(&self.engine.periodic).take() {
            periodic.cancel();
        }
        let drained = self
            .engine
            .scheduler
            .shutdown(self.engine.config.timing.shutdown_wait)
            .await;
        self.engine.disconnect_transport().await;
        Ok(drained?)
    }
}
