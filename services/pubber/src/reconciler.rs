//! Config reconciliation.
//!
//! Each inbound config is applied under the state lock, then reported as a
//! `system.config.*` status entry and followed by a state publish whether
//! or not it applied.

use std::time::Duration;

use udmi_log::error_chain;
use udmi_schema::{Config, Entry, Level, SystemMode, category};

use crate::engine::Engine;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("parsing config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("missing system block in config")]
    MissingSystem,
}

impl ReconcileError {
    fn phase(&self) -> &'static str {
        match self {
            ReconcileError::Parse(_) => "parse",
            ReconcileError::MissingSystem => "apply",
        }
    }
}

impl Engine {
    pub(crate) async fn handle_config(&self, payload: &[u8]) {
        self.router.trace_inbound("config", payload);
        let result = match serde_json::from_slice::<Config>(payload) {
            Ok(config) => self.process_config_update(config).await,
            Err(e) => Err(ReconcileError::Parse(e)),
        };
        match &result {
            Ok(()) => {
                self.config_received.send_replace(true);
                self.publisher_config_log("apply", None).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "config not applied");
                self.publisher_config_log(e.phase(), Some(e)).await;
            }
        }
        if result.is_err() && self.config.options.barf_config {
            self.logger.error("Restarting system after bad config");
            self.system_lifecycle(SystemMode::Restart).await;
            return;
        }
        if self.config.options.config_state_delay {
            self.delay_next_state();
        }
        self.publish_async().await;
    }

    async fn process_config_update(&self, config: Config) -> Result<(), ReconcileError> {
        let mut docs = self.docs.lock().await;
        if self.config.options.barf_config && config.system.is_none() {
            return Err(ReconcileError::MissingSystem);
        }
        tracing::info!(timestamp = ?config.timestamp, "applying config");
        docs.config = config;
        self.update_pointset_config(&mut docs);
        self.update_system_config(&mut docs);
        self.update_discovery_config(&mut docs);
        self.update_endpoint_blob(&mut docs);
        let period = docs
            .config
            .pointset
            .as_ref()
            .and_then(|p| p.sample_rate_sec)
            .filter(|&sec| sec > 0)
            .map(|sec| Duration::from_secs(u64::from(sec)))
            .unwrap_or(self.config.report_interval);
        drop(docs);
        self.maybe_restart_executor(period);
        Ok(())
    }

    async fn publisher_config_log(&self, phase: &str, error: Option<&ReconcileError>) {
        let phase = if self.config.options.bad_category {
            "apply"
        } else {
            phase
        };
        let entry_category = format!("system.config.{phase}");
        let entry = match error {
            None => Entry::new(
                &entry_category,
                category::success_level(&entry_category),
                "success",
            ),
            Some(e) => Entry::new(&entry_category, Level::Error, e.to_string())
                .with_detail(Some(error_chain(e))),
        }
        .at(self.clock.now());
        self.logger.record(entry.clone());
        self.docs.lock().await.state.system.status = Some(entry);
        self.mark_dirty(None);
    }
}
