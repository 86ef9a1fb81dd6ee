//! System manager: the `system` block of state and lifecycle transitions.

use udmi_schema::{Level, Metadata, Operation, State, SystemMode, SystemState};

use crate::clock::DeviceClock;
use crate::config::PubberConfig;
use crate::engine::{DeviceDocs, Engine};

pub(crate) fn initial_state(
    config: &PubberConfig,
    clock: &DeviceClock,
    metadata: &Metadata,
    restart_count: Option<u32>,
) -> State {
    let model = metadata.system.clone().unwrap_or_default();
    State {
        system: SystemState {
            serial_no: Some(config.serial_no.clone()),
            hardware: model.hardware,
            software: model.software,
            last_config: None,
            operation: Operation {
                mode: Some(SystemMode::Initial),
                last_start: Some(clock.start_time()),
                restart_count,
            },
            status: None,
        },
        ..Default::default()
    }
}

impl Engine {
    pub(crate) fn update_system_config(&self, docs: &mut DeviceDocs) {
        docs.state.system.last_config = docs.config.timestamp;
        let level = docs
            .config
            .system
            .as_ref()
            .and_then(|s| s.min_loglevel)
            .map_or(Level::Info, Level::from_value);
        self.logger.set_min_level(level);
        self.mark_dirty(None);
    }

    pub(crate) async fn maybe_restart_system(&self) {
        let request = {
            let mut docs = self.docs.lock().await;
            let operation = docs
                .config
                .system
                .as_ref()
                .and_then(|s| s.operation.clone())
                .unwrap_or_default();
            let state_mode = docs.state.system.operation.mode;
            if state_mode == Some(SystemMode::Active) && operation.mode == Some(SystemMode::Restart) {
                self.logger.error("System mode requesting device restart");
                Some(SystemMode::Restart)
            } else {
                if operation.mode == Some(SystemMode::Active) && state_mode != Some(SystemMode::Active) {
                    docs.state.system.operation.mode = Some(SystemMode::Active);
                    self.mark_dirty(None);
                }
                match operation.last_start {
                    Some(last_start) if self.clock.start_time() < last_start => {
                        self.logger.error(format!(
                            "Device start time {} before last config start {}, restarting",
                            self.clock.start_time().to_rfc3339(),
                            last_start.to_rfc3339()
                        ));
                        Some(SystemMode::Restart)
                    }
                    _ => None,
                }
            }
        };
        if let Some(mode) = request {
            self.system_lifecycle(mode).await;
        }
    }

    pub(crate) async fn set_operation_mode(&self, mode: SystemMode) {
        self.docs.lock().await.state.system.operation.mode = Some(mode);
        self.mark_dirty(None);
    }

    /// Enter `mode`, announce it with a best-effort synchronous state
    /// publish, and notify lifecycle watchers.
    pub(crate) async fn system_lifecycle(&self, mode: SystemMode) {
        self.logger.notice(format!("System lifecycle {mode:?}"));
        self.set_operation_mode(mode).await;
        if let Err(e) = self.publish_sync().await {
            self.logger.error_with("While publishing lifecycle state", &e);
        }
        self.lifecycle.send_replace(Some(mode));
    }
}
