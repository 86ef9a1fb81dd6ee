//! Pointset manager: point state from config and the per-tick telemetry
//! event.

use chrono::{DateTime, Utc};
use serde_json::Value;
use udmi_schema::{
    Entry, Level, PointPointsetEvent, PointPointsetState, PointsetConfig, PointsetEvent,
    PointsetModel, PointsetState, ValueState, category,
};

use crate::engine::{DeviceDocs, Engine};
use crate::router::{DeviceMessage, ExtraPointsetEvent};

pub fn pointset_state(
    config: &PointsetConfig,
    model: Option<&PointsetModel>,
    now: DateTime<Utc>,
) -> PointsetState {
    let points = config
        .points
        .iter()
        .map(|(name, point)| {
            let known = model.is_some_and(|m| m.points.contains_key(name));
            let state = if known {
                PointPointsetState {
                    value_state: point.set_value.as_ref().map(|_| ValueState::Applied),
                    status: None,
                }
            } else {
                PointPointsetState {
                    value_state: None,
                    status: Some(
                        Entry::new(
                            category::POINTSET_POINT_FAILURE,
                            Level::Error,
                            format!("Unknown configured point {name}"),
                        )
                        .at(now),
                    ),
                }
            };
            (name.clone(), state)
        })
        .collect();
    PointsetState {
        state_etag: config.state_etag.clone(),
        status: None,
        points,
    }
}

/// Telemetry for every modelled point: the configured `set_value` when
/// present, else the model baseline.
pub fn pointset_event(
    config: Option<&PointsetConfig>,
    model: Option<&PointsetModel>,
) -> Option<PointsetEvent> {
    let model = model.filter(|m| !m.points.is_empty())?;
    let points = model
        .points
        .iter()
        .map(|(name, point)| {
            let present_value = config
                .and_then(|c| c.points.get(name))
                .and_then(|p| p.set_value.clone())
                .or_else(|| point.baseline_value.clone())
                .unwrap_or(Value::Null);
            (name.clone(), PointPointsetEvent { present_value })
        })
        .collect();
    Some(PointsetEvent {
        points,
        ..Default::default()
    })
}

impl Engine {
    pub(crate) fn update_pointset_config(&self, docs: &mut DeviceDocs) {
        let now = self.clock.now();
        docs.state.pointset = docs
            .config
            .pointset
            .as_ref()
            .map(|config| pointset_state(config, self.metadata.pointset.as_ref(), now));
        self.mark_dirty(None);
    }

    pub(crate) async fn send_pointset_event(&self) {
        let event = {
            let docs = self.docs.lock().await;
            pointset_event(docs.config.pointset.as_ref(), self.metadata.pointset.as_ref())
        };
        let Some(event) = event else {
            return;
        };
        let message = match &self.config.options.extra_field {
            Some(extra) => DeviceMessage::ExtraPointsetEvent(ExtraPointsetEvent {
                event,
                extra_field: extra.clone(),
            }),
            None => DeviceMessage::PointsetEvent(event),
        };
        self.publish_event(message);
    }
}
