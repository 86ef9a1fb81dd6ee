//! Fault injection slate, enabled by the `empty_missing` option.
//!
//! # Slate
//! The tick counter modulo [`MESSAGE_REPORT_INTERVAL`] picks the fault:
//! - `0`: state whose payload is the corrupt string [`CORRUPT_STATE_MESSAGE`]
//! - `1`: `events/invalid` carrying an unexpected field
//! - `2..`: raw replacement payloads on borrowed topics, see [`INVALID_REPLACEMENTS`]
//!
//! Every other phase is quiet. Each injection sits between two
//! `inject_delay` pauses.

use crate::engine::Engine;
use crate::router::{DeviceMessage, InjectedMessage, InjectedState};

pub const MESSAGE_REPORT_INTERVAL: u64 = 10;

pub const CORRUPT_STATE_MESSAGE: &str = "!&*@(!*&@!";

/// Topic and raw payload pairs, in injection order.
pub const INVALID_REPLACEMENTS: &[(&str, &str)] = &[
    ("events/blobset", "\"\""),
    ("events/discovery", "{}"),
    ("events/mapping", "{ NOT VALID JSON!"),
];

const UNEXPECTED_FIELD: &str = "bunny";

// ---------------------------------------------------------------------------
// Public fault outcome type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultOutcome {
    None,
    CorruptState,
    UnexpectedField,
    Replacement {
        topic: &'static str,
        payload: &'static str,
    },
}

pub fn fault_for_tick(tick: u64) -> FaultOutcome {
    match tick % MESSAGE_REPORT_INTERVAL {
        0 => FaultOutcome::CorruptState,
        1 => FaultOutcome::UnexpectedField,
        phase => INVALID_REPLACEMENTS
            .get((phase - 2) as usize)
            .map_or(FaultOutcome::None, |&(topic, payload)| {
                FaultOutcome::Replacement { topic, payload }
            }),
    }
}

impl Engine {
    pub(crate) async fn maybe_inject_fault(&self, tick: u64) {
        if !self.config.options.empty_missing {
            return;
        }
        let outcome = fault_for_tick(tick);
        if outcome == FaultOutcome::None {
            return;
        }
        let delay = self.config.timing.inject_delay;
        tokio::time::sleep(delay).await;
        tracing::info!(tick, fault = ?outcome, "injecting fault");
        match outcome {
            FaultOutcome::None => {}
            FaultOutcome::CorruptState => {
                self.flush_dirty().await;
                let _docs = self.docs.lock().await;
                let message = DeviceMessage::InjectedState(InjectedState {
                    replace_message_with: CORRUPT_STATE_MESSAGE.to_owned(),
                });
                if let Err(e) = self.publish_state_message(message).await {
                    self.logger.error_with("While sending corrupt state", &e);
                }
            }
            FaultOutcome::UnexpectedField => {
                self.publish_event(DeviceMessage::Injected(InjectedMessage {
                    field: Some(UNEXPECTED_FIELD.to_owned()),
                    ..Default::default()
                }));
            }
            FaultOutcome::Replacement { topic, payload } => {
                self.publish_event(DeviceMessage::Injected(InjectedMessage {
                    replace_topic_with: Some(topic.to_owned()),
                    replace_message_with: Some(payload.to_owned()),
                    ..Default::default()
                }));
            }
        }
        tokio::time::sleep(delay).await;
    }
}
