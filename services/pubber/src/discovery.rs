//! Discovery enumeration and per-family scan scheduling.
//!
//! Enumeration runs once per new `discovery.generation`. Scans run per
//! family on generation-stamped timers; every timer captures its generation
//! and re-checks it against state before doing anything, so a superseded or
//! cleared family turns late timers into no-ops.

use std::collections::BTreeMap;
use std::sync::Weak;

use chrono::{DateTime, TimeDelta, Utc};
use udmi_schema::{
    DiscoveryConfig, DiscoveryEvent, FamilyDiscoveryEvent, FamilyDiscoveryState, Metadata,
    PointEnumerationEvent, PointsetModel, State,
};

use crate::engine::{DeviceDocs, Engine};
use crate::features::supported_features;
use crate::router::DeviceMessage;
use crate::scheduler::Job;

/// Family name under which a device reports its own id.
pub const IOT_FAMILY: &str = "iot";

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

/// Hash compatible with `java.lang.String#hashCode` (UTF-16, wrapping).
pub fn java_string_hash(s: &str) -> i32 {
    s.encode_utf16()
        .fold(0i32, |h, c| h.wrapping_mul(31).wrapping_add(i32::from(c)))
}

/// Eight hex digit key used for enumerated points.
pub fn uniq_key(point: &str) -> String {
    format!("{:08x}", java_string_hash(point) as u32)
}

/// Start time for a scan requested at `generation` given a `baseline`.
///
/// A generation at or after the baseline is used as is. An older one moves
/// forward by whole intervals until it reaches the baseline, rounding the
/// gap up to whole seconds first. With no interval a stale generation
/// yields `None`.
pub fn roll_forward(
    generation: DateTime<Utc>,
    baseline: DateTime<Utc>,
    interval_sec: u32,
) -> Option<DateTime<Utc>> {
    if generation >= baseline {
        return Some(generation);
    }
    if interval_sec == 0 {
        return None;
    }
    let interval = i64::from(interval_sec);
    let delta_sec = ((baseline - generation).num_milliseconds() + 999) / 1000;
    let intervals = (delta_sec + interval - 1) / interval;
    Some(generation + TimeDelta::seconds(intervals * interval))
}

/// Whether `candidate` is one of the scan starts derived from the configured
/// `origin`: the origin itself, or a whole number of intervals after it.
pub fn in_scan_chain(candidate: DateTime<Utc>, origin: DateTime<Utc>, interval_sec: u32) -> bool {
    if candidate < origin {
        return false;
    }
    if interval_sec == 0 {
        return candidate == origin;
    }
    (candidate - origin).num_milliseconds() % (i64::from(interval_sec) * 1000) == 0
}

pub fn enumerate_points(model: Option<&PointsetModel>) -> BTreeMap<String, PointEnumerationEvent> {
    model
        .map(|m| {
            m.points
                .iter()
                .map(|(name, point)| {
                    let event = PointEnumerationEvent {
                        name: Some(name.clone()),
                        writable: point.writable,
                        units: point.units.clone(),
                        point_ref: point.point_ref.clone(),
                    };
                    (uniq_key(name), event)
                })
                .collect()
        })
        .unwrap_or_default()
}

fn enumerate_families(metadata: &Metadata) -> BTreeMap<String, FamilyDiscoveryEvent> {
    metadata
        .localnet
        .as_ref()
        .map(|localnet| {
            localnet
                .families
                .iter()
                .map(|(family, model)| {
                    let event = FamilyDiscoveryEvent {
                        addr: model.addr.clone(),
                    };
                    (family.clone(), event)
                })
                .collect()
        })
        .unwrap_or_default()
}

fn family_state<'a>(state: &'a mut State, family: &str) -> &'a mut FamilyDiscoveryState {
    state
        .discovery
        .get_or_insert_with(Default::default)
        .families
        .get_or_insert_with(BTreeMap::new)
        .entry(family.to_owned())
        .or_default()
}

fn recorded_family(state: &State, family: &str) -> Option<FamilyDiscoveryState> {
    state
        .discovery
        .as_ref()?
        .families
        .as_ref()?
        .get(family)
        .cloned()
}

// ---------------------------------------------------------------------------
// Scheduled jobs
// ---------------------------------------------------------------------------

fn check_job(weak: Weak<Engine>, family: String, generation: DateTime<Utc>) -> Job {
    Box::pin(async move {
        if let Some(engine) = weak.upgrade() {
            engine.check_discovery_scan(&family, generation).await;
        }
    })
}

fn send_job(weak: Weak<Engine>, family: String, generation: DateTime<Utc>) -> Job {
    Box::pin(async move {
        if let Some(engine) = weak.upgrade() {
            engine.send_discovery_events(&family, generation).await;
        }
    })
}

fn complete_job(weak: Weak<Engine>, family: String, generation: DateTime<Utc>) -> Job {
    Box::pin(async move {
        if let Some(engine) = weak.upgrade() {
            engine.discovery_scan_complete(&family, generation).await;
        }
    })
}

// ---------------------------------------------------------------------------
// Engine integration
// ---------------------------------------------------------------------------

impl Engine {
    /// Apply `config.discovery` to state. Called under the state lock.
    pub(crate) fn update_discovery_config(&self, docs: &mut DeviceDocs) {
        let Some(discovery) = docs.config.discovery.clone() else {
            if docs.state.discovery.take().is_some() {
                self.mark_dirty(None);
            }
            return;
        };
        self.update_discovery_enumeration(docs, &discovery);
        let families = discovery.families.unwrap_or_default();

        if let Some(recorded) = docs
            .state
            .discovery
            .as_mut()
            .and_then(|d| d.families.as_mut())
        {
            for (family, family_state) in recorded.iter_mut() {
                if !families.contains_key(family) && family_state.generation.is_some() {
                    self.logger
                        .info(format!("Clearing scheduled discovery family {family}"));
                    family_state.generation = None;
                    family_state.active = None;
                }
            }
        }
        for family in families.keys() {
            self.schedule_discovery_scan(docs, family);
        }
        if let Some(discovery) = docs.state.discovery.as_mut() {
            if discovery.families.as_ref().is_some_and(BTreeMap::is_empty) {
                discovery.families = None;
            }
        }
        self.mark_dirty(None);
    }

    fn update_discovery_enumeration(&self, docs: &mut DeviceDocs, discovery: &DiscoveryConfig) {
        let state = docs.state.discovery.get_or_insert_with(Default::default);
        let Some(generation) = discovery.generation else {
            state.generation = None;
            return;
        };
        if state.generation.is_some_and(|current| generation <= current) {
            return;
        }
        state.generation = Some(generation);
        self.logger.info(format!(
            "Discovery enumeration at {}",
            generation.to_rfc3339()
        ));

        let enumerate = discovery.enumerate.clone().unwrap_or_default();
        let event = DiscoveryEvent {
            generation: Some(generation),
            uniqs: enumerate
                .uniqs
                .unwrap_or(false)
                .then(|| enumerate_points(self.metadata.pointset.as_ref())),
            features: enumerate
                .features
                .unwrap_or(false)
                .then(supported_features),
            families: enumerate
                .families
                .unwrap_or(false)
                .then(|| enumerate_families(&self.metadata)),
            ..Default::default()
        };
        self.publish_event(DeviceMessage::DiscoveryEvent(event));
    }

    fn schedule_discovery_scan(&self, docs: &mut DeviceDocs, family: &str) {
        let Some(raw_generation) = docs
            .config
            .family_config(family)
            .and_then(|f| f.generation)
        else {
            if let Some(families) = docs
                .state
                .discovery
                .as_mut()
                .and_then(|d| d.families.as_mut())
            {
                families.remove(family);
            }
            return;
        };
        let interval = docs.config.scan_interval_sec(family);
        let previous = family_state(&mut docs.state, family).generation;
        let baseline = previous.unwrap_or(self.clock.start_time());
        let Some(generation) = roll_forward(raw_generation, baseline, interval) else {
            self.logger.info(format!(
                "Discovery scan {family} generation {} already past, skipping",
                raw_generation.to_rfc3339()
            ));
            return;
        };
        if generation != raw_generation {
            self.logger.info(format!(
                "Discovery scan {family} generation {} rolled forward to {}",
                raw_generation.to_rfc3339(),
                generation.to_rfc3339()
            ));
        }
        tracing::debug!(family, generation = %generation, "discovery scan scheduled");
        self.schedule(
            self.clock.until(generation),
            check_job(self.weak.clone(), family.to_owned(), generation),
        );
    }

    /// Start a scan for `generation` unless state already reached it or the
    /// family's configured generation no longer leads to it.
    pub(crate) async fn check_discovery_scan(&self, family: &str, generation: DateTime<Utc>) {
        {
            let mut docs = self.docs.lock().await;
            let interval = docs.config.scan_interval_sec(family);
            let configured = docs
                .config
                .family_config(family)
                .and_then(|f| f.generation)
                .is_some_and(|origin| in_scan_chain(generation, origin, interval));
            let state = family_state(&mut docs.state, family);
            if !configured || state.generation.is_some_and(|current| current >= generation) {
                tracing::debug!(family, generation = %generation, "discovery check skipped");
                return;
            }
            state.generation = Some(generation);
            state.active = Some(true);
        }
        self.logger.info(format!(
            "Discovery scan starting {family} as {}",
            generation.to_rfc3339()
        ));
        let duration = self.config.timing.scan_duration;
        self.schedule(
            duration,
            complete_job(self.weak.clone(), family.to_owned(), generation),
        );
        self.schedule(
            duration / 2,
            send_job(self.weak.clone(), family.to_owned(), generation),
        );
        self.publish_async().await;
    }

    pub(crate) async fn send_discovery_events(&self, family: &str, generation: DateTime<Utc>) {
        let enumerate = {
            let docs = self.docs.lock().await;
            let current = recorded_family(&docs.state, family);
            let matches = current.as_ref().is_some_and(|s| {
                s.generation == Some(generation) && s.active == Some(true)
            });
            if !matches {
                tracing::debug!(family, generation = %generation, "discovery send skipped");
                return;
            }
            docs.config
                .family_config(family)
                .and_then(|f| f.enumerate)
                .unwrap_or(false)
        };
        let Some(site_model) = &self.site_model else {
            self.logger
                .warn(format!("No site model, no discovery results for {family}"));
            return;
        };
        let mut sent = 0;
        for device_id in site_model.device_ids() {
            let Some(metadata) = site_model.metadata(&device_id) else {
                continue;
            };
            if metadata.family_addr(family).is_none() {
                continue;
            }
            let mut families = enumerate_families(&metadata);
            families.insert(
                IOT_FAMILY.to_owned(),
                FamilyDiscoveryEvent {
                    addr: Some(device_id.clone()),
                },
            );
            let event = DiscoveryEvent {
                generation: Some(generation),
                scan_family: Some(family.to_owned()),
                scan_addr: Some(device_id.clone()),
                families: Some(families),
                uniqs: enumerate.then(|| enumerate_points(metadata.pointset.as_ref())),
                ..Default::default()
            };
            if self.publish_event(DeviceMessage::DiscoveryEvent(event)) {
                sent += 1;
            }
        }
        self.logger.info(format!(
            "Sent {sent} discovery events from {family} for {}",
            generation.to_rfc3339()
        ));
    }

    pub(crate) async fn discovery_scan_complete(&self, family: &str, generation: DateTime<Utc>) {
        let next = {
            let mut docs = self.docs.lock().await;
            if recorded_family(&docs.state, family).and_then(|s| s.generation) != Some(generation) {
                tracing::debug!(family, generation = %generation, "stale discovery completion");
                return;
            }
            let interval = docs.config.scan_interval_sec(family);
            if interval > 0 {
                Some(generation + TimeDelta::seconds(i64::from(interval)))
            } else {
                family_state(&mut docs.state, family).active = Some(false);
                None
            }
        };
        match next {
            Some(next) => {
                tracing::debug!(family, next = %next, "next discovery scan scheduled");
                self.schedule(
                    self.clock.until(next),
                    check_job(self.weak.clone(), family.to_owned(), next),
                );
            }
            None => {
                self.logger
                    .info(format!("Discovery scan {family} complete"));
                self.publish_async().await;
            }
        }
    }
}
