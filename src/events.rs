//! Aggregation of evaluation counts and experiment metrics into fixed-width time slots.
//!
//! Nothing is sent per evaluation. Instead, counters for the current slot are kept in memory and
//! archived once the wall clock crosses the slot boundary. The
//! [`Dispatcher`](crate::dispatcher::Dispatcher) periodically drains archived slots and sends
//! one request per slot and category.
use std::{
    collections::{BTreeMap, HashMap},
    sync::Mutex,
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{config::Environment, transport::Endpoint};

const SDK_TYPE: &str = "rust";

/// flag id → variant key → count
pub type VariantCounts = HashMap<String, HashMap<String, u64>>;

/// flag id → event name → variant key → summary
pub type ExperimentMetrics = HashMap<String, HashMap<String, HashMap<String, MetricSummary>>>;

/// Running summary of recorded metric values. Enough to reconstruct mean, minimum and maximum
/// server-side without sending individual samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    /// Number of recorded values.
    pub count: u64,
    /// Sum of recorded values.
    pub total: f64,
    /// Smallest recorded value.
    pub minimum: f64,
    /// Largest recorded value.
    pub maximum: f64,
}

impl MetricSummary {
    fn new(value: f64) -> MetricSummary {
        MetricSummary {
            count: 1,
            total: value,
            minimum: value,
            maximum: value,
        }
    }

    fn record(&mut self, value: f64) {
        self.count += 1;
        self.total += value;
        self.minimum = self.minimum.min(value);
        self.maximum = self.maximum.max(value);
    }

    fn merge(&mut self, other: &MetricSummary) {
        self.count += other.count;
        self.total += other.total;
        self.minimum = self.minimum.min(other.minimum);
        self.maximum = self.maximum.max(other.maximum);
    }
}

/// Counters collected during one time slot.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SlotCounters {
    /// How many times each variant was served.
    pub evaluation_counts: VariantCounts,
    /// How many evaluations fell back to the default variant because of an error.
    pub error_counts: HashMap<String, u64>,
    /// Code errors reported by the application, per served variant.
    pub code_bug_counts: VariantCounts,
    /// Experiment metrics.
    pub experiment_metrics: ExperimentMetrics,
}

impl SlotCounters {
    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.evaluation_counts.is_empty()
            && self.error_counts.is_empty()
            && self.code_bug_counts.is_empty()
            && self.experiment_metrics.is_empty()
    }

    /// Fold `other` into `self`. Used when a slot is archived twice (forced flush followed by
    /// more events in the same slot).
    fn merge(&mut self, other: SlotCounters) {
        merge_variant_counts(&mut self.evaluation_counts, other.evaluation_counts);
        merge_variant_counts(&mut self.code_bug_counts, other.code_bug_counts);
        for (flag_id, count) in other.error_counts {
            *self.error_counts.entry(flag_id).or_default() += count;
        }
        for (flag_id, events) in other.experiment_metrics {
            let flag_metrics = self.experiment_metrics.entry(flag_id).or_default();
            for (event_name, variants) in events {
                let event_metrics = flag_metrics.entry(event_name).or_default();
                for (variant_key, summary) in variants {
                    event_metrics
                        .entry(variant_key)
                        .and_modify(|existing| existing.merge(&summary))
                        .or_insert(summary);
                }
            }
        }
    }
}

fn merge_variant_counts(into: &mut VariantCounts, from: VariantCounts) {
    for (flag_id, variants) in from {
        let counts = into.entry(flag_id).or_default();
        for (variant_key, count) in variants {
            *counts.entry(variant_key).or_default() += count;
        }
    }
}

/// Request body for [`Endpoint::VariantsData`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantsDataBody {
    pub machine_id: Uuid,
    pub sdk_type: &'static str,
    pub environment: Environment,
    pub data: VariantCounts,
    pub code_bugs: VariantCounts,
    pub errors: HashMap<String, u64>,
    /// Slot boundary, in milliseconds since Unix epoch.
    pub time: i64,
}

/// Request body for [`Endpoint::ExperimentEvents`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentEventsBody {
    pub machine_id: Uuid,
    pub sdk_type: &'static str,
    pub environment: Environment,
    /// Slot boundary, in milliseconds since Unix epoch.
    pub time: i64,
    pub experiment_events: ExperimentMetrics,
}

/// A request ready to be sent.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventRequest {
    VariantsData(VariantsDataBody),
    ExperimentEvents(ExperimentEventsBody),
}

impl EventRequest {
    pub(crate) fn endpoint(&self) -> Endpoint {
        match self {
            EventRequest::VariantsData(_) => Endpoint::VariantsData,
            EventRequest::ExperimentEvents(_) => Endpoint::ExperimentEvents,
        }
    }

    /// Slot boundary the request reports.
    pub fn time(&self) -> i64 {
        match self {
            EventRequest::VariantsData(body) => body.time,
            EventRequest::ExperimentEvents(body) => body.time,
        }
    }
}

struct AggregatorState {
    /// Boundary (end) of the slot `current` belongs to, in milliseconds since Unix epoch.
    time_slot: i64,
    current: SlotCounters,
    /// Archived slots waiting to be sent, keyed by their boundary.
    pending: BTreeMap<i64, SlotCounters>,
}

impl AggregatorState {
    /// Archive `current` and start an empty slot ending at `next_slot`.
    fn rollover(&mut self, next_slot: i64) {
        let archived = std::mem::take(&mut self.current);
        match self.pending.get_mut(&self.time_slot) {
            Some(existing) => existing.merge(archived),
            None => {
                self.pending.insert(self.time_slot, archived);
            }
        }
        self.time_slot = next_slot;
    }
}

/// Thread-safe aggregator of evaluation counters and experiment metrics.
///
/// All counters live behind one mutex, so slot rollover is atomic with respect to concurrent
/// increments and no increment is ever lost.
pub struct EventAggregator {
    flush_interval_ms: i64,
    capture_events: bool,
    machine_id: Uuid,
    environment: Environment,
    state: Mutex<AggregatorState>,
}

impl EventAggregator {
    /// Create an aggregator with slots `flush_interval` wide.
    pub fn new(flush_interval: Duration, environment: Environment, capture_events: bool) -> Self {
        let flush_interval_ms = i64::try_from(flush_interval.as_millis())
            .unwrap_or(i64::MAX)
            .max(1);
        EventAggregator {
            flush_interval_ms,
            capture_events,
            machine_id: Uuid::new_v4(),
            environment,
            state: Mutex::new(AggregatorState {
                time_slot: time_slot(Utc::now(), flush_interval_ms),
                current: SlotCounters::default(),
                pending: BTreeMap::new(),
            }),
        }
    }

    /// Random id identifying this SDK instance in event bodies.
    pub fn machine_id(&self) -> Uuid {
        self.machine_id
    }

    /// Count one evaluation of `flag_id` that served `variant_key`.
    pub fn add_evaluation_count(&self, flag_id: &str, variant_key: &str) {
        self.add_evaluation_count_at(Utc::now(), flag_id, variant_key);
    }

    /// Count one evaluation of `flag_id` that failed and served the default variant.
    pub fn add_error_count(&self, flag_id: &str) {
        self.add_error_count_at(Utc::now(), flag_id);
    }

    /// Count one code error reported by the application for `variant_key` of `flag_id`.
    pub fn add_code_bug_count(&self, flag_id: &str, variant_key: &str) {
        self.add_code_bug_count_at(Utc::now(), flag_id, variant_key);
    }

    /// Record `value` for an experiment event.
    pub fn record_experiment_event(
        &self,
        flag_id: &str,
        event_name: &str,
        variant_key: &str,
        value: f64,
    ) {
        self.record_experiment_event_at(Utc::now(), flag_id, event_name, variant_key, value);
    }

    pub(crate) fn add_evaluation_count_at(
        &self,
        now: DateTime<Utc>,
        flag_id: &str,
        variant_key: &str,
    ) {
        self.with_current_slot(now, |counters| {
            increment(&mut counters.evaluation_counts, flag_id, variant_key)
        });
    }

    pub(crate) fn add_error_count_at(&self, now: DateTime<Utc>, flag_id: &str) {
        self.with_current_slot(now, |counters| {
            *counters.error_counts.entry(flag_id.to_owned()).or_default() += 1;
        });
    }

    pub(crate) fn add_code_bug_count_at(
        &self,
        now: DateTime<Utc>,
        flag_id: &str,
        variant_key: &str,
    ) {
        self.with_current_slot(now, |counters| {
            increment(&mut counters.code_bug_counts, flag_id, variant_key)
        });
    }

    pub(crate) fn record_experiment_event_at(
        &self,
        now: DateTime<Utc>,
        flag_id: &str,
        event_name: &str,
        variant_key: &str,
        value: f64,
    ) {
        self.with_current_slot(now, |counters| {
            counters
                .experiment_metrics
                .entry(flag_id.to_owned())
                .or_default()
                .entry(event_name.to_owned())
                .or_default()
                .entry(variant_key.to_owned())
                .and_modify(|summary| summary.record(value))
                .or_insert_with(|| MetricSummary::new(value));
        });
    }

    /// Run `f` on the counters of the slot `now` falls into, archiving the current slot first if
    /// `now` is past its boundary.
    fn with_current_slot(&self, now: DateTime<Utc>, f: impl FnOnce(&mut SlotCounters)) {
        if !self.capture_events {
            return;
        }

        let slot = time_slot(now, self.flush_interval_ms);
        let mut state = self.lock_state();
        if slot > state.time_slot {
            log::debug!(target: "flagsense", slot = state.time_slot; "archiving time slot");
            state.rollover(slot);
        }
        f(&mut state.current);
    }

    /// Archive the current slot if `now` is past its boundary.
    pub(crate) fn rollover_if_due(&self, now: DateTime<Utc>) {
        let slot = time_slot(now, self.flush_interval_ms);
        let mut state = self.lock_state();
        if slot > state.time_slot {
            state.rollover(slot);
        }
    }

    /// Archive the current slot unconditionally. Used on shutdown so that nothing recorded so far
    /// is left behind.
    pub(crate) fn force_rollover(&self, now: DateTime<Utc>) {
        let slot = time_slot(now, self.flush_interval_ms);
        let mut state = self.lock_state();
        let next_slot = slot.max(state.time_slot);
        state.rollover(next_slot);
    }

    /// Remove all archived slots and turn them into requests.
    ///
    /// A `variantsData` request is produced for every slot; an `experimentEvents` request only
    /// for slots that recorded experiment metrics.
    pub(crate) fn drain_pending(&self) -> Vec<EventRequest> {
        let pending = std::mem::take(&mut self.lock_state().pending);

        let mut requests = Vec::with_capacity(pending.len() * 2);
        for (time, counters) in pending {
            let SlotCounters {
                evaluation_counts,
                error_counts,
                code_bug_counts,
                experiment_metrics,
            } = counters;

            requests.push(EventRequest::VariantsData(VariantsDataBody {
                machine_id: self.machine_id,
                sdk_type: SDK_TYPE,
                environment: self.environment,
                data: evaluation_counts,
                code_bugs: code_bug_counts,
                errors: error_counts,
                time,
            }));

            if !experiment_metrics.is_empty() {
                requests.push(EventRequest::ExperimentEvents(ExperimentEventsBody {
                    machine_id: self.machine_id,
                    sdk_type: SDK_TYPE,
                    environment: self.environment,
                    time,
                    experiment_events: experiment_metrics,
                }));
            }
        }
        requests
    }

    /// Return `true` if nothing has been recorded in the current slot and nothing is pending.
    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        let state = self.lock_state();
        state.current.is_empty() && state.pending.is_empty()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, AggregatorState> {
        self.state
            .lock()
            .expect("thread holding aggregator lock should not panic")
    }

    #[cfg(test)]
    pub(crate) fn current(&self) -> (i64, SlotCounters) {
        let state = self.lock_state();
        (state.time_slot, state.current.clone())
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> BTreeMap<i64, SlotCounters> {
        self.lock_state().pending.clone()
    }
}

fn increment(counts: &mut VariantCounts, flag_id: &str, variant_key: &str) {
    *counts
        .entry(flag_id.to_owned())
        .or_default()
        .entry(variant_key.to_owned())
        .or_default() += 1;
}

/// Boundary of the slot `now` falls into: `now` rounded up to a multiple of `interval_ms`,
/// in milliseconds since Unix epoch.
pub(crate) fn time_slot(now: DateTime<Utc>, interval_ms: i64) -> i64 {
    let now_ms = now.timestamp_millis();
    let floor = now_ms.div_euclid(interval_ms) * interval_ms;
    if floor == now_ms {
        floor
    } else {
        floor + interval_ms
    }
}
