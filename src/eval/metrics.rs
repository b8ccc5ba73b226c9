//! Counters and timers collected during one evaluation.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use serde::{Serialize, Serializer};

/// Time spent parsing and checking the query.
pub const TIMER_QUERY_PARSE: &str = "timer_eval_query_parse_ns";
/// Time spent evaluating the query.
pub const TIMER_QUERY_EVAL: &str = "timer_eval_query_eval_ns";
/// Time spent preparing a partial result.
pub const TIMER_PARTIAL_PREPARE: &str = "timer_eval_partial_prepare_ns";
/// Rule bodies evaluated. Recorded only when instrumented.
pub const COUNTER_RULE_EVALUATIONS: &str = "counter_eval_rule_evaluations";
/// Base documents read. Recorded only when instrumented.
pub const COUNTER_DATA_READS: &str = "counter_eval_data_reads";
/// Queries served from a cached partial result.
pub const COUNTER_PARTIAL_CACHE_HIT: &str = "counter_partial_cache_hit";

#[derive(Debug, Default)]
struct MetricsInner {
    timers: BTreeMap<String, u64>,
    counters: BTreeMap<String, u64>,
}

/// Shared metrics handle. Clones record into the same collector.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    inner: Arc<Mutex<MetricsInner>>,
}

/// A running timer; [`Timer::stop`] records the elapsed nanoseconds.
#[must_use]
#[derive(Debug)]
pub struct Timer {
    metrics: Metrics,
    name: &'static str,
    start: Instant,
}

impl Timer {
    /// Stop the timer, adding the elapsed time to its metric.
    pub fn stop(self) -> u64 {
        let ns = u64::try_from(self.start.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.metrics.add_timer(self.name, ns);
        ns
    }
}

impl Metrics {
    /// An empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut MetricsInner) -> R) -> R {
        // Metrics are best-effort; a poisoned collector is still usable.
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Start timing `name`.
    pub fn timer(&self, name: &'static str) -> Timer {
        Timer {
            metrics: self.clone(),
            name,
            start: Instant::now(),
        }
    }

    /// Add `ns` nanoseconds to timer `name`.
    pub fn add_timer(&self, name: &str, ns: u64) {
        self.with(|m| {
            let slot = m.timers.entry(name.to_string()).or_default();
            *slot = slot.saturating_add(ns);
        });
    }

    /// Increment counter `name`.
    pub fn incr(&self, name: &str) {
        self.add(name, 1);
    }

    /// Add `n` to counter `name`.
    pub fn add(&self, name: &str, n: u64) {
        self.with(|m| {
            let slot = m.counters.entry(name.to_string()).or_default();
            *slot = slot.saturating_add(n);
        });
    }

    /// Value of counter `name`; zero if never touched.
    #[must_use]
    pub fn counter(&self, name: &str) -> u64 {
        self.with(|m| m.counters.get(name).copied().unwrap_or(0))
    }

    /// Accumulated nanoseconds of timer `name`, if it ran.
    #[must_use]
    pub fn timer_ns(&self, name: &str) -> Option<u64> {
        self.with(|m| m.timers.get(name).copied())
    }

    /// Flat snapshot of every timer and counter.
    #[must_use]
    pub fn all(&self) -> BTreeMap<String, u64> {
        self.with(|m| {
            m.timers
                .iter()
                .chain(m.counters.iter())
                .map(|(k, v)| (k.clone(), *v))
                .collect()
        })
    }

    /// Reset every timer and counter.
    pub fn clear(&self) {
        self.with(|m| {
            m.timers.clear();
            m.counters.clear();
        });
    }
}

impl Serialize for Metrics {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.all().serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_one_collector() {
        let m = Metrics::new();
        let c = m.clone();
        c.incr(COUNTER_DATA_READS);
        m.add(COUNTER_DATA_READS, 2);
        assert_eq!(m.counter(COUNTER_DATA_READS), 3);
    }

    #[test]
    fn timers_accumulate_and_show_in_snapshot() {
        let m = Metrics::new();
        let _ = m.timer(TIMER_QUERY_EVAL).stop();
        m.add_timer(TIMER_QUERY_EVAL, 5);
        assert!(m.timer_ns(TIMER_QUERY_EVAL).unwrap() >= 5);
        assert!(m.all().contains_key(TIMER_QUERY_EVAL));
        m.clear();
        assert!(m.all().is_empty());
    }

    #[test]
    fn serializes_as_flat_map() {
        let m = Metrics::new();
        m.incr("counter_x");
        assert_eq!(serde_json::to_value(&m).unwrap(), serde_json::json!({"counter_x": 1}));
    }
}
