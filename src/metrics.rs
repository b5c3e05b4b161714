//! Invocation and instance statistics.
//!
//! Counters are plain atomics updated on the dispatch path; timing samples
//! are kept per method behind a short mutex. [`ComponentStats`] is a
//! point-in-time snapshot and never blocks dispatch.

use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::descriptor::ComponentKind;
use crate::error::ErrorKind;

const RECENT_SAMPLES: usize = 100;

/// Timing samples for one method.
#[derive(Debug, Clone)]
pub struct TimingStats {
    /// Total number of calls
    pub count: u64,
    /// Fastest call
    pub min_duration: Duration,
    /// Slowest call
    pub max_duration: Duration,
    /// Accumulated time
    pub total_duration: Duration,
    /// Most recent samples, for percentiles
    pub recent_times: VecDeque<Duration>,
}

impl TimingStats {
    fn new() -> Self {
        Self {
            count: 0,
            min_duration: Duration::MAX,
            max_duration: Duration::ZERO,
            total_duration: Duration::ZERO,
            recent_times: VecDeque::with_capacity(RECENT_SAMPLES),
        }
    }

    /// Adds a sample.
    pub fn record(&mut self, duration: Duration) {
        self.count += 1;
        self.min_duration = self.min_duration.min(duration);
        self.max_duration = self.max_duration.max(duration);
        self.total_duration += duration;

        if self.recent_times.len() >= RECENT_SAMPLES {
            self.recent_times.pop_front();
        }
        self.recent_times.push_back(duration);
    }

    /// Mean call time.
    pub fn average_duration(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos((self.total_duration.as_nanos() / self.count as u128) as u64)
        }
    }

    /// 95th percentile over the recent samples.
    pub fn p95_duration(&self) -> Duration {
        if self.recent_times.is_empty() {
            return Duration::ZERO;
        }

        let mut sorted: Vec<_> = self.recent_times.iter().copied().collect();
        sorted.sort();
        let index = (sorted.len() as f64 * 0.95) as usize;
        sorted.get(index.min(sorted.len() - 1)).copied().unwrap_or(Duration::ZERO)
    }
}

/// Instance lifecycle counters of one component.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LifecycleStats {
    /// Instances constructed
    pub created: u64,
    /// Instances destroyed, with or without pre-destroy
    pub destroyed: u64,
    /// Instances destroyed because a call failed
    pub discarded: u64,
    /// Session instances serialized out of memory
    pub passivated: u64,
    /// Session instances restored from passivation
    pub activated: u64,
    /// Factory or post-construct failures
    pub construction_failures: u64,
    /// Other callback failures (pre-destroy, passivation hooks)
    pub callback_failures: u64,
}

#[derive(Debug, Default)]
pub(crate) struct LifecycleCounters {
    pub(crate) created: AtomicU64,
    pub(crate) destroyed: AtomicU64,
    pub(crate) discarded: AtomicU64,
    pub(crate) passivated: AtomicU64,
    pub(crate) activated: AtomicU64,
    pub(crate) construction_failures: AtomicU64,
    pub(crate) callback_failures: AtomicU64,
}

impl LifecycleCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> LifecycleStats {
        LifecycleStats {
            created: self.created.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            passivated: self.passivated.load(Ordering::Relaxed),
            activated: self.activated.load(Ordering::Relaxed),
            construction_failures: self.construction_failures.load(Ordering::Relaxed),
            callback_failures: self.callback_failures.load(Ordering::Relaxed),
        }
    }
}

/// Instance counts held by a store at one moment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Instances alive in memory (idle plus busy)
    pub live: usize,
    /// Idle instances ready for a call
    pub idle: usize,
    /// Instances serving a call
    pub busy: usize,
    /// Passivated sessions
    pub passivated: usize,
    /// Callers currently waiting for an instance
    pub waiting: usize,
    /// Configured capacity
    pub capacity: usize,
}

/// Invocation outcome counters of one component.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvocationStats {
    /// Calls dispatched
    pub invocations: u64,
    /// Calls that returned normally
    pub succeeded: u64,
    /// Declared business failures
    pub business_failures: u64,
    /// System failures
    pub system_failures: u64,
    /// Bounded waits that elapsed
    pub timeouts: u64,
    /// Capacity reached without waiting
    pub exhausted: u64,
    /// Cancelled waits
    pub cancelled: u64,
    /// Everything else (resolution, transactions, construction)
    pub other_failures: u64,
}

#[derive(Debug, Default)]
pub(crate) struct InvocationMetrics {
    invocations: AtomicU64,
    succeeded: AtomicU64,
    business_failures: AtomicU64,
    system_failures: AtomicU64,
    timeouts: AtomicU64,
    exhausted: AtomicU64,
    cancelled: AtomicU64,
    other_failures: AtomicU64,
    timings: Mutex<HashMap<String, TimingStats>>,
}

impl InvocationMetrics {
    pub(crate) fn started(&self) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn succeeded(&self, method: &str, elapsed: Duration) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        self.record_timing(method, elapsed);
    }

    pub(crate) fn failed(&self, method: &str, kind: ErrorKind, elapsed: Duration) {
        let counter = match kind {
            ErrorKind::BusinessFailure => &self.business_failures,
            ErrorKind::SystemFailure => &self.system_failures,
            ErrorKind::Timeout => &self.timeouts,
            ErrorKind::Exhausted => &self.exhausted,
            ErrorKind::Cancelled => &self.cancelled,
            _ => &self.other_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if matches!(kind, ErrorKind::BusinessFailure | ErrorKind::SystemFailure) {
            self.record_timing(method, elapsed);
        }
    }

    fn record_timing(&self, method: &str, elapsed: Duration) {
        let mut timings = self.timings.lock();
        match timings.get_mut(method) {
            Some(stats) => stats.record(elapsed),
            None => {
                let mut stats = TimingStats::new();
                stats.record(elapsed);
                timings.insert(method.to_string(), stats);
            }
        }
    }

    pub(crate) fn snapshot(&self) -> (InvocationStats, HashMap<String, TimingStats>) {
        let stats = InvocationStats {
            invocations: self.invocations.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            business_failures: self.business_failures.load(Ordering::Relaxed),
            system_failures: self.system_failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            other_failures: self.other_failures.load(Ordering::Relaxed),
        };
        (stats, self.timings.lock().clone())
    }
}

/// Snapshot of one deployed component.
#[derive(Debug, Clone)]
pub struct ComponentStats {
    /// Component name
    pub name: String,
    /// Component kind
    pub kind: ComponentKind,
    /// Outcome counters
    pub invocations: InvocationStats,
    /// Instance counters
    pub lifecycle: LifecycleStats,
    /// Store occupancy
    pub store: StoreStats,
    /// Per-method timings
    pub methods: HashMap<String, TimingStats>,
}

/// Snapshot of every deployed component.
#[derive(Debug, Clone, Default)]
pub struct ContainerStats {
    /// Per-component snapshots, sorted by name
    pub components: Vec<ComponentStats>,
}

impl ContainerStats {
    /// Snapshot of one component.
    pub fn component(&self, name: &str) -> Option<&ComponentStats> {
        self.components.iter().find(|c| c.name == name)
    }

    /// Renders the snapshot in the Prometheus text format.
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str(
            "# HELP ferrous_container_invocations_total Business calls by outcome\n\
             # TYPE ferrous_container_invocations_total counter\n",
        );
        for c in &self.components {
            let i = &c.invocations;
            for (outcome, value) in [
                ("success", i.succeeded),
                ("business", i.business_failures),
                ("system", i.system_failures),
                ("timeout", i.timeouts),
                ("exhausted", i.exhausted),
                ("cancelled", i.cancelled),
                ("other", i.other_failures),
            ] {
                let _ = writeln!(
                    output,
                    "ferrous_container_invocations_total{{component=\"{}\",outcome=\"{}\"}} {}",
                    c.name, outcome, value
                );
            }
        }
        output.push('\n');

        output.push_str(
            "# HELP ferrous_container_instances Instances held in memory\n\
             # TYPE ferrous_container_instances gauge\n",
        );
        for c in &self.components {
            let _ = writeln!(
                output,
                "ferrous_container_instances{{component=\"{}\",state=\"idle\"}} {}\n\
                 ferrous_container_instances{{component=\"{}\",state=\"busy\"}} {}\n\
                 ferrous_container_instances{{component=\"{}\",state=\"passivated\"}} {}",
                c.name, c.store.idle, c.name, c.store.busy, c.name, c.store.passivated
            );
        }
        output.push('\n');

        output.push_str(
            "# HELP ferrous_container_call_duration_seconds Time spent in business calls\n\
             # TYPE ferrous_container_call_duration_seconds summary\n",
        );
        for c in &self.components {
            for (method, stats) in &c.methods {
                let _ = writeln!(
                    output,
                    "ferrous_container_call_duration_seconds_sum{{component=\"{}\",method=\"{}\"}} {}\n\
                     ferrous_container_call_duration_seconds_count{{component=\"{}\",method=\"{}\"}} {}",
                    c.name,
                    method,
                    stats.total_duration.as_secs_f64(),
                    c.name,
                    method,
                    stats.count
                );
            }
        }

        output
    }
}

/// What an idle sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Idle pooled or singleton instances destroyed
    pub idle_destroyed: usize,
    /// Pooled instances destroyed for exceeding max age
    pub aged_destroyed: usize,
    /// Sessions destroyed after their timeout
    pub sessions_expired: usize,
    /// Sessions moved out of memory
    pub sessions_passivated: usize,
}

impl EvictionReport {
    /// Total instances affected.
    pub fn total(&self) -> usize {
        self.idle_destroyed + self.aged_destroyed + self.sessions_expired + self.sessions_passivated
    }

    pub(crate) fn merge(&mut self, other: EvictionReport) {
        self.idle_destroyed += other.idle_destroyed;
        self.aged_destroyed += other.aged_destroyed;
        self.sessions_expired += other.sessions_expired;
        self.sessions_passivated += other.sessions_passivated;
    }
}

/// What a shutdown did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Components undeployed
    pub components: usize,
    /// Instances destroyed with pre-destroy
    pub destroyed: usize,
    /// Passivated sessions dropped
    pub passivated_dropped: usize,
    /// Calls still in flight when the drain period ran out
    pub abandoned_calls: usize,
    /// Time spent waiting for in-flight calls
    pub drained_in: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timing_stats() {
        let mut stats = TimingStats::new();

        stats.record(Duration::from_millis(10));
        stats.record(Duration::from_millis(20));
        stats.record(Duration::from_millis(30));

        assert_eq!(stats.count, 3);
        assert_eq!(stats.min_duration, Duration::from_millis(10));
        assert_eq!(stats.max_duration, Duration::from_millis(30));
        assert_eq!(stats.average_duration(), Duration::from_millis(20));
        assert_eq!(stats.p95_duration(), Duration::from_millis(30));
    }

    #[test]
    fn recent_samples_are_bounded() {
        let mut stats = TimingStats::new();
        for ms in 0..250u64 {
            stats.record(Duration::from_millis(ms));
        }
        assert_eq!(stats.count, 250);
        assert_eq!(stats.recent_times.len(), RECENT_SAMPLES);
        assert_eq!(stats.recent_times.front(), Some(&Duration::from_millis(150)));
    }

    #[test]
    fn invocation_metrics_classify_failures() {
        let metrics = InvocationMetrics::default();
        for _ in 0..4 {
            metrics.started();
        }
        metrics.succeeded("get", Duration::from_millis(2));
        metrics.failed("get", ErrorKind::Timeout, Duration::from_millis(50));
        metrics.failed("put", ErrorKind::SystemFailure, Duration::from_millis(1));
        metrics.failed("put", ErrorKind::Resolution, Duration::ZERO);

        let (stats, timings) = metrics.snapshot();
        assert_eq!(stats.invocations, 4);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.system_failures, 1);
        assert_eq!(stats.other_failures, 1);
        assert_eq!(timings["get"].count, 1);
        assert_eq!(timings["put"].count, 1);
    }

    #[test]
    fn prometheus_export() {
        let metrics = InvocationMetrics::default();
        metrics.started();
        metrics.succeeded("ping", Duration::from_millis(3));
        let (invocations, methods) = metrics.snapshot();

        let stats = ContainerStats {
            components: vec![ComponentStats {
                name: "Echo".to_string(),
                kind: ComponentKind::Pooled,
                invocations,
                lifecycle: LifecycleStats::default(),
                store: StoreStats { live: 1, idle: 1, ..StoreStats::default() },
                methods,
            }],
        };

        let text = stats.to_prometheus();
        assert!(text.contains("ferrous_container_invocations_total{component=\"Echo\",outcome=\"success\"} 1"));
        assert!(text.contains("ferrous_container_instances{component=\"Echo\",state=\"idle\"} 1"));
        assert!(text.contains("ferrous_container_call_duration_seconds_count{component=\"Echo\",method=\"ping\"} 1"));
        assert!(stats.component("Echo").is_some());
    }
}
