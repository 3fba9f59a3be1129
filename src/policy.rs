/// Termination policy: pure evaluation of one poll cycle.
///
/// `evaluate` maps (config, samples, previous streak state, now) to
/// (next streak state, decision). It never performs I/O, so every
/// decision path is unit-testable without a running clock.
use crate::config::WatchdogConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One GPU telemetry reading. `valid: false` means the query failed;
/// that is distinct from a genuine zero reading.
#[derive(Debug, Clone, Serialize)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub gpu_util_percent: Option<f64>,
    pub gpu_mem_fraction: Option<f64>,
    pub valid: bool,
}

impl MetricSample {
    pub fn reading(timestamp: DateTime<Utc>, util_percent: f64, mem_fraction: f64) -> Self {
        Self {
            timestamp,
            gpu_util_percent: Some(util_percent),
            gpu_mem_fraction: Some(mem_fraction),
            valid: true,
        }
    }

    /// A failed query. Treated as GPU activity by the policy (fail-safe).
    pub fn invalid(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            gpu_util_percent: None,
            gpu_mem_fraction: None,
            valid: false,
        }
    }
}

/// One job-queue depth reading, same validity contract as MetricSample.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSample {
    pub timestamp: DateTime<Utc>,
    pub queue_depth: Option<u64>,
    pub valid: bool,
}

impl QueueSample {
    pub fn depth(timestamp: DateTime<Utc>, depth: u64) -> Self {
        Self {
            timestamp,
            queue_depth: Some(depth),
            valid: true,
        }
    }

    /// A failed query. Treated as a non-empty queue by the policy (fail-safe).
    pub fn invalid(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            queue_depth: None,
            valid: false,
        }
    }
}

/// Idle/queue-empty streak state, threaded through `evaluate` by value.
///
/// A field is non-null only while the corresponding condition has held
/// continuously since that timestamp. Any disqualifying or invalid sample
/// resets it to null; there is no grace window or decay. The state starts
/// empty at process start and is never persisted across restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActivityState {
    pub idle_since: Option<DateTime<Utc>>,
    pub queue_empty_since: Option<DateTime<Utc>>,
}

/// Why a termination was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminateReason {
    Idle,
    QueueEmpty,
}

impl std::fmt::Display for TerminateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminateReason::Idle => write!(f, "idle"),
            TerminateReason::QueueEmpty => write!(f, "queue_empty"),
        }
    }
}

/// Outcome of one poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Keep polling.
    Continue,
    /// Invoke the termination action, then stop.
    Terminate(TerminateReason),
}

/// Evaluate one poll cycle.
///
/// Idle tracking: an invalid GPU sample, a partial reading, or either
/// metric above its threshold counts as activity and resets the streak.
/// Queue tracking is symmetric, gated by both `queue_empty_enabled` and
/// `terminate_on_empty_queue`, with its own threshold
/// (`queue_empty_seconds`, defaulting to `idle_seconds`).
///
/// `enabled = false` is the global kill switch: both streaks are cleared
/// and the decision is always Continue. When both triggers fire in the
/// same cycle, idle wins.
pub fn evaluate(
    config: &WatchdogConfig,
    gpu: &MetricSample,
    queue: &QueueSample,
    prev: &ActivityState,
    now: DateTime<Utc>,
) -> (ActivityState, Decision) {
    if !config.enabled {
        return (ActivityState::default(), Decision::Continue);
    }

    let mut state = prev.clone();

    if !config.idle_enabled {
        state.idle_since = None;
    } else {
        let idle_now = match (gpu.valid, gpu.gpu_util_percent, gpu.gpu_mem_fraction) {
            (true, Some(util), Some(mem)) => {
                util <= config.gpu_util_threshold && mem <= config.gpu_mem_fraction_threshold
            }
            // Unknown reading must not masquerade as idleness.
            _ => false,
        };
        if idle_now {
            state.idle_since.get_or_insert(now);
        } else {
            state.idle_since = None;
        }
    }

    if !(config.queue_empty_enabled && config.terminate_on_empty_queue) {
        state.queue_empty_since = None;
    } else if queue.valid && queue.queue_depth == Some(0) {
        state.queue_empty_since.get_or_insert(now);
    } else {
        state.queue_empty_since = None;
    }

    let idle_fired = state
        .idle_since
        .is_some_and(|since| (now - since).num_seconds() >= config.idle_seconds as i64);
    let queue_fired = state
        .queue_empty_since
        .is_some_and(|since| (now - since).num_seconds() >= config.queue_empty_seconds() as i64);

    let decision = if idle_fired {
        Decision::Terminate(TerminateReason::Idle)
    } else if queue_fired {
        Decision::Terminate(TerminateReason::QueueEmpty)
    } else {
        Decision::Continue
    };

    (state, decision)
}
