/// Per-cycle state snapshot for external inspection.
///
/// Rewritten after every poll cycle; read by `--status` and by humans
/// wondering why the pod is (not) still alive. The daemon never reads it
/// back at startup, so a restart always begins with a clean history.
use crate::policy::{ActivityState, Decision, MetricSample, QueueSample};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Serialize)]
pub struct StateSnapshot {
    pub timestamp: DateTime<Utc>,
    pub enabled: bool,
    pub gpu: MetricSample,
    pub queue: QueueSample,
    pub idle_since: Option<DateTime<Utc>>,
    pub queue_empty_since: Option<DateTime<Utc>>,
    pub decision: String,
}

impl StateSnapshot {
    pub fn new(
        timestamp: DateTime<Utc>,
        enabled: bool,
        gpu: &MetricSample,
        queue: &QueueSample,
        activity: &ActivityState,
        decision: &Decision,
    ) -> Self {
        Self {
            timestamp,
            enabled,
            gpu: gpu.clone(),
            queue: queue.clone(),
            idle_since: activity.idle_since,
            queue_empty_since: activity.queue_empty_since,
            decision: decision_label(decision),
        }
    }
}

fn decision_label(decision: &Decision) -> String {
    match decision {
        Decision::Continue => "continue".to_string(),
        Decision::Terminate(reason) => format!("terminate:{reason}"),
    }
}

/// Best-effort write: a failing snapshot must never abort the loop.
pub fn write(path: &Path, snapshot: &StateSnapshot) {
    let json = match serde_json::to_string_pretty(snapshot) {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!(error = %e, "failed to serialize state snapshot");
            return;
        }
    };
    if let Err(e) = std::fs::write(path, json) {
        tracing::warn!(error = %e, path = %path.display(), "failed to write state snapshot");
    }
}
