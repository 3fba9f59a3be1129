/// GPU telemetry sampling via nvidia-smi.
///
/// Every failure path (missing binary, timeout, bad exit, unparsable
/// output) yields an invalid sample. A metrics outage must never abort
/// the watchdog loop.
use crate::policy::MetricSample;
use chrono::Utc;
use std::time::Duration;
use tokio::process::Command;

const NVIDIA_SMI: &str = "nvidia-smi";
const QUERY_ARGS: [&str; 2] = [
    "--query-gpu=utilization.gpu,memory.used,memory.total",
    "--format=csv,noheader,nounits",
];

/// Query GPU utilization and memory fraction, bounded by `timeout`.
pub async fn sample(timeout: Duration) -> MetricSample {
    sample_with_command(NVIDIA_SMI, timeout).await
}

async fn sample_with_command(program: &str, timeout: Duration) -> MetricSample {
    let now = Utc::now();

    let output = match tokio::time::timeout(
        timeout,
        Command::new(program).args(QUERY_ARGS).output(),
    )
    .await
    {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "failed to run nvidia-smi");
            return MetricSample::invalid(now);
        }
        Err(_) => {
            tracing::warn!(timeout_secs = timeout.as_secs(), "nvidia-smi timed out");
            return MetricSample::invalid(now);
        }
    };

    if !output.status.success() {
        tracing::warn!(status = ?output.status.code(), "nvidia-smi exited non-zero");
        return MetricSample::invalid(now);
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    match parse_query_output(&stdout) {
        Some((util, mem_fraction)) => MetricSample::reading(now, util, mem_fraction),
        None => {
            tracing::warn!("nvidia-smi produced no parsable GPU lines");
            MetricSample::invalid(now)
        }
    }
}

/// Parse `utilization.gpu, memory.used, memory.total` CSV lines.
///
/// Multi-GPU hosts report one line per device; the busiest device decides
/// whether the pod counts as idle, so readings aggregate by max. Malformed
/// lines are skipped; if nothing parses, the sample is invalid.
fn parse_query_output(output: &str) -> Option<(f64, f64)> {
    let mut best: Option<(f64, f64)> = None;
    for line in output.lines() {
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        if parts.len() != 3 {
            continue;
        }
        let (Ok(util), Ok(mem_used), Ok(mem_total)) = (
            parts[0].parse::<f64>(),
            parts[1].parse::<f64>(),
            parts[2].parse::<f64>(),
        ) else {
            continue;
        };
        let mem_fraction = if mem_total > 0.0 {
            mem_used / mem_total
        } else {
            0.0
        };
        let (max_util, max_mem) = best.unwrap_or((0.0, 0.0));
        best = Some((util.max(max_util), mem_fraction.max(max_mem)));
    }
    best
}
