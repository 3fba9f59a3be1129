/// One-shot pod termination with bounded retry.
///
/// The executor is idempotent: once a termination round succeeds, later
/// invocations are no-ops that report success. Transient API failures
/// retry with exponential backoff; after the attempt budget is spent the
/// error is returned and the caller goes back to polling, so a missed
/// termination is retried on the next trigger instead of crashing the
/// daemon.
use crate::config::TerminateMode;
use crate::runpod::{PodApi, RunpodError};
use std::time::Duration;

const MAX_ATTEMPTS: u32 = 4;
const INITIAL_DELAY_SECS: u64 = 2;
const MAX_DELAY_SECS: u64 = 60;

pub struct TerminationExecutor<P: PodApi> {
    api: P,
    mode: TerminateMode,
    terminate_all: bool,
    /// Pod id pinned via RUNPOD_POD_ID; skips the list-pods call entirely.
    env_pod_id: Option<String>,
    completed: bool,
}

impl<P: PodApi> TerminationExecutor<P> {
    pub fn new(
        api: P,
        mode: TerminateMode,
        terminate_all: bool,
        env_pod_id: Option<String>,
    ) -> Self {
        Self {
            api,
            mode,
            terminate_all,
            env_pod_id,
            completed: false,
        }
    }

    /// Whether a prior invocation already succeeded.
    #[allow(dead_code)]
    pub fn completed(&self) -> bool {
        self.completed
    }

    /// Run the termination action, retrying transient failures.
    pub async fn terminate(&mut self) -> Result<(), RunpodError> {
        if self.completed {
            tracing::debug!("termination already completed, skipping");
            return Ok(());
        }

        let mut last_error = None;
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let delay = backoff_delay(INITIAL_DELAY_SECS, attempt - 1, MAX_DELAY_SECS);
                tracing::warn!(attempt, delay_secs = delay, "retrying pod termination");
                tokio::time::sleep(Duration::from_secs(delay)).await;
            }
            match self.terminate_once().await {
                Ok(()) => {
                    self.completed = true;
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "pod termination attempt failed");
                    last_error = Some(e);
                }
            }
        }

        let err = last_error.expect("at least one attempt ran");
        tracing::error!(
            attempts = MAX_ATTEMPTS,
            error = %err,
            "pod termination failed, falling back to polling"
        );
        Err(err)
    }

    async fn terminate_once(&self) -> Result<(), RunpodError> {
        let targets = self.target_pods().await?;
        if targets.is_empty() {
            tracing::info!("no pods found; nothing to terminate");
            return Ok(());
        }
        for pod_id in &targets {
            tracing::info!(pod_id = %pod_id, mode = %self.mode, "sending pod termination request");
            match self.mode {
                TerminateMode::Terminate => self.api.terminate_pod(pod_id).await?,
                TerminateMode::Stop => self.api.stop_pod(pod_id).await?,
            }
        }
        Ok(())
    }

    /// Which pods to act on: the pinned pod id if set, otherwise every
    /// listed pod with terminate_all, otherwise the first listed pod.
    async fn target_pods(&self) -> Result<Vec<String>, RunpodError> {
        if let Some(pod_id) = &self.env_pod_id {
            return Ok(vec![pod_id.clone()]);
        }
        let pods = self.api.list_pods().await?;
        for pod in &pods {
            tracing::debug!(
                id = %pod.id,
                name = %pod.name,
                status = %pod.desired_status,
                "discovered pod"
            );
        }
        if self.terminate_all {
            return Ok(pods.into_iter().map(|p| p.id).collect());
        }
        if pods.len() > 1 {
            tracing::warn!(count = pods.len(), "multiple pods found; terminating first only");
        }
        Ok(pods.into_iter().take(1).map(|p| p.id).collect())
    }
}

/// Exponential backoff: `initial_delay * 2^attempt`, capped at `max_delay`.
fn backoff_delay(initial_delay_secs: u64, attempt: u32, max_delay_secs: u64) -> u64 {
    let shift = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    let delay = initial_delay_secs.saturating_mul(shift);
    delay.min(max_delay_secs)
}
