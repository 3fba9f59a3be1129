/// The watchdog control loop.
///
/// Each cycle: sample GPU telemetry and queue depth (concurrently, both
/// bounded by the sampling timeout), evaluate the termination policy,
/// write the state snapshot, and either keep polling or hand off to the
/// termination executor. The poll cadence is anchored to loop start, so
/// slow cycles do not drift the schedule.
use crate::config::WatchdogConfig;
use crate::policy::{self, ActivityState, Decision, MetricSample, QueueSample};
use crate::runpod::PodApi;
use crate::signals::ShutdownSignal;
use crate::state::{self, StateSnapshot};
use crate::terminate::TerminationExecutor;
use crate::{gpu, queue};
use chrono::Utc;
use std::path::PathBuf;
use tokio::time::MissedTickBehavior;

/// Why the loop ended. Both outcomes exit the process with status 0.
#[derive(Debug, PartialEq, Eq)]
pub enum LoopOutcome {
    /// SIGINT/SIGTERM arrived; no termination was issued.
    Shutdown,
    /// The termination executor succeeded; the pod is going away.
    Terminated,
}

pub struct WatchdogLoop<P: PodApi> {
    config: WatchdogConfig,
    executor: TerminationExecutor<P>,
    state_file: PathBuf,
}

impl<P: PodApi> WatchdogLoop<P> {
    pub fn new(
        config: WatchdogConfig,
        api: P,
        env_pod_id: Option<String>,
        state_file: PathBuf,
    ) -> Self {
        let executor = TerminationExecutor::new(
            api,
            config.terminate_mode,
            config.terminate_all,
            env_pod_id,
        );
        Self {
            config,
            executor,
            state_file,
        }
    }

    pub async fn run(mut self, shutdown: &mut ShutdownSignal) -> LoopOutcome {
        tracing::info!(
            enabled = self.config.enabled,
            idle_enabled = self.config.idle_enabled,
            queue_empty_enabled = self.config.queue_empty_enabled,
            idle_seconds = self.config.idle_seconds,
            queue_empty_seconds = self.config.queue_empty_seconds(),
            poll_seconds = self.config.poll_seconds,
            gpu_util_threshold = self.config.gpu_util_threshold,
            gpu_mem_fraction_threshold = self.config.gpu_mem_fraction_threshold,
            mode = %self.config.terminate_mode,
            "watchdog started"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut activity = ActivityState::default();

        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    tracing::info!("shutdown requested, exiting without terminating pod");
                    return LoopOutcome::Shutdown;
                }
                _ = interval.tick() => {}
            }

            // Sampling can stall up to the sample timeout on a hung
            // nvidia-smi; a signal arriving meanwhile still wins.
            let (gpu_sample, queue_sample) = tokio::select! {
                _ = shutdown.wait() => {
                    tracing::info!("shutdown requested during sampling, exiting without terminating pod");
                    return LoopOutcome::Shutdown;
                }
                samples = self.collect_samples() => samples,
            };
            let now = Utc::now();
            let (next_activity, decision) = policy::evaluate(
                &self.config,
                &gpu_sample,
                &queue_sample,
                &activity,
                now,
            );
            activity = next_activity;

            let idle_for = activity
                .idle_since
                .map(|since| (now - since).num_seconds())
                .unwrap_or(0);
            let queue_empty_for = activity
                .queue_empty_since
                .map(|since| (now - since).num_seconds())
                .unwrap_or(0);
            tracing::info!(
                gpu_valid = gpu_sample.valid,
                gpu_util = ?gpu_sample.gpu_util_percent,
                gpu_mem_fraction = ?gpu_sample.gpu_mem_fraction,
                queue_valid = queue_sample.valid,
                queue_depth = ?queue_sample.queue_depth,
                idle_for_secs = idle_for,
                queue_empty_for_secs = queue_empty_for,
                decision = ?decision,
                "poll cycle"
            );

            let snapshot = StateSnapshot::new(
                now,
                self.config.enabled,
                &gpu_sample,
                &queue_sample,
                &activity,
                &decision,
            );
            state::write(&self.state_file, &snapshot);

            if let Decision::Terminate(reason) = decision {
                // A manual shutdown is not a termination decision, even
                // when the signal lands between sampling and acting.
                if shutdown.is_shutdown() {
                    tracing::info!("shutdown requested, exiting without terminating pod");
                    return LoopOutcome::Shutdown;
                }
                tracing::info!(reason = %reason, "termination threshold reached");
                match self.executor.terminate().await {
                    Ok(()) => return LoopOutcome::Terminated,
                    // A missed termination is recoverable on the next
                    // trigger; keep monitoring.
                    Err(_) => continue,
                }
            }
        }
    }

    /// Gather both samples for this cycle. The queue query only runs when
    /// queue tracking is on; the policy sees an invalid sample otherwise.
    async fn collect_samples(&self) -> (MetricSample, QueueSample) {
        let timeout = self.config.sample_timeout();
        if self.config.queue_empty_enabled {
            let db_path = self.config.db_path();
            tokio::join!(gpu::sample(timeout), queue::sample(&db_path, timeout))
        } else {
            (gpu::sample(timeout).await, QueueSample::invalid(Utc::now()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runpod::{Pod, RunpodError};
    use std::sync::Mutex;
    use std::time::Duration;

    struct StubApi {
        terminated: Mutex<Vec<String>>,
    }

    impl PodApi for &StubApi {
        async fn list_pods(&self) -> Result<Vec<Pod>, RunpodError> {
            Ok(vec![Pod {
                id: "pod-1".to_string(),
                name: "trainer".to_string(),
                desired_status: "RUNNING".to_string(),
            }])
        }

        async fn stop_pod(&self, _pod_id: &str) -> Result<(), RunpodError> {
            Ok(())
        }

        async fn terminate_pod(&self, pod_id: &str) -> Result<(), RunpodError> {
            self.terminated.lock().unwrap().push(pod_id.to_string());
            Ok(())
        }
    }

    fn test_config(db_path: &std::path::Path) -> WatchdogConfig {
        WatchdogConfig {
            poll_seconds: 1,
            api_key: "rp_test".to_string(),
            db_path: Some(db_path.to_path_buf()),
            ..WatchdogConfig::default()
        }
    }

    #[tokio::test]
    async fn test_shutdown_exits_without_terminating() {
        let dir = tempfile::tempdir().unwrap();
        let api = StubApi {
            terminated: Mutex::new(Vec::new()),
        };
        // No database and no nvidia-smi readings: every sample is invalid,
        // so no trigger can ever fire.
        let watchdog = WatchdogLoop::new(
            test_config(&dir.path().join("missing.sqlite")),
            &api,
            None,
            dir.path().join("state.json"),
        );

        let (tx, mut shutdown) = ShutdownSignal::manual();
        tx.send(true).unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(10), watchdog.run(&mut shutdown))
            .await
            .expect("loop should exit promptly on shutdown");
        assert_eq!(outcome, LoopOutcome::Shutdown);
        assert!(api.terminated.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_queue_terminates_pod() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("experiments.sqlite");
        let conn = rusqlite::Connection::open(&db_path).unwrap();
        conn.execute_batch("CREATE TABLE experiments (id INTEGER PRIMARY KEY, status TEXT);")
            .unwrap();
        drop(conn);

        let api = StubApi {
            terminated: Mutex::new(Vec::new()),
        };
        // Zero grace: the first empty-queue cycle fires the trigger.
        let config = WatchdogConfig {
            queue_empty_grace_seconds: Some(0),
            ..test_config(&db_path)
        };
        let state_file = dir.path().join("state.json");
        let watchdog = WatchdogLoop::new(config, &api, None, state_file.clone());

        let (_tx, mut shutdown) = ShutdownSignal::manual();
        let outcome = tokio::time::timeout(Duration::from_secs(10), watchdog.run(&mut shutdown))
            .await
            .expect("loop should terminate on the first cycle");
        assert_eq!(outcome, LoopOutcome::Terminated);
        assert_eq!(*api.terminated.lock().unwrap(), vec!["pod-1"]);

        // The snapshot for the terminating cycle was written first.
        let contents = std::fs::read_to_string(&state_file).unwrap();
        assert!(contents.contains("terminate:queue_empty"));
    }

    #[tokio::test]
    async fn test_shutdown_during_sampling_is_not_a_termination() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();

        // Slow fake nvidia-smi, so the cycle is still in SAMPLING when
        // the signal lands.
        let bin_dir = dir.path().join("bin");
        std::fs::create_dir(&bin_dir).unwrap();
        let script = bin_dir.join("nvidia-smi");
        std::fs::write(&script, "#!/bin/sh\nsleep 2\necho '0, 0, 16000'\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        let old_path = std::env::var("PATH").unwrap_or_default();
        std::env::set_var("PATH", format!("{}:{}", bin_dir.display(), old_path));

        // Empty queue with zero grace: this cycle would otherwise terminate.
        let db_path = dir.path().join("experiments.sqlite");
        let conn = rusqlite::Connection::open(&db_path).unwrap();
        conn.execute_batch("CREATE TABLE experiments (id INTEGER PRIMARY KEY, status TEXT);")
            .unwrap();
        drop(conn);

        let api = StubApi {
            terminated: Mutex::new(Vec::new()),
        };
        // poll_seconds=5 gives a 2.5s sampling budget, enough for the
        // fake to finish if the loop (wrongly) waits it out.
        let config = WatchdogConfig {
            poll_seconds: 5,
            queue_empty_grace_seconds: Some(0),
            ..test_config(&db_path)
        };
        let watchdog = WatchdogLoop::new(config, &api, None, dir.path().join("state.json"));

        let (tx, mut shutdown) = ShutdownSignal::manual();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let _ = tx.send(true);
        });
        let outcome = tokio::time::timeout(Duration::from_secs(10), watchdog.run(&mut shutdown))
            .await
            .expect("loop should exit promptly on mid-cycle shutdown");

        std::env::set_var("PATH", old_path);

        assert_eq!(outcome, LoopOutcome::Shutdown);
        assert!(api.terminated.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_config_never_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("experiments.sqlite");
        let conn = rusqlite::Connection::open(&db_path).unwrap();
        conn.execute_batch("CREATE TABLE experiments (id INTEGER PRIMARY KEY, status TEXT);")
            .unwrap();
        drop(conn);

        let api = StubApi {
            terminated: Mutex::new(Vec::new()),
        };
        // Same empty queue and zero grace as above, but the kill switch is off.
        let config = WatchdogConfig {
            enabled: false,
            queue_empty_grace_seconds: Some(0),
            ..test_config(&db_path)
        };
        let watchdog = WatchdogLoop::new(config, &api, None, dir.path().join("state.json"));

        // Run a few 1-second cycles; the loop must still be polling when
        // the timeout lapses, with no termination issued.
        let (_tx, mut shutdown) = ShutdownSignal::manual();
        let result =
            tokio::time::timeout(Duration::from_millis(2500), watchdog.run(&mut shutdown)).await;
        assert!(result.is_err(), "disabled watchdog should keep polling");
        assert!(api.terminated.lock().unwrap().is_empty());
    }
}
