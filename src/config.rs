use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Fallback experiments database when neither config nor AF_DB_PATH names one.
const DEFAULT_DB_PATH: &str = "/workspace/AlphaForecasting/runs/experiments.sqlite";

/// Watchdog configuration loaded from watchdog.toml.
///
/// Immutable after load: the daemon reads it once at startup and never
/// re-reads the file. A missing file yields all defaults; unknown fields
/// are ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Master on/off switch. When false, every cycle decides Continue.
    pub enabled: bool,
    /// Enable the idle-GPU trigger.
    pub idle_enabled: bool,
    /// Enable queue-empty streak tracking.
    pub queue_empty_enabled: bool,
    /// Gate the queue-empty streak into the termination decision.
    pub terminate_on_empty_queue: bool,
    /// Act on every listed pod instead of just the first.
    pub terminate_all: bool,
    /// Seconds of continuous idleness before the idle trigger fires.
    pub idle_seconds: u64,
    /// Sampling cadence in seconds.
    pub poll_seconds: u64,
    /// Distinct threshold for the queue-empty trigger; defaults to idle_seconds.
    pub queue_empty_grace_seconds: Option<u64>,
    /// GPU utilization percent at or below which the GPU counts as idle.
    pub gpu_util_threshold: f64,
    /// GPU memory fraction at or below which the GPU counts as idle.
    pub gpu_mem_fraction_threshold: f64,
    /// Whether to destroy the pod or merely stop billed compute.
    pub terminate_mode: TerminateMode,
    /// RunPod API key; falls back to the RUNPOD_API_KEY environment variable.
    pub api_key: String,
    /// Experiments database path; falls back to AF_DB_PATH, then a built-in default.
    pub db_path: Option<PathBuf>,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_enabled: true,
            queue_empty_enabled: true,
            terminate_on_empty_queue: true,
            terminate_all: false,
            idle_seconds: 600,
            poll_seconds: 60,
            queue_empty_grace_seconds: None,
            gpu_util_threshold: 5.0,
            gpu_mem_fraction_threshold: 0.05,
            terminate_mode: TerminateMode::Terminate,
            api_key: String::new(),
            db_path: None,
        }
    }
}

/// What the termination action does to the pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminateMode {
    /// Destroy the pod and its ephemeral storage.
    Terminate,
    /// Stop billed compute, preserving persistent storage.
    Stop,
}

impl std::fmt::Display for TerminateMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminateMode::Terminate => write!(f, "terminate"),
            TerminateMode::Stop => write!(f, "stop"),
        }
    }
}

/// Errors that abort startup. None of these are retried.
#[derive(Debug)]
pub enum ConfigError {
    /// Config file exists but could not be read.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Config file is not valid TOML, or a field has the wrong shape
    /// (including an unrecognized terminate_mode).
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// A numeric field is outside its documented range.
    OutOfRange {
        field: &'static str,
        message: String,
    },
    /// No API key in the config file or RUNPOD_API_KEY.
    MissingApiKey,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::OutOfRange { field, message } => {
                write!(f, "config field {field} out of range: {message}")
            }
            ConfigError::MissingApiKey => {
                write!(
                    f,
                    "missing RunPod API key: set api_key in the config file or RUNPOD_API_KEY"
                )
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Load and validate the config file.
///
/// A missing file is not an error: every field has a documented default.
/// Environment fallbacks (RUNPOD_API_KEY, AF_DB_PATH) are resolved here so
/// the rest of the daemon only ever sees a fully-resolved config.
pub fn load(path: &Path) -> Result<WatchdogConfig, ConfigError> {
    let mut config = if path.exists() {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?
    } else {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        WatchdogConfig::default()
    };

    if config.api_key.is_empty() {
        config.api_key = std::env::var("RUNPOD_API_KEY").unwrap_or_default();
    }
    if config.db_path.is_none() {
        config.db_path = Some(
            std::env::var("AF_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_DB_PATH)),
        );
    }

    config.validate()?;
    Ok(config)
}

impl WatchdogConfig {
    /// Range checks that serde cannot express. Fatal on failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_seconds == 0 {
            return Err(ConfigError::OutOfRange {
                field: "poll_seconds",
                message: "must be greater than 0".to_string(),
            });
        }
        if self.idle_seconds == 0 {
            return Err(ConfigError::OutOfRange {
                field: "idle_seconds",
                message: "must be greater than 0".to_string(),
            });
        }
        if !(0.0..=100.0).contains(&self.gpu_util_threshold) {
            return Err(ConfigError::OutOfRange {
                field: "gpu_util_threshold",
                message: format!("{} is not in [0, 100]", self.gpu_util_threshold),
            });
        }
        if !(0.0..=1.0).contains(&self.gpu_mem_fraction_threshold) {
            return Err(ConfigError::OutOfRange {
                field: "gpu_mem_fraction_threshold",
                message: format!("{} is not in [0, 1]", self.gpu_mem_fraction_threshold),
            });
        }
        // idle_seconds < poll_seconds is allowed; the first idle sample
        // then already satisfies the threshold.
        Ok(())
    }

    /// Queue-empty trigger threshold; shares idle_seconds unless overridden.
    pub fn queue_empty_seconds(&self) -> u64 {
        self.queue_empty_grace_seconds.unwrap_or(self.idle_seconds)
    }

    /// Sampling cadence as a Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_seconds)
    }

    /// Per-call budget for metric/queue sampling: half the poll period,
    /// floored at 500 ms and capped at 15 s. Always strictly below
    /// poll_seconds.
    pub fn sample_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_seconds.saturating_mul(500).clamp(500, 15_000))
    }

    /// Resolved experiments database path.
    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH))
    }
}
