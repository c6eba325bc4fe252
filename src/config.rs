//! TOML configuration for the SmartUptime daemon.
//!
//! Every section has compiled-in defaults so a partial (or empty) file is
//! valid. The file is located via an explicit path, the `SMARTUPTIME_CONFIG`
//! environment variable, or the standard system location.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming the config file to load.
pub const CONFIG_ENV: &str = "SMARTUPTIME_CONFIG";

const SYSTEM_CONFIG_PATH: &str = "/etc/smartuptime/smartuptime.toml";

/// One day, the ceiling for the poll interval and both timeouts.
const MAX_DURATION_SECS: u64 = 86_400;

/// Ten years of outcome history.
const MAX_RETENTION_DAYS: u32 = 3_650;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the monitoring daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub scripts: ScriptsConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl MonitorConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve the configuration, in order:
    /// 1. `explicit` (from the command line), which must load.
    /// 2. The path in `SMARTUPTIME_CONFIG`.
    /// 3. `/etc/smartuptime/smartuptime.toml`.
    /// 4. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "SMARTUPTIME_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }

    /// Reject values the scheduler and executor cannot work with.
    pub fn validate(&self) -> Result<()> {
        check_secs("scheduler.poll_interval_secs", self.scheduler.poll_interval_secs)?;
        check_secs("scheduler.probe_timeout_secs", self.scheduler.probe_timeout_secs)?;
        if self.scheduler.max_concurrent_probes == 0 {
            anyhow::bail!("scheduler.max_concurrent_probes must be greater than zero");
        }
        if !(1..=MAX_RETENTION_DAYS).contains(&self.scheduler.retention_days) {
            anyhow::bail!(
                "scheduler.retention_days must be between 1 and {MAX_RETENTION_DAYS}, got {}",
                self.scheduler.retention_days
            );
        }
        check_secs("scripts.timeout_secs", self.scripts.timeout_secs)?;
        Ok(())
    }
}

fn check_secs(key: &str, value: u64) -> Result<()> {
    if !(1..=MAX_DURATION_SECS).contains(&value) {
        anyhow::bail!("{key} must be between 1 and {MAX_DURATION_SECS} seconds, got {value}");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Poll loop timing and retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between cycle boundaries.
    pub poll_interval_secs: u64,
    /// Upper bound on a single site probe.
    pub probe_timeout_secs: u64,
    /// Maximum number of probes in flight within one cycle.
    pub max_concurrent_probes: usize,
    /// Probe outcomes older than this many days are deleted.
    pub retention_days: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            probe_timeout_secs: 10,
            max_concurrent_probes: 16,
            retention_days: 7,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }
}

// ---------------------------------------------------------------------------
// Scripts
// ---------------------------------------------------------------------------

/// Remediation script execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptsConfig {
    /// Working directory for every script; rule paths are relative to it.
    pub root: PathBuf,
    /// Hard limit on a single script run before it is killed.
    pub timeout_secs: u64,
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("scripts"),
            timeout_secs: 300,
        }
    }
}

impl ScriptsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

/// External latency anomaly scoring service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// `POST` endpoint; when absent every outcome is classified as normal.
    pub endpoint: Option<String>,
    pub timeout_ms: u64,
    /// Consecutive classifier failures before an escalation is logged.
    /// Zero keeps failures at warn level forever.
    pub outage_alert_after: u32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            endpoint: Some("http://127.0.0.1:5000/predict".to_string()),
            timeout_ms: 2000,
            outage_alert_after: 10,
        }
    }
}

impl ClassifierConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Storage / API / Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/smartuptime.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
    /// Origin allowed to call the API from a browser dashboard.
    pub cors_origin: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            cors_origin: Some("http://localhost:3000".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
