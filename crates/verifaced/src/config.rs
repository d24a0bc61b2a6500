use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use veriface_core::VerifyConfig;

/// Daemon configuration, loaded from environment variables.
///
/// Verification tuning (thresholds, counters, liveness) lives in
/// [`VerifyConfig`] and is read from the TOML file named by
/// `VERIFACE_CONFIG`; everything else is environment-only.
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Verification tuning shared by every session.
    pub verify: VerifyConfig,
    /// Period of the liveness timer tick for open sessions.
    pub tick_interval: Duration,
    /// Maximum number of concurrently open sessions.
    pub max_sessions: usize,
    /// Sessions idle for longer than this are closed.
    pub session_idle: Duration,
    /// Failed sessions per subject before lockout.
    pub max_failures: u32,
    /// Window over which failed sessions are counted.
    pub failure_window: Duration,
    /// Lockout duration once `max_failures` is reached.
    pub lockout: Duration,
    /// Whether the daemon is running on the session bus (development mode).
    pub session_bus: bool,
}

impl Config {
    /// Load configuration from `VERIFACE_*` environment variables with defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("veriface");

        let db_path = std::env::var("VERIFACE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("references.db"));

        let verify = match std::env::var("VERIFACE_CONFIG") {
            Ok(path) => load_verify_config(&PathBuf::from(path))?,
            Err(_) => VerifyConfig::default(),
        };

        Ok(Self {
            db_path,
            verify,
            tick_interval: Duration::from_millis(env_u64("VERIFACE_TICK_MS", 200).max(10)),
            max_sessions: env_usize("VERIFACE_MAX_SESSIONS", 16),
            session_idle: Duration::from_secs(env_u64("VERIFACE_SESSION_IDLE_SECS", 120)),
            max_failures: env_u32("VERIFACE_MAX_FAILURES", 5),
            failure_window: Duration::from_secs(env_u64("VERIFACE_FAILURE_WINDOW_SECS", 60)),
            lockout: Duration::from_secs(env_u64("VERIFACE_LOCKOUT_SECS", 300)),
            session_bus: std::env::var("VERIFACE_SESSION_BUS").is_ok(),
        })
    }
}

fn load_verify_config(path: &PathBuf) -> anyhow::Result<VerifyConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config = VerifyConfig::from_toml(&contents)
        .with_context(|| format!("invalid verification config {}", path.display()))?;
    tracing::info!(path = %path.display(), "loaded verification config");
    Ok(config)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
