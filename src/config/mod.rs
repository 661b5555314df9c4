use std::env;
use std::time::Duration;

/// Engine-wide defaults. These can be overridden by env vars but do not
/// require any user-authored config files.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Interval between periodic sync cycles.
    pub sync_interval: Duration,
    /// Pause inserted between folders of the same account to avoid saturating
    /// a single connection.
    pub folder_pause: Duration,
    /// A pooled connection idle longer than this is replaced on `get`.
    pub idle_threshold: Duration,
    /// Cadence of the background sweep over the connection pool.
    pub sweep_interval: Duration,
    /// A pooled connection idle longer than this is force-closed by the sweep.
    pub hard_idle_threshold: Duration,
    /// Attempts per command before a transport failure is surfaced.
    pub retry_attempts: u32,
    /// Fixed backoff between command retries.
    pub retry_backoff: Duration,
    /// Most recent UIDs fetched per folder sync.
    pub fetch_window: usize,
    /// Bound on how long `stop()` waits for the sync loop to drain.
    pub stop_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(300),
            folder_pause: Duration::from_millis(500),
            idle_threshold: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            hard_idle_threshold: Duration::from_secs(600),
            retry_attempts: 3,
            retry_backoff: Duration::from_secs(1),
            fetch_window: 200,
            stop_timeout: Duration::from_secs(10),
        }
    }
}

impl EngineConfig {
    pub fn load() -> Self {
        let defaults = Self::default();
        Self {
            sync_interval: secs_from_env("PLUME_SYNC_INTERVAL_SECS", defaults.sync_interval),
            folder_pause: millis_from_env("PLUME_FOLDER_PAUSE_MS", defaults.folder_pause),
            idle_threshold: secs_from_env("PLUME_IDLE_THRESHOLD_SECS", defaults.idle_threshold),
            sweep_interval: secs_from_env("PLUME_SWEEP_INTERVAL_SECS", defaults.sweep_interval),
            hard_idle_threshold: secs_from_env(
                "PLUME_HARD_IDLE_THRESHOLD_SECS",
                defaults.hard_idle_threshold,
            ),
            retry_attempts: env::var("PLUME_RETRY_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse::<u32>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.retry_attempts),
            retry_backoff: millis_from_env("PLUME_RETRY_BACKOFF_MS", defaults.retry_backoff),
            fetch_window: env::var("PLUME_FETCH_WINDOW")
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.fetch_window),
            stop_timeout: secs_from_env("PLUME_STOP_TIMEOUT_SECS", defaults.stop_timeout),
        }
    }
}

fn secs_from_env(key: &str, fallback: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(fallback)
}

fn millis_from_env(key: &str, fallback: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(fallback)
}
