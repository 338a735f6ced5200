use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite gallery file.
    pub db_path: PathBuf,
    /// External model program invoked for embedding extraction and attribute analysis.
    pub extractor_cmd: PathBuf,
    /// Extra arguments placed before the mode argument, whitespace separated.
    pub extractor_args: Vec<String>,
    /// Number of engine threads (one model process at a time per thread).
    pub extract_workers: usize,
    /// Upper bound on a single extraction or analysis call.
    pub extract_timeout_secs: u64,
    /// Cosine similarity threshold for identification.
    pub match_threshold: f32,
    /// Cosine similarity threshold above which a registration is a duplicate.
    pub duplicate_threshold: f32,
    /// Admitted requests per client within one window.
    pub rate_limit: usize,
    /// Sliding window length in milliseconds.
    pub rate_window_ms: u64,
    /// Tracked client keys before an inline sweep is forced.
    pub rate_max_clients: usize,
    /// Serve on the session bus instead of the system bus.
    pub session_bus: bool,
}

impl Config {
    /// Load configuration from `FACEGATE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facegate");

        let db_path = std::env::var("FACEGATE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("faces.db"));

        Self {
            db_path,
            extractor_cmd: std::env::var("FACEGATE_EXTRACTOR_CMD")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/usr/libexec/facegate/face-model")),
            extractor_args: std::env::var("FACEGATE_EXTRACTOR_ARGS")
                .map(|v| v.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            extract_workers: env_usize("FACEGATE_EXTRACT_WORKERS", 2).max(1),
            extract_timeout_secs: env_u64("FACEGATE_EXTRACT_TIMEOUT_SECS", 30),
            match_threshold: env_threshold("FACEGATE_MATCH_THRESHOLD", 0.6),
            duplicate_threshold: env_threshold("FACEGATE_DUPLICATE_THRESHOLD", 0.8),
            rate_limit: env_usize("FACEGATE_RATE_LIMIT", 5),
            rate_window_ms: env_u64("FACEGATE_RATE_WINDOW_MS", 1000),
            rate_max_clients: env_usize("FACEGATE_RATE_MAX_CLIENTS", 10_000),
            session_bus: std::env::var("FACEGATE_SESSION_BUS")
                .map(|v| v != "0")
                .unwrap_or(false),
        }
    }

    pub fn extract_timeout(&self) -> Duration {
        Duration::from_secs(self.extract_timeout_secs)
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms)
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Cosine similarity threshold: a finite value in [-1, 1], else `default`.
fn env_threshold(key: &str, default: f32) -> f32 {
    let value = env_f32(key, default);
    if value.is_finite() && (-1.0..=1.0).contains(&value) {
        value
    } else {
        tracing::warn!(key, value, default, "threshold out of range [-1, 1]; using default");
        default
    }
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
