//! Runner configuration
//!
//! Everything tunable about the service comes from environment variables
//! (optionally via `.env`), with defaults suitable for a single host.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// What the admission gate does when every slot is taken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionPolicy {
    /// Wait for a free slot, up to the given timeout
    Queue { timeout: Duration },
    /// Refuse immediately
    Reject,
}

/// Service configuration
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Optional override for the bundled languages.toml
    pub languages_path: Option<PathBuf>,
    /// Directory under which per-request workspaces are created
    pub workspace_root: PathBuf,
    /// Maximum simultaneous pipelines
    pub max_concurrent: usize,
    pub admission: AdmissionPolicy,
    /// Run step CPU time limit in milliseconds when the request has none
    pub default_time_limit_ms: u32,
    /// Run step memory limit in MB when the request has none
    pub default_memory_limit_mb: u32,
    /// Compile step time limit in milliseconds (default: 30000ms = 30s)
    pub compile_time_limit_ms: u32,
    /// Compile step memory limit in MB (default: 2048MB)
    pub compile_memory_limit_mb: u32,
    /// Per-stream capture limit in bytes
    pub max_output_bytes: usize,
    /// Age after which an unowned workspace is considered stale
    pub workspace_grace: Duration,
    pub sweep_interval: Duration,
    /// Resource sampling period of the process monitor
    pub monitor_interval: Duration,
    /// HTTP intake bind address (None disables it)
    pub http_bind: Option<String>,
    /// Redis queue intake (None disables it)
    pub redis_url: Option<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            languages_path: None,
            workspace_root: std::env::temp_dir().join("code-runner"),
            max_concurrent: 4,
            admission: AdmissionPolicy::Queue {
                timeout: Duration::from_secs(30),
            },
            default_time_limit_ms: 2_000,
            default_memory_limit_mb: 256,
            compile_time_limit_ms: 30_000,
            compile_memory_limit_mb: 2048,
            max_output_bytes: 64 * 1024,
            workspace_grace: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(300),
            monitor_interval: Duration::from_millis(10),
            http_bind: Some("0.0.0.0:5000".to_string()),
            redis_url: None,
        }
    }
}

impl RunnerConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup, falling back to defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let queue_timeout_ms: u64 = parse_or(&lookup, "QUEUE_TIMEOUT_MS", 30_000)?;
        let admission = match lookup("ADMISSION_POLICY").as_deref() {
            None | Some("queue") => AdmissionPolicy::Queue {
                timeout: Duration::from_millis(queue_timeout_ms),
            },
            Some("reject") => AdmissionPolicy::Reject,
            Some(other) => anyhow::bail!(
                "Invalid ADMISSION_POLICY: {} (expected \"queue\" or \"reject\")",
                other
            ),
        };

        let max_concurrent: usize = parse_or(&lookup, "MAX_CONCURRENT", defaults.max_concurrent)?;
        if max_concurrent == 0 {
            anyhow::bail!("MAX_CONCURRENT must be at least 1");
        }
        let sweep_interval_secs: u64 = parse_or(&lookup, "SWEEP_INTERVAL_SECS", 300)?;
        if sweep_interval_secs == 0 {
            anyhow::bail!("SWEEP_INTERVAL_SECS must be at least 1");
        }
        let monitor_interval_ms: u64 = parse_or(&lookup, "MONITOR_INTERVAL_MS", 10)?;
        if monitor_interval_ms == 0 {
            anyhow::bail!("MONITOR_INTERVAL_MS must be at least 1");
        }

        Ok(Self {
            languages_path: lookup("LANGUAGES_CONFIG").map(PathBuf::from),
            workspace_root: lookup("WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            max_concurrent,
            admission,
            default_time_limit_ms: parse_or(
                &lookup,
                "DEFAULT_TIME_LIMIT_MS",
                defaults.default_time_limit_ms,
            )?,
            default_memory_limit_mb: parse_or(
                &lookup,
                "DEFAULT_MEMORY_LIMIT_MB",
                defaults.default_memory_limit_mb,
            )?,
            compile_time_limit_ms: parse_or(
                &lookup,
                "COMPILE_TIME_LIMIT_MS",
                defaults.compile_time_limit_ms,
            )?,
            compile_memory_limit_mb: parse_or(
                &lookup,
                "COMPILE_MEMORY_LIMIT_MB",
                defaults.compile_memory_limit_mb,
            )?,
            max_output_bytes: parse_or(&lookup, "MAX_OUTPUT_BYTES", defaults.max_output_bytes)?,
            workspace_grace: Duration::from_secs(parse_or(&lookup, "WORKSPACE_GRACE_SECS", 3600)?),
            sweep_interval: Duration::from_secs(sweep_interval_secs),
            monitor_interval: Duration::from_millis(monitor_interval_ms),
            http_bind: match lookup("HTTP_BIND") {
                Some(bind) if bind.is_empty() => None,
                Some(bind) => Some(bind),
                None => defaults.http_bind,
            },
            redis_url: lookup("REDIS_URL").filter(|url| !url.is_empty()),
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw)),
        None => Ok(default),
    }
}
