//! Environment-derived configuration.
//!
//! All tunables arrive through `FLOWFORGE_*` environment variables and are
//! resolved once at startup into a [`Config`] that the composition root
//! hands to each component. Out-of-range values fall back to defaults or
//! are clamped to their documented caps; a non-local bind host is refused
//! and replaced with the loopback address.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

/// Default ledger path when `FLOWFORGE_DB_PATH` is unset.
pub const DEFAULT_DB_PATH: &str = "flowforge.db";

/// Default decision-trace sample size for replay health scans.
pub const DEFAULT_REPLAY_HEALTH_LIMIT: usize = 500;
/// Hard cap for replay health scans.
pub const MAX_REPLAY_HEALTH_LIMIT: usize = 5000;

/// Signal-baseline drift thresholds and guardrails.
#[derive(Debug, Clone, Copy)]
pub struct BaselineTuning {
    /// Absolute cpu-score delta that counts as drift.
    pub cpu_delta_threshold: f64,
    /// Absolute entropy-score delta that counts as drift.
    pub entropy_delta_threshold: f64,
    /// Absolute confidence-score delta that counts as drift.
    pub confidence_delta_threshold: f64,
    /// Minimum baseline samples before drift logic applies.
    pub min_baseline_samples: usize,
    /// Consecutive breaches required to escalate to at-risk.
    pub required_consecutive_breaches: usize,
    /// Decision-trace sample size for baseline scans.
    pub sample_limit: usize,
}

/// Caps for [`BaselineTuning`].
pub const MAX_BASELINE_MIN_SAMPLES: usize = 100;
/// Cap for the at-risk escalation streak.
pub const MAX_BASELINE_REQUIRED_STREAK: usize = 10;
/// Cap for the baseline scan sample size.
pub const MAX_BASELINE_SAMPLE_LIMIT: usize = 5000;

impl Default for BaselineTuning {
    fn default() -> Self {
        Self {
            cpu_delta_threshold: 25.0,
            entropy_delta_threshold: 20.0,
            confidence_delta_threshold: 20.0,
            min_baseline_samples: 3,
            required_consecutive_breaches: 2,
            sample_limit: 500,
        }
    }
}

/// Optional external dependency probes for readiness.
#[derive(Debug, Clone)]
pub struct CloudDepsConfig {
    /// When false, probes are skipped entirely.
    pub required: bool,
    /// TCP address of the postgres sidecar.
    pub postgres_addr: String,
    /// TCP address of the redis sidecar.
    pub redis_addr: String,
    /// NATS monitoring health URL.
    pub nats_health_url: String,
    /// MinIO liveness URL.
    pub minio_health_url: String,
    /// Per-probe timeout.
    pub timeout: Duration,
}

impl Default for CloudDepsConfig {
    fn default() -> Self {
        Self {
            required: false,
            postgres_addr: "127.0.0.1:15432".to_string(),
            redis_addr: "127.0.0.1:16379".to_string(),
            nats_health_url: "http://127.0.0.1:18222/healthz".to_string(),
            minio_health_url: "http://127.0.0.1:19000/minio/health/live".to_string(),
            timeout: Duration::from_millis(800),
        }
    }
}

/// Resolved process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bearer token required for unsafe methods; `None` blocks them.
    pub api_key: Option<String>,
    /// Hex master key enabling ledger column encryption.
    pub master_key: Option<String>,
    /// Bind host, restricted to loopback.
    pub bind_host: String,
    /// Extra allowed CORS origin (must itself be local).
    pub allowed_origin: Option<String>,
    /// Ledger file location.
    pub db_path: PathBuf,
    /// Signal-baseline tuning.
    pub baseline: BaselineTuning,
    /// Replay health scan sample size.
    pub replay_health_limit: usize,
    /// Cloud dependency probes.
    pub cloud: CloudDepsConfig,
    /// Healthcheck probe URL override used by the CLI.
    pub healthcheck_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: None,
            master_key: None,
            bind_host: "127.0.0.1".to_string(),
            allowed_origin: None,
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            baseline: BaselineTuning::default(),
            replay_health_limit: DEFAULT_REPLAY_HEALTH_LIMIT,
            cloud: CloudDepsConfig::default(),
            healthcheck_url: None,
        }
    }
}

impl Config {
    /// Loads configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let baseline_defaults = BaselineTuning::default();
        let cloud_defaults = CloudDepsConfig::default();

        Self {
            api_key: env_string("FLOWFORGE_API_KEY"),
            master_key: env_string("FLOWFORGE_MASTER_KEY"),
            bind_host: resolve_bind_host(env_string("FLOWFORGE_BIND_HOST")),
            allowed_origin: env_string("FLOWFORGE_ALLOWED_ORIGIN"),
            db_path: env_string("FLOWFORGE_DB_PATH")
                .map_or(defaults.db_path, PathBuf::from),
            baseline: BaselineTuning {
                cpu_delta_threshold: env_positive_f64(
                    "FLOWFORGE_DECISION_SIGNAL_CPU_DELTA_THRESHOLD",
                    baseline_defaults.cpu_delta_threshold,
                ),
                entropy_delta_threshold: env_positive_f64(
                    "FLOWFORGE_DECISION_SIGNAL_ENTROPY_DELTA_THRESHOLD",
                    baseline_defaults.entropy_delta_threshold,
                ),
                confidence_delta_threshold: env_positive_f64(
                    "FLOWFORGE_DECISION_SIGNAL_CONFIDENCE_DELTA_THRESHOLD",
                    baseline_defaults.confidence_delta_threshold,
                ),
                min_baseline_samples: env_bounded_usize(
                    "FLOWFORGE_DECISION_SIGNAL_BASELINE_MIN_SAMPLES",
                    baseline_defaults.min_baseline_samples,
                    1,
                    MAX_BASELINE_MIN_SAMPLES,
                ),
                required_consecutive_breaches: env_bounded_usize(
                    "FLOWFORGE_DECISION_SIGNAL_BASELINE_REQUIRED_CONSECUTIVE",
                    baseline_defaults.required_consecutive_breaches,
                    1,
                    MAX_BASELINE_REQUIRED_STREAK,
                ),
                sample_limit: env_bounded_usize(
                    "FLOWFORGE_DECISION_SIGNAL_BASELINE_LIMIT",
                    baseline_defaults.sample_limit,
                    1,
                    MAX_BASELINE_SAMPLE_LIMIT,
                ),
            },
            replay_health_limit: env_bounded_usize(
                "FLOWFORGE_DECISION_REPLAY_HEALTH_LIMIT",
                DEFAULT_REPLAY_HEALTH_LIMIT,
                1,
                MAX_REPLAY_HEALTH_LIMIT,
            ),
            cloud: CloudDepsConfig {
                required: env_bool("FLOWFORGE_CLOUD_DEPS_REQUIRED", cloud_defaults.required),
                postgres_addr: env_string("FLOWFORGE_CLOUD_POSTGRES_ADDR")
                    .unwrap_or(cloud_defaults.postgres_addr),
                redis_addr: env_string("FLOWFORGE_CLOUD_REDIS_ADDR")
                    .unwrap_or(cloud_defaults.redis_addr),
                nats_health_url: env_string("FLOWFORGE_CLOUD_NATS_HEALTH_URL")
                    .unwrap_or(cloud_defaults.nats_health_url),
                minio_health_url: env_string("FLOWFORGE_CLOUD_MINIO_HEALTH_URL")
                    .unwrap_or(cloud_defaults.minio_health_url),
                timeout: env_duration_ms("FLOWFORGE_CLOUD_PROBE_TIMEOUT_MS", cloud_defaults.timeout),
            },
            healthcheck_url: env_string("FLOWFORGE_HEALTHCHECK_URL"),
        }
    }
}

/// Forces the bind host onto the loopback interface.
///
/// Anything other than `127.0.0.1` or `localhost` is refused with a
/// warning rather than exposing the control plane on the network.
#[must_use]
pub fn resolve_bind_host(requested: Option<String>) -> String {
    match requested {
        None => "127.0.0.1".to_string(),
        Some(host) => {
            let trimmed = host.trim();
            if trimmed == "127.0.0.1" || trimmed == "localhost" {
                trimmed.to_string()
            } else {
                warn!(requested = %trimmed, "refusing non-local bind host, falling back to 127.0.0.1");
                "127.0.0.1".to_string()
            }
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_bool(name: &str, fallback: bool) -> bool {
    match env_string(name).as_deref().map(str::to_ascii_lowercase) {
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => fallback,
        },
        None => fallback,
    }
}

fn env_positive_f64(name: &str, fallback: f64) -> f64 {
    env_string(name)
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| *v > 0.0)
        .unwrap_or(fallback)
}

fn env_bounded_usize(name: &str, fallback: usize, min: usize, max: usize) -> usize {
    match env_string(name).and_then(|v| v.parse::<usize>().ok()) {
        Some(v) => v.clamp(min, max),
        None => fallback,
    }
}

fn env_duration_ms(name: &str, fallback: Duration) -> Duration {
    env_string(name)
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .map_or(fallback, Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_host_rejects_non_local() {
        assert_eq!(resolve_bind_host(Some("0.0.0.0".into())), "127.0.0.1");
        assert_eq!(resolve_bind_host(Some("example.com".into())), "127.0.0.1");
        assert_eq!(resolve_bind_host(Some("localhost".into())), "localhost");
        assert_eq!(resolve_bind_host(None), "127.0.0.1");
    }

    #[test]
    fn baseline_defaults_match_contract() {
        let tuning = BaselineTuning::default();
        assert_eq!(tuning.cpu_delta_threshold, 25.0);
        assert_eq!(tuning.entropy_delta_threshold, 20.0);
        assert_eq!(tuning.confidence_delta_threshold, 20.0);
        assert_eq!(tuning.min_baseline_samples, 3);
        assert_eq!(tuning.required_consecutive_breaches, 2);
        assert_eq!(tuning.sample_limit, 500);
    }

    #[test]
    fn bounded_parse_clamps() {
        std::env::set_var("FLOWFORGE_TEST_BOUNDED", "9999");
        assert_eq!(env_bounded_usize("FLOWFORGE_TEST_BOUNDED", 3, 1, 100), 100);
        std::env::set_var("FLOWFORGE_TEST_BOUNDED", "0");
        assert_eq!(env_bounded_usize("FLOWFORGE_TEST_BOUNDED", 3, 1, 100), 1);
        std::env::set_var("FLOWFORGE_TEST_BOUNDED", "junk");
        assert_eq!(env_bounded_usize("FLOWFORGE_TEST_BOUNDED", 3, 1, 100), 3);
        std::env::remove_var("FLOWFORGE_TEST_BOUNDED");
    }
}
