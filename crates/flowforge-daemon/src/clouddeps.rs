//! Optional cloud-dependency readiness probes.
//!
//! When `FLOWFORGE_CLOUD_DEPS_REQUIRED` is set, readiness also checks
//! the postgres/redis TCP endpoints and the NATS/MinIO health URLs. All
//! four probes run concurrently under one configured timeout; any
//! failure flips readiness to 503.

use std::time::Duration;

use flowforge_core::config::CloudDepsConfig;
use serde::{Deserialize, Serialize};

/// Result of one probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    /// Probe name (e.g. `cloud_postgres`).
    pub name: String,
    /// Whether the dependency answered.
    pub healthy: bool,
    /// Probe target.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub target: String,
    /// Failure detail.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub error: String,
}

/// Probes all configured dependencies concurrently.
pub async fn probe(config: &CloudDepsConfig) -> (Vec<CheckResult>, bool) {
    let (postgres, redis, nats, minio) = tokio::join!(
        probe_tcp("cloud_postgres", &config.postgres_addr, config.timeout),
        probe_tcp("cloud_redis", &config.redis_addr, config.timeout),
        probe_http("cloud_nats", &config.nats_health_url, config.timeout),
        probe_http("cloud_minio", &config.minio_health_url, config.timeout),
    );
    let results = vec![postgres, redis, nats, minio];
    let healthy = results.iter().all(|r| r.healthy);
    (results, healthy)
}

async fn probe_tcp(name: &str, addr: &str, timeout: Duration) -> CheckResult {
    let mut result = CheckResult {
        name: name.to_string(),
        healthy: false,
        target: addr.to_string(),
        error: String::new(),
    };
    match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => result.healthy = true,
        Ok(Err(err)) => result.error = err.to_string(),
        Err(_) => result.error = format!("connect timed out after {timeout:?}"),
    }
    result
}

async fn probe_http(name: &str, url: &str, timeout: Duration) -> CheckResult {
    let mut result = CheckResult {
        name: name.to_string(),
        healthy: false,
        target: url.to_string(),
        error: String::new(),
    };
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(err) => {
            result.error = err.to_string();
            return result;
        }
    };
    match client.get(url).send().await {
        Ok(response) if response.status().is_success() => result.healthy = true,
        Ok(response) => result.error = format!("non-2xx status: {}", response.status().as_u16()),
        Err(err) => result.error = err.to_string(),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_tcp_target_is_unhealthy() {
        // TEST-NET-1 is guaranteed unroutable; the timeout bounds the probe.
        let result = probe_tcp(
            "cloud_postgres",
            "192.0.2.1:9",
            Duration::from_millis(100),
        )
        .await;
        assert!(!result.healthy);
        assert!(!result.error.is_empty());
    }

    #[tokio::test]
    async fn probe_runs_all_four_checks() {
        let config = CloudDepsConfig {
            required: true,
            postgres_addr: "192.0.2.1:9".to_string(),
            redis_addr: "192.0.2.1:10".to_string(),
            nats_health_url: "http://192.0.2.1:11/healthz".to_string(),
            minio_health_url: "http://192.0.2.1:12/health".to_string(),
            timeout: Duration::from_millis(100),
        };
        let (results, healthy) = probe(&config).await;
        assert_eq!(results.len(), 4);
        assert!(!healthy);
        let names: Vec<_> = results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(
            names,
            ["cloud_postgres", "cloud_redis", "cloud_nats", "cloud_minio"]
        );
    }
}
