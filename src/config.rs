//! Operator configuration
//!
//! Values come from command-line flags with environment fallbacks (see
//! `main.rs`); timing knobs carry production defaults and are shrunk by tests.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};

/// Port of the OpenSearch HTTP endpoint behind the `-internal` service
pub const OPENSEARCH_HTTP_PORT: u16 = 9200;

pub const DEFAULT_API_ADDR: &str = "0.0.0.0:8068";
pub const DEFAULT_CERTIFICATE_PATH: &str = "/certs/crt.pem";
pub const DEFAULT_DBAAS_CERTIFICATE_PATH: &str = "/certs/dbaas-adapter/ca.crt";

#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Namespace the operator watches
    pub namespace: String,
    /// Overrides the computed OpenSearch URL when set (`OPENSEARCH_HOST`)
    pub opensearch_host: Option<String>,
    pub api_addr: SocketAddr,
    /// CA used for the OpenSearch endpoint; plain HTTP when the file is absent
    pub certificate_path: PathBuf,
    /// CA used for the DBaaS adapter and aggregator endpoints
    pub dbaas_certificate_path: PathBuf,
    /// Log response bodies of the admin API
    pub debug: bool,
    pub timings: Timings,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            opensearch_host: None,
            api_addr: SocketAddr::from(([0, 0, 0, 0], 8068)),
            certificate_path: PathBuf::from(DEFAULT_CERTIFICATE_PATH),
            dbaas_certificate_path: PathBuf::from(DEFAULT_DBAAS_CERTIFICATE_PATH),
            debug: false,
            timings: Timings::default(),
        }
    }
}

impl OperatorConfig {
    /// URL of the OpenSearch cluster managed by the resource `name`
    pub fn opensearch_url(&self, name: &str) -> String {
        if let Some(host) = self.opensearch_host.as_deref().filter(|h| !h.is_empty()) {
            return host.trim_end_matches('/').to_string();
        }
        let protocol = if self.certificate_path.exists() {
            "https"
        } else {
            "http"
        };
        format!("{protocol}://{name}-internal:{OPENSEARCH_HTTP_PORT}")
    }

    /// HTTP client for the OpenSearch cluster
    pub fn opensearch_http_client(&self) -> Result<reqwest::Client> {
        build_http_client(&self.certificate_path, self.timings.http_timeout)
    }

    /// HTTP client for the DBaaS adapter and aggregator
    pub fn dbaas_http_client(&self) -> Result<reqwest::Client> {
        build_http_client(&self.dbaas_certificate_path, self.timings.http_timeout)
    }
}

/// Build a client trusting the PEM bundle at `ca_path` when it exists
pub fn build_http_client(ca_path: &Path, timeout: Duration) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(timeout);

    if ca_path.exists() {
        let pem = std::fs::read(ca_path).map_err(|e| {
            Error::ConfigError(format!(
                "failed to read CA certificate {}: {e}",
                ca_path.display()
            ))
        })?;
        let certs = reqwest::Certificate::from_pem_bundle(&pem)?;
        debug!(path = %ca_path.display(), count = certs.len(), "Loaded CA certificates");
        for cert in certs {
            builder = builder.add_root_certificate(cert);
        }
    }

    Ok(builder.build()?)
}

/// Bounded waits and retry budgets
#[derive(Clone, Debug)]
pub struct Timings {
    pub http_timeout: Duration,
    /// Extra attempts for idempotent requests after a transient failure
    pub http_retries: u32,
    pub http_max_backoff: Duration,
    pub status_conflict_attempts: u32,
    pub replication_poll_interval: Duration,
    pub replication_poll_timeout: Duration,
    pub users_recovery_poll_interval: Duration,
    pub aggregator_retry_interval: Duration,
    pub users_recovery_timeout: Duration,
    pub scale_poll_interval: Duration,
    pub scale_timeout: Duration,
    pub watcher_default_interval: Duration,
    /// Pause after a replication restart, held under the replication lock
    pub watcher_cooldown: Duration,
    /// Settle time after traffic is cut and after indices are deleted
    pub settle_delay: Duration,
    pub snapshot_repository_attempts: u32,
    pub snapshot_repository_retry_interval: Duration,
    pub not_ready_requeue: Duration,
    pub resync_interval: Duration,
    pub retriable_error_requeue: Duration,
    pub error_requeue: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            http_timeout: Duration::from_secs(60),
            http_retries: 2,
            http_max_backoff: Duration::from_secs(5),
            status_conflict_attempts: 5,
            replication_poll_interval: Duration::from_secs(10),
            replication_poll_timeout: Duration::from_secs(240),
            users_recovery_poll_interval: Duration::from_secs(5),
            aggregator_retry_interval: Duration::from_secs(10),
            users_recovery_timeout: Duration::from_secs(240),
            scale_poll_interval: Duration::from_secs(10),
            scale_timeout: Duration::from_secs(180),
            watcher_default_interval: Duration::from_secs(30),
            watcher_cooldown: Duration::from_secs(60),
            settle_delay: Duration::from_secs(2),
            snapshot_repository_attempts: 5,
            snapshot_repository_retry_interval: Duration::from_secs(5),
            not_ready_requeue: Duration::from_secs(20),
            resync_interval: Duration::from_secs(60),
            retriable_error_requeue: Duration::from_secs(15),
            error_requeue: Duration::from_secs(60),
        }
    }
}

impl Timings {
    /// Millisecond-scale timings for tests and local experiments
    pub fn fast() -> Self {
        let ms = Duration::from_millis;
        Self {
            http_timeout: Duration::from_secs(5),
            http_retries: 2,
            http_max_backoff: ms(20),
            status_conflict_attempts: 5,
            replication_poll_interval: ms(10),
            replication_poll_timeout: ms(300),
            users_recovery_poll_interval: ms(10),
            aggregator_retry_interval: ms(10),
            users_recovery_timeout: ms(500),
            scale_poll_interval: ms(10),
            scale_timeout: ms(300),
            watcher_default_interval: ms(20),
            watcher_cooldown: ms(50),
            settle_delay: Duration::ZERO,
            snapshot_repository_attempts: 3,
            snapshot_repository_retry_interval: ms(10),
            not_ready_requeue: ms(20),
            resync_interval: ms(60),
            retriable_error_requeue: ms(15),
            error_requeue: ms(60),
        }
    }

    /// Interval of the replication watcher for a configured value in seconds
    pub fn watcher_interval(&self, configured_secs: i64) -> Duration {
        if configured_secs <= 0 {
            self.watcher_default_interval
        } else {
            Duration::from_secs(configured_secs as u64)
        }
    }
}
