//! Operator configuration read from the environment

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

pub const DEFAULT_COMPONENT_FAILED_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_VOLUME_EXPANSION_TIMEOUT_SECS: u64 = 30 * 60;
pub const DEFAULT_HEALTH_ADDR: &str = "0.0.0.0:8080";

#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Namespace to watch; `None` watches every namespace
    pub watch_namespace: Option<String>,
    /// Leader election identity
    pub pod_name: String,
    pub pod_namespace: String,
    /// How long a targeted component may stay Failed/Abnormal before the request fails
    pub component_failed_timeout: Duration,
    pub volume_expansion_timeout: Duration,
    /// Maximum concurrent reconciles; 0 is unbounded
    pub reconcile_concurrency: u16,
    pub health_addr: SocketAddr,
    pub log_json: bool,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            pod_name: "ops-operator".to_string(),
            pod_namespace: "default".to_string(),
            component_failed_timeout: Duration::from_secs(DEFAULT_COMPONENT_FAILED_TIMEOUT_SECS),
            volume_expansion_timeout: Duration::from_secs(DEFAULT_VOLUME_EXPANSION_TIMEOUT_SECS),
            reconcile_concurrency: 0,
            health_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            log_json: false,
        }
    }
}

impl OperatorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let pod_name = env::var("POD_NAME").unwrap_or_else(|_| {
            warn!("POD_NAME not set, using hostname");
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string())
        });
        let pod_namespace = env::var("POD_NAMESPACE").unwrap_or_else(|_| {
            warn!("POD_NAMESPACE not set, using 'default'");
            defaults.pod_namespace.clone()
        });

        Self {
            watch_namespace: env::var("WATCH_NAMESPACE").ok().filter(|ns| !ns.is_empty()),
            pod_name,
            pod_namespace,
            component_failed_timeout: Duration::from_secs(parse_or(
                "COMPONENT_FAILED_TIMEOUT_SECS",
                DEFAULT_COMPONENT_FAILED_TIMEOUT_SECS,
            )),
            volume_expansion_timeout: Duration::from_secs(parse_or(
                "VOLUME_EXPANSION_TIMEOUT_SECS",
                DEFAULT_VOLUME_EXPANSION_TIMEOUT_SECS,
            )),
            reconcile_concurrency: parse_or("RECONCILE_CONCURRENCY", 0),
            health_addr: parse_or("HEALTH_ADDR", defaults.health_addr),
            log_json: env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")),
        }
    }
}

/// Parse an env var, falling back to the default (with a warning) when invalid
fn parse_or<T>(key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Debug,
{
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, ?default, "invalid value, using default");
            default
        }),
        Err(_) => default,
    }
}
