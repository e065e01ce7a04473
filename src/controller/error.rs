//! Error types for the OpsRequest controller

use std::time::Duration;

use thiserror::Error;

/// Error variants are named with the `Error` suffix for clarity (e.g., `KubeError`, `ValidationError`).
#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Logically impossible or unsupported state; the request fails without retry
    #[error("{0}")]
    Fatal(String),

    #[error("Transient error (will retry): {0}")]
    Transient(String),

    /// The informer cache lags a write we just made
    #[error("wait for the cache to refresh: {0}")]
    WaitCacheRefresh(String),

    #[error("Queue update conflict on cluster {0}")]
    QueueConflict(String),
}

impl Error {
    pub fn fatal(msg: impl Into<String>) -> Self {
        Error::Fatal(msg.into())
    }

    /// Fatal errors move the request straight to Failed
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_) | Error::ValidationError(_))
    }

    /// Check if this error is retryable by the outer controller loop
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::KubeError(e) => match e {
                kube::Error::Api(api_err) => {
                    // 4xx errors (except 409 Conflict, 429 TooManyRequests) are usually not retryable
                    let code = api_err.code;
                    if (400..500).contains(&code) {
                        return code == 409 || code == 429;
                    }
                    true
                }
                _ => true,
            },
            Error::Transient(_) | Error::WaitCacheRefresh(_) | Error::QueueConflict(_) => true,
            Error::NotFound(_) => true,
            Error::Fatal(_) | Error::ValidationError(_) => false,
            Error::SerializationError(_) | Error::MissingObjectKey(_) => false,
        }
    }

    /// True when the API server answered 404
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(e)) => e.code == 404,
            Error::NotFound(_) => true,
            _ => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Exponential backoff configuration
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Initial delay for first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry
    pub multiplier: f64,
    /// Random jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Calculate the backoff delay for a given retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay_secs =
            self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt.min(30) as i32);

        let jitter_range = base_delay_secs * self.jitter;
        let jitter = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
        let delay_with_jitter = (base_delay_secs + jitter).max(0.0);

        Duration::from_secs_f64(delay_with_jitter.min(self.max_delay.as_secs_f64()))
    }

    /// Retryable errors back off exponentially; the rest wait the maximum delay
    pub fn delay_for_error(&self, error: &Error, attempt: u32) -> Duration {
        if error.is_retryable() {
            self.delay_for_attempt(attempt)
        } else {
            self.max_delay
        }
    }
}
