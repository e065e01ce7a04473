mod cluster;
mod config_constraint;
mod dataprotection;
mod ops_definition;
mod ops_request;

pub use cluster::*;
pub use config_constraint::*;
pub use dataprotection::*;
pub use ops_definition::*;
pub use ops_request::*;

pub use cluster::labels as cluster_labels;
pub use ops_request::{annotations, labels};

use chrono::{DateTime, SecondsFormat, Utc};

/// Parse an RFC3339 status timestamp
pub fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Format a timestamp the way status fields store it
pub fn format_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Convert an API server timestamp
pub fn from_k8s_time(t: &k8s_openapi::apimachinery::pkg::apis::meta::v1::Time) -> DateTime<Utc> {
    DateTime::from_timestamp(t.0.as_second(), t.0.subsec_nanosecond().max(0) as u32)
        .unwrap_or_default()
}

/// Convert to an API server timestamp (second precision)
pub fn to_k8s_time(t: DateTime<Utc>) -> k8s_openapi::apimachinery::pkg::apis::meta::v1::Time {
    k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
        jiff::Timestamp::from_second(t.timestamp()).unwrap_or(jiff::Timestamp::UNIX_EPOCH),
    )
}
