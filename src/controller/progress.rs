//! Progress ledger: per-object progress records of a running operation.
//!
//! Every handler reports into `status.components[c].progressDetails` through
//! [`set_progress_detail`]. Records are keyed by `Kind/Name` (plus the action
//! name for custom operations), appended once and then only moved forward:
//! a Failed record can only be replaced by Succeed.

use chrono::{DateTime, Utc};

use crate::crd::{ProgressStatus, ProgressStatusDetail, format_time};

/// Stable ledger key of a Kubernetes object
pub fn object_key(kind: &str, name: &str) -> String {
    format!("{}/{}", kind, name)
}

pub fn processing_message(verb: &str, key: &str, component: &str) -> String {
    format!("Start to {}: {} in Component: {}", verb, key, component)
}

pub fn succeed_message(verb: &str, key: &str, component: &str) -> String {
    format!("Successfully {}: {} in Component: {}", verb, key, component)
}

pub fn failed_message(verb: &str, key: &str, component: &str, message: &str) -> String {
    format!(
        "Failed to {}: {} in Component: {}, message: {}",
        verb, key, component, message
    )
}

/// Event that should be emitted for a ledger change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub warning: bool,
    pub reason: &'static str,
    pub message: String,
}

impl ProgressEvent {
    fn for_detail(detail: &ProgressStatusDetail) -> Option<Self> {
        let reason = match detail.status {
            ProgressStatus::Pending => return None,
            ProgressStatus::Processing => "Processing",
            ProgressStatus::Succeed => "Succeed",
            ProgressStatus::Failed => "Failed",
        };
        Some(Self {
            warning: detail.status == ProgressStatus::Failed,
            reason,
            message: detail.message.clone(),
        })
    }
}

/// Build a fresh detail for `key`
pub fn detail(key: impl Into<String>, status: ProgressStatus, message: impl Into<String>) -> ProgressStatusDetail {
    ProgressStatusDetail {
        object_key: key.into(),
        status,
        message: message.into(),
        ..Default::default()
    }
}

pub fn find_progress_detail<'a>(
    details: &'a [ProgressStatusDetail],
    key: &str,
    action_name: Option<&str>,
) -> Option<&'a ProgressStatusDetail> {
    details
        .iter()
        .find(|d| d.object_key == key && d.action_name.as_deref() == action_name)
}

/// Insert or update a detail, applying the ledger rules.
///
/// Returns the event to publish when the ledger changed.
pub fn set_progress_detail(
    details: &mut Vec<ProgressStatusDetail>,
    mut new: ProgressStatusDetail,
    now: DateTime<Utc>,
) -> Option<ProgressEvent> {
    let existing = details
        .iter_mut()
        .find(|d| d.object_key == new.object_key && d.action_name == new.action_name);

    let Some(existing) = existing else {
        update_times(&mut new, now);
        let event = ProgressEvent::for_detail(&new);
        details.push(new);
        return event;
    };

    if existing.status == new.status {
        return None;
    }
    // Failed is sticky
    if existing.status == ProgressStatus::Failed && new.status != ProgressStatus::Succeed {
        return None;
    }
    existing.status = new.status;
    existing.message = new.message;
    if new.group.is_some() {
        existing.group = new.group;
    }
    update_times(existing, now);
    ProgressEvent::for_detail(existing)
}

fn update_times(detail: &mut ProgressStatusDetail, now: DateTime<Utc>) {
    if detail.status == ProgressStatus::Processing && detail.start_time.is_none() {
        detail.start_time = Some(format_time(now));
    }
    if detail.status.is_completed() && detail.end_time.is_none() {
        detail.end_time = Some(format_time(now));
    }
}

/// Count of (completed, succeeded, failed) records
pub fn tally(details: &[ProgressStatusDetail]) -> (i32, i32, i32) {
    details.iter().fold((0, 0, 0), |(c, s, f), d| match d.status {
        ProgressStatus::Succeed => (c + 1, s + 1, f),
        ProgressStatus::Failed => (c + 1, s, f + 1),
        _ => (c, s, f),
    })
}
