//! VolumeExpansion: grow the volume claim templates of components and wait for the claims

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::ResourceExt;

use crate::controller::Context;
use crate::controller::aggregator::{ProgressSummary, generate_pod_names, resolve_components};
use crate::controller::error::{Error, Result};
use crate::controller::progress::{
    ProgressEvent, detail, failed_message, object_key, processing_message, set_progress_detail,
    succeed_message,
};
use crate::crd::{LastComponentConfiguration, ProgressStatus, ProgressStatusDetail};
use crate::handlers::{OpsResource, ReconcileOutcome, component_not_found, update_cluster};
use crate::resources::pvc::{
    ExpansionState, PVC_KIND, claim_name, expansion_state, list_component_pvcs,
};
use crate::resources::quantity::compare_quantity;

const REQUEUE: Duration = Duration::from_secs(60);
const VERB: &str = "expand volume";

pub fn validate(res: &mut OpsResource) -> Result<()> {
    for ve in &res.ops.spec.volume_expansion {
        let spec = res
            .cluster
            .component_spec(&ve.component_name)
            .ok_or_else(|| component_not_found(&res.cluster, &ve.component_name))?;
        for requested in &ve.volume_claim_templates {
            let current = spec
                .volume_claim_templates
                .iter()
                .find(|v| v.name == requested.name)
                .ok_or_else(|| {
                    Error::ValidationError(format!(
                        "volumeClaimTemplate {} not found in component {}",
                        requested.name, ve.component_name
                    ))
                })?;
            match compare_quantity(&requested.storage, &current.storage) {
                Some(Ordering::Less) => {
                    return Err(Error::ValidationError(format!(
                        "requested storage size of volumeClaimTemplate {} can not be less than {}",
                        requested.name, current.storage
                    )));
                }
                Some(_) => {}
                None => {
                    return Err(Error::ValidationError(format!(
                        "invalid storage size {} for volumeClaimTemplate {}",
                        requested.storage, requested.name
                    )));
                }
            }
        }
    }
    Ok(())
}

pub fn save_last_configuration(res: &mut OpsResource) {
    for ve in &res.ops.spec.volume_expansion {
        let Some(spec) = res.cluster.component_spec(&ve.component_name) else {
            continue;
        };
        let volume_claim_templates = spec
            .volume_claim_templates
            .iter()
            .map(|v| (v.name.clone(), v.storage.clone()))
            .collect();
        res.status.last_configuration.components.insert(
            ve.component_name.clone(),
            LastComponentConfiguration {
                volume_claim_templates,
                ..Default::default()
            },
        );
    }
}

pub async fn action(ctx: &Context, res: &mut OpsResource) -> Result<()> {
    let requests = res.ops.spec.volume_expansion.clone();
    update_cluster(ctx, res, |cluster| {
        for ve in &requests {
            let Some(spec) = cluster.component_spec_mut(&ve.component_name) else {
                return Err(Error::fatal(format!(
                    "component {} not found",
                    ve.component_name
                )));
            };
            for requested in &ve.volume_claim_templates {
                if let Some(vct) = spec
                    .volume_claim_templates
                    .iter_mut()
                    .find(|v| v.name == requested.name)
                {
                    vct.storage = requested.storage.clone();
                }
            }
        }
        Ok(())
    })
    .await
}

/// Inputs shared by the claim checks of one volume claim template
#[derive(Debug, Clone)]
pub struct PvcRules<'a> {
    pub component: &'a str,
    /// `<component>.<vct>`, or `<sharding>.<vct>` for shards
    pub group: String,
    pub requested: &'a str,
    pub ops_start: DateTime<Utc>,
    pub timeout: Duration,
    pub now: DateTime<Utc>,
}

impl PvcRules<'_> {
    fn timed_out(&self) -> bool {
        (self.now - self.ops_start)
            .to_std()
            .is_ok_and(|elapsed| elapsed > self.timeout)
    }

    fn timeout_message(&self) -> String {
        format!(
            "Timed out waiting for volume expansion to complete, the timeout value is {} minutes",
            self.timeout.as_secs() / 60
        )
    }

    fn classify(&self, pvc: &PersistentVolumeClaim) -> ProgressStatusDetail {
        let key = object_key(PVC_KIND, &pvc.name_any());
        let state = expansion_state(pvc, self.requested);
        let mut d = match state {
            ExpansionState::Expanded => detail(
                &key,
                ProgressStatus::Succeed,
                succeed_message(VERB, &key, self.component),
            ),
            _ if self.timed_out() => detail(
                &key,
                ProgressStatus::Failed,
                failed_message(VERB, &key, self.component, &self.timeout_message()),
            ),
            ExpansionState::Resizing => detail(
                &key,
                ProgressStatus::Processing,
                processing_message(VERB, &key, self.component),
            ),
            ExpansionState::Waiting => detail(
                &key,
                ProgressStatus::Pending,
                "Waiting for an external controller to process the pvc",
            ),
        };
        d.group = Some(self.group.clone());
        d
    }

    /// Detail of an expected claim that does not exist
    fn classify_missing(&self, name: &str) -> ProgressStatusDetail {
        let key = object_key(PVC_KIND, name);
        let mut d = if self.timed_out() {
            let reason = format!("the pvc is not found. {}", self.timeout_message());
            detail(
                &key,
                ProgressStatus::Failed,
                failed_message(VERB, &key, self.component, &reason),
            )
        } else {
            detail(&key, ProgressStatus::Pending, "Waiting for the pvc to be created")
        };
        d.group = Some(self.group.clone());
        d
    }
}

/// Fold the claims of one volume claim template into the ledger.
///
/// `expected` names the claims the component should have; a missing one
/// stays Pending until the timeout and then fails.
pub fn pvc_progress(
    rules: &PvcRules<'_>,
    expected: &BTreeSet<String>,
    pvcs: &[PersistentVolumeClaim],
    ledger: &mut Vec<ProgressStatusDetail>,
    events: &mut Vec<ProgressEvent>,
) -> ProgressSummary {
    let mut keys = BTreeSet::new();
    let mut listed = BTreeSet::new();
    for pvc in pvcs {
        let new = rules.classify(pvc);
        listed.insert(pvc.name_any());
        keys.insert(new.object_key.clone());
        events.extend(set_progress_detail(ledger, new, rules.now));
    }
    for name in expected.difference(&listed) {
        let new = rules.classify_missing(name);
        keys.insert(new.object_key.clone());
        events.extend(set_progress_detail(ledger, new, rules.now));
    }

    let total = i32::try_from(keys.len()).unwrap_or(i32::MAX);
    let mut summary = ProgressSummary::new(total, 0, 0);
    for d in ledger.iter().filter(|d| keys.contains(&d.object_key)) {
        match d.status {
            ProgressStatus::Succeed => {
                summary.completed += 1;
                summary.succeeded += 1;
            }
            ProgressStatus::Failed => summary.completed += 1,
            _ => {}
        }
    }
    summary
}

pub async fn reconcile_action(ctx: &Context, res: &mut OpsResource) -> Result<ReconcileOutcome> {
    let ns = res.namespace();
    let start = res.start_time();
    let cluster_name = res.cluster.name_any();
    let mut total = ProgressSummary::default();

    for ve in res.ops.spec.volume_expansion.clone() {
        let target = ve.component_name.as_str();
        let Some(spec) = res.cluster.component_spec(target).cloned() else {
            return Err(component_not_found(&res.cluster, target));
        };
        for resolved in resolve_components(&res.cluster, target) {
            let pods = generate_pod_names(
                &cluster_name,
                &resolved.name,
                spec.replicas,
                &spec.offline_instances,
            );
            for vct in &ve.volume_claim_templates {
                let expected: BTreeSet<String> =
                    pods.iter().map(|pod| claim_name(&vct.name, pod)).collect();
                let pvcs =
                    list_component_pvcs(&ctx.client, &ns, &cluster_name, &resolved.name, &vct.name)
                        .await?;
                let rules = PvcRules {
                    component: &resolved.name,
                    group: format!("{}.{}", target, vct.name),
                    requested: &vct.storage,
                    ops_start: start,
                    timeout: ctx.config.volume_expansion_timeout,
                    now: res.now,
                };
                let ledger = &mut res
                    .status
                    .components
                    .entry(target.to_string())
                    .or_default()
                    .progress_details;
                total.merge(pvc_progress(&rules, &expected, &pvcs, ledger, &mut res.events));
            }
        }
    }
    Ok(ReconcileOutcome::new(total, REQUEUE))
}
