//! Moving a restored volume from its temp claim to the instance's own claim.
//!
//! The protocol is checkpointed on the objects themselves:
//!
//! 1. the PV is set to `Retain` and labelled with the temp claim name,
//! 2. the temp claim is deleted,
//! 3. the PV's `claimRef` is cleared and it is annotated `rebuild-from`,
//! 4. the source claim is deleted and, once it is gone, recreated bound by
//!    name to the PV and annotated `rebuild-from` as well.
//!
//! Each step is skipped when its marker is already present, so re-running
//! [`rebind_volume`] after a crash at any point converges on the same state.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::ObjectMeta;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info};

use crate::controller::error::{Error, Result};
use crate::crd::{annotations, labels};
use crate::resources::FIELD_MANAGER;

/// Changes made to a PersistentVolume during a rebind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PvPatch {
    /// Keep the volume when its claim goes away and remember the temp claim
    RetainAndLabel { tmp_claim: String },
    /// Free the volume for the recreated source claim
    Release { ops_name: String },
}

/// Volume objects of one namespace
#[async_trait]
pub trait VolumeWorld: Send + Sync {
    async fn get_pvc(&self, name: &str) -> Result<Option<PersistentVolumeClaim>>;

    /// Create a claim; an existing claim of the same name is left alone
    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<()>;

    /// Delete a claim and drop its finalizers; a missing claim is fine
    async fn delete_pvc(&self, name: &str) -> Result<()>;

    async fn get_pv(&self, name: &str) -> Result<Option<PersistentVolume>>;

    /// PV labelled with the given temp claim
    async fn find_pv_by_tmp_claim(&self, tmp_claim: &str) -> Result<Option<PersistentVolume>>;

    async fn patch_pv(&self, name: &str, patch: &PvPatch) -> Result<()>;

    async fn delete_pod(&self, name: &str, force: bool) -> Result<()>;
}

fn rebuilt_by(meta: &ObjectMeta, ops_name: &str) -> bool {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(annotations::REBUILD_FROM))
        .is_some_and(|v| v == ops_name)
}

/// Locate the PV holding the restored data of `tmp`
async fn restored_pv<W: VolumeWorld + ?Sized>(
    world: &W,
    tmp: &PersistentVolumeClaim,
) -> Result<PersistentVolume> {
    let tmp_name = tmp.name_any();
    let bound = tmp.spec.as_ref().and_then(|s| s.volume_name.clone());
    match bound {
        Some(volume) => world.get_pv(&volume).await?.ok_or_else(|| {
            Error::Transient(format!("pv {} of pvc {} not found yet", volume, tmp_name))
        }),
        None => world
            .find_pv_by_tmp_claim(&tmp_name)
            .await?
            .ok_or_else(|| Error::fatal(format!("can not found the pv by the pvc \"{}\"", tmp_name))),
    }
}

/// Rebind the volume restored into `tmp_template` to the claim `source_name`.
///
/// `base_labels` label the recreated claim when the source claim is already gone.
pub async fn rebind_volume<W: VolumeWorld + ?Sized>(
    world: &W,
    ops_name: &str,
    source_name: &str,
    tmp_template: &PersistentVolumeClaim,
    base_labels: &BTreeMap<String, String>,
) -> Result<()> {
    let source = world.get_pvc(source_name).await?;
    if source.as_ref().is_some_and(|s| rebuilt_by(&s.metadata, ops_name)) {
        debug!(pvc = source_name, "source pvc already rebuilt");
        return Ok(());
    }

    let tmp_name = tmp_template.name_any();
    let tmp = world
        .get_pvc(&tmp_name)
        .await?
        .unwrap_or_else(|| tmp_template.clone());
    let pv = restored_pv(world, &tmp).await?;
    let pv_name = pv.name_any();

    if !rebuilt_by(&pv.metadata, ops_name) {
        let labelled = pv.labels().get(labels::REBUILD_TMP_PVC) == Some(&tmp_name);
        if !labelled {
            let claim = pv.spec.as_ref().and_then(|s| s.claim_ref.as_ref());
            if let Some(claim) = claim
                && claim.name.as_deref() != Some(tmp_name.as_str())
            {
                return Err(Error::fatal(format!(
                    "the pv \"{}\" is not bound by the pvc \"{}\"",
                    pv_name, tmp_name
                )));
            }
            world
                .patch_pv(
                    &pv_name,
                    &PvPatch::RetainAndLabel {
                        tmp_claim: tmp_name.clone(),
                    },
                )
                .await?;
        }
        world.delete_pvc(&tmp_name).await?;
        world
            .patch_pv(
                &pv_name,
                &PvPatch::Release {
                    ops_name: ops_name.to_string(),
                },
            )
            .await?;
    }

    let mut pvc_labels = base_labels.clone();
    if let Some(source) = &source {
        pvc_labels.extend(source.labels().clone());
        world.delete_pvc(source_name).await?;
        // The claim must be gone before it is recreated
        if world.get_pvc(source_name).await?.is_some() {
            return Err(Error::Transient(format!(
                "waiting for the pvc \"{}\" to be deleted",
                source_name
            )));
        }
    }

    let mut spec = tmp.spec.clone().unwrap_or_default();
    spec.volume_name = Some(pv_name.clone());
    let recreated = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(source_name.to_string()),
            namespace: tmp.namespace(),
            labels: Some(pvc_labels),
            annotations: Some(BTreeMap::from([(
                annotations::REBUILD_FROM.to_string(),
                ops_name.to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(spec),
        status: None,
    };
    world.create_pvc(&recreated).await?;
    let recreated_on_pv = world.get_pvc(source_name).await?.is_some_and(|c| {
        rebuilt_by(&c.metadata, ops_name)
            && c.spec.as_ref().and_then(|s| s.volume_name.as_deref()) == Some(pv_name.as_str())
    });
    if !recreated_on_pv {
        return Err(Error::Transient(format!(
            "the pvc \"{}\" is not bound to the pv \"{}\" yet",
            source_name, pv_name
        )));
    }
    info!(pvc = source_name, pv = %pv_name, "source pvc recreated on the restored volume");
    Ok(())
}

/// [`VolumeWorld`] backed by the API server
pub struct KubeVolumeWorld {
    client: Client,
    namespace: String,
}

impl KubeVolumeWorld {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
        }
    }

    fn pvcs(&self) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pvs(&self) -> Api<PersistentVolume> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl VolumeWorld for KubeVolumeWorld {
    async fn get_pvc(&self, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        Ok(self.pvcs().get_opt(name).await?)
    }

    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<()> {
        match self.pvcs().create(&PostParams::default(), pvc).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_pvc(&self, name: &str) -> Result<()> {
        let api = self.pvcs();
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => {}
            Err(kube::Error::Api(e)) if e.code == 404 => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        // The pvc-protection finalizer would hold the claim until the old pod is gone
        let patch = serde_json::json!({ "metadata": { "finalizers": null } });
        match api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_pv(&self, name: &str) -> Result<Option<PersistentVolume>> {
        Ok(self.pvs().get_opt(name).await?)
    }

    async fn find_pv_by_tmp_claim(&self, tmp_claim: &str) -> Result<Option<PersistentVolume>> {
        let lp = ListParams::default()
            .labels(&format!("{}={}", labels::REBUILD_TMP_PVC, tmp_claim))
            .limit(1);
        Ok(self.pvs().list(&lp).await?.items.into_iter().next())
    }

    async fn patch_pv(&self, name: &str, patch: &PvPatch) -> Result<()> {
        let body = match patch {
            PvPatch::RetainAndLabel { tmp_claim } => serde_json::json!({
                "metadata": { "labels": { (labels::REBUILD_TMP_PVC): tmp_claim } },
                "spec": { "persistentVolumeReclaimPolicy": "Retain" }
            }),
            PvPatch::Release { ops_name } => serde_json::json!({
                "metadata": { "annotations": { (annotations::REBUILD_FROM): ops_name } },
                "spec": { "claimRef": null }
            }),
        };
        self.pvs()
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&body))
            .await?;
        Ok(())
    }

    async fn delete_pod(&self, name: &str, force: bool) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let dp = if force {
            DeleteParams::background().grace_period(0)
        } else {
            DeleteParams::background()
        };
        match api.delete(name, &dp).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
