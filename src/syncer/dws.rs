//! Downward sync: the virtual object is the source of truth for spec and
//! metadata, and the physical mirror is made to match it.

use std::sync::Arc;

use tracing::debug;

use crate::backend::PvcBackend;
use crate::conversion::{owner_uid, pvc_specs_equal, to_physical_pvc, ClusterKey};
use crate::error::Error;
use crate::syncer::SyncKey;
use crate::{Result, CLUSTER_ANNOTATION};

/// Reconciles one key downward, virtual → physical
pub struct DwsReconciler {
    tenant: Arc<dyn PvcBackend>,
    superc: Arc<dyn PvcBackend>,
    cluster_key: ClusterKey,
}

impl DwsReconciler {
    /// Build the reconciler
    pub fn new(
        tenant: Arc<dyn PvcBackend>,
        superc: Arc<dyn PvcBackend>,
        cluster_key: ClusterKey,
    ) -> Self {
        Self {
            tenant,
            superc,
            cluster_key,
        }
    }

    /// Drive the pair named by `key` to its downward fixed point.
    ///
    /// Idempotent: once virtual and physical agree, re-running is a no-op.
    /// Ownership conflicts are surfaced as permanent errors so the queue
    /// drops the key instead of hammering a foreign object.
    pub async fn reconcile(&self, key: &SyncKey) -> Result<()> {
        let virtual_obj = self.tenant.get(&key.tenant_namespace, &key.name).await?;
        let physical_obj = self.superc.get(&key.super_namespace, &key.name).await?;

        match (virtual_obj, physical_obj) {
            (Some(v), None) => {
                let desired = to_physical_pvc(&v, &self.cluster_key);
                debug!(%key, "creating physical pvc");
                self.superc.create(&key.super_namespace, &desired).await
            }
            (Some(v), Some(p)) => {
                let Some(owner) = owner_uid(&p.metadata) else {
                    return Err(Error::ownership_conflict(
                        key.to_string(),
                        "physical object exists but carries no ownership marker",
                    ));
                };
                if Some(owner) != v.metadata.uid.as_deref() {
                    return Err(Error::ownership_conflict(
                        key.to_string(),
                        format!(
                            "physical object owned by uid {}, virtual object has uid {}",
                            owner,
                            v.metadata.uid.as_deref().unwrap_or("<none>")
                        ),
                    ));
                }
                let desired = to_physical_pvc(&v, &self.cluster_key);
                if pvc_specs_equal(&desired, &p) {
                    debug!(target: "DEBUG-VC", %key, "dws no-op, specs agree");
                    return Ok(());
                }
                debug!(%key, "updating physical pvc");
                self.superc.update(&key.super_namespace, &desired).await
            }
            (None, Some(p)) => {
                // Delete only what this cluster created. Foreign objects and
                // other tenants' objects in a shared namespace stay put.
                let ours = p
                    .metadata
                    .annotations
                    .as_ref()
                    .and_then(|a| a.get(CLUSTER_ANNOTATION))
                    .is_some_and(|k| k == self.cluster_key.as_str());
                if !ours || owner_uid(&p.metadata).is_none() {
                    debug!(%key, "virtual gone but physical is not ours, leaving it");
                    return Ok(());
                }
                debug!(%key, "deleting orphaned physical pvc");
                self.superc
                    .delete(&key.super_namespace, &key.name, p.metadata.uid.as_deref())
                    .await
            }
            (None, None) => Ok(()),
        }
    }
}
