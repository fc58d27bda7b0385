//! Upward sync: the physical object is the source of truth for the status
//! subset, which flows back to the owning virtual object under a feature
//! gate.
//!
//! The only confirmed transition for PVCs is phase Lost observed physically
//! while the virtual object still reads Bound. Everything else in the phase
//! matrix is deliberately left alone until each transition is confirmed
//! individually.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PersistentVolumeClaimStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::debug;

use crate::backend::PvcBackend;
use crate::conversion::{owner_uid, status_phase, ClusterKey};
use crate::featuregate::{self, SYNC_TENANT_PVC_STATUS_PHASE};
use crate::syncer::SyncKey;
use crate::Result;

/// Reconciles one key upward, physical status → virtual status
pub struct UwsReconciler {
    tenant: Arc<dyn PvcBackend>,
    superc: Arc<dyn PvcBackend>,
    cluster_key: ClusterKey,
}

impl UwsReconciler {
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

    /// Propagate the status subset for the pair named by `key`.
    ///
    /// Missing or foreign objects on either side are quiet no-ops; patrol
    /// owns the cleanup of stale physicals, not this loop.
    pub async fn reconcile(&self, key: &SyncKey) -> Result<()> {
        if !featuregate::enabled(SYNC_TENANT_PVC_STATUS_PHASE) {
            return Ok(());
        }

        let Some(physical) = self.superc.get(&key.super_namespace, &key.name).await? else {
            return Ok(());
        };
        let Some(owner) = owner_uid(&physical.metadata) else {
            return Ok(());
        };
        let Some(virtual_obj) = self.tenant.get(&key.tenant_namespace, &key.name).await?
        else {
            debug!(%key, "virtual object gone, leaving stale physical to patrol");
            return Ok(());
        };
        if virtual_obj.metadata.uid.as_deref() != Some(owner) {
            debug!(%key, "owner uid mismatch, leaving stale physical to patrol");
            return Ok(());
        }

        match (status_phase(&physical), status_phase(&virtual_obj)) {
            (Some("Lost"), Some("Bound")) => {
                debug!(%key, cluster_key = %self.cluster_key, "propagating phase Lost to virtual pvc");
                // Status writes go out as server-side apply. The body must
                // be a fresh object naming only the fields this manager
                // owns: echoing the GET response back would carry
                // managedFields, which the apiserver rejects outright.
                let patch = PersistentVolumeClaim {
                    metadata: ObjectMeta {
                        name: virtual_obj.metadata.name.clone(),
                        namespace: virtual_obj.metadata.namespace.clone(),
                        ..Default::default()
                    },
                    spec: None,
                    status: Some(PersistentVolumeClaimStatus {
                        phase: Some("Lost".to_string()),
                        ..Default::default()
                    }),
                };
                self.tenant.update_status(&key.tenant_namespace, &patch).await
            }
            (physical_phase, virtual_phase) => {
                debug!(
                    target: "DEBUG-VC",
                    %key,
                    ?physical_phase,
                    ?virtual_phase,
                    "uws no-op, transition not propagated"
                );
                Ok(())
            }
        }
    }
}
