//! Per-resource-type sync engine.
//!
//! One [`PvcSyncer`] serves one tenant cluster. It wires together the
//! downward loop ([`dws`]), the upward loop ([`uws`]), and the periodic
//! [`patrol`] pass, all feeding keyed work through coalescing [`queue`]s.

pub mod dws;
pub mod patrol;
pub mod queue;
pub mod uws;

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{PvcBackend, WatchNotification};
use crate::conversion::ClusterKey;
use crate::error::Error;
use crate::retry::RetryConfig;
use crate::{Result, CLUSTER_ANNOTATION, TENANT_NAMESPACE_ANNOTATION};

use dws::DwsReconciler;
use patrol::Patroller;
use queue::WorkQueue;
use uws::UwsReconciler;

/// Join key identifying one mirrored object pair.
///
/// Carries both namespaces so either loop can reach its side without a
/// reverse lookup; the (super-namespace, name) pair is the identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SyncKey {
    /// Namespace of the virtual object in the tenant cluster
    pub tenant_namespace: String,
    /// Mapped namespace of the physical object in the super cluster
    pub super_namespace: String,
    /// Shared object name
    pub name: String,
}

impl SyncKey {
    /// Derive the key from a virtual object
    pub fn from_virtual(cluster_key: &ClusterKey, vpvc: &PersistentVolumeClaim) -> Result<Self> {
        let namespace = vpvc.metadata.namespace.as_deref().ok_or_else(|| {
            Error::malformed_key(
                vpvc.metadata.name.as_deref().unwrap_or("<unnamed>"),
                "virtual object has no namespace",
            )
        })?;
        let name = vpvc
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::malformed_key(namespace, "virtual object has no name"))?;
        Ok(Self {
            tenant_namespace: namespace.to_string(),
            super_namespace: cluster_key.super_cluster_namespace(namespace),
            name: name.to_string(),
        })
    }

    /// Derive the key from a physical object's ownership markers
    pub fn from_physical(ppvc: &PersistentVolumeClaim) -> Result<Self> {
        let name = ppvc
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::malformed_key("<unnamed>", "physical object has no name"))?;
        let super_namespace = ppvc.metadata.namespace.as_deref().ok_or_else(|| {
            Error::malformed_key(name, "physical object has no namespace")
        })?;
        let tenant_namespace = ppvc
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(TENANT_NAMESPACE_ANNOTATION))
            .ok_or_else(|| {
                Error::malformed_key(
                    format!("{}/{}", super_namespace, name),
                    "physical object carries no tenant namespace marker",
                )
            })?;
        Ok(Self {
            tenant_namespace: tenant_namespace.clone(),
            super_namespace: super_namespace.to_string(),
            name: name.to_string(),
        })
    }
}

impl std::fmt::Display for SyncKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.super_namespace, self.name)
    }
}

/// Tuning knobs for one syncer
#[derive(Clone, Debug)]
pub struct SyncerConfig {
    /// Concurrent workers per queue
    pub workers: usize,
    /// Interval between patrol passes
    pub patrol_interval: Duration,
    /// Requeue backoff for failed keys
    pub retry: RetryConfig,
}

impl Default for SyncerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            patrol_interval: Duration::from_secs(60),
            retry: RetryConfig::default(),
        }
    }
}

/// The three-loop engine for one tenant cluster's PVCs
pub struct PvcSyncer {
    tenant: Arc<dyn PvcBackend>,
    superc: Arc<dyn PvcBackend>,
    cluster_key: ClusterKey,
    config: SyncerConfig,
    dws_queue: WorkQueue<SyncKey>,
    uws_queue: WorkQueue<SyncKey>,
}

impl PvcSyncer {
    /// Build a syncer over the two backends
    pub fn new(
        tenant: Arc<dyn PvcBackend>,
        superc: Arc<dyn PvcBackend>,
        cluster_key: ClusterKey,
        config: SyncerConfig,
    ) -> Self {
        Self {
            tenant,
            superc,
            cluster_key,
            config,
            dws_queue: WorkQueue::new(),
            uws_queue: WorkQueue::new(),
        }
    }

    /// Run all loops until cancelled.
    ///
    /// A failure to establish either watch is fatal and reported upward;
    /// everything after establishment is retried or requeued internally.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(cluster_key = %self.cluster_key, "starting pvc syncer");

        let dws = Arc::new(DwsReconciler::new(
            Arc::clone(&self.tenant),
            Arc::clone(&self.superc),
            self.cluster_key.clone(),
        ));
        let uws = Arc::new(UwsReconciler::new(
            Arc::clone(&self.tenant),
            Arc::clone(&self.superc),
            self.cluster_key.clone(),
        ));
        let patroller = Patroller::new(
            Arc::clone(&self.tenant),
            Arc::clone(&self.superc),
            self.cluster_key.clone(),
            self.dws_queue.clone(),
            self.uws_queue.clone(),
        );

        let dws_workers = {
            let handler_dws = Arc::clone(&dws);
            self.dws_queue.run(
                self.config.workers,
                self.config.retry.clone(),
                cancel.clone(),
                move |key: SyncKey| {
                    let dws = Arc::clone(&handler_dws);
                    async move { dws.reconcile(&key).await }
                },
            )
        };
        let uws_workers = {
            let handler_uws = Arc::clone(&uws);
            self.uws_queue.run(
                self.config.workers,
                self.config.retry.clone(),
                cancel.clone(),
                move |key: SyncKey| {
                    let uws = Arc::clone(&handler_uws);
                    async move { uws.reconcile(&key).await }
                },
            )
        };

        let tenant_pump = self.pump_tenant_events(cancel.clone());
        let super_pump = self.pump_super_events(cancel.clone());
        let patrol_loop = self.patrol_loop(patroller, cancel.clone());

        let (tenant_res, super_res, _, _, _) = tokio::join!(
            tenant_pump,
            super_pump,
            dws_workers,
            uws_workers,
            patrol_loop
        );
        tenant_res?;
        super_res?;
        info!(cluster_key = %self.cluster_key, "pvc syncer stopped");
        Ok(())
    }

    /// Feed tenant-side object events into the downward queue
    async fn pump_tenant_events(&self, cancel: CancellationToken) -> Result<()> {
        let (tx, mut rx) = mpsc::channel(256);
        let backend = Arc::clone(&self.tenant);
        let watch_cancel = cancel.clone();
        let watch =
            tokio::spawn(async move { backend.watch(tx, watch_cancel).await });

        while let Some(notification) = rx.recv().await {
            let pvc = match notification {
                WatchNotification::Applied(pvc) | WatchNotification::Deleted(pvc) => pvc,
                WatchNotification::Resynced => {
                    debug!("tenant watch caught up");
                    continue;
                }
            };
            match SyncKey::from_virtual(&self.cluster_key, &pvc) {
                Ok(key) => self.dws_queue.enqueue(key),
                Err(e) => warn!(error = %e, "skipping unkeyable tenant event"),
            }
        }

        match watch.await {
            Ok(result) => result,
            Err(e) => Err(Error::internal_with_context("tenant watch", e.to_string())),
        }
    }

    /// Feed super-side object events into the right queue.
    ///
    /// Applies become upward keys; deletes go downward so a physical object
    /// removed behind our back is recreated while its virtual owner lives.
    /// Objects belonging to other tenant clusters are skipped.
    async fn pump_super_events(&self, cancel: CancellationToken) -> Result<()> {
        let (tx, mut rx) = mpsc::channel(256);
        let backend = Arc::clone(&self.superc);
        let watch_cancel = cancel.clone();
        let watch =
            tokio::spawn(async move { backend.watch(tx, watch_cancel).await });

        while let Some(notification) = rx.recv().await {
            let (pvc, deleted) = match notification {
                WatchNotification::Applied(pvc) => (pvc, false),
                WatchNotification::Deleted(pvc) => (pvc, true),
                WatchNotification::Resynced => {
                    debug!("super watch caught up");
                    continue;
                }
            };
            let ours = pvc
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(CLUSTER_ANNOTATION))
                .is_some_and(|k| k == self.cluster_key.as_str());
            if !ours {
                continue;
            }
            match SyncKey::from_physical(&pvc) {
                Ok(key) if deleted => self.dws_queue.enqueue(key),
                Ok(key) => self.uws_queue.enqueue(key),
                Err(e) => warn!(error = %e, "skipping unkeyable super event"),
            }
        }

        match watch.await {
            Ok(result) => result,
            Err(e) => Err(Error::internal_with_context("super watch", e.to_string())),
        }
    }

    async fn patrol_loop(&self, patroller: Patroller, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.patrol_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately; skip it so events settle first
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            match patroller.patrol_once().await {
                Ok(stats) => {
                    info!(cluster_key = %self.cluster_key, ?stats, "patrol pass complete")
                }
                Err(e) => warn!(cluster_key = %self.cluster_key, error = %e, "patrol pass failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn vpvc(namespace: &str, name: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                uid: Some("12345".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn virtual_key_maps_the_namespace() {
        let cluster_key = ClusterKey::new("tenant-1", "test", "uid-1");
        let key = SyncKey::from_virtual(&cluster_key, &vpvc("default", "pvc-1")).unwrap();
        assert_eq!(key.tenant_namespace, "default");
        assert_eq!(
            key.super_namespace,
            cluster_key.super_cluster_namespace("default")
        );
        assert_eq!(key.name, "pvc-1");
    }

    #[test]
    fn physical_key_requires_tenant_marker() {
        let mut ppvc = vpvc("super-ns", "pvc-1");
        let err = SyncKey::from_physical(&ppvc).unwrap_err();
        assert!(matches!(err, Error::MalformedKey { .. }));

        ppvc.metadata.annotations = Some(
            [(TENANT_NAMESPACE_ANNOTATION.to_string(), "default".to_string())]
                .into_iter()
                .collect(),
        );
        let key = SyncKey::from_physical(&ppvc).unwrap();
        assert_eq!(key.tenant_namespace, "default");
        assert_eq!(key.super_namespace, "super-ns");
    }

    #[test]
    fn keys_from_both_sides_agree() {
        let cluster_key = ClusterKey::new("tenant-1", "test", "uid-1");
        let v = vpvc("default", "pvc-1");
        let from_virtual = SyncKey::from_virtual(&cluster_key, &v).unwrap();

        let p = crate::conversion::to_physical_pvc(&v, &cluster_key);
        let from_physical = SyncKey::from_physical(&p).unwrap();
        assert_eq!(from_virtual, from_physical);
    }
}
