//! Storage backends for PVC objects.
//!
//! The sync loops never talk to `kube::Api` directly; they go through
//! [`PvcBackend`] so the engine logic stays testable against an in-memory
//! fake. [`KubePvcBackend`] is the production implementation.

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams, Preconditions};
use kube::runtime::watcher::{self, watcher, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Result, FIELD_MANAGER};

/// A change observed on a watched cluster
#[derive(Clone, Debug)]
pub enum WatchNotification {
    /// Object created or updated. Initial-list replays arrive the same way,
    /// which is what makes handlers safe to run on stale duplicates.
    Applied(PersistentVolumeClaim),
    /// Object deleted
    Deleted(PersistentVolumeClaim),
    /// Initial list completed; the watch is now caught up
    Resynced,
}

/// Read/write access to PVCs in one cluster
#[async_trait]
pub trait PvcBackend: Send + Sync {
    /// List PVCs, optionally restricted to one namespace
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<PersistentVolumeClaim>>;

    /// Fetch one PVC, mapping 404 to `None`
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>>;

    /// Create a PVC
    async fn create(&self, namespace: &str, pvc: &PersistentVolumeClaim) -> Result<()>;

    /// Replace a PVC's spec and metadata
    async fn update(&self, namespace: &str, pvc: &PersistentVolumeClaim) -> Result<()>;

    /// Patch a PVC's status subresource
    async fn update_status(&self, namespace: &str, pvc: &PersistentVolumeClaim) -> Result<()>;

    /// Delete a PVC, treating 404 as success.
    ///
    /// When `precondition_uid` is set the delete only applies to the exact
    /// object instance carrying that UID; a replacement object created in
    /// the meantime is left alone and the call fails with a 409.
    async fn delete(&self, namespace: &str, name: &str, precondition_uid: Option<&str>)
        -> Result<()>;

    /// Stream change notifications into `tx` until cancelled.
    ///
    /// Returns when the token fires or the sink closes; transient watch
    /// errors are handled internally by the watcher's backoff.
    async fn watch(
        &self,
        tx: mpsc::Sender<WatchNotification>,
        cancel: CancellationToken,
    ) -> Result<()>;
}

/// Production backend over a kube client, watching all namespaces
#[derive(Clone)]
pub struct KubePvcBackend {
    client: Client,
}

impl KubePvcBackend {
    /// Wrap a client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl PvcBackend for KubePvcBackend {
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> = match namespace {
            Some(ns) => self.api(ns),
            None => Api::all(self.client.clone()),
        };
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        match self.api(namespace).get(name).await {
            Ok(pvc) => Ok(Some(pvc)),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, namespace: &str, pvc: &PersistentVolumeClaim) -> Result<()> {
        self.api(namespace)
            .create(&PostParams::default(), pvc)
            .await?;
        Ok(())
    }

    async fn update(&self, namespace: &str, pvc: &PersistentVolumeClaim) -> Result<()> {
        self.api(namespace)
            .patch(
                pvc.metadata.name.as_deref().unwrap_or_default(),
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(pvc),
            )
            .await?;
        Ok(())
    }

    async fn update_status(&self, namespace: &str, pvc: &PersistentVolumeClaim) -> Result<()> {
        self.api(namespace)
            .patch_status(
                pvc.metadata.name.as_deref().unwrap_or_default(),
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(pvc),
            )
            .await?;
        Ok(())
    }

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        precondition_uid: Option<&str>,
    ) -> Result<()> {
        let mut params = DeleteParams::default();
        if let Some(uid) = precondition_uid {
            params.preconditions = Some(Preconditions {
                uid: Some(uid.to_string()),
                resource_version: None,
            });
        }
        match self.api(namespace).delete(name, &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn watch(
        &self,
        tx: mpsc::Sender<WatchNotification>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let api: Api<PersistentVolumeClaim> = Api::all(self.client.clone());
        let stream = watcher(api, watcher::Config::default().any_semantic()).default_backoff();
        tokio::pin!(stream);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("pvc watch cancelled");
                    return Ok(());
                }
                event = stream.next() => {
                    let notification = match event {
                        Some(Ok(Event::Apply(pvc))) | Some(Ok(Event::InitApply(pvc))) => {
                            WatchNotification::Applied(pvc)
                        }
                        Some(Ok(Event::Delete(pvc))) => WatchNotification::Deleted(pvc),
                        Some(Ok(Event::Init)) => continue,
                        Some(Ok(Event::InitDone)) => WatchNotification::Resynced,
                        Some(Err(e)) => {
                            warn!(error = %e, "pvc watch error, watcher will back off");
                            continue;
                        }
                        None => return Ok(()),
                    };
                    if tx.send(notification).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}
