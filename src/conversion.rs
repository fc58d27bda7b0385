//! Conversion layer: tenant identity → super-cluster naming, and virtual
//! object → physical object translation.
//!
//! Everything here is deterministic and side-effect-free. The central
//! correctness property of the whole engine is that the namespace mapping
//! is injective across all tenant clusters sharing one super cluster: two
//! different (tenant, namespace) pairs must never land in the same physical
//! namespace, or their objects would collide.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::{CLUSTER_ANNOTATION, OWNER_UID_ANNOTATION, TENANT_NAMESPACE_ANNOTATION};

/// Maximum length of a Kubernetes namespace name (DNS label)
const MAX_NAMESPACE_LEN: usize = 63;

/// Stable identifier for a tenant cluster, derived from its identity.
///
/// Immutable once assigned. The embedded UID digest is what keeps keys for
/// distinct tenants distinct even when their namespace and name collide
/// (recreate-with-same-name churn included).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClusterKey(String);

impl ClusterKey {
    /// Derive the key from a tenant cluster's namespace, name, and UID.
    pub fn new(namespace: &str, name: &str, uid: &str) -> Self {
        Self(format!(
            "{}-{}-{}",
            namespace,
            &deterministic_hash(uid)[..6],
            name
        ))
    }

    /// The key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Compute the super-cluster namespace backing the given tenant
    /// namespace.
    ///
    /// Injective across (ClusterKey, tenant namespace) pairs: the key embeds
    /// a digest of the tenant cluster's UID, so distinct tenants always get
    /// distinct prefixes, and within one tenant the suffix is the tenant
    /// namespace itself. Overlong results are replaced with a truncated
    /// prefix plus a digest of the full untruncated name, preserving both
    /// the length limit and injectivity.
    pub fn super_cluster_namespace(&self, tenant_namespace: &str) -> String {
        let full = format!("{}-{}", self.0, tenant_namespace);
        if full.len() <= MAX_NAMESPACE_LEN {
            return full;
        }
        let digest = deterministic_hash(&full);
        let prefix_len = MAX_NAMESPACE_LEN - digest.len() - 1;
        let prefix = full[..prefix_len].trim_end_matches('-');
        format!("{}-{}", prefix, digest)
    }
}

impl std::fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compute a deterministic hash of the input, returning a 16-char hex digest.
///
/// Uses truncated SHA-256 for stability across toolchain versions;
/// `DefaultHasher` is not guaranteed stable across Rust releases and this
/// digest is persisted in object names and annotations.
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// Read the ownership marker from a physical object's metadata.
///
/// `None` means the object is foreign: not created by this engine, never
/// mutated or deleted by it.
pub fn owner_uid(meta: &ObjectMeta) -> Option<&str> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(OWNER_UID_ANNOTATION))
        .map(String::as_str)
}

/// Strip cluster-specific metadata so the object can be recreated in the
/// super cluster.
///
/// Removes the fields the source API server owns: uid, resourceVersion,
/// creationTimestamp, managedFields, generation.
pub fn strip_cluster_metadata(meta: &mut ObjectMeta) {
    meta.uid = None;
    meta.resource_version = None;
    meta.creation_timestamp = None;
    meta.managed_fields = None;
    meta.generation = None;
}

/// Convert a virtual PVC into its physical representation.
///
/// Total for well-formed input: a virtual object always carries namespace,
/// name, and UID assigned by its API server; their absence is a programmer
/// error surfaced by the caller as a malformed key, not here.
pub fn to_physical_pvc(vpvc: &PersistentVolumeClaim, key: &ClusterKey) -> PersistentVolumeClaim {
    let tenant_ns = vpvc.metadata.namespace.as_deref().unwrap_or_default();

    let mut annotations: BTreeMap<String, String> =
        vpvc.metadata.annotations.clone().unwrap_or_default();
    annotations.insert(
        OWNER_UID_ANNOTATION.to_string(),
        vpvc.metadata.uid.clone().unwrap_or_default(),
    );
    annotations.insert(CLUSTER_ANNOTATION.to_string(), key.to_string());
    annotations.insert(TENANT_NAMESPACE_ANNOTATION.to_string(), tenant_ns.to_string());

    let mut metadata = ObjectMeta {
        name: vpvc.metadata.name.clone(),
        namespace: Some(key.super_cluster_namespace(tenant_ns)),
        labels: vpvc.metadata.labels.clone(),
        annotations: Some(annotations),
        ..Default::default()
    };
    strip_cluster_metadata(&mut metadata);

    PersistentVolumeClaim {
        metadata,
        spec: vpvc.spec.clone(),
        // Status flows the other way (super → tenant) and only through UWS
        status: None,
    }
}

/// Extract the reverse-propagated status subset of a physical PVC.
///
/// For PVCs this is the phase only; it is the single field eligible for
/// upward writes, and only under the phase-sync feature gate.
pub fn status_phase(pvc: &PersistentVolumeClaim) -> Option<&str> {
    pvc.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
}

/// Compare the converted physical spec against the live physical spec.
///
/// Drives the DWS fixed point: an update is issued only when this returns
/// false.
pub fn pvc_specs_equal(desired: &PersistentVolumeClaim, live: &PersistentVolumeClaim) -> bool {
    desired.spec == live.spec
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PersistentVolumeClaimSpec;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use std::collections::HashSet;

    fn vpvc(namespace: &str, name: &str, uid: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                uid: Some(uid.to_string()),
                resource_version: Some("42".to_string()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                storage_class_name: Some("storage-class-1".to_string()),
                volume_name: Some("volume-1".to_string()),
                resources: Some(k8s_openapi::api::core::v1::VolumeResourceRequirements {
                    requests: Some(
                        [("storage".to_string(), Quantity("20Gi".to_string()))]
                            .into_iter()
                            .collect(),
                    ),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: None,
        }
    }

    #[test]
    fn cluster_key_is_stable_and_uid_scoped() {
        let a = ClusterKey::new("tenant-1", "test", "7374a172-c35d-45b1-9c8e-bf5c5b614937");
        let b = ClusterKey::new("tenant-1", "test", "7374a172-c35d-45b1-9c8e-bf5c5b614937");
        assert_eq!(a, b);

        // Same namespace/name but a recreated tenant (new UID) gets a new key
        let c = ClusterKey::new("tenant-1", "test", "00000000-0000-0000-0000-000000000000");
        assert_ne!(a, c);
    }

    #[test]
    fn namespace_mapping_is_injective_over_generated_pairs() {
        // Generated (tenant identity, namespace) pairs must map to pairwise
        // distinct super namespaces. UIDs are unique per tenant by backend
        // contract, which is what anchors the proof.
        let mut seen: HashSet<String> = HashSet::new();
        let mut total = 0usize;
        for t in 0..20usize {
            let key = ClusterKey::new(
                &format!("tenant-{}", t % 5),
                &format!("vc-{}", t),
                &format!("uid-{:08}", t.wrapping_mul(2654435761)),
            );
            for ns in ["default", "kube-system", "apps", "really-long-namespace-name-x"] {
                let mapped = key.super_cluster_namespace(ns);
                assert!(mapped.len() <= MAX_NAMESPACE_LEN, "{} too long", mapped);
                assert!(seen.insert(mapped), "collision for ({}, {})", key, ns);
                total += 1;
            }
        }
        assert_eq!(seen.len(), total);
    }

    #[test]
    fn overlong_namespaces_are_digest_truncated() {
        let key = ClusterKey::new(
            "a-very-long-tenant-namespace-indeed",
            "cluster-with-a-long-name",
            "uid-1",
        );
        let ns = key.super_cluster_namespace("an-equally-long-tenant-namespace");
        assert!(ns.len() <= MAX_NAMESPACE_LEN);

        // Deterministic: same input, same output
        assert_eq!(ns, key.super_cluster_namespace("an-equally-long-tenant-namespace"));

        // Distinct overlong inputs stay distinct
        let other = key.super_cluster_namespace("an-equally-long-tenant-namespacf");
        assert_ne!(ns, other);
    }

    #[test]
    fn physical_pvc_carries_ownership_markers() {
        let key = ClusterKey::new("tenant-1", "test", "7374a172");
        let v = vpvc("default", "pvc-1", "12345");
        let p = to_physical_pvc(&v, &key);

        assert_eq!(p.metadata.name.as_deref(), Some("pvc-1"));
        assert_eq!(
            p.metadata.namespace.as_deref(),
            Some(key.super_cluster_namespace("default").as_str())
        );
        assert_eq!(owner_uid(&p.metadata), Some("12345"));

        let annotations = p.metadata.annotations.as_ref().unwrap();
        assert_eq!(annotations.get(CLUSTER_ANNOTATION), Some(&key.to_string()));
        assert_eq!(
            annotations.get(TENANT_NAMESPACE_ANNOTATION),
            Some(&"default".to_string())
        );
    }

    #[test]
    fn conversion_strips_cluster_specific_metadata() {
        let key = ClusterKey::new("tenant-1", "test", "7374a172");
        let p = to_physical_pvc(&vpvc("default", "pvc-1", "12345"), &key);
        assert!(p.metadata.uid.is_none());
        assert!(p.metadata.resource_version.is_none());
        assert!(p.metadata.managed_fields.is_none());
        assert!(p.status.is_none());
    }

    #[test]
    fn conversion_is_deterministic_and_spec_preserving() {
        let key = ClusterKey::new("tenant-1", "test", "7374a172");
        let v = vpvc("default", "pvc-1", "12345");
        let p1 = to_physical_pvc(&v, &key);
        let p2 = to_physical_pvc(&v, &key);
        assert_eq!(p1, p2);
        assert!(pvc_specs_equal(&p1, &v));
    }

    #[test]
    fn foreign_objects_have_no_owner() {
        let meta = ObjectMeta {
            name: Some("pvc-1".to_string()),
            ..Default::default()
        };
        assert_eq!(owner_uid(&meta), None);
    }

    #[test]
    fn status_subset_is_the_phase() {
        let mut p = vpvc("default", "pvc-1", "12345");
        assert_eq!(status_phase(&p), None);
        p.status = Some(k8s_openapi::api::core::v1::PersistentVolumeClaimStatus {
            phase: Some("Bound".to_string()),
            ..Default::default()
        });
        assert_eq!(status_phase(&p), Some("Bound"));
    }
}
