//! ClusterVersion custom resource: the control-plane template a tenant
//! cluster is stamped from, plus the DNS helpers the provisioner uses to
//! wire etcd and the apiserver together inside one super-cluster namespace.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Template describing one versioned tenant control plane
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "tenancy.nestvc.io",
    version = "v1alpha1",
    kind = "ClusterVersion",
    plural = "clusterversions"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterVersionSpec {
    /// etcd component template
    pub etcd: ComponentTemplate,
    /// kube-apiserver component template
    pub api_server: ComponentTemplate,
    /// kube-controller-manager component template
    pub controller_manager: ComponentTemplate,
}

/// One control-plane component: its headless service and workload
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentTemplate {
    /// Name of the component's service
    pub service_name: String,
    /// Name of the component's stateful set
    pub stateful_set_name: String,
    /// Replica count of the stateful set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
}

impl ClusterVersion {
    /// DNS name of the etcd service.
    ///
    /// The apiserver resolves it from inside the same namespace, so the bare
    /// service name is adequate; no `.{namespace}.svc` suffix is needed.
    pub fn etcd_domain(&self) -> &str {
        tracing::debug!(target: "DEBUG-VC", etcd_svc = %self.spec.etcd.service_name, "etcd domain");
        &self.spec.etcd.service_name
    }

    /// Hostnames of the individual etcd pods, one per replica.
    ///
    /// An unset replica count yields an empty list rather than a default of
    /// one; a template without replicas is not runnable yet.
    pub fn etcd_servers(&self) -> Vec<String> {
        let sts = &self.spec.etcd.stateful_set_name;
        let replicas = self.spec.etcd.replicas.unwrap_or(0);
        let servers: Vec<String> = (0..replicas)
            .map(|i| format!("{}-{}.{}", sts, i, self.etcd_domain()))
            .collect();
        tracing::debug!(target: "DEBUG-VC", ?servers, "etcd servers");
        servers
    }

    /// DNS name of the apiserver service within the given namespace.
    pub fn api_server_domain(&self, namespace: &str) -> String {
        let domain = format!("{}.{}", self.spec.api_server.service_name, namespace);
        tracing::debug!(target: "DEBUG-VC", %domain, "apiserver domain");
        domain
    }
}
