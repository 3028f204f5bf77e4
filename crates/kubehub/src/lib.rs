//! Keel kubehub: [`ControlPlane`] over the Kubernetes API.
//!
//! Resources are handled as `DynamicObject`s resolved through discovery, so the same
//! describe/create path serves every supported kind. Kinds with no Kubernetes mapping
//! (compute clusters, node pools, chart releases) are reported as unsupported.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use keel_core::ports::{ControlPlane, ReadinessTarget};
use keel_core::{InfraError, ResourceDescriptor, ResourceKey, ResourceKind, CLAIM_TEMPLATE, INSTANCE_LABEL, MEMBER_PREFIX};
use kube::{
    api::{Api, ListParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::histogram;
use tokio::sync::Mutex;
use tracing::{debug, info};

const MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// `v1/Kind` or `group/v1/Kind` for kinds this backend can create.
pub fn gvk_key(kind: ResourceKind) -> Option<&'static str> {
    match kind {
        ResourceKind::Namespace => Some("v1/Namespace"),
        ResourceKind::StorageClass => Some("storage.k8s.io/v1/StorageClass"),
        ResourceKind::Service => Some("v1/Service"),
        ResourceKind::PersistentVolumeClaim => Some("v1/PersistentVolumeClaim"),
        ResourceKind::StatefulSet => Some("apps/v1/StatefulSet"),
        ResourceKind::ComputeCluster | ResourceKind::NodePool | ResourceKind::Release => None,
    }
}

fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() }),
        [group, version, kind] => Ok(GroupVersionKind { group: (*group).to_string(), version: (*version).to_string(), kind: (*kind).to_string() }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

/// Control plane backed by a kube client. Discovery results are cached per kind.
pub struct KubeControlPlane {
    client: Client,
    resolved: Mutex<HashMap<ResourceKind, (ApiResource, bool)>>,
}

impl KubeControlPlane {
    pub fn new(client: Client) -> Self {
        Self { client, resolved: Mutex::new(HashMap::new()) }
    }

    /// Client from the ambient kubeconfig or in-cluster environment.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        Ok(Self::new(client))
    }

    async fn resolve(&self, kind: ResourceKind) -> Result<(ApiResource, bool), InfraError> {
        let key = gvk_key(kind).ok_or_else(|| InfraError::Unsupported(format!("{} has no Kubernetes mapping", kind)))?;
        let mut cache = self.resolved.lock().await;
        if let Some(hit) = cache.get(&kind) {
            return Ok(hit.clone());
        }
        let started = Instant::now();
        let gvk = parse_gvk_key(key).map_err(|e| InfraError::Unsupported(e.to_string()))?;
        let found = find_api_resource(self.client.clone(), &gvk)
            .await
            .map_err(|e| InfraError::Transient(format!("discovery for {}: {:#}", key, e)))?;
        histogram!("kubehub_discovery_ms", started.elapsed().as_secs_f64() * 1000.0, "kind" => kind.as_str());
        debug!(kind = %kind, plural = %found.0.plural, namespaced = found.1, "resolved api resource");
        cache.insert(kind, found.clone());
        Ok(found)
    }

    async fn api_for(&self, key: &ResourceKey) -> Result<Api<DynamicObject>, InfraError> {
        let (ar, namespaced) = self.resolve(key.kind).await?;
        Ok(if namespaced {
            Api::namespaced_with(self.client.clone(), &key.scope, &ar)
        } else {
            Api::all_with(self.client.clone(), &ar)
        })
    }
}

#[async_trait]
impl ControlPlane for KubeControlPlane {
    async fn describe(&self, key: &ResourceKey) -> Result<Option<serde_json::Value>, InfraError> {
        let api = self.api_for(key).await?;
        let found = api.get_opt(&key.name).await.map_err(classify)?;
        match found {
            Some(obj) => serde_json::to_value(&obj)
                .map(Some)
                .map_err(|e| InfraError::Transient(format!("serializing {}: {}", key, e))),
            None => Ok(None),
        }
    }

    async fn create(&self, desc: &ResourceDescriptor) -> Result<(), InfraError> {
        let (ar, namespaced) = self.resolve(desc.key.kind).await?;
        let api = self.api_for(&desc.key).await?;
        let manifest = manifest(desc, &ar, namespaced);
        let obj: DynamicObject = serde_json::from_value(manifest)
            .map_err(|e| InfraError::Unsupported(format!("{} is not a valid object: {}", desc.key, e)))?;
        api.create(&PostParams::default(), &obj).await.map_err(classify)?;
        info!(resource = %desc.key, "object created");
        Ok(())
    }

    async fn count_ready(&self, scope: &str, target: ReadinessTarget) -> Result<usize, InfraError> {
        match target {
            ReadinessTarget::SchedulableMembers => {
                let api: Api<Pod> = Api::namespaced(self.client.clone(), scope);
                let lp = ListParams::default().labels(&format!("{}={}", INSTANCE_LABEL, scope));
                let pods = api.list(&lp).await.map_err(classify)?;
                Ok(pods.items.iter().filter(|p| pod_is_ready(p)).count())
            }
            ReadinessTarget::BoundClaims => {
                let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), scope);
                let claims = api.list(&ListParams::default()).await.map_err(classify)?;
                Ok(claims.items.iter().filter(|c| is_member_claim(c) && claim_is_bound(c)).count())
            }
        }
    }
}

/// Full object for `desc`: type meta and our labels around the descriptor body.
pub fn manifest(desc: &ResourceDescriptor, ar: &ApiResource, namespaced: bool) -> serde_json::Value {
    let mut obj = match &desc.body {
        serde_json::Value::Object(m) => m.clone(),
        _ => serde_json::Map::new(),
    };
    let mut meta = serde_json::json!({
        "name": desc.key.name,
        "labels": { INSTANCE_LABEL: desc.key.scope, MANAGED_BY: "keel" },
    });
    if namespaced {
        meta["namespace"] = serde_json::Value::String(desc.key.scope.clone());
    }
    obj.insert("apiVersion".into(), serde_json::Value::String(ar.api_version.clone()));
    obj.insert("kind".into(), serde_json::Value::String(ar.kind.clone()));
    obj.insert("metadata".into(), meta);
    serde_json::Value::Object(obj)
}

/// Running with the Ready condition true.
pub fn pod_is_ready(p: &Pod) -> bool {
    let Some(status) = &p.status else { return false };
    let running = status.phase.as_deref() == Some("Running");
    let ready = status
        .conditions
        .as_ref()
        .map(|cs| cs.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
        .unwrap_or(false);
    running && ready
}

pub fn claim_is_bound(c: &PersistentVolumeClaim) -> bool {
    c.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Bound")
}

fn is_member_claim(c: &PersistentVolumeClaim) -> bool {
    let prefix = format!("{}-{}-", CLAIM_TEMPLATE, MEMBER_PREFIX);
    c.metadata.name.as_deref().map(|n| n.starts_with(&prefix)).unwrap_or(false)
}

fn classify(e: kube::Error) -> InfraError {
    match e {
        kube::Error::Api(ae) if ae.code == 409 => InfraError::AlreadyExists,
        kube::Error::Api(ae) if ae.code == 403 || ae.code == 422 => {
            InfraError::Unsupported(format!("{} ({}): {}", ae.reason, ae.code, ae.message))
        }
        other => InfraError::Transient(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod(phase: &str, ready: &str) -> Pod {
        serde_json::from_value(json!({
            "metadata": {"name": "member-0"},
            "status": {"phase": phase, "conditions": [{"type": "Ready", "status": ready}]}
        }))
        .unwrap()
    }

    fn claim(name: &str, phase: &str) -> PersistentVolumeClaim {
        serde_json::from_value(json!({"metadata": {"name": name}, "status": {"phase": phase}})).unwrap()
    }

    #[test]
    fn every_kind_maps_or_is_unsupported() {
        assert_eq!(gvk_key(ResourceKind::StatefulSet), Some("apps/v1/StatefulSet"));
        assert!(gvk_key(ResourceKind::Release).is_none());
        assert!(gvk_key(ResourceKind::NodePool).is_none());
        let gvk = parse_gvk_key(gvk_key(ResourceKind::StorageClass).unwrap()).unwrap();
        assert_eq!((gvk.group.as_str(), gvk.version.as_str(), gvk.kind.as_str()), ("storage.k8s.io", "v1", "StorageClass"));
        let core = parse_gvk_key("v1/Namespace").unwrap();
        assert_eq!(core.group, "");
        assert!(parse_gvk_key("a/b/c/d").is_err());
    }

    #[test]
    fn manifest_wraps_body_with_type_meta_and_labels() {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "PersistentVolumeClaim"));
        let desc = ResourceDescriptor::new(
            ResourceKind::PersistentVolumeClaim,
            "data-member-0",
            "test",
            json!({"spec": {"resources": {"requests": {"storage": "10Gi"}}}}),
        );
        let m = manifest(&desc, &ar, true);
        assert_eq!(m["apiVersion"], "v1");
        assert_eq!(m["kind"], "PersistentVolumeClaim");
        assert_eq!(m["metadata"]["namespace"], "test");
        assert_eq!(m["metadata"]["labels"][INSTANCE_LABEL], "test");
        assert_eq!(m["spec"]["resources"]["requests"]["storage"], "10Gi");
        let obj: DynamicObject = serde_json::from_value(m).unwrap();
        assert_eq!(obj.metadata.name.as_deref(), Some("data-member-0"));

        let ns = ResourceDescriptor::new(ResourceKind::Namespace, "test", "test", json!({}));
        let ns_ar = ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "Namespace"));
        assert!(manifest(&ns, &ns_ar, false)["metadata"].get("namespace").is_none());
    }

    #[test]
    fn readiness_predicates() {
        assert!(pod_is_ready(&pod("Running", "True")));
        assert!(!pod_is_ready(&pod("Running", "False")));
        assert!(!pod_is_ready(&pod("Pending", "True")));
        assert!(claim_is_bound(&claim("data-member-0", "Bound")));
        assert!(!claim_is_bound(&claim("data-member-0", "Pending")));
        assert!(is_member_claim(&claim("data-member-2", "Bound")));
        assert!(!is_member_claim(&claim("scratch", "Bound")));
    }
}
