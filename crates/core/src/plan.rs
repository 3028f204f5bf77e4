//! Fixed dependency order of the resources one cluster needs.
//!
//! Tiers run in order; descriptors inside a tier are independent of each other.
//!
//! 1. compute cluster (optional)
//! 2. node pool (optional)
//! 3. namespace, storage class
//! 4. headless service, one claim per member
//! 5. stateful workload, or the chart release replacing it

use serde::Serialize;
use serde_json::json;

use crate::{allocate, ClusterSpec, ResourceDescriptor, ResourceKind, CLAIM_TEMPLATE, DATA_CONTAINER, INSTANCE_LABEL, MEMBER_PREFIX};

const DEFAULT_PROVISIONER: &str = "rancher.io/local-path";

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProvisionPlan {
    pub tiers: Vec<Vec<ResourceDescriptor>>,
}

impl ProvisionPlan {
    pub fn new(tiers: Vec<Vec<ResourceDescriptor>>) -> Self {
        Self { tiers: tiers.into_iter().filter(|t| !t.is_empty()).collect() }
    }

    pub fn len(&self) -> usize { self.tiers.iter().map(Vec::len).sum() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn for_cluster(spec: &ClusterSpec) -> Self {
        let scope = spec.scope.as_str();
        let sc = spec.storage_class_name();
        let mut tiers = Vec::new();

        if let Some(compute) = &spec.compute {
            tiers.push(vec![ResourceDescriptor::new(
                ResourceKind::ComputeCluster,
                &compute.cluster_name,
                scope,
                json!({"spec": {"computeClass": spec.compute_class}}),
            )]);
            tiers.push(vec![ResourceDescriptor::new(
                ResourceKind::NodePool,
                format!("{}-pool", compute.cluster_name),
                scope,
                json!({"spec": {"nodeCount": compute.node_count, "computeClass": spec.compute_class}}),
            )]);
        }

        tiers.push(vec![
            ResourceDescriptor::new(ResourceKind::Namespace, scope, scope, json!({})),
            ResourceDescriptor::new(
                ResourceKind::StorageClass,
                &sc,
                scope,
                json!({"provisioner": spec.storage_provisioner.as_deref().unwrap_or(DEFAULT_PROVISIONER)}),
            ),
        ]);

        let mut storage = vec![ResourceDescriptor::new(ResourceKind::Service, scope, scope, service_body(spec))];
        for m in allocate(spec) {
            storage.push(ResourceDescriptor::new(
                ResourceKind::PersistentVolumeClaim,
                claim_name(&m.stable_name),
                scope,
                json!({"spec": claim_spec(spec, &sc)}),
            ));
        }
        tiers.push(storage);

        let workload = match &spec.release {
            Some(rel) => ResourceDescriptor::new(
                ResourceKind::Release,
                &rel.name,
                scope,
                json!({"chart": rel.chart, "version": rel.version, "values": rel.values}),
            ),
            None => ResourceDescriptor::new(ResourceKind::StatefulSet, MEMBER_PREFIX, scope, stateful_set_body(spec, &sc)),
        };
        tiers.push(vec![workload]);

        Self::new(tiers)
    }
}

/// `data-member-<n>`: the name the stateful set's claim template resolves to.
pub fn claim_name(stable_name: &str) -> String {
    format!("{}-{}", CLAIM_TEMPLATE, stable_name)
}

fn claim_spec(spec: &ClusterSpec, sc: &str) -> serde_json::Value {
    json!({
        "accessModes": ["ReadWriteOnce"],
        "storageClassName": sc,
        "resources": {"requests": {"storage": spec.storage_size}}
    })
}

// Headless service named after the scope, so `member-<n>.<scope>` resolves from inside the namespace.
fn service_body(spec: &ClusterSpec) -> serde_json::Value {
    json!({
        "spec": {
            "clusterIP": "None",
            "publishNotReadyAddresses": true,
            "selector": {INSTANCE_LABEL: spec.scope},
            "ports": [{"name": "data", "port": spec.data_port}]
        }
    })
}

fn stateful_set_body(spec: &ClusterSpec, sc: &str) -> serde_json::Value {
    json!({
        "spec": {
            "replicas": spec.members,
            "serviceName": spec.scope,
            "podManagementPolicy": "Parallel",
            "selector": {"matchLabels": {INSTANCE_LABEL: spec.scope}},
            "template": {
                "metadata": {"labels": {INSTANCE_LABEL: spec.scope}},
                "spec": {
                    "nodeSelector": {"node.kubernetes.io/instance-type": spec.compute_class},
                    "containers": [{
                        "name": DATA_CONTAINER,
                        "image": spec.image,
                        "args": ["--replSet", spec.replication_set_id, "--bind_ip_all", "--port", spec.data_port.to_string()],
                        "ports": [{"name": "data", "containerPort": spec.data_port}],
                        "volumeMounts": [{"name": CLAIM_TEMPLATE, "mountPath": "/data/db"}]
                    }]
                }
            },
            "volumeClaimTemplates": [{
                "metadata": {"name": CLAIM_TEMPLATE},
                "spec": claim_spec(spec, sc)
            }]
        }
    })
}
