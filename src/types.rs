//! Typed views of the cluster objects the registrar cares about
//!
//! Services and nodes are read from the API server as `k8s-openapi` objects
//! and immediately narrowed to these types, so the reconciler never touches
//! raw object metadata.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::core::v1::{Node, Service};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};

/// Identifies a Service within the cluster
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceIdentity {
    /// Namespace the Service lives in
    pub namespace: String,
    /// Service name
    pub name: String,
}

impl ServiceIdentity {
    /// Create a new identity
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// How a Service is exposed (`spec.type`)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExposureType {
    /// Cluster-internal virtual IP
    ClusterIP,
    /// Static port on every node
    NodePort,
    /// Provisioned by an external load balancer
    LoadBalancer,
    /// DNS CNAME to an external name
    ExternalName,
}

impl ExposureType {
    /// Return the Kubernetes spelling of this type
    pub fn as_str(&self) -> &'static str {
        match self {
            ExposureType::ClusterIP => "ClusterIP",
            ExposureType::NodePort => "NodePort",
            ExposureType::LoadBalancer => "LoadBalancer",
            ExposureType::ExternalName => "ExternalName",
        }
    }
}

impl fmt::Display for ExposureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExposureType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ClusterIP" => Ok(ExposureType::ClusterIP),
            "NodePort" => Ok(ExposureType::NodePort),
            "LoadBalancer" => Ok(ExposureType::LoadBalancer),
            "ExternalName" => Ok(ExposureType::ExternalName),
            other => Err(format!("unknown service type: {other}")),
        }
    }
}

/// Point-in-time view of a Service
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceSnapshot {
    /// Namespace and name
    pub identity: ServiceIdentity,
    /// Object UID, used to tell a terminating object from a re-created one
    pub uid: Option<String>,
    /// Resource version at the time the snapshot was taken
    pub resource_version: Option<String>,
    /// Exposure type; `None` when the type is unrecognized
    pub exposure: Option<ExposureType>,
}

impl ServiceSnapshot {
    /// Build a snapshot from a Service object
    ///
    /// A Service without `spec.type` is `ClusterIP`, matching the API server
    /// default. Objects without a namespace are placed in `default`.
    pub fn from_service(svc: &Service) -> Self {
        let namespace = svc.namespace().unwrap_or_else(|| "default".to_string());
        let exposure = match svc.spec.as_ref().and_then(|s| s.type_.as_deref()) {
            None => Some(ExposureType::ClusterIP),
            Some(t) => t.parse().ok(),
        };

        Self {
            identity: ServiceIdentity::new(namespace, svc.name_any()),
            uid: svc.metadata.uid.clone(),
            resource_version: svc.metadata.resource_version.clone(),
            exposure,
        }
    }

    /// True when the Service is known to be a NodePort service
    pub fn is_node_port(&self) -> bool {
        self.exposure == Some(ExposureType::NodePort)
    }
}

/// Node fields used for listener address resolution
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeRecord {
    /// Node name
    pub name: String,
    /// Node labels
    pub labels: BTreeMap<String, String>,
    /// Node annotations (the listener IP lives here)
    pub annotations: BTreeMap<String, String>,
    /// `spec.unschedulable`
    pub unschedulable: bool,
}

impl NodeRecord {
    /// Build a record from a Node object
    pub fn from_node(node: &Node) -> Self {
        Self {
            name: node.name_any(),
            labels: node.metadata.labels.clone().unwrap_or_default(),
            annotations: node.metadata.annotations.clone().unwrap_or_default(),
            unschedulable: node
                .spec
                .as_ref()
                .and_then(|s| s.unschedulable)
                .unwrap_or(false),
        }
    }
}
