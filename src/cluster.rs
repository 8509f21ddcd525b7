//! Control plane access
//!
//! The reconciler reads two things from the API server: the live Service
//! behind an event and the current node set. Both reads bypass any cache so
//! decisions reflect the cluster at handling time.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Service};
use kube::api::{Api, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::error::Error;
use crate::types::{NodeRecord, ServiceSnapshot};

/// Trait abstracting the Kubernetes reads the reconciler performs
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch the current Service, `None` if it no longer exists
    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceSnapshot>, Error>;

    /// List every node in the cluster
    async fn list_nodes(&self) -> Result<Vec<NodeRecord>, Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Create a new KubeClusterClient wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceSnapshot>, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let svc = api
            .get_opt(name)
            .await
            .map_err(|e| Error::kube("get-service", e))?;
        Ok(svc.as_ref().map(ServiceSnapshot::from_service))
    }

    async fn list_nodes(&self) -> Result<Vec<NodeRecord>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::kube("list-nodes", e))?;
        Ok(nodes.items.iter().map(NodeRecord::from_node).collect())
    }
}

/// Where the Kubernetes client configuration comes from
#[derive(Clone, Debug, Default)]
pub struct ClientSettings {
    /// Explicit kubeconfig file or path list; `None` infers the config
    /// (`KUBECONFIG`, then `$HOME/.kube/config`, then in-cluster)
    pub kubeconfig: Option<PathBuf>,
    /// Kubeconfig context override
    pub context: Option<String>,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Read timeout; must exceed the watch timeout
    pub read_timeout: Duration,
}

/// Read a kubeconfig file, or merge every file of a path list
///
/// Lists use the platform separator (`:` on Unix), the same format as
/// `KUBECONFIG`. Earlier files win on conflicting entries.
pub fn load_kubeconfig(paths: &Path) -> Result<Kubeconfig, Error> {
    let mut merged: Option<Kubeconfig> = None;
    for path in std::env::split_paths(paths.as_os_str()) {
        if path.as_os_str().is_empty() {
            continue;
        }
        debug!(path = %path.display(), "loading kubeconfig");
        let next = Kubeconfig::read_from(&path).map_err(|e| {
            Error::client_config(format!("failed to read {}: {e}", path.display()))
        })?;
        merged = Some(match merged {
            Some(current) => current
                .merge(next)
                .map_err(|e| Error::client_config(format!("failed to merge kubeconfigs: {e}")))?,
            None => next,
        });
    }
    merged.ok_or_else(|| {
        Error::client_config(format!("no kubeconfig files in {}", paths.display()))
    })
}

/// Build a Kubernetes client and verify the API server answers
pub async fn build_client(settings: &ClientSettings) -> Result<Client, Error> {
    let options = KubeConfigOptions {
        context: settings.context.clone(),
        ..Default::default()
    };

    let mut config = match (&settings.kubeconfig, &settings.context) {
        (Some(paths), _) => {
            let kubeconfig = load_kubeconfig(paths)?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .map_err(|e| Error::client_config(e.to_string()))?
        }
        (None, Some(_)) => kube::Config::from_kubeconfig(&options)
            .await
            .map_err(|e| Error::client_config(e.to_string()))?,
        (None, None) => kube::Config::infer()
            .await
            .map_err(|e| Error::client_config(e.to_string()))?,
    };

    config.connect_timeout = Some(settings.connect_timeout);
    config.read_timeout = Some(settings.read_timeout);

    let client = Client::try_from(config).map_err(|e| Error::client_config(e.to_string()))?;

    let version = client
        .apiserver_version()
        .await
        .map_err(|e| Error::kube("apiserver-version", e))?;
    info!(
        version = %version.git_version,
        kubeconfig = ?settings.kubeconfig,
        "connected to control plane"
    );

    Ok(client)
}
