//! Listener address resolution
//!
//! A NodePort service is reachable on every node, so the registrar only needs
//! one node address. Selection is deterministic: nodes are ordered by name
//! before any policy is applied, so two reconciliations over the same node
//! set always agree. [`NodeSelector::Index`] is the exception and exists only
//! for registrars that were provisioned against a fixed node position.

use std::fmt;
use std::str::FromStr;

use tracing::{debug, warn};

use crate::error::Error;
use crate::types::NodeRecord;

/// Node role labels that mark control plane nodes
const CONTROL_PLANE_LABELS: &[&str] = &[
    "node-role.kubernetes.io/control-plane",
    "node-role.kubernetes.io/master",
];

/// Policy for choosing which node's address is announced
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum NodeSelector {
    /// First schedulable non-control-plane node that carries the annotation
    #[default]
    Worker,
    /// First node with a matching label (any value when `value` is None)
    Label {
        /// Label key
        key: String,
        /// Required label value
        value: Option<String>,
    },
    /// Node at a fixed position in listing order
    Index(usize),
}

impl fmt::Display for NodeSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeSelector::Worker => f.write_str("worker"),
            NodeSelector::Label { key, value: None } => write!(f, "label:{key}"),
            NodeSelector::Label {
                key,
                value: Some(v),
            } => write!(f, "label:{key}={v}"),
            NodeSelector::Index(i) => write!(f, "index:{i}"),
        }
    }
}

impl FromStr for NodeSelector {
    type Err = String;

    /// Parse `worker`, `label:<key>[=<value>]` or `index:<n>`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "worker" {
            return Ok(NodeSelector::Worker);
        }
        if let Some(rest) = s.strip_prefix("label:") {
            let (key, value) = match rest.split_once('=') {
                Some((k, v)) => (k, Some(v.to_string())),
                None => (rest, None),
            };
            if key.is_empty() {
                return Err("label selector requires a key".to_string());
            }
            return Ok(NodeSelector::Label {
                key: key.to_string(),
                value,
            });
        }
        if let Some(rest) = s.strip_prefix("index:") {
            return rest
                .parse::<usize>()
                .map(NodeSelector::Index)
                .map_err(|e| format!("invalid node index '{rest}': {e}"));
        }
        Err(format!(
            "invalid node selector '{s}' (expected worker, label:<key>[=<value>] or index:<n>)"
        ))
    }
}

/// Resolves the listener IP announced to the registrar
#[derive(Clone, Debug)]
pub struct AddressResolver {
    selector: NodeSelector,
    annotation: String,
}

impl AddressResolver {
    /// Create a resolver reading `annotation` from nodes chosen by `selector`
    pub fn new(selector: NodeSelector, annotation: impl Into<String>) -> Self {
        Self {
            selector,
            annotation: annotation.into(),
        }
    }

    /// The annotation key holding the node's public address
    pub fn annotation(&self) -> &str {
        &self.annotation
    }

    /// Pick a listener address from `nodes`
    ///
    /// Never panics on an empty or short node list; every miss is an
    /// [`Error::AddressResolution`].
    pub fn resolve(&self, nodes: &[NodeRecord]) -> Result<String, Error> {
        if nodes.is_empty() {
            return Err(Error::address_resolution("cluster reported no nodes"));
        }

        let node = match &self.selector {
            NodeSelector::Index(i) => {
                warn!(
                    index = *i,
                    "resolving listener address by node position; listing order is not stable"
                );
                nodes.get(*i).ok_or_else(|| {
                    Error::address_resolution(format!(
                        "node index {} out of range ({} nodes)",
                        i,
                        nodes.len()
                    ))
                })?
            }
            NodeSelector::Worker => self.select_worker(nodes)?,
            NodeSelector::Label { key, value } => self
                .sorted(nodes)
                .into_iter()
                .find(|n| match (n.labels.get(key), value) {
                    (Some(_), None) => true,
                    (Some(actual), Some(expected)) => actual == expected,
                    (None, _) => false,
                })
                .ok_or_else(|| {
                    Error::address_resolution(format!(
                        "no node matches selector {}",
                        self.selector
                    ))
                })?,
        };

        let address = self.address_of(node).ok_or_else(|| {
            Error::address_resolution(format!(
                "node {} has no {} annotation",
                node.name, self.annotation
            ))
        })?;

        debug!(node = %node.name, address = %address, "resolved listener address");
        Ok(address.to_string())
    }

    /// First annotated worker; single-node clusters fall back to any
    /// schedulable annotated node, control plane included
    fn select_worker<'a>(&self, nodes: &'a [NodeRecord]) -> Result<&'a NodeRecord, Error> {
        let sorted = self.sorted(nodes);
        let annotated = |n: &&NodeRecord| !n.unschedulable && self.address_of(n).is_some();

        if let Some(node) = sorted.iter().copied().filter(annotated).find(|n| is_worker(n)) {
            return Ok(node);
        }

        let fallback = sorted.iter().copied().find(annotated).ok_or_else(|| {
            Error::address_resolution(format!(
                "no schedulable node carries annotation {}",
                self.annotation
            ))
        })?;
        warn!(
            node = %fallback.name,
            "no annotated worker node, using a control-plane node"
        );
        Ok(fallback)
    }

    fn sorted<'a>(&self, nodes: &'a [NodeRecord]) -> Vec<&'a NodeRecord> {
        let mut sorted: Vec<&NodeRecord> = nodes.iter().collect();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));
        sorted
    }

    fn address_of<'a>(&self, node: &'a NodeRecord) -> Option<&'a str> {
        node.annotations
            .get(&self.annotation)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }
}

fn is_worker(node: &NodeRecord) -> bool {
    !node.unschedulable
        && !CONTROL_PLANE_LABELS
            .iter()
            .any(|l| node.labels.contains_key(*l))
}
