//! nodeport-registrar - announces Kubernetes NodePort services to an external registrar
//!
//! The controller watches Services and keeps an external load-balancer
//! registry in step with the cluster: a NodePort Service is registered with a
//! node's public address when it appears and withdrawn when it goes away.
//!
//! # Architecture
//!
//! ```text
//! Service watch -> EventNormalizer -> Dispatcher (per-service shards)
//!                                          |
//!                                     Reconciler -> get Service / list Nodes
//!                                          |
//!                                     Registrar (POST /services/register|registercancel)
//! ```
//!
//! # Modules
//!
//! - [`event`] - Service watch subscription and event normalization
//! - [`dispatch`] - Identity-partitioned worker pool
//! - [`controller`] - Registration reconciler
//! - [`resolver`] - Listener address selection from the node set
//! - [`registrar`] - Registrar HTTP client
//! - [`cluster`] - Kubernetes reads and client construction
//! - [`health`] - Reconciliation health and HTTP probes
//! - [`config`] - Command-line configuration
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod cluster;
pub mod config;
pub mod controller;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod health;
pub mod registrar;
pub mod resolver;
pub mod retry;
pub mod telemetry;
pub mod types;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Default registrar base URL
pub const DEFAULT_REGISTRAR_URL: &str = "http://127.0.0.1:5000";

/// Node annotation flannel sets to the node's public address
pub const PUBLIC_IP_ANNOTATION: &str = "flannel.alpha.coreos.com/public-ip";

/// Consecutive failures before the controller reports unready
pub const DEFAULT_FAILURE_THRESHOLD: u64 = 5;
