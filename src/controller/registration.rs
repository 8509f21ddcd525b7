//! Registration reconciler
//!
//! Each event is handled on its own: read the live Service, decide whether it
//! is externally reachable through a NodePort, resolve a listener address from
//! the current node set and call the registrar. Nothing about past
//! registrations is remembered, so replaying an event replays the call.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, instrument, warn};

use crate::cluster::ClusterClient;
use crate::dispatch::EventHandler;
use crate::error::Error;
use crate::event::ServiceEvent;
use crate::health::HealthState;
use crate::registrar::{RegistrarAction, RegistrationRequest, Registrar};
use crate::resolver::AddressResolver;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::types::{ExposureType, ServiceIdentity, ServiceSnapshot};

/// Why an event produced no registrar call
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// Service is not a NodePort service (`None` = unrecognized type)
    NotNodePort(Option<ExposureType>),
    /// Service no longer exists
    NotFound,
    /// Update did not change NodePort-ness
    Unchanged,
}

/// Result of handling one event
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Register call accepted
    Registered {
        /// Announced listener address
        listener_ip: String,
    },
    /// Unregister call accepted
    Unregistered {
        /// Withdrawn listener address
        listener_ip: String,
    },
    /// Nothing to do
    Skipped(SkipReason),
}

/// Controller context containing injected clients and policy
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```ignore
/// let ctx = Context::builder(cluster, registrar)
///     .resolver(AddressResolver::new(NodeSelector::Worker, PUBLIC_IP_ANNOTATION))
///     .retry(RetryConfig::with_max_attempts(5))
///     .build();
/// ```
pub struct Context {
    /// Kubernetes reads (trait object for testability)
    pub cluster: Arc<dyn ClusterClient>,
    /// Registrar calls (trait object for testability)
    pub registrar: Arc<dyn Registrar>,
    /// Listener address policy
    pub resolver: AddressResolver,
    /// Backoff for control plane and registrar calls
    pub retry: RetryConfig,
    /// Health counters
    pub health: Arc<HealthState>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(cluster: Arc<dyn ClusterClient>, registrar: Arc<dyn Registrar>) -> ContextBuilder {
        ContextBuilder::new(cluster, registrar)
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    cluster: Arc<dyn ClusterClient>,
    registrar: Arc<dyn Registrar>,
    resolver: Option<AddressResolver>,
    retry: RetryConfig,
    health: Option<Arc<HealthState>>,
}

impl ContextBuilder {
    /// Start a builder with the two required clients
    pub fn new(cluster: Arc<dyn ClusterClient>, registrar: Arc<dyn Registrar>) -> Self {
        Self {
            cluster,
            registrar,
            resolver: None,
            retry: RetryConfig::default(),
            health: None,
        }
    }

    /// Set the listener address policy
    pub fn resolver(mut self, resolver: AddressResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Set the retry policy
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Share an existing health state
    pub fn health(mut self, health: Arc<HealthState>) -> Self {
        self.health = Some(health);
        self
    }

    /// Build the context
    pub fn build(self) -> Context {
        Context {
            cluster: self.cluster,
            registrar: self.registrar,
            resolver: self.resolver.unwrap_or_else(|| {
                AddressResolver::new(Default::default(), crate::PUBLIC_IP_ANNOTATION)
            }),
            retry: self.retry,
            health: self
                .health
                .unwrap_or_else(|| Arc::new(HealthState::new(crate::DEFAULT_FAILURE_THRESHOLD))),
        }
    }
}

/// Handle one normalized event
pub async fn reconcile(event: &ServiceEvent, ctx: &Context) -> Result<Outcome, Error> {
    match event {
        ServiceEvent::Created(snapshot) => on_service_created(&snapshot.identity, ctx).await,
        ServiceEvent::Updated(old, new) => on_service_updated(old, new, ctx).await,
        ServiceEvent::Deleted(snapshot) => on_service_deleted(snapshot, ctx).await,
    }
}

/// A Service appeared or exists at subscription time
///
/// The live object decides: a Service that was changed or removed since the
/// event was emitted is judged by what the API server returns now.
#[instrument(skip(ctx), fields(service = %identity))]
pub async fn on_service_created(
    identity: &ServiceIdentity,
    ctx: &Context,
) -> Result<Outcome, Error> {
    let Some(live) = fetch_service(identity, ctx).await? else {
        debug!("service gone before it could be registered");
        return Ok(Outcome::Skipped(SkipReason::NotFound));
    };

    if !live.is_node_port() {
        debug!(exposure = ?live.exposure, "not a NodePort service");
        return Ok(Outcome::Skipped(SkipReason::NotNodePort(live.exposure)));
    }

    announce(RegistrarAction::Register, &live.identity, ctx).await
}

/// A Service was deleted
///
/// The live object is normally gone by now. It is only trusted when it still
/// exists with the same UID (terminating behind a finalizer); otherwise the
/// final snapshot carried by the event decides. An unrecognized exposure is
/// treated as possibly NodePort and unregistered.
#[instrument(skip(deleted, ctx), fields(service = %deleted.identity))]
pub async fn on_service_deleted(
    deleted: &ServiceSnapshot,
    ctx: &Context,
) -> Result<Outcome, Error> {
    let live = match fetch_service(&deleted.identity, ctx).await {
        Ok(live) => live,
        Err(e) => {
            warn!(error = %e, "live lookup failed, using deleted snapshot");
            None
        }
    };

    let exposure = match live {
        Some(live) if live.uid.is_some() && live.uid == deleted.uid => live.exposure,
        _ => deleted.exposure,
    };

    match exposure {
        Some(ExposureType::NodePort) => {}
        Some(other) => {
            debug!(exposure = %other, "deleted service was not NodePort");
            return Ok(Outcome::Skipped(SkipReason::NotNodePort(Some(other))));
        }
        None => warn!("deleted service has unknown exposure, unregistering anyway"),
    }

    announce(RegistrarAction::Unregister, &deleted.identity, ctx).await
}

/// A Service changed
///
/// Only a change of NodePort-ness matters: becoming NodePort registers,
/// leaving NodePort unregisters.
#[instrument(skip(old, new, ctx), fields(service = %new.identity))]
pub async fn on_service_updated(
    old: &ServiceSnapshot,
    new: &ServiceSnapshot,
    ctx: &Context,
) -> Result<Outcome, Error> {
    match (old.is_node_port(), new.is_node_port()) {
        (false, true) => {
            info!(from = ?old.exposure, "service became NodePort");
            on_service_created(&new.identity, ctx).await
        }
        (true, false) => {
            info!(to = ?new.exposure, "service is no longer NodePort");
            announce(RegistrarAction::Unregister, &old.identity, ctx).await
        }
        _ => Ok(Outcome::Skipped(SkipReason::Unchanged)),
    }
}

async fn fetch_service(
    identity: &ServiceIdentity,
    ctx: &Context,
) -> Result<Option<ServiceSnapshot>, Error> {
    let cluster = &ctx.cluster;
    retry_with_backoff(&ctx.retry, "get-service", Error::is_retryable, move || {
        cluster.get_service(&identity.namespace, &identity.name)
    })
    .await
}

/// Resolve the listener address and call the registrar
async fn announce(
    action: RegistrarAction,
    identity: &ServiceIdentity,
    ctx: &Context,
) -> Result<Outcome, Error> {
    let cluster = &ctx.cluster;
    let nodes = retry_with_backoff(&ctx.retry, "list-nodes", Error::is_retryable, move || {
        cluster.list_nodes()
    })
    .await?;

    let listener_ip = ctx.resolver.resolve(&nodes)?;
    let request = RegistrationRequest::new(&identity.name, &listener_ip);

    let registrar = &ctx.registrar;
    let req = &request;
    let body = retry_with_backoff(
        &ctx.retry,
        action.as_str(),
        Error::is_retryable,
        move || async move {
            match action {
                RegistrarAction::Register => registrar.register(req).await,
                RegistrarAction::Unregister => registrar.unregister(req).await,
            }
        },
    )
    .await?;

    ctx.health.record_success(action);
    info!(
        action = action.as_str(),
        listener_ip = %listener_ip,
        response = %body,
        "registrar updated"
    );

    Ok(match action {
        RegistrarAction::Register => Outcome::Registered { listener_ip },
        RegistrarAction::Unregister => Outcome::Unregistered { listener_ip },
    })
}

/// Event handler that runs [`reconcile`] and records failures
pub struct Reconciler {
    ctx: Arc<Context>,
}

impl Reconciler {
    /// Create a reconciler over a shared context
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl EventHandler for Reconciler {
    async fn handle(&self, event: ServiceEvent) {
        match reconcile(&event, &self.ctx).await {
            Ok(outcome) => {
                debug!(
                    kind = event.kind(),
                    service = %event.identity(),
                    ?outcome,
                    "event handled"
                );
                self.ctx.health.record_reconciled();
            }
            Err(e) => {
                error!(
                    kind = event.kind(),
                    service = %event.identity(),
                    error = %e,
                    "event handling failed"
                );
                self.ctx.health.record_failure(&e);
            }
        }
    }
}
