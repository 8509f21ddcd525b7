//! Service lifecycle events
//!
//! The watcher reports Services as "applied" or "deleted" plus relist
//! markers. The registrar needs to know whether an applied object is new or
//! changed, so [`EventNormalizer`] keeps the last snapshot it delivered for
//! each Service and turns raw watcher events into typed [`ServiceEvent`]s.
//!
//! The normalizer is the only stateful piece of the pipeline and it only
//! remembers what was observed, never what was registered.

mod source;

use std::collections::{HashMap, HashSet};

use k8s_openapi::api::core::v1::Service;
use kube::runtime::watcher;

use crate::types::{ServiceIdentity, ServiceSnapshot};

pub use source::{run_event_source, service_watcher, EventSink, WATCH_TIMEOUT_SECS};

/// A normalized Service lifecycle event
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServiceEvent {
    /// Service appeared, or exists at (re)subscription time
    Created(ServiceSnapshot),
    /// Service changed; carries the previous and the new snapshot
    Updated(ServiceSnapshot, ServiceSnapshot),
    /// Service was removed; carries its last known snapshot
    Deleted(ServiceSnapshot),
}

impl ServiceEvent {
    /// Identity of the Service the event is about
    pub fn identity(&self) -> &ServiceIdentity {
        match self {
            ServiceEvent::Created(s) | ServiceEvent::Deleted(s) => &s.identity,
            ServiceEvent::Updated(_, new) => &new.identity,
        }
    }

    /// Short event kind for logs
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceEvent::Created(_) => "created",
            ServiceEvent::Updated(_, _) => "updated",
            ServiceEvent::Deleted(_) => "deleted",
        }
    }
}

/// Turns raw watcher events into [`ServiceEvent`]s
#[derive(Debug, Default)]
pub struct EventNormalizer {
    known: HashMap<ServiceIdentity, ServiceSnapshot>,
    relist: Option<HashSet<ServiceIdentity>>,
    synced: bool,
}

impl EventNormalizer {
    /// Create an empty normalizer
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the first full listing has been delivered
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Number of Services currently known
    pub fn known_count(&self) -> usize {
        self.known.len()
    }

    /// Normalize one watcher event
    ///
    /// - A relist (`Init` .. `InitDone`) replays `Created` for every listed
    ///   Service, then emits `Deleted` for Services that vanished while the
    ///   watch was down. A known Service whose NodePort-ness flipped during
    ///   the gap is `Updated` instead, so the old registration is withdrawn.
    /// - `Apply` of an unknown Service is `Created`, of a known one `Updated`.
    /// - `Delete` is `Deleted` with the final object state.
    pub fn normalize(&mut self, event: watcher::Event<Service>) -> Vec<ServiceEvent> {
        match event {
            watcher::Event::Init => {
                self.relist = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitApply(svc) => {
                let snapshot = ServiceSnapshot::from_service(&svc);
                if let Some(seen) = self.relist.as_mut() {
                    seen.insert(snapshot.identity.clone());
                }
                match self
                    .known
                    .insert(snapshot.identity.clone(), snapshot.clone())
                {
                    // Exposure changed while the watch was down
                    Some(old) if old.is_node_port() != snapshot.is_node_port() => {
                        vec![ServiceEvent::Updated(old, snapshot)]
                    }
                    _ => vec![ServiceEvent::Created(snapshot)],
                }
            }
            watcher::Event::InitDone => {
                self.synced = true;
                let Some(seen) = self.relist.take() else {
                    return Vec::new();
                };
                let mut gone: Vec<ServiceIdentity> = self
                    .known
                    .keys()
                    .filter(|id| !seen.contains(*id))
                    .cloned()
                    .collect();
                gone.sort();
                gone.into_iter()
                    .filter_map(|id| self.known.remove(&id))
                    .map(ServiceEvent::Deleted)
                    .collect()
            }
            watcher::Event::Apply(svc) => {
                let snapshot = ServiceSnapshot::from_service(&svc);
                match self
                    .known
                    .insert(snapshot.identity.clone(), snapshot.clone())
                {
                    Some(old) => vec![ServiceEvent::Updated(old, snapshot)],
                    None => vec![ServiceEvent::Created(snapshot)],
                }
            }
            watcher::Event::Delete(svc) => {
                let snapshot = ServiceSnapshot::from_service(&svc);
                self.known.remove(&snapshot.identity);
                vec![ServiceEvent::Deleted(snapshot)]
            }
        }
    }
}
