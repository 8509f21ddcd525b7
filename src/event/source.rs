//! Service watch subscription
//!
//! Runs the kube-runtime watcher, feeds every raw event through the
//! [`EventNormalizer`] and hands the typed events to an [`EventSink`]. The
//! watcher reconnects on its own with exponential backoff; a reconnect
//! starts a fresh relist, so downstream handling must be idempotent.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Service;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{EventNormalizer, ServiceEvent};
use crate::health::HealthState;

/// Watcher timeout (seconds) - must be less than client read_timeout
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
pub const WATCH_TIMEOUT_SECS: u32 = 25;

/// Receives normalized events from the subscription
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Accept one event; may wait for capacity
    async fn dispatch(&self, event: ServiceEvent);
}

/// Build the raw Service watch stream, reconnecting with backoff
///
/// `namespace` restricts the watch; `None` watches every namespace.
pub fn service_watcher(
    client: Client,
    namespace: Option<&str>,
) -> impl Stream<Item = Result<watcher::Event<Service>, watcher::Error>> + Send {
    let api: Api<Service> = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    watcher(api, watcher::Config::default().timeout(WATCH_TIMEOUT_SECS)).default_backoff()
}

/// Drive the subscription until `cancel` fires or the stream ends
///
/// Watch errors are logged and skipped; the backoff wrapper on the stream
/// handles reconnection. Events already handed to the sink are not affected
/// by cancellation.
pub async fn run_event_source<S>(
    stream: S,
    sink: Arc<dyn EventSink>,
    health: Arc<HealthState>,
    cancel: CancellationToken,
) where
    S: Stream<Item = Result<watcher::Event<Service>, watcher::Error>> + Send,
{
    let mut normalizer = EventNormalizer::new();
    tokio::pin!(stream);

    info!("Starting service watch");

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Service watch cancelled");
                break;
            }
            next = stream.next() => next,
        };

        match next {
            Some(Ok(raw)) => {
                let was_synced = normalizer.is_synced();
                let events = normalizer.normalize(raw);
                if !was_synced && normalizer.is_synced() {
                    info!(
                        services = normalizer.known_count(),
                        "initial service listing delivered"
                    );
                    health.mark_synced();
                }

                for event in events {
                    debug!(
                        kind = event.kind(),
                        service = %event.identity(),
                        "service event"
                    );
                    health.record_event();
                    sink.dispatch(event).await;
                }
            }
            Some(Err(e)) => {
                warn!(error = %e, "service watch error, reconnecting");
            }
            None => {
                warn!("service watch stream ended");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ServiceSpec;
    use kube::api::ObjectMeta;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<ServiceEvent>>,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn dispatch(&self, event: ServiceEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn svc(name: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("NodePort".to_string()),
                ..Default::default()
            }),
            status: None,
        }
    }

    fn watch_error() -> watcher::Error {
        watcher::Error::NoResourceVersion
    }

    #[tokio::test]
    async fn delivers_initial_sync_then_live_events() {
        let raw = vec![
            Ok(watcher::Event::Init),
            Ok(watcher::Event::InitApply(svc("a"))),
            Ok(watcher::Event::InitDone),
            Err(watch_error()),
            Ok(watcher::Event::Apply(svc("b"))),
            Ok(watcher::Event::Apply(svc("b"))),
            Ok(watcher::Event::Delete(svc("a"))),
        ];
        let sink = Arc::new(RecordingSink::default());
        let health = Arc::new(HealthState::new(1));

        run_event_source(
            futures::stream::iter(raw),
            sink.clone(),
            health.clone(),
            CancellationToken::new(),
        )
        .await;

        let kinds: Vec<(&str, String)> = sink
            .events
            .lock()
            .unwrap()
            .iter()
            .map(|e| (e.kind(), e.identity().name.clone()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("created", "a".to_string()),
                ("created", "b".to_string()),
                ("updated", "b".to_string()),
                ("deleted", "a".to_string()),
            ]
        );

        let snap = health.snapshot();
        assert!(snap.synced);
        assert_eq!(snap.events_received, 4);
    }

    #[tokio::test]
    async fn cancellation_stops_a_pending_stream() {
        let sink = Arc::new(RecordingSink::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        run_event_source(
            futures::stream::pending(),
            sink.clone(),
            Arc::new(HealthState::new(1)),
            cancel,
        )
        .await;

        assert!(sink.events.lock().unwrap().is_empty());
    }
}
