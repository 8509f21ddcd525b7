//! Partitioned worker pool for event handling
//!
//! Handling an event performs blocking I/O (API reads, registrar POST with
//! retries). Running it inline would stall the watch, so events are queued to
//! a fixed set of workers. Each Service identity hashes to one worker, which
//! keeps a Service's events in delivery order (a Deleted never overtakes its
//! Created) while unrelated Services proceed in parallel.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::event::{EventSink, ServiceEvent};
use crate::types::ServiceIdentity;

/// Handles a single event; implemented by the reconciler
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle one event to completion; failures are handled internally
    async fn handle(&self, event: ServiceEvent);
}

/// Bounded, identity-partitioned worker pool
pub struct Dispatcher {
    shards: Mutex<Option<Vec<mpsc::Sender<ServiceEvent>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Spawn `workers` tasks, each with a queue of `queue_depth` events
    ///
    /// Both values are clamped to at least 1.
    pub fn spawn(handler: Arc<dyn EventHandler>, workers: usize, queue_depth: usize) -> Self {
        let shard_count = workers.max(1);
        let mut shards = Vec::with_capacity(shard_count);
        let mut handles = Vec::with_capacity(shard_count);

        for shard in 0..shard_count {
            let (tx, mut rx) = mpsc::channel::<ServiceEvent>(queue_depth.max(1));
            let handler = handler.clone();
            handles.push(tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    handler.handle(event).await;
                }
                debug!(shard, "dispatcher worker stopped");
            }));
            shards.push(tx);
        }

        info!(workers = shard_count, "Started event dispatcher");

        Self {
            shards: Mutex::new(Some(shards)),
            workers: Mutex::new(handles),
        }
    }

    /// Stop accepting events and wait up to `grace` for queued events
    ///
    /// Workers still busy when `grace` runs out are aborted and their
    /// remaining events are lost.
    pub async fn shutdown(&self, grace: Duration) {
        let senders = self.shards.lock().ok().and_then(|mut s| s.take());
        drop(senders);

        let mut handles: Vec<JoinHandle<()>> = match self.workers.lock() {
            Ok(mut w) => w.drain(..).collect(),
            Err(_) => Vec::new(),
        };

        let drain = async {
            for handle in handles.iter_mut() {
                if let Err(e) = handle.await {
                    warn!(error = %e, "dispatcher worker panicked");
                }
            }
        };

        if tokio::time::timeout(grace, drain).await.is_err() {
            let pending = handles.iter().filter(|h| !h.is_finished()).count();
            warn!(
                pending,
                grace_secs = grace.as_secs(),
                "Drain timed out, aborting dispatcher workers"
            );
            for handle in &handles {
                handle.abort();
            }
            return;
        }
        info!("Event dispatcher drained");
    }
}

#[async_trait]
impl EventSink for Dispatcher {
    async fn dispatch(&self, event: ServiceEvent) {
        let sender = {
            let guard = match self.shards.lock() {
                Ok(g) => g,
                Err(_) => return,
            };
            match guard.as_ref() {
                Some(shards) => shards[shard_index(event.identity(), shards.len())].clone(),
                None => {
                    warn!(service = %event.identity(), "dispatcher shut down, dropping event");
                    return;
                }
            }
        };

        if let Err(e) = sender.send(event).await {
            warn!(service = %e.0.identity(), "dispatcher worker gone, dropping event");
        }
    }
}

fn shard_index(identity: &ServiceIdentity, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    identity.hash(&mut hasher);
    (hasher.finish() % shards.max(1) as u64) as usize
}
