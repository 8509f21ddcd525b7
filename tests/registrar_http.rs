//! Registrar HTTP integration tests
//!
//! These run the real [`HttpRegistrar`] against an in-process fake registrar
//! bound to a loopback port, so the wire format and paths are checked
//! end to end without a cluster.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::routing::post;
use axum::Router;
use serde_json::json;

use nodeport_registrar::cluster::ClusterClient;
use nodeport_registrar::controller::{reconcile, Context, Outcome};
use nodeport_registrar::event::ServiceEvent;
use nodeport_registrar::health::HealthState;
use nodeport_registrar::registrar::{HttpRegistrar, Registrar, RegistrationRequest};
use nodeport_registrar::retry::RetryConfig;
use nodeport_registrar::types::{ExposureType, NodeRecord, ServiceIdentity, ServiceSnapshot};
use nodeport_registrar::{Error, PUBLIC_IP_ANNOTATION};

// =============================================================================
// Fake registrar
// =============================================================================

#[derive(Clone)]
struct FakeRegistrar {
    calls: Arc<Mutex<Vec<(String, serde_json::Value)>>>,
    content_types: Arc<Mutex<Vec<Option<String>>>>,
    status: Arc<AtomicU16>,
}

impl FakeRegistrar {
    fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            content_types: Arc::new(Mutex::new(Vec::new())),
            status: Arc::new(AtomicU16::new(200)),
        }
    }

    fn respond_with(&self, status: u16) {
        self.status.store(status, Ordering::SeqCst);
    }

    fn calls(&self) -> Vec<(String, serde_json::Value)> {
        self.calls.lock().unwrap().clone()
    }

    fn content_types(&self) -> Vec<Option<String>> {
        self.content_types.lock().unwrap().clone()
    }
}

async fn record(
    State(fake): State<FakeRegistrar>,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> (StatusCode, String) {
    fake.content_types.lock().unwrap().push(
        headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    );
    let parsed = serde_json::from_str(&body).unwrap_or(serde_json::Value::Null);
    fake.calls
        .lock()
        .unwrap()
        .push((uri.path().to_string(), parsed));
    let status = StatusCode::from_u16(fake.status.load(Ordering::SeqCst)).unwrap();
    (status, format!("handled {}", uri.path()))
}

async fn start_fake() -> (FakeRegistrar, String) {
    let fake = FakeRegistrar::new();
    let app = Router::new()
        .route("/services/register", post(record))
        .route("/services/registercancel", post(record))
        .with_state(fake.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (fake, format!("http://{addr}"))
}

async fn unused_addr() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

// =============================================================================
// Fake cluster
// =============================================================================

#[derive(Default)]
struct FakeCluster {
    services: HashMap<ServiceIdentity, ServiceSnapshot>,
    nodes: Vec<NodeRecord>,
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceSnapshot>, Error> {
        Ok(self
            .services
            .get(&ServiceIdentity::new(namespace, name))
            .cloned())
    }

    async fn list_nodes(&self) -> Result<Vec<NodeRecord>, Error> {
        Ok(self.nodes.clone())
    }
}

fn snapshot(name: &str, exposure: ExposureType) -> ServiceSnapshot {
    ServiceSnapshot {
        identity: ServiceIdentity::new("default", name),
        uid: Some(format!("uid-{name}")),
        resource_version: Some("1".to_string()),
        exposure: Some(exposure),
    }
}

fn worker(name: &str, ip: &str) -> NodeRecord {
    NodeRecord {
        name: name.to_string(),
        annotations: BTreeMap::from([(PUBLIC_IP_ANNOTATION.to_string(), ip.to_string())]),
        ..Default::default()
    }
}

fn fast_retry(attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts: attempts,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        backoff_multiplier: 2.0,
    }
}

// =============================================================================
// HttpRegistrar
// =============================================================================

#[tokio::test]
async fn register_posts_service_name_and_listener_ip() {
    let (fake, base) = start_fake().await;
    let registrar = HttpRegistrar::new(&base, Duration::from_secs(5)).unwrap();

    let body = registrar
        .register(&RegistrationRequest::new("web-svc", "10.0.0.5"))
        .await
        .unwrap();

    assert_eq!(body, "handled /services/register");
    assert_eq!(
        fake.calls(),
        vec![(
            "/services/register".to_string(),
            json!({"sName": "web-svc", "lSip": "10.0.0.5"})
        )]
    );
    assert_eq!(
        fake.content_types(),
        vec![Some("application/json".to_string())]
    );
}

#[tokio::test]
async fn unregister_posts_to_cancel_path() {
    let (fake, base) = start_fake().await;
    let registrar = HttpRegistrar::new(format!("{base}/"), Duration::from_secs(5)).unwrap();

    registrar
        .unregister(&RegistrationRequest::new("web-svc", "10.0.0.5"))
        .await
        .unwrap();

    assert_eq!(
        fake.calls(),
        vec![(
            "/services/registercancel".to_string(),
            json!({"sName": "web-svc", "lSip": "10.0.0.5"})
        )]
    );
    assert_eq!(
        fake.content_types(),
        vec![Some("application/json".to_string())]
    );
}

#[tokio::test]
async fn non_success_status_is_a_retryable_error() {
    let (fake, base) = start_fake().await;
    fake.respond_with(503);
    let registrar = HttpRegistrar::new(&base, Duration::from_secs(5)).unwrap();

    let err = registrar
        .register(&RegistrationRequest::new("web-svc", "10.0.0.5"))
        .await
        .unwrap_err();

    assert_eq!(err.registrar_status_code(), Some(503));
    assert!(err.is_retryable());
    assert_eq!(fake.calls().len(), 1);
}

#[tokio::test]
async fn unreachable_registrar_is_a_transport_error() {
    let addr = unused_addr().await;
    let registrar = HttpRegistrar::new(format!("http://{addr}"), Duration::from_secs(2)).unwrap();

    let err = registrar
        .register(&RegistrationRequest::new("web-svc", "10.0.0.5"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::RegistrarUnreachable { .. }));
    assert_eq!(err.registrar_status_code(), None);
    assert!(err.is_retryable());
}

// =============================================================================
// Reconcile against the HTTP registrar
// =============================================================================

/// Story: a NodePort service is created, then deleted, and the registrar
/// sees exactly one register followed by one cancel for it.
#[tokio::test]
async fn story_nodeport_lifecycle_reaches_registrar() {
    let (fake, base) = start_fake().await;
    let web = snapshot("web-svc", ExposureType::NodePort);

    let mut cluster = FakeCluster {
        nodes: vec![worker("node-a", "10.0.0.5"), worker("node-b", "10.0.0.6")],
        ..Default::default()
    };
    cluster.services.insert(web.identity.clone(), web.clone());

    let health = Arc::new(HealthState::new(3));
    let ctx = Context::builder(
        Arc::new(cluster),
        Arc::new(HttpRegistrar::new(&base, Duration::from_secs(5)).unwrap()),
    )
    .retry(fast_retry(3))
    .health(health.clone())
    .build();

    let created = reconcile(&ServiceEvent::Created(web.clone()), &ctx)
        .await
        .unwrap();
    assert_eq!(
        created,
        Outcome::Registered {
            listener_ip: "10.0.0.5".to_string()
        }
    );

    let deleted = reconcile(&ServiceEvent::Deleted(web), &ctx).await.unwrap();
    assert_eq!(
        deleted,
        Outcome::Unregistered {
            listener_ip: "10.0.0.5".to_string()
        }
    );

    let paths: Vec<String> = fake.calls().into_iter().map(|(path, _)| path).collect();
    assert_eq!(paths, vec!["/services/register", "/services/registercancel"]);

    let snapshot = health.snapshot();
    assert_eq!(snapshot.registrations, 1);
    assert_eq!(snapshot.unregistrations, 1);
}

#[tokio::test]
async fn cluster_ip_service_never_reaches_registrar() {
    let (fake, base) = start_fake().await;
    let internal = snapshot("internal-svc", ExposureType::ClusterIP);

    let mut cluster = FakeCluster {
        nodes: vec![worker("node-a", "10.0.0.5")],
        ..Default::default()
    };
    cluster
        .services
        .insert(internal.identity.clone(), internal.clone());

    let ctx = Context::builder(
        Arc::new(cluster),
        Arc::new(HttpRegistrar::new(&base, Duration::from_secs(5)).unwrap()),
    )
    .retry(fast_retry(1))
    .build();

    reconcile(&ServiceEvent::Created(internal.clone()), &ctx)
        .await
        .unwrap();
    reconcile(&ServiceEvent::Deleted(internal), &ctx)
        .await
        .unwrap();

    assert!(fake.calls().is_empty());
}

#[tokio::test]
async fn failing_registrar_is_retried_until_attempts_run_out() {
    let (fake, base) = start_fake().await;
    fake.respond_with(502);
    let web = snapshot("web-svc", ExposureType::NodePort);

    let mut cluster = FakeCluster {
        nodes: vec![worker("node-a", "10.0.0.5")],
        ..Default::default()
    };
    cluster.services.insert(web.identity.clone(), web.clone());

    let ctx = Context::builder(
        Arc::new(cluster),
        Arc::new(HttpRegistrar::new(&base, Duration::from_secs(5)).unwrap()),
    )
    .retry(fast_retry(3))
    .build();

    let err = reconcile(&ServiceEvent::Created(web), &ctx)
        .await
        .unwrap_err();

    assert_eq!(err.registrar_status_code(), Some(502));
    assert_eq!(fake.calls().len(), 3);
}
