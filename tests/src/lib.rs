//! Shared test harness for Pier integration tests.
//!
//! Provides [`TestNode`]: a complete node wired the way `pierd start` wires
//! it (settings file, file-backed cache, HTTP control-plane client, edge
//! router) against two in-process HTTP servers:
//!
//! - [`MockControlPlane`]: answers `/ping` and `/stop`, with failure injection
//! - [`Upstream`]: an image origin serving deterministic bytes
//!
//! Timings are shortened so lifecycle tests run in real time.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use http_body_util::BodyExt;
use pier_cache::CacheEngine;
use pier_control::{Assignment, HttpControlPlane, PingRequest};
use pier_node::{ClientSettings, NodeSupervisor, SettingsFile, SettingsSource, SupervisorOptions};
use pier_store::{FileStore, FlakyStore, ObjectStore};
use pierd::server::EdgeServer;
use tempfile::TempDir;
use tower::ServiceExt;

/// Secret every test node registers with.
pub const TEST_SECRET: &str = "integration-secret";

/// Supervisor timings used by test nodes.
pub fn test_options() -> SupervisorOptions {
    SupervisorOptions {
        reconcile_interval: Duration::from_millis(100),
        quiet_window: Duration::from_millis(300),
        drain_poll: Duration::from_millis(20),
        control_timeout: Duration::from_secs(2),
        build_version: pierd::BUILD_VERSION,
    }
}

/// Generate `size` bytes of deterministic test data for `seed`.
pub fn test_data_seeded(size: usize, seed: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity(size);
    let mut state: u32 = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
    for _ in 0..size {
        state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        data.push((state >> 16) as u8);
    }
    data
}

async fn spawn_router(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    addr
}

// =========================================================================
// Upstream origin
// =========================================================================

/// Image origin.
///
/// `GET /{mode}/{chapter}/{size}.png` returns `size` deterministic bytes
/// seeded from the path. Names without a numeric stem return `404`.
#[derive(Clone)]
pub struct Upstream {
    pub addr: SocketAddr,
    fetches: Arc<AtomicUsize>,
}

impl Upstream {
    pub async fn spawn() -> Self {
        let fetches = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route("/{mode}/{chapter}/{image}", get(serve_origin))
            .with_state(fetches.clone());
        let addr = spawn_router(router).await;
        Self { addr, fetches }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Number of image requests the origin has answered.
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

/// Bytes the origin serves for a path.
pub fn origin_bytes(mode: &str, chapter: &str, image: &str) -> Option<Vec<u8>> {
    let size: usize = image.split_once('.')?.0.parse().ok()?;
    let seed = format!("{mode}/{chapter}/{image}")
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b)));
    Some(test_data_seeded(size, seed))
}

async fn serve_origin(
    State(fetches): State<Arc<AtomicUsize>>,
    Path((mode, chapter, image)): Path<(String, String, String)>,
) -> Response {
    fetches.fetch_add(1, Ordering::SeqCst);
    match origin_bytes(&mode, &chapter, &image) {
        Some(data) => (StatusCode::OK, data).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

// =========================================================================
// Mock control plane
// =========================================================================

#[derive(Default)]
struct ControlState {
    image_server: Mutex<String>,
    failing: AtomicBool,
    pings: Mutex<Vec<PingRequest>>,
    stops: AtomicUsize,
}

/// In-process control plane speaking the node's JSON protocol.
#[derive(Clone)]
pub struct MockControlPlane {
    pub addr: SocketAddr,
    state: Arc<ControlState>,
}

impl MockControlPlane {
    /// Spawn a control plane that assigns `image_server` to every node.
    pub async fn spawn(image_server: &str) -> Self {
        let state = Arc::new(ControlState::default());
        *state.image_server.lock().expect("lock poisoned") = image_server.to_string();

        let router = Router::new()
            .route("/ping", post(handle_ping))
            .route("/stop", post(handle_stop))
            .with_state(state.clone());
        let addr = spawn_router(router).await;
        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Make subsequent pings fail with `500`.
    pub fn set_failing(&self, failing: bool) {
        self.state.failing.store(failing, Ordering::SeqCst);
    }

    /// Change the upstream handed out on subsequent pings.
    pub fn set_image_server(&self, image_server: &str) {
        *self.state.image_server.lock().expect("lock poisoned") = image_server.to_string();
    }

    /// Every ping received so far.
    pub fn pings(&self) -> Vec<PingRequest> {
        self.state.pings.lock().expect("lock poisoned").clone()
    }

    /// Number of `/stop` calls received.
    pub fn stops(&self) -> usize {
        self.state.stops.load(Ordering::SeqCst)
    }
}

async fn handle_ping(
    State(state): State<Arc<ControlState>>,
    Json(request): Json<PingRequest>,
) -> Response {
    state.pings.lock().expect("lock poisoned").push(request);
    if state.failing.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "control plane down").into_response();
    }
    let image_server = state.image_server.lock().expect("lock poisoned").clone();
    Json(Assignment {
        image_server,
        url: "https://node.pier.test".to_string(),
        token_key: Some("token-key".to_string()),
        latest_build: pierd::BUILD_VERSION,
        paused: false,
        compromised: false,
        force_tokens: false,
        tls: None,
    })
    .into_response()
}

async fn handle_stop(State(state): State<Arc<ControlState>>) -> StatusCode {
    state.stops.fetch_add(1, Ordering::SeqCst);
    StatusCode::OK
}

// =========================================================================
// Test node
// =========================================================================

/// A running node plus the collaborators it talks to.
pub struct TestNode {
    pub supervisor: Arc<NodeSupervisor>,
    pub router: Router,
    pub control: MockControlPlane,
    pub upstream: Upstream,
    /// Present when the node was built with [`TestNode::start_flaky`].
    pub flaky: Option<Arc<FlakyStore>>,
    settings_file: SettingsFile,
    dir: TempDir,
}

impl TestNode {
    /// Start a node with a `max_cache_mib` ceiling.
    pub async fn start(max_cache_mib: u64) -> Self {
        Self::start_with(max_cache_mib, false).await
    }

    /// Start a node whose store can be switched into failing.
    pub async fn start_flaky(max_cache_mib: u64) -> Self {
        Self::start_with(max_cache_mib, true).await
    }

    async fn start_with(max_cache_mib: u64, flaky: bool) -> Self {
        let upstream = Upstream::spawn().await;
        let control = MockControlPlane::spawn(&upstream.url()).await;
        let dir = tempfile::tempdir().unwrap();

        let settings_file = SettingsFile::in_dir(dir.path());
        let settings = ClientSettings {
            client_secret: TEST_SECRET.to_string(),
            cache_directory: dir.path().join("cache"),
            max_cache_size_mebibytes: max_cache_mib,
            cache_scan_interval_seconds: 3600,
            cache_refresh_age_seconds: 3600,
            graceful_shutdown_seconds: 5,
            control_plane_url: control.url(),
            ..ClientSettings::default()
        };
        write_settings(&settings_file, &settings);

        Self::boot(dir, settings_file, control, upstream, flaky).await
    }

    /// Boot a node from what is on disk in `dir`.
    async fn boot(
        dir: TempDir,
        settings_file: SettingsFile,
        control: MockControlPlane,
        upstream: Upstream,
        flaky: bool,
    ) -> Self {
        let settings = settings_file.load().unwrap();
        let file_store: Arc<dyn ObjectStore> =
            Arc::new(FileStore::new(&settings.cache_directory).unwrap());
        let (store, flaky): (Arc<dyn ObjectStore>, _) = if flaky {
            let flaky = Arc::new(FlakyStore::new(file_store));
            (flaky.clone(), Some(flaky))
        } else {
            (file_store, None)
        };

        let engine = Arc::new(
            CacheEngine::open(store, settings.cache_limits())
                .await
                .unwrap(),
        );
        let client = Arc::new(HttpControlPlane::new(&settings.control_plane_url).unwrap());
        let supervisor = NodeSupervisor::start(
            settings,
            Arc::new(settings_file.clone()),
            client,
            engine,
            None,
            test_options(),
        )
        .await
        .unwrap();
        let router = EdgeServer::new(supervisor.clone()).unwrap().into_router();

        Self {
            supervisor,
            router,
            control,
            upstream,
            flaky,
            settings_file,
            dir,
        }
    }

    /// Stop this node without draining and boot a fresh one on the same
    /// settings and cache directory.
    pub async fn restart(self) -> Self {
        let Self {
            supervisor,
            router,
            control,
            upstream,
            flaky,
            settings_file,
            dir,
        } = self;
        supervisor.run_state().begin_shutdown();
        drop(router);
        drop(supervisor);
        Self::boot(dir, settings_file, control, upstream, flaky.is_some()).await
    }

    pub fn engine(&self) -> &Arc<CacheEngine> {
        self.supervisor.engine()
    }

    /// Settings currently on disk.
    pub fn settings(&self) -> ClientSettings {
        self.settings_file.load().unwrap()
    }

    /// Rewrite the settings file.
    pub fn update_settings(&self, update: impl FnOnce(&mut ClientSettings)) {
        let mut settings = self.settings();
        update(&mut settings);
        write_settings(&self.settings_file, &settings);
    }

    /// Cache directory of this node.
    pub fn cache_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("cache")
    }

    /// `GET path` through the edge router.
    pub async fn get(&self, path: &str) -> (StatusCode, Option<String>, Bytes) {
        fetch(&self.router, path).await
    }

    /// Bytes the cache store currently holds, according to its listing.
    pub async fn stored_bytes(&self) -> u64 {
        self.engine()
            .object_store()
            .list_all()
            .await
            .unwrap()
            .iter()
            .map(|meta| meta.size_bytes)
            .sum()
    }
}

/// `GET path` through `router`, returning status, `x-cache` and body.
pub async fn fetch(router: &Router, path: &str) -> (StatusCode, Option<String>, Bytes) {
    let response = router
        .clone()
        .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let cache = response
        .headers()
        .get("x-cache")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, cache, body)
}

fn write_settings(file: &SettingsFile, settings: &ClientSettings) {
    let body = toml::to_string_pretty(settings).unwrap();
    std::fs::write(file.path(), body).unwrap();
}
