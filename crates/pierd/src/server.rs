//! Client-facing HTTP layer.
//!
//! Routes:
//!
//! - `GET /data/{chapter}/{image}`: original-quality image
//! - `GET /data-saver/{chapter}/{image}`: compressed image
//!
//! Each request is counted by the node's request gate, including while the
//! node drains, so the drain can tell steady traffic from silence. Hits are
//! served from the cache; misses are fetched from the assigned upstream,
//! cached and returned. Cache failures degrade to a miss.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use bytes::Bytes;
use pier_node::NodeSupervisor;
use pier_types::ContentId;
use tracing::{debug, warn};

/// Timeout for a single upstream fetch.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors returned by the serving layer.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    /// The request path is not a valid image path.
    #[error("invalid image path")]
    BadPath,

    /// The upstream could not be reached or its body could not be read.
    #[error("upstream fetch failed: {0}")]
    Upstream(#[from] reqwest::Error),

    /// The upstream answered with a non-success status.
    #[error("upstream returned {0}")]
    UpstreamStatus(StatusCode),
}

impl ServeError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::BadPath => StatusCode::BAD_REQUEST,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamStatus(StatusCode::NOT_FOUND) => StatusCode::NOT_FOUND,
            Self::UpstreamStatus(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ServeError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}

#[derive(Clone)]
struct AppState {
    supervisor: Arc<NodeSupervisor>,
    upstream: reqwest::Client,
}

/// HTTP server fronting a running node.
pub struct EdgeServer {
    router: Router,
}

impl EdgeServer {
    /// Create the server for `supervisor`.
    pub fn new(supervisor: Arc<NodeSupervisor>) -> Result<Self, ServeError> {
        let upstream = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .build()?;
        let state = AppState {
            supervisor,
            upstream,
        };
        Ok(Self {
            router: Self::build_router(state),
        })
    }

    fn build_router(state: AppState) -> Router {
        Router::new()
            .route("/data/{chapter}/{image}", get(serve_data))
            .route("/data-saver/{chapter}/{image}", get(serve_data_saver))
            .with_state(state)
    }

    /// Return the inner [`Router`] (useful for testing with `tower::ServiceExt`).
    pub fn into_router(self) -> Router {
        self.router
    }

    /// Serve on an already-bound listener until the task is dropped.
    pub async fn serve(self, listener: tokio::net::TcpListener) -> Result<(), std::io::Error> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "edge server listening");
        }
        axum::serve(listener, self.router).await
    }
}

async fn serve_data(
    State(state): State<AppState>,
    Path((chapter, image)): Path<(String, String)>,
) -> Result<Response, ServeError> {
    serve_image(&state, "data", &chapter, &image).await
}

async fn serve_data_saver(
    State(state): State<AppState>,
    Path((chapter, image)): Path<(String, String)>,
) -> Result<Response, ServeError> {
    serve_image(&state, "data-saver", &chapter, &image).await
}

async fn serve_image(
    state: &AppState,
    mode: &str,
    chapter: &str,
    image: &str,
) -> Result<Response, ServeError> {
    let _request = state.supervisor.run_state().enter();

    if !valid_chapter(chapter) || !valid_image(image) {
        return Err(ServeError::BadPath);
    }

    let id = ContentId::for_image(mode, chapter, image);
    let engine = state.supervisor.engine();

    match engine.lookup(id).await {
        Ok(Some(hit)) => {
            debug!(%id, size = hit.entry.size_bytes, "cache hit");
            return Ok(image_response(image, hit.data, "HIT"));
        }
        Ok(None) => {}
        Err(e) => warn!(%id, error = %e, "cache lookup failed, treating as miss"),
    }

    let assignment = state.supervisor.assignment();
    let url = format!(
        "{}/{mode}/{chapter}/{image}",
        assignment.image_server.trim_end_matches('/')
    );
    let response = state.upstream.get(&url).send().await?;
    let status = response.status();
    if !status.is_success() {
        warn!(%url, %status, "upstream refused image");
        return Err(ServeError::UpstreamStatus(status));
    }
    let data = response.bytes().await?;

    match engine.store(id, data.clone()).await {
        Ok(entry) => debug!(%id, size = entry.size_bytes, "cached upstream image"),
        Err(e) => warn!(%id, error = %e, "failed to cache upstream image"),
    }

    Ok(image_response(image, data, "MISS"))
}

fn image_response(image: &str, data: Bytes, cache_status: &'static str) -> Response {
    (
        [
            (header::CONTENT_TYPE, content_type(image)),
            (header::CACHE_CONTROL, "public, max-age=1209600"),
            (header::HeaderName::from_static("x-cache"), cache_status),
        ],
        Body::from(data),
    )
        .into_response()
}

fn content_type(image: &str) -> &'static str {
    match image.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()) {
        Some(ext) if ext == "png" => "image/png",
        Some(ext) if ext == "jpg" || ext == "jpeg" => "image/jpeg",
        Some(ext) if ext == "gif" => "image/gif",
        Some(ext) if ext == "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

fn valid_chapter(chapter: &str) -> bool {
    !chapter.is_empty() && chapter.chars().all(|c| c.is_ascii_alphanumeric())
}

fn valid_image(image: &str) -> bool {
    !image.is_empty()
        && !image.starts_with('.')
        && image
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}
