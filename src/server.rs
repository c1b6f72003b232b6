//! HTTP front end streaming probe results to the caller
//!
//! `POST /api/test-proxies` answers with newline-delimited JSON events as
//! probes finish. Dropping the response body cancels the run.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::watch;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

use crate::config::{clamp_timeout_secs, ServerConfig};
use crate::emitter::{stream_run, ChannelWriter, ResultStreamEmitter};
use crate::error::{ProbeError, Result};
use crate::proxy::{CancelSignal, CheckerConfig, WorkerPool};

/// Workers used when a request does not ask for a specific count
const DEFAULT_REQUEST_WORKERS: usize = 10;

/// Shared state for handlers
#[derive(Clone)]
pub struct AppState {
    /// Defaults for fields a request leaves out
    pub defaults: Arc<CheckerConfig>,
}

/// Body of a test request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyTestRequest {
    #[serde(default)]
    pub proxies: Vec<String>,
    #[serde(default)]
    pub test_url: String,
    /// Per-probe timeout in seconds
    pub timeout: Option<u64>,
    pub workers: Option<usize>,
}

impl ProxyTestRequest {
    fn validate(&self) -> Result<()> {
        if self.proxies.is_empty() {
            return Err(ProbeError::InvalidRequest("Proxies array is required".to_string()));
        }
        if self.test_url.trim().is_empty() {
            return Err(ProbeError::InvalidRequest("Test URL is required".to_string()));
        }
        Ok(())
    }

    fn checker_config(&self, defaults: &CheckerConfig) -> CheckerConfig {
        let timeout = clamp_timeout_secs(self.timeout.unwrap_or(defaults.timeout.as_secs()));

        defaults
            .clone()
            .with_test_url(self.test_url.trim().to_string())
            .with_timeout(Duration::from_secs(timeout))
            .with_workers(self.workers.unwrap_or(DEFAULT_REQUEST_WORKERS))
    }
}

/// Create the router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/test-proxies", post(test_proxies))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "proxy-probe"
        })),
    )
}

#[instrument(skip_all)]
async fn test_proxies(
    State(state): State<AppState>,
    Json(request): Json<ProxyTestRequest>,
) -> std::result::Result<Response, ProbeError> {
    request.validate()?;

    let pool = WorkerPool::new(request.checker_config(&state.defaults));
    let (writer, rx) = ChannelWriter::channel();
    let cancel = CancelSignal::new();

    // Notice a disconnect even while no result is being written
    let watcher = {
        let writer = writer.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            writer.closed().await;
            if cancel.cancel() {
                info!("Client disconnected, aborting test");
            }
        })
    };

    let descriptors = request.proxies;
    tokio::spawn(async move {
        let emitter = Arc::new(ResultStreamEmitter::new(writer));
        if let Err(e) = stream_run(&pool, descriptors, Arc::clone(&emitter), cancel.clone()).await {
            if !cancel.is_cancelled() {
                error!("Error in proxy test: {}", e);
                let _ = emitter.emit_error(e.to_string());
            }
        }
        watcher.abort();
    });

    let body = Body::from_stream(UnboundedReceiverStream::new(rx).map(Ok::<_, Infallible>));

    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response())
}

/// HTTP server
pub struct ProbeServer {
    config: ServerConfig,
    state: AppState,
}

impl ProbeServer {
    pub fn new(config: ServerConfig, defaults: CheckerConfig) -> Self {
        Self {
            config,
            state: AppState {
                defaults: Arc::new(defaults),
            },
        }
    }

    /// Run the server until `shutdown` flips to true
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|e| ProbeError::InvalidConfig(format!("invalid listen address: {}", e)))?;

        let router = create_router(self.state.clone());

        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("Server listening on {}", addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            })
            .await?;

        info!("Server shut down");
        Ok(())
    }
}
