//! HTTP gateway for Fusion Connect call signaling: the router, its shared
//! state and the mailbox and call-history services behind it.

pub mod calls;
pub mod config;
mod error;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod signaling;
pub mod telemetry;

const CONTENT_SECURITY_POLICY: &str =
    "default-src 'none'; frame-ancestors 'none'; base-uri 'none'; form-action 'self'";
const REFERRER_POLICY: &str = "no-referrer";
const X_CONTENT_TYPE_OPTIONS: &str = "nosniff";
const X_FRAME_OPTIONS: &str = "DENY";

#[cfg(feature = "metrics")]
use anyhow::Result;
use axum::{
    extract::State,
    http::{header::HeaderName, HeaderValue},
    routing::get,
    Json, Router,
};
#[cfg(feature = "metrics")]
use axum::{
    extract::MatchedPath,
    http::{header::CONTENT_TYPE, StatusCode},
    response::IntoResponse,
};
use serde::Serialize;
#[cfg(feature = "metrics")]
use std::{
    future::Future,
    net::SocketAddr,
    pin::Pin,
    task::{Context as TaskContext, Poll},
};
use std::{sync::Arc, time::Instant};
#[cfg(feature = "metrics")]
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    propagate_header::PropagateHeaderLayer,
    request_id::{MakeRequestUuid, SetRequestIdLayer},
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};
#[cfg(feature = "metrics")]
use tracing::{error, info};

use fusion_storage::KeyValueStore;

#[cfg(feature = "metrics")]
use crate::metrics::MetricsContext;
use crate::{
    calls::CallHistoryService,
    config::ServerConfig,
    signaling::SignalMailbox,
    telemetry::{HttpOnResponse, HttpSpanMaker, REQUEST_ID_HEADER},
};

/// Where signals and call history are kept, as reported by `/ready`.
#[derive(Clone)]
pub enum StorageState {
    InMemory,
    Connected,
    Error(String),
}

impl StorageState {
    fn component(&self) -> ComponentStatus {
        match self {
            StorageState::InMemory => ComponentStatus {
                name: "storage",
                status: "in_memory",
                details: Some("database_url not configured".to_string()),
            },
            StorageState::Connected => ComponentStatus {
                name: "storage",
                status: "connected",
                details: Some("postgres connection established".to_string()),
            },
            StorageState::Error(message) => ComponentStatus {
                name: "storage",
                status: "error",
                details: Some(message.clone()),
            },
        }
    }

    fn readiness_status(&self) -> &'static str {
        match self {
            StorageState::InMemory | StorageState::Connected => "ready",
            StorageState::Error(_) => "degraded",
        }
    }

    #[cfg(feature = "metrics")]
    fn is_ready(&self) -> bool {
        !matches!(self, StorageState::Error(_))
    }
}

#[derive(Clone)]
pub struct AppState {
    started_at: Instant,
    #[cfg_attr(not(feature = "metrics"), allow(dead_code))]
    config: Arc<ServerConfig>,
    storage: StorageState,
    mailbox: Arc<SignalMailbox>,
    call_history: Arc<CallHistoryService>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<MetricsContext>>,
}

impl AppState {
    pub fn new(config: Arc<ServerConfig>, storage: StorageState, store: Arc<dyn KeyValueStore>) -> Self {
        let mailbox = SignalMailbox::new(store.clone(), config.signaling.mailbox_warn_depth);
        Self {
            started_at: Instant::now(),
            config,
            storage,
            mailbox: Arc::new(mailbox),
            call_history: Arc::new(CallHistoryService::new(store)),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    #[cfg(test)]
    fn with_start_time(mut self, started_at: Instant) -> Self {
        self.started_at = started_at;
        self
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Option<Arc<MetricsContext>>) -> Self {
        self.metrics = metrics;
        self
    }

    fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn mailbox(&self) -> Arc<SignalMailbox> {
        self.mailbox.clone()
    }

    pub fn call_history(&self) -> Arc<CallHistoryService> {
        self.call_history.clone()
    }

    fn record_http_request(&self, route: &str, status: u16) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            let status_str = status.to_string();
            metrics
                .http_requests_total
                .with_label_values(&[route, status_str.as_str()])
                .inc();
        }
        #[cfg(not(feature = "metrics"))]
        {
            let _ = (self, route, status);
        }
    }

    fn record_signal(&self, outcome: &str, count: u64) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_signals(outcome, count);
        }
        #[cfg(not(feature = "metrics"))]
        {
            let _ = (self, outcome, count);
        }
    }

    #[cfg(feature = "metrics")]
    fn metrics_enabled(&self) -> bool {
        self.config.metrics.enabled
    }

    #[cfg(feature = "metrics")]
    fn metrics(&self) -> Option<Arc<MetricsContext>> {
        self.metrics.clone()
    }
}

async fn health(State(state): State<AppState>) -> &'static str {
    state.record_http_request("health", 200);
    "ok"
}

async fn readiness(State(state): State<AppState>) -> Json<ReadinessResponse> {
    #[cfg(feature = "metrics")]
    if let Some(metrics) = state.metrics() {
        metrics.set_storage_ready(state.storage.is_ready());
    }
    state.record_http_request("ready", 200);

    Json(ReadinessResponse {
        status: state.storage.readiness_status(),
        uptime_seconds: state.uptime_seconds(),
        components: vec![state.storage.component()],
    })
}

#[derive(Serialize)]
struct VersionResponse {
    version: &'static str,
}

async fn version(State(state): State<AppState>) -> Json<VersionResponse> {
    state.record_http_request("version", 200);
    Json(VersionResponse {
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
struct ReadinessResponse {
    status: &'static str,
    uptime_seconds: u64,
    components: Vec<ComponentStatus>,
}

#[derive(Serialize)]
struct ComponentStatus {
    name: &'static str,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

pub fn build_app(state: AppState) -> Router {
    #[cfg(feature = "metrics")]
    let expose_metrics_here =
        state.metrics_enabled() && state.config.metrics.bind_addr.is_none();
    #[cfg(feature = "metrics")]
    let metrics_ctx = state.metrics();

    let signaling_routes = Router::new()
        .route(
            "/signal",
            get(signaling::get_signals).post(signaling::post_signal),
        )
        .route("/calls", get(calls::list_calls).post(calls::record_call));

    let mut router = Router::new()
        .route("/health", get(health))
        .route("/ready", get(readiness))
        .route("/version", get(version));

    #[cfg(feature = "metrics")]
    {
        if expose_metrics_here {
            router = router.route("/metrics", get(metrics_handler));
        }
    }

    // Served bare and under `/api` for older web clients.
    router = router.merge(signaling_routes.clone());
    router = router.nest("/api", signaling_routes);
    router = router.fallback(error::not_found);

    let request_id_header = HeaderName::from_static(REQUEST_ID_HEADER);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(HttpSpanMaker)
        .on_response(HttpOnResponse);

    let builder = ServiceBuilder::new()
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("content-security-policy"),
            HeaderValue::from_static(CONTENT_SECURITY_POLICY),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static(REFERRER_POLICY),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static(X_CONTENT_TYPE_OPTIONS),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static(X_FRAME_OPTIONS),
        ))
        .layer(PropagateHeaderLayer::new(request_id_header.clone()))
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
        .layer(trace_layer);

    #[cfg(feature = "metrics")]
    let builder = builder.layer(MetricsRecorderLayer {
        metrics: metrics_ctx,
    });

    router.layer(builder.into_inner()).with_state(state)
}

#[cfg(feature = "metrics")]
#[derive(Clone)]
struct MetricsRecorderLayer {
    metrics: Option<Arc<MetricsContext>>,
}

#[cfg(feature = "metrics")]
impl<S> tower::Layer<S> for MetricsRecorderLayer {
    type Service = MetricsRecorderService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsRecorderService {
            inner,
            metrics: self.metrics.clone(),
        }
    }
}

#[cfg(feature = "metrics")]
#[derive(Clone)]
struct MetricsRecorderService<S> {
    inner: S,
    metrics: Option<Arc<MetricsContext>>,
}

#[cfg(feature = "metrics")]
impl<S, B> tower::Service<axum::http::Request<B>> for MetricsRecorderService<S>
where
    S: tower::Service<axum::http::Request<B>, Response = axum::response::Response>,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: axum::http::Request<B>) -> Self::Future {
        let metrics = self.metrics.clone();
        let route = request
            .extensions()
            .get::<MatchedPath>()
            .map(|matched| matched.as_str().to_string())
            .unwrap_or_else(|| request.uri().path().to_string());
        let start = Instant::now();

        let future = self.inner.call(request);

        Box::pin(async move {
            let response = future.await?;
            if let Some(metrics) = metrics {
                metrics.observe_http_latency(&route, response.status().as_u16(), start.elapsed());
            }
            Ok(response)
        })
    }
}

#[cfg(feature = "metrics")]
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let Some(metrics) = state.metrics() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(?err, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(feature = "metrics")]
pub async fn serve_metrics(bind_addr: SocketAddr, state: AppState) -> Result<()> {
    let router = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(state);
    let listener = TcpListener::bind(bind_addr).await?;
    let addr = listener.local_addr()?;
    info!("metrics listening on {addr}");
    axum::serve(listener, router.into_make_service()).await?;
    Ok(())
}
