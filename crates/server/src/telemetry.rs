//! Log formatting and per-request spans.

use std::time::Duration;

use axum::{body::HttpBody, extract::MatchedPath};
use tower_http::request_id::RequestId;
use tracing::{
    field::{Field, Visit},
    Event, Subscriber,
};
use tracing_subscriber::{
    fmt::{
        format::Format as FmtFormat, format::Writer as FmtWriter, writer::MakeWriter, FmtContext,
        FormatEvent, FormatFields,
    },
    layer::{Context as LayerContext, SubscriberExt},
    registry::LookupSpan,
    EnvFilter, Layer,
};

use crate::config::{LogFormat, ServerConfig};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
const DEFAULT_FILTER: &str = "info,fusion_server=info,fusion=info";

pub fn init_tracing(config: &ServerConfig) {
    // RUST_LOG wins when set.
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let json = matches!(config.log_format(), LogFormat::Json);
    let subscriber = build_subscriber(json, env_filter, std::io::stderr);

    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install tracing subscriber: {err}");
    }
}

pub fn build_subscriber<W>(
    json: bool,
    env_filter: EnvFilter,
    make_writer: W,
) -> Box<dyn Subscriber + Send + Sync>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + Clone + 'static,
{
    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(RequestIdStorageLayer);

    if json {
        let format = FmtFormat::default()
            .with_target(true)
            .with_level(true)
            .json();
        Box::new(
            registry.with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .event_format(RequestIdEventFormat { inner: format })
                    .with_writer(make_writer),
            ),
        )
    } else {
        let format = FmtFormat::default().with_target(true).with_level(true);
        Box::new(
            registry.with(
                tracing_subscriber::fmt::layer()
                    .event_format(RequestIdEventFormat { inner: format })
                    .with_writer(make_writer),
            ),
        )
    }
}

/// Opens one `http.request` span per request, keyed by the matched route.
#[derive(Clone, Default)]
pub struct HttpSpanMaker;

impl<B> tower_http::trace::MakeSpan<B> for HttpSpanMaker
where
    B: HttpBody + Send + 'static,
    B::Data: Send,
{
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let route = request
            .extensions()
            .get::<MatchedPath>()
            .map(|matched| matched.as_str().to_owned())
            .unwrap_or_else(|| request.uri().path().to_owned());
        let request_id = request
            .extensions()
            .get::<RequestId>()
            .and_then(|rid| rid.header_value().to_str().ok())
            .unwrap_or("unknown")
            .to_owned();

        tracing::info_span!(
            "http.request",
            method = %request.method(),
            route = %route,
            request_id = %request_id,
            status_code = tracing::field::Empty,
            latency_ms = tracing::field::Empty
        )
    }
}

#[derive(Clone, Default)]
pub struct HttpOnResponse;

impl<B> tower_http::trace::OnResponse<B> for HttpOnResponse
where
    B: HttpBody + Send + 'static,
    B::Data: Send,
{
    fn on_response(
        self,
        response: &axum::http::Response<B>,
        latency: Duration,
        span: &tracing::Span,
    ) {
        let latency_ms = latency.as_secs_f64() * 1000.0;
        let status = response.status().as_u16();

        span.record("status_code", tracing::field::display(status));
        span.record("latency_ms", tracing::field::display(latency_ms));

        tracing::debug!(parent: span, status, latency_ms, "request completed");
    }
}

#[derive(Default)]
struct RequestIdStorageLayer;

#[derive(Clone)]
struct RequestIdExtension(String);

#[derive(Default)]
struct RequestIdVisitor {
    request_id: Option<String>,
}

impl Visit for RequestIdVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "request_id" {
            self.request_id = Some(value.to_owned());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "request_id" && self.request_id.is_none() {
            let rendered = format!("{value:?}");
            self.request_id = Some(rendered.trim_matches('"').to_owned());
        }
    }
}

impl<S> Layer<S> for RequestIdStorageLayer
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    fn on_new_span(
        &self,
        attrs: &tracing::span::Attributes<'_>,
        id: &tracing::Id,
        ctx: LayerContext<'_, S>,
    ) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut visitor = RequestIdVisitor::default();
        attrs.record(&mut visitor);
        if let Some(request_id) = visitor.request_id {
            span.extensions_mut().insert(RequestIdExtension(request_id));
        }
    }
}

/// Prefixes each event with the request id of the innermost request span.
struct RequestIdEventFormat<E> {
    inner: E,
}

impl<S, N, E> FormatEvent<S, N> for RequestIdEventFormat<E>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
    N: for<'writer> FormatFields<'writer> + 'static,
    E: FormatEvent<S, N>,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: FmtWriter<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        if let Some(scope) = ctx.event_scope() {
            for span in scope {
                if let Some(request_id) = span.extensions().get::<RequestIdExtension>() {
                    write!(writer, "[request_id={}] ", request_id.0)?;
                    break;
                }
            }
        }

        self.inner.format_event(ctx, writer, event)
    }
}
