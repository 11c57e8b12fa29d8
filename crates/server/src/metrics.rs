#![cfg(feature = "metrics")]

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct MetricsContext {
    registry: Registry,
    pub http_requests_total: IntCounterVec,
    http_request_duration: HistogramVec,
    signals_total: IntCounterVec,
    storage_ready: IntGauge,
}

impl MetricsContext {
    pub fn init() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new(
                "fusion_http_requests_total",
                "Number of HTTP responses served, labeled by route and status",
            ),
            &["route", "status"],
        )?;
        registry.register(Box::new(requests.clone()))?;

        let duration = HistogramVec::new(
            HistogramOpts::new(
                "fusion_http_request_duration_seconds",
                "HTTP request latency, labeled by matched route and status",
            ),
            &["route", "status"],
        )?;
        registry.register(Box::new(duration.clone()))?;

        let signals = IntCounterVec::new(
            Opts::new(
                "fusion_signals_total",
                "Signaling payloads by outcome (enqueued, delivered, rejected)",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(signals.clone()))?;

        let storage_ready = IntGauge::new(
            "fusion_storage_ready",
            "1 when the configured storage backend is reachable",
        )?;
        registry.register(Box::new(storage_ready.clone()))?;

        Ok(Arc::new(Self {
            registry,
            http_requests_total: requests,
            http_request_duration: duration,
            signals_total: signals,
            storage_ready,
        }))
    }

    pub fn observe_http_latency(&self, route: &str, status: u16, latency: Duration) {
        let status = status.to_string();
        self.http_request_duration
            .with_label_values(&[route, status.as_str()])
            .observe(latency.as_secs_f64());
    }

    pub fn record_signals(&self, outcome: &str, count: u64) {
        self.signals_total
            .with_label_values(&[outcome])
            .inc_by(count);
    }

    pub fn set_storage_ready(&self, ready: bool) {
        self.storage_ready.set(i64::from(ready));
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_registered_families() {
        let metrics = MetricsContext::init().expect("metrics");
        metrics
            .http_requests_total
            .with_label_values(&["signal.send", "200"])
            .inc();
        metrics.record_signals("enqueued", 2);
        metrics.set_storage_ready(true);

        let body = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(body.contains("fusion_http_requests_total"));
        assert!(body.contains("fusion_signals_total{outcome=\"enqueued\"} 2"));
        assert!(body.contains("fusion_storage_ready 1"));
    }
}
