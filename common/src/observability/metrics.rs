//! Prometheus metrics (Rust `prometheus` crate).
//!
//! One `MetricsContext` is intended per process. Sessions hold a clone and
//! bump counters from the audio thread; every handle is an `Arc` inside, so
//! cloning is cheap and all clones report into the same registry.

use anyhow::Result;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Configuration for the built-in Prometheus scrape endpoint.
#[derive(Debug, Clone)]
pub struct MetricsServerConfig {
    // ---
    /// Address to bind, e.g. `127.0.0.1:9100`.
    pub bind: SocketAddr,
}

impl MetricsServerConfig {
    // ---
    pub fn new(bind: SocketAddr) -> Self {
        // ---
        Self { bind }
    }
}

/// Prometheus registry plus the SCO data-path handles.
#[derive(Clone)]
pub struct MetricsContext {
    // ---
    registry: Registry,

    // Wideband frame accounting
    pub msbc_frames_decoded_total: IntCounter,
    pub msbc_frames_lost_total: IntCounter,
    pub msbc_frames_encoded_total: IntCounter,

    // Socket traffic
    pub sco_bytes_sent_total: IntCounter,
    pub sco_bytes_received_total: IntCounter,
    pub sco_packet_size_adjustments_total: IntCounter,
    pub sco_fatal_errors_total: IntCounter,

    // Ring levels (bytes)
    pub capture_buffer_level_bytes: IntGauge,
    pub playback_buffer_level_bytes: IntGauge,

    // Per call / per tick
    pub hfp_packet_loss_ratio: Histogram,
    pub sco_dispatch_seconds: Histogram,
}

impl MetricsContext {
    // ---
    /// Create a new registry and register the SCO metrics.
    ///
    /// `process_name` is applied as a constant label (`process=<name>`).
    pub fn new(process_name: &str) -> Result<Self> {
        // ---
        let registry = Registry::new_custom(
            Some("hfp_sco".into()),
            Some(prometheus::labels! { "process".to_string() => process_name.to_string() }),
        )?;

        let msbc_frames_decoded_total = IntCounter::with_opts(Opts::new(
            "msbc_frames_decoded_total",
            "mSBC frames received and decoded",
        ))?;
        let msbc_frames_lost_total = IntCounter::with_opts(Opts::new(
            "msbc_frames_lost_total",
            "mSBC frames lost or corrupted and concealed",
        ))?;
        let msbc_frames_encoded_total = IntCounter::with_opts(Opts::new(
            "msbc_frames_encoded_total",
            "mSBC frames encoded for transmission",
        ))?;

        let sco_bytes_sent_total =
            IntCounter::with_opts(Opts::new("bytes_sent_total", "Bytes written to SCO sockets"))?;
        let sco_bytes_received_total = IntCounter::with_opts(Opts::new(
            "bytes_received_total",
            "Bytes read from SCO sockets",
        ))?;
        let sco_packet_size_adjustments_total = IntCounter::with_opts(Opts::new(
            "packet_size_adjustments_total",
            "Times a session corrected its packet size from the MTU",
        ))?;
        let sco_fatal_errors_total = IntCounter::with_opts(Opts::new(
            "fatal_errors_total",
            "Sessions torn down by socket errors",
        ))?;

        let capture_buffer_level_bytes = IntGauge::with_opts(Opts::new(
            "capture_buffer_level_bytes",
            "Bytes queued in the capture ring",
        ))?;
        let playback_buffer_level_bytes = IntGauge::with_opts(Opts::new(
            "playback_buffer_level_bytes",
            "Bytes queued in the playback ring",
        ))?;

        let hfp_packet_loss_ratio = Histogram::with_opts(
            HistogramOpts::new(
                "packet_loss_ratio",
                "Lost / total mSBC frames, observed once per stopped call",
            )
            .buckets(vec![0.0, 0.001, 0.005, 0.01, 0.02, 0.05, 0.1, 0.2, 0.5, 1.0]),
        )?;
        let sco_dispatch_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "dispatch_seconds",
                "Time spent in one socket event dispatch (seconds)",
            )
            .buckets(prometheus::exponential_buckets(0.000_01, 2.0, 12)?),
        )?;

        registry.register(Box::new(msbc_frames_decoded_total.clone()))?;
        registry.register(Box::new(msbc_frames_lost_total.clone()))?;
        registry.register(Box::new(msbc_frames_encoded_total.clone()))?;
        registry.register(Box::new(sco_bytes_sent_total.clone()))?;
        registry.register(Box::new(sco_bytes_received_total.clone()))?;
        registry.register(Box::new(sco_packet_size_adjustments_total.clone()))?;
        registry.register(Box::new(sco_fatal_errors_total.clone()))?;
        registry.register(Box::new(capture_buffer_level_bytes.clone()))?;
        registry.register(Box::new(playback_buffer_level_bytes.clone()))?;
        registry.register(Box::new(hfp_packet_loss_ratio.clone()))?;
        registry.register(Box::new(sco_dispatch_seconds.clone()))?;

        Ok(Self {
            registry,
            msbc_frames_decoded_total,
            msbc_frames_lost_total,
            msbc_frames_encoded_total,
            sco_bytes_sent_total,
            sco_bytes_received_total,
            sco_packet_size_adjustments_total,
            sco_fatal_errors_total,
            capture_buffer_level_bytes,
            playback_buffer_level_bytes,
            hfp_packet_loss_ratio,
            sco_dispatch_seconds,
        })
    }

    /// Gather metric families from this registry.
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        // ---
        self.registry.gather()
    }

    /// Renders the registry in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        // ---
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Spawns a minimal HTTP server that serves `GET /metrics`.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn spawn_metrics_server(&self, cfg: MetricsServerConfig) -> JoinHandle<Result<()>> {
        // ---
        let registry = Arc::new(self.registry.clone());
        tokio::spawn(async move {
            // ---
            let make_svc = make_service_fn(move |_conn| {
                let registry = Arc::clone(&registry);
                async move {
                    Ok::<_, hyper::Error>(service_fn(move |req| {
                        let registry = Arc::clone(&registry);
                        async move { handle_metrics_request(req, registry).await }
                    }))
                }
            });

            Server::bind(&cfg.bind)
                .serve(make_svc)
                .await
                .map_err(|e| anyhow::anyhow!(e))
        })
    }
}

async fn handle_metrics_request(
    req: Request<Body>,
    registry: Arc<Registry>,
) -> Result<Response<Body>, hyper::Error> {
    if req.method() != Method::GET || req.uri().path() != "/metrics" {
        let mut resp = Response::new(Body::from("not found"));
        *resp.status_mut() = StatusCode::NOT_FOUND;
        return Ok(resp);
    }

    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&registry.gather(), &mut buffer) {
        let mut resp = Response::new(Body::from(format!("encode error: {e}")));
        *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        return Ok(resp);
    }

    let mut resp = Response::new(Body::from(buffer));
    resp.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    Ok(resp)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn registers_sco_metrics() {
        // ---
        let ctx = MetricsContext::new("test").expect("MetricsContext should init");
        ctx.msbc_frames_lost_total.inc();
        ctx.hfp_packet_loss_ratio.observe(0.25);

        let text = ctx.render().expect("render");
        assert!(text.contains("hfp_sco_msbc_frames_lost_total"));
        assert!(text.contains("hfp_sco_packet_loss_ratio_count"));
    }

    #[test]
    fn clones_share_registry() {
        // ---
        let ctx = MetricsContext::new("test").expect("MetricsContext should init");
        let clone = ctx.clone();
        clone.sco_bytes_sent_total.inc_by(60);
        assert_eq!(ctx.sco_bytes_sent_total.get(), 60);
    }
}
