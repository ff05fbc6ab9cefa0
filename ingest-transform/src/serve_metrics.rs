use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    Router,
};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Install the global Prometheus recorder. Can only be called once per process.
pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    metrics_builder()?.install_recorder()
}

fn metrics_builder() -> Result<PrometheusBuilder, BuildError> {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
    ];
    const MILLISECONDS: &[f64] = &[
        1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0,
    ];
    const SIZES: &[f64] = &[
        1.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
    ];

    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("http_requests_duration_seconds".to_string()),
            EXPONENTIAL_SECONDS,
        )?
        .set_buckets_for_metric(Matcher::Suffix("_ms".to_string()), MILLISECONDS)?
        .set_buckets_for_metric(Matcher::Suffix("_batch_size".to_string()), SIZES)?
        .set_buckets_for_metric(Matcher::Suffix("_bundle_size".to_string()), SIZES)
}

/// Middleware to record some common HTTP metrics
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };

    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics_consts::{BATCH_SIZE, SINK_WRITE_TIME};

    #[test]
    fn histograms_use_buckets_in_their_own_unit() {
        let recorder = metrics_builder().unwrap().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            metrics::histogram!("http_requests_duration_seconds").record(0.2);
            metrics::histogram!(SINK_WRITE_TIME).record(200.0);
            metrics::histogram!(BATCH_SIZE).record(20.0);
        });
        let rendered = handle.render();

        assert!(rendered.contains(r#"http_requests_duration_seconds_bucket{le="0.25"} 1"#));
        assert!(!rendered.contains(r#"http_requests_duration_seconds_bucket{le="2500"#));
        assert!(rendered.contains(r#"ingest_transform_sink_write_time_ms_bucket{le="250"#));
        assert!(!rendered.contains(r#"ingest_transform_sink_write_time_ms_bucket{le="0.25"#));
        assert!(rendered.contains(r#"ingest_transform_batch_size_bucket{le="25"#));
    }
}
