use std::future::Future;
use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::health::HealthRegistry;

/// Serve `router` on `bind` until `shutdown` resolves.
pub async fn serve<F>(router: Router, bind: &str, shutdown: F) -> Result<(), std::io::Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

/// Operational endpoints of the dispatcher: Prometheus metrics and liveness.
pub fn app(metrics: Option<PrometheusHandle>, liveness: HealthRegistry) -> Router {
    Router::new()
        .route("/", get(index))
        .route(
            "/metrics",
            get(move || match metrics {
                Some(ref recorder_handle) => std::future::ready(recorder_handle.render()),
                None => std::future::ready("no metrics recorder installed".to_owned()),
            }),
        )
        .route(
            "/_liveness",
            get(move || std::future::ready(liveness.get_status())),
        )
        .layer(axum::middleware::from_fn(track_metrics))
}

pub async fn index() -> &'static str {
    "epcis dispatcher"
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    // Cycles talk to the store and the partner over the network, so buckets reach minutes.
    const CYCLE_SECONDS: &[f64] = &[
        0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(CYCLE_SECONDS)?
        .install_recorder()
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
    use axum::http::StatusCode;

    #[tokio::test]
    async fn test_routes() {
        let liveness = HealthRegistry::new("liveness");
        let handle = liveness
            .register("dispatch_cycle", time::Duration::seconds(30))
            .await;
        handle.report_healthy().await;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app(None, liveness)).await.unwrap();
        });

        let client = reqwest::Client::new();
        let index = client.get(format!("http://{addr}/")).send().await.unwrap();
        assert_eq!(index.text().await.unwrap(), "epcis dispatcher");

        let metrics = client
            .get(format!("http://{addr}/metrics"))
            .send()
            .await
            .unwrap();
        assert_eq!(
            metrics.text().await.unwrap(),
            "no metrics recorder installed"
        );

        // The registry applies reports asynchronously.
        let mut status = StatusCode::INTERNAL_SERVER_ERROR;
        for _ in 0..50 {
            let response = client
                .get(format!("http://{addr}/_liveness"))
                .send()
                .await
                .unwrap();
            status = response.status();
            if status == StatusCode::OK {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        assert_eq!(status, StatusCode::OK);
    }
}
