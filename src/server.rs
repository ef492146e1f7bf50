//! HTTP endpoint serving the Prometheus scrape.

use crate::error::Result;
use crate::metrics::PrometheusSink;
use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use log::{error, info};
use std::sync::Arc;

pub fn router(sink: Arc<PrometheusSink>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .with_state(sink)
}

/// Serve `/metrics` on `bind` until the listener fails.
pub async fn run(sink: Arc<PrometheusSink>, bind: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("[HTTP] Serving metrics on http://{}/metrics", bind);
    axum::serve(listener, router(sink)).await?;
    Ok(())
}

async fn metrics(State(sink): State<Arc<PrometheusSink>>) -> Response {
    match sink.render() {
        Ok(body) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            error!("[HTTP] Failed to render metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{MetricKey, MetricSink};
    use crate::registry::SourceType;

    #[tokio::test]
    async fn test_metrics_endpoint_renders_gauges() {
        let sink = Arc::new(PrometheusSink::new().unwrap());
        sink.set(
            &MetricKey {
                device: "Plug".to_string(),
                path: "tele/plug".to_string(),
                property: "Power".to_string(),
                unit: "W".to_string(),
                source_type: SourceType::HomeAssistant,
            },
            42.0,
        );

        let response = metrics(State(sink)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            prometheus::TEXT_FORMAT
        );

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("# TYPE mqtt_sensor gauge"));
        assert!(text.contains("source_type=\"ha\""));
        assert!(text.contains("} 42"));
    }
}
