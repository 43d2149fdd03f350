use crate::{
    config::ServerConfig, handler::DetectionPipeline, model_service::ModelHandle,
    routes::api_routes, telemetry::Metrics,
};
use axum::Router;
use axum_otel_metrics::HttpMetricsLayerBuilder;
use std::sync::Arc;
use tokio::{net::TcpListener, sync::broadcast::Receiver, task::JoinHandle};

#[derive(Clone)]
pub struct SharedState {
    pub pipeline: Arc<DetectionPipeline>,
    pub model: ModelHandle,
    pub metrics: Arc<Metrics>,
}

pub fn build_router(state: SharedState) -> Router {
    let metrics_layer = HttpMetricsLayerBuilder::new().build();

    Router::new()
        .merge(api_routes())
        .with_state(state)
        .layer(metrics_layer)
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(state: SharedState, config: &ServerConfig) -> anyhow::Result<Self> {
        let addr = config.get_address();
        let router = build_router(state);
        let listener = TcpListener::bind(&addr).await?;

        Ok(Self { router, listener })
    }

    pub async fn run(self, mut shutdown_rx: Receiver<()>) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
        tracing::info!("Starting app on {}", self.listener.local_addr()?);

        let listener = self.listener;
        let router = self.router;
        let server_handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    shutdown_rx.recv().await.ok();
                })
                .await?;
            Ok(())
        });

        Ok(server_handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::ErrorResponse,
        executor::InferenceExecutor,
        test_utils::{png_bytes, test_config, BrightSquareDetector},
    };
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
    };
    use tower::ServiceExt;

    fn router_with(config: crate::config::Config) -> Router {
        let model: ModelHandle = Arc::new(BrightSquareDetector::new());
        let executor = Arc::new(InferenceExecutor::new(model.clone(), &config.executor).unwrap());
        build_router(SharedState {
            pipeline: Arc::new(DetectionPipeline::new(model.clone(), executor, &config)),
            model,
            metrics: Arc::new(Metrics::new().unwrap()),
        })
    }

    async fn json(response: axum::response::Response) -> serde_json::Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = router_with(test_config())
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await, serde_json::json!({"status": "Available"}));
    }

    #[tokio::test]
    async fn test_labels() {
        let response = router_with(test_config())
            .oneshot(Request::get("/v1/labels").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let body = json(response).await;
        assert_eq!(body["model"], "bright-square");
        assert_eq!(body["labels"], serde_json::json!(["square"]));
    }

    #[tokio::test]
    async fn test_detect_image_from_content_type() {
        let request = Request::post("/v1/detect")
            .header(header::CONTENT_TYPE, "image/png")
            .body(Body::from(png_bytes(16, 16, [255, 255, 255])))
            .unwrap();

        let response = router_with(test_config()).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
        let body = json(response).await;
        assert_eq!(body["kind"], "image");
        assert_eq!(body["frames"].as_array().unwrap().len(), 1);
        assert_eq!(body["frames"][0]["detections"][0]["label"], "square");
    }

    #[tokio::test]
    async fn test_detect_error_body() {
        let request = Request::post("/v1/detect?kind=video")
            .body(Body::from(png_bytes(8, 8, [0, 0, 0])))
            .unwrap();

        let response = router_with(test_config()).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let request_id = response.headers()["x-request-id"].to_str().unwrap().to_string();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let error: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(error.request_id, request_id);
        assert_eq!(error.error.code, crate::error::ErrorKind::DecodeError);
    }

    #[tokio::test]
    async fn test_detect_rejects_bad_query_and_large_body() {
        let mut config = test_config();
        config.handler.max_payload_bytes = 16;

        let bad_query = Request::post("/v1/detect?kind=image&confidence=high")
            .body(Body::from(vec![1u8; 8]))
            .unwrap();
        let response = router_with(config.clone()).oneshot(bad_query).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(response).await["error"]["code"], "invalid_input");

        let too_large = Request::post("/v1/detect?kind=image")
            .body(Body::from(vec![1u8; 64]))
            .unwrap();
        let response = router_with(config).oneshot(too_large).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(json(response).await["error"]["code"], "invalid_input");
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let response = router_with(test_config())
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }
}
