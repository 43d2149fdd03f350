use crate::{
    error::{ApiError, RequestFailure},
    frame::MediaKind,
    handler::{DetectionResponse, InferenceRequest, RequestOptions},
    server::SharedState,
};
use axum::{
    body::Body,
    extract::{rejection::QueryRejection, Query, State},
    http::{header, HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
};
use http_body_util::LengthLimitError;
use serde::Deserialize;
use std::{error::Error as _, time::Instant};
use tracing::instrument;

const ROUTE: &str = "/v1/detect";

#[derive(Debug, Default, Deserialize)]
pub struct DetectQuery {
    pub kind: Option<String>,
    pub confidence: Option<f32>,
    /// Comma-separated label names.
    pub classes: Option<String>,
    pub max_frames: Option<usize>,
}

impl DetectQuery {
    fn options(&self) -> RequestOptions {
        RequestOptions {
            confidence: self.confidence,
            classes: self.classes.as_ref().map(|classes| {
                classes
                    .split(',')
                    .map(str::trim)
                    .filter(|class| !class.is_empty())
                    .map(String::from)
                    .collect()
            }),
            max_frames: self.max_frames,
        }
    }
}

fn declared_kind(query: &DetectQuery, headers: &HeaderMap) -> Option<String> {
    query.kind.clone().or_else(|| {
        headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(MediaKind::from_content_type)
            .map(|kind| kind.as_str().to_string())
    })
}

async fn read_payload(headers: &HeaderMap, body: Body, limit: usize) -> Result<bytes::Bytes, ApiError> {
    let declared_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok());
    if declared_length.is_some_and(|length| length > limit) {
        return Err(ApiError::PayloadTooLarge { limit });
    }

    axum::body::to_bytes(body, limit).await.map_err(|e| {
        if exceeds_length_limit(&e) {
            ApiError::PayloadTooLarge { limit }
        } else {
            ApiError::InvalidInput(format!("failed to read request body: {}", e))
        }
    })
}

fn exceeds_length_limit(error: &axum::Error) -> bool {
    let mut source = error.source();
    while let Some(cause) = source {
        if cause.is::<LengthLimitError>() {
            return true;
        }
        source = cause.source();
    }
    false
}

async fn run_detection(
    state: &SharedState,
    request_id: &str,
    query: Result<Query<DetectQuery>, QueryRejection>,
    headers: &HeaderMap,
    body: Body,
) -> Result<DetectionResponse, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::InvalidInput(e.body_text()))?;
    let payload = read_payload(headers, body, state.pipeline.max_payload_bytes()).await?;

    let request = InferenceRequest {
        payload,
        declared_kind: declared_kind(&query, headers),
        options: query.options(),
    };
    state.pipeline.handle(request_id, request).await
}

#[instrument(skip_all)]
pub async fn detect(
    State(state): State<SharedState>,
    query: Result<Query<DetectQuery>, QueryRejection>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let request_id = format!("{:016x}", rand::random::<u64>());
    let started = Instant::now();

    let mut response = match run_detection(&state, &request_id, query, &headers, body).await {
        Ok(detection) => {
            state.metrics.record_frames(detection.frame_count as u64);
            state
                .metrics
                .record_inference_duration(started.elapsed().as_millis() as u64, ROUTE);
            state.metrics.record_request(ROUTE, "ok");
            (
                [(header::CONTENT_TYPE, "application/json")],
                detection.body,
            )
                .into_response()
        }
        Err(error) => {
            if matches!(error, ApiError::Overloaded) {
                state.metrics.record_rejection();
            }
            state.metrics.record_request(ROUTE, error.kind().as_str());
            tracing::info!(request_id = %request_id, "Request failed: {}", error);
            RequestFailure {
                request_id: request_id.clone(),
                error,
            }
            .into_response()
        }
    };

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}
