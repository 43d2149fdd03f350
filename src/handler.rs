use crate::{
    config::{Config, HandlerConfig, QualityConfig},
    decoder::{DecodeError, FrameStream, MediaDecoder},
    detection::{Detection, DetectionParams, FrameResult, InferenceResult},
    error::{ApiError, ErrorKind},
    executor::{CancelToken, ExecutorError, InferenceExecutor},
    frame::{Frame, MediaKind},
    model_service::ModelHandle,
    quality::{assess, QualityReport},
};
use bytes::Bytes;
use futures::{
    future::{self, BoxFuture, FutureExt},
    stream::{self, FuturesOrdered},
    StreamExt,
};
use std::{collections::HashSet, fmt, sync::Arc, time::Duration};
use tokio::time::timeout;
use tracing::instrument;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOptions {
    pub confidence: Option<f32>,
    pub classes: Option<Vec<String>>,
    pub max_frames: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub payload: Bytes,
    /// `image` or `video`, as declared by the client.
    pub declared_kind: Option<String>,
    pub options: RequestOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStage {
    Received,
    Validating,
    Decoding,
    Inferring,
    Aggregating,
    Responded,
    Failed(ErrorKind),
}

impl RequestStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStage::Responded | RequestStage::Failed(_))
    }
}

impl fmt::Display for RequestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestStage::Failed(kind) => write!(f, "failed({})", kind.as_str()),
            other => write!(f, "{}", format!("{:?}", other).to_lowercase()),
        }
    }
}

/// Records the lifecycle of one request. Once terminal, the stage never moves.
#[derive(Debug)]
pub struct StageTracker {
    stage: RequestStage,
}

impl StageTracker {
    pub fn new() -> Self {
        Self {
            stage: RequestStage::Received,
        }
    }

    pub fn stage(&self) -> RequestStage {
        self.stage
    }

    pub fn advance(&mut self, next: RequestStage) {
        if self.stage.is_terminal() || self.stage == next {
            return;
        }
        tracing::debug!(from = %self.stage, to = %next, "Request stage changed");
        self.stage = next;
    }

    pub fn fail(&mut self, error: &ApiError) {
        self.advance(RequestStage::Failed(error.kind()));
    }
}

impl Default for StageTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// A response body ready to send, with the number of frames it covers.
#[derive(Debug)]
pub struct DetectionResponse {
    pub body: Bytes,
    pub frame_count: usize,
}

type PendingFrame = (usize, f64, Result<Vec<Detection>, ExecutorError>);

struct ValidatedRequest {
    kind: MediaKind,
    params: DetectionParams,
    classes: Option<HashSet<String>>,
    max_frames: usize,
}

/// Drives one request from raw payload to serialized `InferenceResult`.
pub struct DetectionPipeline {
    decoder: MediaDecoder,
    executor: Arc<InferenceExecutor>,
    model: ModelHandle,
    default_params: DetectionParams,
    max_frames: usize,
    handler: HandlerConfig,
    quality: QualityConfig,
}

impl DetectionPipeline {
    pub fn new(model: ModelHandle, executor: Arc<InferenceExecutor>, config: &Config) -> Self {
        Self {
            decoder: MediaDecoder::new(config.decoder.clone()),
            executor,
            model,
            default_params: config.model.detection_params(),
            max_frames: config.decoder.max_frames,
            handler: config.handler.clone(),
            quality: config.quality.clone(),
        }
    }

    pub fn max_payload_bytes(&self) -> usize {
        self.handler.max_payload_bytes
    }

    pub fn executor(&self) -> &Arc<InferenceExecutor> {
        &self.executor
    }

    #[instrument(skip(self, request), fields(request_id = %request_id, bytes = request.payload.len()))]
    pub async fn handle(
        &self,
        request_id: &str,
        request: InferenceRequest,
    ) -> Result<DetectionResponse, ApiError> {
        let mut stages = StageTracker::new();
        let deadline = Duration::from_millis(self.handler.request_timeout_ms);

        let outcome = match timeout(deadline, self.process(&mut stages, request_id, request)).await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!("Request timed out after {:?}", deadline);
                Err(ApiError::Timeout(deadline))
            }
        };

        let response = outcome.and_then(|result| {
            let frame_count = result.frames.len();
            serde_json::to_vec(&result)
                .map(|body| DetectionResponse {
                    body: Bytes::from(body),
                    frame_count,
                })
                .map_err(|e| ApiError::Internal(format!("failed to serialize result: {}", e)))
        });

        match &response {
            Ok(_) => stages.advance(RequestStage::Responded),
            Err(error) => stages.fail(error),
        }
        response
    }

    async fn process(
        &self,
        stages: &mut StageTracker,
        request_id: &str,
        request: InferenceRequest,
    ) -> Result<InferenceResult, ApiError> {
        stages.advance(RequestStage::Validating);
        let plan = self.validate(&request)?;

        // Jobs still queued for this request are skipped once it is dropped.
        let cancel = CancelToken::new();
        let _cancel_guard = cancel.drop_guard();

        stages.advance(RequestStage::Decoding);
        let (frames, quality) = match plan.kind {
            MediaKind::Image if self.quality.enabled => {
                let frame = self
                    .decoder
                    .decode(request.payload, MediaKind::Image, None)
                    .next()
                    .await
                    .unwrap_or(Err(DecodeError::Empty))?;
                let (frame, report) = self.assess_quality(frame).await?;
                if self.quality.reject && !report.is_valid {
                    return Err(ApiError::InvalidInput(
                        report
                            .reason
                            .unwrap_or_else(|| "image failed the quality check".to_string()),
                    ));
                }
                let frames: FrameStream = stream::once(future::ready(Ok(frame))).boxed();
                (frames, Some(report))
            }
            kind => (
                self.decoder
                    .decode(request.payload, kind, Some(plan.max_frames)),
                None,
            ),
        };

        let (mut results, truncated) = self
            .infer_frames(stages, frames, plan.params, &cancel)
            .await?;

        stages.advance(RequestStage::Aggregating);
        if let Some(classes) = &plan.classes {
            for result in &mut results {
                result
                    .detections
                    .retain(|detection| classes.contains(&detection.label));
            }
        }

        Ok(InferenceResult {
            request_id: request_id.to_string(),
            kind: plan.kind,
            model: self.model.name().to_string(),
            truncated,
            quality,
            frames: results,
        })
    }

    fn validate(&self, request: &InferenceRequest) -> Result<ValidatedRequest, ApiError> {
        let kind = request
            .declared_kind
            .as_deref()
            .ok_or_else(|| {
                ApiError::InvalidInput(
                    "media kind is missing, pass `kind` or an image/video Content-Type".into(),
                )
            })?
            .parse::<MediaKind>()
            .map_err(ApiError::InvalidInput)?;

        if request.payload.is_empty() {
            return Err(ApiError::InvalidInput("payload is empty".into()));
        }
        if request.payload.len() > self.handler.max_payload_bytes {
            return Err(ApiError::PayloadTooLarge {
                limit: self.handler.max_payload_bytes,
            });
        }

        let mut params = self.default_params;
        if let Some(confidence) = request.options.confidence {
            if !(0.0..=1.0).contains(&confidence) {
                return Err(ApiError::InvalidInput(format!(
                    "confidence must be within [0, 1], got {}",
                    confidence
                )));
            }
            params.confidence_threshold = confidence;
        }

        let max_frames = match request.options.max_frames {
            Some(0) => {
                return Err(ApiError::InvalidInput(
                    "max_frames must be at least 1".into(),
                ))
            }
            Some(requested) => requested.min(self.max_frames),
            None => self.max_frames,
        };

        let classes = match &request.options.classes {
            Some(classes) if !classes.is_empty() => {
                let known = self.model.labels();
                if let Some(unknown) = classes.iter().find(|class| !known.contains(class)) {
                    return Err(ApiError::InvalidInput(format!(
                        "unknown class `{}`",
                        unknown
                    )));
                }
                Some(classes.iter().cloned().collect())
            }
            _ => None,
        };

        Ok(ValidatedRequest {
            kind,
            params,
            classes,
            max_frames,
        })
    }

    async fn assess_quality(&self, frame: Frame) -> Result<(Frame, QualityReport), ApiError> {
        let config = self.quality.clone();
        tokio::task::spawn_blocking(move || {
            let report = assess(&frame, &config);
            (frame, report)
        })
        .await
        .map_err(|e| ApiError::Internal(format!("quality check failed: {}", e)))
    }

    /// Feeds decoded frames to the executor while keeping at most one job per
    /// worker outstanding. Results come back in frame order. Returns whether a
    /// decoder failure cut the sequence short.
    pub(crate) async fn infer_frames(
        &self,
        stages: &mut StageTracker,
        mut frames: FrameStream,
        params: DetectionParams,
        cancel: &CancelToken,
    ) -> Result<(Vec<FrameResult>, bool), ApiError> {
        let window = self.executor.worker_count();
        let mut pending: FuturesOrdered<BoxFuture<'static, PendingFrame>> =
            FuturesOrdered::new();
        let mut results = Vec::new();
        let mut decode_error: Option<DecodeError> = None;
        let mut exhausted = false;

        loop {
            tokio::select! {
                biased;

                Some((frame_index, timestamp, reply)) = pending.next(), if !pending.is_empty() => {
                    let detections = reply?;
                    results.push(FrameResult {
                        frame_index,
                        timestamp,
                        detections,
                    });
                }
                next = frames.next(), if !exhausted && pending.len() < window => {
                    match next {
                        Some(Ok(frame)) => {
                            stages.advance(RequestStage::Inferring);
                            let (frame_index, timestamp) = (frame.index, frame.timestamp);
                            let job = self.executor.submit(frame, params, cancel)?;
                            pending.push_back(
                                async move { (frame_index, timestamp, job.await) }.boxed(),
                            );
                        }
                        Some(Err(e)) => {
                            if !self.handler.accept_partial_video {
                                return Err(e.into());
                            }
                            tracing::warn!("Decoder failed mid-stream: {}", e);
                            decode_error = Some(e);
                            exhausted = true;
                        }
                        None => exhausted = true,
                    }
                }
                else => break,
            }
        }

        match decode_error {
            Some(e) if results.is_empty() => Err(e.into()),
            Some(_) => Ok((results, true)),
            None => Ok((results, false)),
        }
    }
}
