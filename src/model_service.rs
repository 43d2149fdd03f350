use crate::{
    config::ModelConfig,
    detection::{Detection, DetectionParams},
    frame::Frame,
    labels::load_labels,
    ort_service::OrtDetector,
};
use std::{path::PathBuf, sync::Arc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelLoadError {
    #[error("Model file not found: {0:?}")]
    NotFound(PathBuf),
    #[error("Device `{0}` is not available, only `cpu` is supported")]
    DeviceUnavailable(String),
    #[error("Failed to load labels from {path:?}: {source}")]
    Labels {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to build onnx session: {0}")]
    Session(#[from] ort::Error),
}

#[derive(Error, Debug)]
pub enum InferError {
    #[error("Frame cannot be fed to the model: {0}")]
    InvalidFrame(String),
    #[error("Inference failed: {0}")]
    Session(String),
    #[error("Unexpected model output: {0}")]
    Output(String),
}

/// A loaded detection model. `detect` is blocking and must run off the async
/// runtime; implementations never mutate observable state, so repeated calls
/// with the same frame and parameters return the same detections.
pub trait Detector: Send + Sync + 'static {
    fn detect(&self, frame: &Frame, params: &DetectionParams)
        -> Result<Vec<Detection>, InferError>;

    fn labels(&self) -> &[String];

    fn name(&self) -> &str;
}

pub type ModelHandle = Arc<dyn Detector>;

/// Loads the model once for the process lifetime. `slots` is the number of
/// workers that may call `detect` concurrently.
pub fn load(model_config: &ModelConfig, slots: usize) -> Result<ModelHandle, ModelLoadError> {
    if !model_config.device.eq_ignore_ascii_case("cpu") {
        return Err(ModelLoadError::DeviceUnavailable(
            model_config.device.clone(),
        ));
    }
    if !model_config.path.is_file() {
        return Err(ModelLoadError::NotFound(model_config.path.clone()));
    }

    let labels = match &model_config.labels_path {
        Some(path) => load_labels(path).map_err(|source| ModelLoadError::Labels {
            path: path.clone(),
            source,
        })?,
        None => Vec::new(),
    };

    let detector = OrtDetector::new(model_config, labels, slots.max(1))?;
    tracing::info!(
        model = detector.name(),
        labels = detector.labels().len(),
        "Model loaded"
    );

    Ok(Arc::new(detector))
}
