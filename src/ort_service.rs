use crate::{
    config::ModelConfig,
    detection::{non_max_suppression, Detection, DetectionParams},
    frame::Frame,
    labels::label_for,
    model_service::{Detector, InferError},
};
use image::imageops::{self, FilterType};
use ndarray::{Array, ArrayD, ArrayViewD, Axis, Ix2, Ix4};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use parking_lot::Mutex;
use std::{
    path::Path,
    sync::atomic::{AtomicUsize, Ordering},
};

fn transform_frame(frame: &Frame, input_size: u32) -> Result<Array<f32, Ix4>, InferError> {
    let image = frame
        .as_image()
        .ok_or_else(|| InferError::InvalidFrame("pixel buffer does not match dimensions".into()))?;
    let resized = imageops::resize(&image, input_size, input_size, FilterType::CatmullRom);

    let side = input_size as usize;
    let mut input = Array::zeros((1, 3, side, side));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        let [r, g, b] = pixel.0;
        input[[0, 0, y, x]] = (r as f32) / 255.;
        input[[0, 1, y, x]] = (g as f32) / 255.;
        input[[0, 2, y, x]] = (b as f32) / 255.;
    }

    Ok(input)
}

/// Turns a `[1, 4 + classes, candidates]` YOLO head into frame-space detections.
/// Box centers and sizes are expressed in model-input pixels.
pub(crate) fn decode_output(
    output: ArrayViewD<f32>,
    frame_width: u32,
    frame_height: u32,
    input_size: u32,
    labels: &[String],
    params: &DetectionParams,
) -> Result<Vec<Detection>, InferError> {
    let shape = output.shape().to_vec();
    if shape.len() != 3 || shape[0] != 1 || shape[1] < 5 {
        return Err(InferError::Output(format!(
            "expected shape [1, 4 + classes, candidates], got {:?}",
            shape
        )));
    }
    let output = output
        .index_axis(Axis(0), 0)
        .into_dimensionality::<Ix2>()
        .map_err(|e| InferError::Output(e.to_string()))?;

    let x_scale = frame_width as f32 / input_size as f32;
    let y_scale = frame_height as f32 / input_size as f32;
    let (max_x, max_y) = (frame_width as f32, frame_height as f32);

    let mut boxes = Vec::new();
    for candidate in output.axis_iter(Axis(1)) {
        let (class_id, confidence) = candidate
            .iter()
            .skip(4)
            .copied()
            .enumerate()
            .fold((0, f32::MIN), |best, (index, value)| {
                if value > best.1 {
                    (index, value)
                } else {
                    best
                }
            });

        if confidence < params.confidence_threshold {
            continue;
        }

        let xc = candidate[0] * x_scale;
        let yc = candidate[1] * y_scale;
        let w = candidate[2] * x_scale;
        let h = candidate[3] * y_scale;

        let x1 = (xc - w / 2.).clamp(0., max_x);
        let y1 = (yc - h / 2.).clamp(0., max_y);
        let x2 = (xc + w / 2.).clamp(0., max_x);
        let y2 = (yc + h / 2.).clamp(0., max_y);

        boxes.push(Detection {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            class_id: class_id as u32,
            label: label_for(labels, class_id),
            confidence: confidence.min(1.0),
        });
    }

    Ok(non_max_suppression(boxes, params.iou_threshold))
}

fn build_session(path: &Path) -> Result<Session, ort::Error> {
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(1)?
        .commit_from_file(path)?;
    Ok(session)
}

/// YOLO detector backed by onnxruntime. ort needs exclusive access to run a
/// session, so one session is kept per worker slot.
pub struct OrtDetector {
    sessions: Vec<Mutex<Session>>,
    counter: AtomicUsize,
    labels: Vec<String>,
    input_size: u32,
    name: String,
}

impl OrtDetector {
    pub fn new(
        model_config: &ModelConfig,
        labels: Vec<String>,
        slots: usize,
    ) -> Result<Self, ort::Error> {
        let sessions = (0..slots)
            .map(|_| build_session(&model_config.path).map(Mutex::new))
            .collect::<Result<Vec<_>, ort::Error>>()?;

        tracing::info!("Created {} ONNX sessions", sessions.len());

        Ok(Self {
            sessions,
            counter: AtomicUsize::new(0),
            labels,
            input_size: model_config.input_size,
            name: model_config.model_name(),
        })
    }

    fn run_inference(&self, input: &Array<f32, Ix4>) -> Result<ArrayD<f32>, InferError> {
        // Admission never lets more callers in than there are sessions, so a
        // free slot is normally found without blocking.
        let mut session = match self.sessions.iter().find_map(|slot| slot.try_lock()) {
            Some(session) => session,
            None => {
                let index = self.counter.fetch_add(1, Ordering::Relaxed) % self.sessions.len();
                tracing::debug!("All sessions busy, waiting on session {}", index);
                self.sessions[index].lock()
            }
        };

        let tensor_ref = TensorRef::from_array_view(input.view())
            .map_err(|e| InferError::Session(format!("failed to build tensor: {}", e)))?;

        let outputs = session
            .run(ort::inputs![tensor_ref])
            .map_err(|e| InferError::Session(e.to_string()))?;

        let (shape, data) = outputs["output0"]
            .try_extract_tensor::<f32>()
            .map_err(|e| InferError::Output(format!("failed to extract tensor: {}", e)))?;

        ArrayD::from_shape_vec(shape.to_ixdyn(), data.to_vec())
            .map_err(|e| InferError::Output(format!("invalid tensor shape: {}", e)))
    }
}

impl Detector for OrtDetector {
    fn detect(
        &self,
        frame: &Frame,
        params: &DetectionParams,
    ) -> Result<Vec<Detection>, InferError> {
        let input = transform_frame(frame, self.input_size)?;
        let output = self.run_inference(&input)?;

        decode_output(
            output.view(),
            frame.width,
            frame.height,
            self.input_size,
            &self.labels,
            params,
        )
    }

    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use ndarray::Array3;

    const PARAMS: DetectionParams = DetectionParams {
        confidence_threshold: 0.5,
        iou_threshold: 0.7,
    };

    /// Builds a `[1, 4 + classes, n]` head from `(xc, yc, w, h, class, score)` rows.
    fn head(classes: usize, rows: &[(f32, f32, f32, f32, usize, f32)]) -> ArrayD<f32> {
        let mut output = Array3::<f32>::zeros((1, 4 + classes, rows.len()));
        for (i, &(xc, yc, w, h, class, score)) in rows.iter().enumerate() {
            output[[0, 0, i]] = xc;
            output[[0, 1, i]] = yc;
            output[[0, 2, i]] = w;
            output[[0, 3, i]] = h;
            output[[0, 4 + class, i]] = score;
        }
        output.into_dyn()
    }

    #[test]
    fn test_transform_frame() {
        let image = RgbImage::from_pixel(100, 50, Rgb([255, 0, 0]));
        let frame = Frame::from_rgb_image(0, image, 0.0).unwrap();

        let input = transform_frame(&frame, 640).unwrap();

        assert_eq!(input.shape(), &[1, 3, 640, 640]);
        assert_eq!(input[[0, 0, 320, 320]], 1.0);
        assert_eq!(input[[0, 1, 320, 320]], 0.0);
    }

    #[test]
    fn test_decode_output_scales_to_frame() {
        let output = head(2, &[(320.0, 320.0, 64.0, 128.0, 1, 0.9)]);
        let labels = vec!["person".to_string(), "cat".to_string()];

        let detections = decode_output(output.view(), 1280, 320, 640, &labels, &PARAMS).unwrap();

        assert_eq!(detections.len(), 1);
        let detection = &detections[0];
        assert_eq!(detection.label, "cat");
        assert_eq!(detection.class_id, 1);
        assert!((detection.x - 576.0).abs() < 1e-3);
        assert!((detection.y - 128.0).abs() < 1e-3);
        assert!((detection.width - 128.0).abs() < 1e-3);
        assert!((detection.height - 64.0).abs() < 1e-3);
    }

    #[test]
    fn test_decode_output_filters_and_suppresses() {
        let output = head(
            1,
            &[
                (100.0, 100.0, 50.0, 50.0, 0, 0.8),
                (102.0, 101.0, 50.0, 50.0, 0, 0.95),
                (400.0, 400.0, 50.0, 50.0, 0, 0.3),
            ],
        );

        let detections = decode_output(output.view(), 640, 640, 640, &[], &PARAMS).unwrap();

        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].confidence, 0.95);
        assert_eq!(detections[0].label, "class_0");
    }

    #[test]
    fn test_decode_output_is_deterministic() {
        let output = head(
            3,
            &[
                (100.0, 100.0, 50.0, 50.0, 0, 0.8),
                (101.0, 100.0, 50.0, 50.0, 0, 0.8),
                (300.0, 200.0, 80.0, 40.0, 2, 0.7),
            ],
        );

        let first = decode_output(output.view(), 640, 480, 640, &[], &PARAMS).unwrap();
        let second = decode_output(output.view(), 640, 480, 640, &[], &PARAMS).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        assert!((first[0].x - 75.0).abs() < 1e-3);
    }

    #[test]
    fn test_decode_output_rejects_bad_shape() {
        let output = ArrayD::<f32>::zeros(vec![1, 3, 10]);

        let result = decode_output(output.view(), 640, 640, 640, &[], &PARAMS);
        assert!(matches!(result, Err(InferError::Output(_))));
    }
}
