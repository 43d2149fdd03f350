//! Fixtures shared by unit tests: synthetic media and fake detectors.

use crate::{
    config::{
        Config, DecoderConfig, ExecutorConfig, HandlerConfig, LogLevel, ModelConfig,
        QualityConfig, ServerConfig,
    },
    decoder::FrameStream,
    detection::{Detection, DetectionParams},
    frame::Frame,
    model_service::{Detector, InferError},
};
use futures::StreamExt;
use image::{ImageFormat, Rgb, RgbImage};
use parking_lot::{Condvar, Mutex};
use std::{
    io::Cursor,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

pub fn test_config() -> Config {
    Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        log_level: LogLevel::Debug,
        model: ModelConfig {
            path: PathBuf::from("models/test.onnx"),
            device: "cpu".to_string(),
            labels_path: None,
            confidence_threshold: 0.5,
            iou_threshold: 0.7,
            input_size: 640,
        },
        executor: ExecutorConfig {
            worker_count: 2,
            queue_depth: 8,
        },
        decoder: DecoderConfig::default(),
        handler: HandlerConfig::default(),
        quality: QualityConfig::default(),
    }
}

pub fn png_bytes(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
    let image = RgbImage::from_pixel(width, height, Rgb(color));
    let mut bytes = Cursor::new(Vec::new());
    image.write_to(&mut bytes, ImageFormat::Png).unwrap();
    bytes.into_inner()
}

/// Uncompressed 4:2:0 video. Frames flagged `true` carry a white square in the
/// middle of an otherwise black picture.
pub fn y4m_video(width: u32, height: u32, fps: u32, frames: &[bool]) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let chroma = w.div_ceil(2) * h.div_ceil(2);
    let mut bytes =
        format!("YUV4MPEG2 W{} H{} F{}:1 Ip A1:1 C420jpeg\n", width, height, fps).into_bytes();

    for &with_square in frames {
        bytes.extend_from_slice(b"FRAME\n");
        for y in 0..h {
            for x in 0..w {
                let inside = (w / 4..w * 3 / 4).contains(&x) && (h / 4..h * 3 / 4).contains(&y);
                bytes.push(if with_square && inside { 255 } else { 0 });
            }
        }
        bytes.extend(std::iter::repeat(128u8).take(chroma * 2));
    }
    bytes
}

/// Set once the value it was cloned into is dropped.
#[derive(Clone, Default)]
pub struct DropFlag(Arc<AtomicBool>);

impl DropFlag {
    pub fn is_dropped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct SetOnDrop(DropFlag);

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        (self.0).0.store(true, Ordering::SeqCst);
    }
}

/// Wraps a frame stream so that `flag` reports when the stream is dropped.
pub fn guarded(frames: FrameStream, flag: &DropFlag) -> FrameStream {
    let guard = SetOnDrop(flag.clone());
    frames
        .map(move |item| {
            let _alive = &guard;
            item
        })
        .boxed()
}

/// Whether a process exists and is not a zombie.
pub fn is_running(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => !matches!(
            stat.rsplit_once(") ").and_then(|(_, rest)| rest.chars().next()),
            Some('Z') | Some('X') | None
        ),
        Err(_) => false,
    }
}

/// Reports the bounding box of bright pixels as a single `square`.
pub struct BrightSquareDetector {
    labels: Vec<String>,
}

impl BrightSquareDetector {
    pub fn new() -> Self {
        Self {
            labels: vec!["square".to_string()],
        }
    }
}

impl Detector for BrightSquareDetector {
    fn detect(
        &self,
        frame: &Frame,
        params: &DetectionParams,
    ) -> Result<Vec<Detection>, InferError> {
        let mut bounds: Option<(u32, u32, u32, u32)> = None;
        for (i, pixel) in frame.pixels().chunks_exact(3).enumerate() {
            if pixel.iter().all(|&value| value > 200) {
                let x = i as u32 % frame.width;
                let y = i as u32 / frame.width;
                bounds = Some(match bounds {
                    Some((x1, y1, x2, y2)) => (x1.min(x), y1.min(y), x2.max(x), y2.max(y)),
                    None => (x, y, x, y),
                });
            }
        }

        let confidence = 0.9;
        Ok(bounds
            .filter(|_| confidence >= params.confidence_threshold)
            .map(|(x1, y1, x2, y2)| Detection {
                x: x1 as f32,
                y: y1 as f32,
                width: (x2 - x1 + 1) as f32,
                height: (y2 - y1 + 1) as f32,
                class_id: 0,
                label: "square".to_string(),
                confidence,
            })
            .into_iter()
            .collect())
    }

    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn name(&self) -> &str {
        "bright-square"
    }
}

/// Blocks every call until `open` is called, counting calls that started.
pub struct GatedDetector {
    labels: Vec<String>,
    open: Mutex<bool>,
    opened: Condvar,
    started: AtomicUsize,
}

impl GatedDetector {
    pub fn new() -> Self {
        Self {
            labels: vec!["gate".to_string()],
            open: Mutex::new(false),
            opened: Condvar::new(),
            started: AtomicUsize::new(0),
        }
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn open(&self) {
        *self.open.lock() = true;
        self.opened.notify_all();
    }
}

impl Detector for GatedDetector {
    fn detect(&self, _: &Frame, _: &DetectionParams) -> Result<Vec<Detection>, InferError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let mut open = self.open.lock();
        while !*open {
            self.opened.wait(&mut open);
        }
        Ok(Vec::new())
    }

    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn name(&self) -> &str {
        "gated"
    }
}

/// Detector whose behaviour is a closure over the frame.
pub struct FnDetector<F> {
    labels: Vec<String>,
    detect: F,
}

impl<F> FnDetector<F>
where
    F: Fn(&Frame) -> Result<Vec<Detection>, InferError> + Send + Sync + 'static,
{
    pub fn new(labels: &[&str], detect: F) -> Self {
        Self {
            labels: labels.iter().map(|label| label.to_string()).collect(),
            detect,
        }
    }
}

impl<F> Detector for FnDetector<F>
where
    F: Fn(&Frame) -> Result<Vec<Detection>, InferError> + Send + Sync + 'static,
{
    fn detect(&self, frame: &Frame, _: &DetectionParams) -> Result<Vec<Detection>, InferError> {
        (self.detect)(frame)
    }

    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn name(&self) -> &str {
        "fn"
    }
}

/// A detection whose `x` records the frame it came from.
pub fn marker(frame: &Frame) -> Detection {
    Detection {
        x: frame.index as f32,
        y: 0.0,
        width: 1.0,
        height: 1.0,
        class_id: 0,
        label: "marker".to_string(),
        confidence: 0.99,
    }
}

pub fn solid_frame(index: usize, width: u32, height: u32, value: u8) -> Frame {
    Frame::from_rgb_image(index, RgbImage::from_pixel(width, height, Rgb([value; 3])), 0.0)
        .unwrap()
}
