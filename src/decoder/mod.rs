mod ppm;
mod video;

use crate::{
    config::DecoderConfig,
    frame::{Frame, MediaKind},
};
use bytes::Bytes;
use futures::{stream, Stream, StreamExt};
use image::{ImageReader, Limits, RgbImage};
use std::{io::Cursor, pin::Pin, process::ExitStatus};
use thiserror::Error;
use tokio::process::Command;

pub use video::FfmpegProcess;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Unsupported or corrupt image: {0}")]
    Image(#[from] image::ImageError),
    #[error("Payload is a still image ({0:?}), not a video")]
    NotAVideo(image::ImageFormat),
    #[error("Failed to spool payload for ffmpeg: {0}")]
    Spool(std::io::Error),
    #[error("Failed to run ffmpeg: {0}")]
    Spawn(std::io::Error),
    #[error("ffmpeg exited with {status}: {stderr}")]
    Subprocess { status: ExitStatus, stderr: String },
    #[error("Malformed frame stream from ffmpeg: {0}")]
    Stream(String),
    #[error("Picture of {width}x{height} exceeds the limit of {max_pixels} pixels")]
    TooLarge {
        width: u32,
        height: u32,
        max_pixels: u64,
    },
    #[error("No frames could be decoded from the payload")]
    Empty,
    #[error("Decoder task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Lazy, single-pass sequence of frames for one payload.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, DecodeError>> + Send>>;

#[derive(Debug, Clone)]
pub struct MediaDecoder {
    config: DecoderConfig,
}

impl MediaDecoder {
    pub fn new(config: DecoderConfig) -> Self {
        Self { config }
    }

    /// Runs `ffmpeg -version`, failing when the binary cannot be executed.
    pub async fn probe(&self) -> Result<String, DecodeError> {
        let output = Command::new(&self.config.ffmpeg_path)
            .arg("-version")
            .kill_on_drop(true)
            .output()
            .await
            .map_err(DecodeError::Spawn)?;

        if !output.status.success() {
            return Err(DecodeError::Subprocess {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .unwrap_or_default()
            .to_string())
    }

    /// Images yield exactly one frame. Videos are decoded by an ffmpeg child
    /// that lives as long as the returned stream, stopping after `max_frames`.
    pub fn decode(&self, payload: Bytes, kind: MediaKind, max_frames: Option<usize>) -> FrameStream {
        match kind {
            MediaKind::Image => {
                stream::once(decode_image(payload, self.config.max_pixels)).boxed()
            }
            MediaKind::Video => video::frames(self.config.clone(), payload, max_frames).boxed(),
        }
    }
}

/// Decoder buffers may hold up to 16-bit RGBA before conversion.
const MAX_BYTES_PER_PIXEL: u64 = 8;

pub async fn decode_image(payload: Bytes, max_pixels: u64) -> Result<Frame, DecodeError> {
    let rgb = tokio::task::spawn_blocking(move || read_image(&payload, max_pixels)).await??;

    Frame::from_rgb_image(0, rgb, 0.0).ok_or(DecodeError::Empty)
}

fn image_reader(payload: &[u8]) -> Result<ImageReader<Cursor<&[u8]>>, DecodeError> {
    ImageReader::new(Cursor::new(payload))
        .with_guessed_format()
        .map_err(|e| DecodeError::Image(e.into()))
}

fn read_image(payload: &[u8], max_pixels: u64) -> Result<RgbImage, DecodeError> {
    let (width, height) = image_reader(payload)?.into_dimensions()?;
    if u64::from(width) * u64::from(height) > max_pixels {
        return Err(DecodeError::TooLarge {
            width,
            height,
            max_pixels,
        });
    }

    let mut limits = Limits::default();
    limits.max_image_width = Some(width);
    limits.max_image_height = Some(height);
    limits.max_alloc = Some(max_pixels.saturating_mul(MAX_BYTES_PER_PIXEL));

    let mut reader = image_reader(payload)?;
    reader.limits(limits);
    Ok(reader.decode()?.to_rgb8())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{png_bytes, y4m_video};
    use futures::TryStreamExt;

    fn decoder() -> MediaDecoder {
        MediaDecoder::new(DecoderConfig::default())
    }

    #[tokio::test]
    async fn test_image_yields_single_frame_with_header_dimensions() {
        let payload = Bytes::from(png_bytes(37, 21, [10, 20, 30]));

        let frames: Vec<Frame> = decoder()
            .decode(payload, MediaKind::Image, None)
            .try_collect()
            .await
            .unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!((frames[0].width, frames[0].height), (37, 21));
        assert_eq!(frames[0].timestamp, 0.0);
        assert_eq!(&frames[0].pixels()[..3], &[10, 20, 30]);
    }

    #[tokio::test]
    async fn test_corrupt_image_is_a_decode_error() {
        let payload = Bytes::from_static(b"definitely not an image");

        let mut frames = decoder().decode(payload, MediaKind::Image, None);

        assert!(matches!(frames.next().await, Some(Err(DecodeError::Image(_)))));
        assert!(frames.next().await.is_none());
    }

    #[tokio::test]
    async fn test_image_over_pixel_limit_is_rejected() {
        let decoder = MediaDecoder::new(DecoderConfig {
            max_pixels: 100,
            ..DecoderConfig::default()
        });

        let large = Bytes::from(png_bytes(20, 20, [0, 0, 0]));
        let mut frames = decoder.decode(large, MediaKind::Image, None);
        assert!(matches!(
            frames.next().await,
            Some(Err(DecodeError::TooLarge {
                width: 20,
                height: 20,
                max_pixels: 100
            }))
        ));

        let small = Bytes::from(png_bytes(10, 10, [0, 0, 0]));
        let mut frames = decoder.decode(small, MediaKind::Image, None);
        assert!(matches!(frames.next().await, Some(Ok(_))));
    }

    #[tokio::test]
    async fn test_image_declared_as_video_is_rejected() {
        let payload = Bytes::from(png_bytes(8, 8, [0, 0, 0]));

        let mut frames = decoder().decode(payload, MediaKind::Video, None);

        assert!(matches!(
            frames.next().await,
            Some(Err(DecodeError::NotAVideo(image::ImageFormat::Png)))
        ));
    }

    #[tokio::test]
    async fn test_probe_reports_missing_binary() {
        let decoder = MediaDecoder::new(DecoderConfig {
            ffmpeg_path: "/nonexistent/ffmpeg".into(),
            ..DecoderConfig::default()
        });

        assert!(matches!(decoder.probe().await, Err(DecodeError::Spawn(_))));
    }

    #[tokio::test]
    #[ignore = "requires ffmpeg"]
    async fn test_video_frames_in_order_with_timestamps() {
        let payload = Bytes::from(y4m_video(32, 24, 10, &[false, true, false, false]));

        let frames: Vec<Frame> = decoder()
            .decode(payload, MediaKind::Video, None)
            .try_collect()
            .await
            .unwrap();

        assert_eq!(frames.len(), 4);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.index, i);
            assert_eq!((frame.width, frame.height), (32, 24));
        }
        assert!((frames[1].timestamp - 0.1).abs() < 1e-6);
        assert!((frames[3].timestamp - 0.3).abs() < 1e-6);
    }

    #[tokio::test]
    #[ignore = "requires ffmpeg"]
    async fn test_video_stops_at_max_frames() {
        let payload = Bytes::from(y4m_video(16, 16, 25, &[false; 50]));

        let frames: Vec<Frame> = decoder()
            .decode(payload, MediaKind::Video, Some(3))
            .try_collect()
            .await
            .unwrap();

        assert_eq!(frames.len(), 3);
    }

    #[tokio::test]
    #[ignore = "requires ffmpeg"]
    async fn test_garbage_video_fails() {
        let payload = Bytes::from(vec![0x42u8; 4096]);

        let result: Result<Vec<Frame>, DecodeError> = decoder()
            .decode(payload, MediaKind::Video, None)
            .try_collect()
            .await;

        assert!(matches!(
            result,
            Err(DecodeError::Subprocess { .. }) | Err(DecodeError::Empty)
        ));
    }
}
