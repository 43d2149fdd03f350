use image::{ImageBuffer, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    Rgb8,
}

impl PixelLayout {
    pub fn channels(&self) -> usize {
        match self {
            PixelLayout::Rgb8 => 3,
        }
    }
}

/// One decoded raster image. Frames are moved from stage to stage, never shared.
#[derive(Debug)]
pub struct Frame {
    pub index: usize,
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
    /// Presentation time in seconds; zero for still images.
    pub timestamp: f64,
    pixels: Vec<u8>,
}

impl Frame {
    /// Returns `None` when the buffer length does not match the dimensions.
    pub fn rgb8(
        index: usize,
        width: u32,
        height: u32,
        pixels: Vec<u8>,
        timestamp: f64,
    ) -> Option<Self> {
        let expected = (width as usize) * (height as usize) * PixelLayout::Rgb8.channels();
        if width == 0 || height == 0 || pixels.len() != expected {
            return None;
        }
        Some(Self {
            index,
            width,
            height,
            layout: PixelLayout::Rgb8,
            timestamp,
            pixels,
        })
    }

    pub fn from_rgb_image(index: usize, image: RgbImage, timestamp: f64) -> Option<Self> {
        let (width, height) = image.dimensions();
        Self::rgb8(index, width, height, image.into_raw(), timestamp)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn as_image(&self) -> Option<ImageBuffer<Rgb<u8>, &[u8]>> {
        ImageBuffer::from_raw(self.width, self.height, self.pixels.as_slice())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        }
    }

    /// Maps `image/*` and `video/*` content types; anything else is undeclared.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let essence = content_type.split(';').next()?.trim().to_lowercase();
        if essence.starts_with("image/") {
            Some(MediaKind::Image)
        } else if essence.starts_with("video/") {
            Some(MediaKind::Video)
        } else {
            None
        }
    }
}

impl FromStr for MediaKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "image" => Ok(MediaKind::Image),
            "video" => Ok(MediaKind::Video),
            other => Err(format!(
                "{} is not a supported media kind. Use either `image` or `video`.",
                other
            )),
        }
    }
}
