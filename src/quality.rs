use crate::{config::QualityConfig, frame::Frame};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub is_valid: bool,
    pub reason: Option<String>,
    pub width: u32,
    pub height: u32,
    /// Variance of the Laplacian of the grayscale image.
    pub sharpness: f64,
    /// Mean grayscale intensity in [0, 255].
    pub brightness: f64,
}

fn grayscale(frame: &Frame) -> Vec<f64> {
    frame
        .pixels()
        .chunks_exact(3)
        .map(|px| 0.299 * px[0] as f64 + 0.587 * px[1] as f64 + 0.114 * px[2] as f64)
        .collect()
}

fn laplacian_variance(gray: &[f64], width: usize, height: usize) -> f64 {
    if width < 3 || height < 3 {
        return 0.0;
    }

    let mut values = Vec::with_capacity((width - 2) * (height - 2));
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let center = gray[y * width + x];
            let value = gray[(y - 1) * width + x]
                + gray[(y + 1) * width + x]
                + gray[y * width + x - 1]
                + gray[y * width + x + 1]
                - 4.0 * center;
            values.push(value);
        }
    }

    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n
}

/// Checks size, then sharpness, then brightness; the first failure is reported.
pub fn assess(frame: &Frame, config: &QualityConfig) -> QualityReport {
    let gray = grayscale(frame);
    let (width, height) = (frame.width, frame.height);
    let sharpness = laplacian_variance(&gray, width as usize, height as usize);
    let brightness = gray.iter().sum::<f64>() / gray.len().max(1) as f64;

    let reason = if width < config.min_side || height < config.min_side {
        Some(format!(
            "image too small ({}x{}, need at least {}x{})",
            width, height, config.min_side, config.min_side
        ))
    } else if sharpness < config.min_sharpness {
        Some(format!(
            "image too blurry (sharpness {:.2}, need > {})",
            sharpness, config.min_sharpness
        ))
    } else if brightness < config.min_brightness {
        Some(format!(
            "image too dark (brightness {:.1}, need > {})",
            brightness, config.min_brightness
        ))
    } else if brightness > config.max_brightness {
        Some(format!(
            "image too bright (brightness {:.1}, need < {})",
            brightness, config.max_brightness
        ))
    } else {
        None
    };

    QualityReport {
        is_valid: reason.is_none(),
        reason,
        width,
        height,
        sharpness,
        brightness,
    }
}
