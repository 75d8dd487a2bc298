use std::path::Path;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{Category, Detection, DetectionBatch, Rect};
use crate::frame::DecodedImage;

/// One scripted detection, box normalized to `[0, 1]` of the frame.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ReplayDetection {
    pub label: String,
    pub confidence: f32,
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl ReplayDetection {
    pub fn new(label: &str, confidence: f32, left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            label: label.to_string(),
            confidence,
            left,
            top,
            right,
            bottom,
        }
    }
}

/// Replay backend. Returns the same normalized detections for every image,
/// scaled onto the submitted frame.
///
/// Used for offline runs (no model runtime available) and deterministic tests.
#[derive(Clone, Debug, Default)]
pub struct ReplayBackend {
    detections: Vec<ReplayDetection>,
}

impl ReplayBackend {
    /// Fails when any box is inverted (`left > right` or `top > bottom`).
    pub fn new(detections: Vec<ReplayDetection>) -> Result<Self> {
        for det in &detections {
            if det.left > det.right || det.top > det.bottom {
                return Err(anyhow!(
                    "replay detection '{}' has an inverted box ({}, {}, {}, {})",
                    det.label,
                    det.left,
                    det.top,
                    det.right,
                    det.bottom
                ));
            }
        }
        Ok(Self { detections })
    }

    /// Load a JSON array of [`ReplayDetection`].
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read replay file {}", path.display()))?;
        let detections: Vec<ReplayDetection> = serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid replay file {}: {}", path.display(), e))?;
        Self::new(detections).with_context(|| format!("invalid replay file {}", path.display()))
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }
}

impl DetectorBackend for ReplayBackend {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn detect(&mut self, image: &DecodedImage, rotation_degrees: u32) -> Result<DetectionBatch> {
        let started = Instant::now();
        let frame = image.rotated(rotation_degrees)?;
        let (width, height) = frame.dimensions();
        let w = width as f32;
        let h = height as f32;

        let detections = self
            .detections
            .iter()
            .map(|d| {
                let rect = Rect::new(
                    d.left.clamp(0.0, 1.0) * w,
                    d.top.clamp(0.0, 1.0) * h,
                    d.right.clamp(0.0, 1.0) * w,
                    d.bottom.clamp(0.0, 1.0) * h,
                );
                Detection::new(rect, Category::new(d.label.clone(), d.confidence))
            })
            .collect();

        DetectionBatch::new(
            detections,
            started.elapsed().as_millis() as u64,
            width,
            height,
        )
    }
}
