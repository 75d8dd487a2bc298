use anyhow::{anyhow, Result};
use serde::Serialize;

/// Axis-aligned rectangle in pixel coordinates.
///
/// `left <= right` and `top <= bottom` for every rectangle produced by a
/// detector; remapping preserves the ordering because scales are positive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct Rect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl Rect {
    pub fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// Intersection-over-union of two rectangles; 0 when they do not overlap.
    pub fn iou(&self, other: &Rect) -> f32 {
        let left = self.left.max(other.left);
        let top = self.top.max(other.top);
        let right = self.right.min(other.right);
        let bottom = self.bottom.min(other.bottom);
        if right <= left || bottom <= top {
            return 0.0;
        }
        let intersection = (right - left) * (bottom - top);
        let union = self.area() + other.area() - intersection;
        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }
}

/// Labeled class with its confidence in `[0, 1]`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Category {
    label: String,
    confidence: f32,
}

impl Category {
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }
}

/// One detected object: a box in source-image pixels plus its category.
///
/// Detections are values. Fields are private so nothing downstream of the
/// producing detector can rewrite a box or a label in place.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detection {
    bounding_box: Rect,
    category: Category,
}

impl Detection {
    pub fn new(bounding_box: Rect, category: Category) -> Self {
        Self {
            bounding_box,
            category,
        }
    }

    pub fn bounding_box(&self) -> &Rect {
        &self.bounding_box
    }

    pub fn category(&self) -> &Category {
        &self.category
    }

    pub fn label(&self) -> &str {
        self.category.label()
    }

    pub fn confidence(&self) -> f32 {
        self.category.confidence()
    }
}

/// Output of a single detector invocation.
///
/// The boxes are expressed against a frame of `image_width` x `image_height`
/// pixels. Both dimensions are strictly positive.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionBatch {
    detections: Vec<Detection>,
    inference_time_ms: u64,
    image_width: u32,
    image_height: u32,
}

impl DetectionBatch {
    pub fn new(
        detections: Vec<Detection>,
        inference_time_ms: u64,
        image_width: u32,
        image_height: u32,
    ) -> Result<Self> {
        if image_width == 0 || image_height == 0 {
            return Err(anyhow!(
                "detection batch frame must be non-empty (got {}x{})",
                image_width,
                image_height
            ));
        }
        Ok(Self {
            detections,
            inference_time_ms,
            image_width,
            image_height,
        })
    }

    pub fn detections(&self) -> &[Detection] {
        &self.detections
    }

    pub fn into_detections(self) -> Vec<Detection> {
        self.detections
    }

    pub fn inference_time_ms(&self) -> u64 {
        self.inference_time_ms
    }

    pub fn image_width(&self) -> u32 {
        self.image_width
    }

    pub fn image_height(&self) -> u32 {
        self.image_height
    }

    /// `(width, height)` of the frame the boxes refer to.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.image_width, self.image_height)
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_rejects_empty_frame() {
        assert!(DetectionBatch::new(vec![], 0, 0, 10).is_err());
        assert!(DetectionBatch::new(vec![], 0, 10, 0).is_err());
        let batch = DetectionBatch::new(vec![], 3, 640, 480).unwrap();
        assert_eq!(batch.dimensions(), (640, 480));
        assert!(batch.is_empty());
    }

    #[test]
    fn category_confidence_is_clamped() {
        assert_eq!(Category::new("7", 1.4).confidence(), 1.0);
        assert_eq!(Category::new("7", -0.2).confidence(), 0.0);
    }

    #[test]
    fn iou_of_disjoint_and_identical_boxes() {
        let a = Rect::new(0.0, 0.0, 10.0, 10.0);
        let b = Rect::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&b), 0.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);

        let half = Rect::new(5.0, 0.0, 15.0, 10.0);
        // 50 overlap / 150 union
        assert!((a.iou(&half) - 1.0 / 3.0).abs() < 1e-6);
    }
}
