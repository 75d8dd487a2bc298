//! Display overlay mapping.
//!
//! Boxes come out of the detectors in source-image pixels. The caller shows
//! that image scaled into some rectangle of its view; this module maps the
//! boxes into that rectangle so an overlay lines up with the picture.
//!
//! No letterbox compensation happens here: the caller passes the rectangle
//! the image actually occupies.

use serde::Serialize;

use crate::detect::{Detection, Rect};

/// Destination rectangle in view pixels.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct DisplayRect {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

impl DisplayRect {
    pub fn new(left: f32, top: f32, width: f32, height: f32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    pub fn from_ltrb(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self::new(left, top, right - left, bottom - top)
    }

    /// The whole source frame drawn 1:1 at the origin.
    pub fn identity(image_width: u32, image_height: u32) -> Self {
        Self::new(0.0, 0.0, image_width as f32, image_height as f32)
    }

    /// Nothing can be drawn into an empty (or negative) rectangle.
    pub fn is_empty(&self) -> bool {
        !(self.width > 0.0 && self.height > 0.0)
    }
}

/// One box ready to draw, in view pixels.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OverlayBox {
    pub rect: Rect,
    pub caption: String,
}

/// What the render target should do with the overlay.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "action", content = "boxes", rename_all = "lowercase")]
pub enum OverlayInstruction {
    /// No mapping possible (no display rectangle, empty frame). Remove any
    /// previous overlay rather than drawing at stale coordinates.
    Clear,
    /// Draw these boxes. May be empty when nothing was detected.
    Draw(Vec<OverlayBox>),
}

/// Surface that actually draws. Lives outside the core.
pub trait RenderTarget {
    fn draw(&mut self, boxes: &[OverlayBox]);
    fn clear(&mut self);
}

impl OverlayInstruction {
    pub fn is_clear(&self) -> bool {
        matches!(self, Self::Clear)
    }

    pub fn boxes(&self) -> &[OverlayBox] {
        match self {
            Self::Clear => &[],
            Self::Draw(boxes) => boxes,
        }
    }

    pub fn present<R: RenderTarget + ?Sized>(&self, target: &mut R) {
        match self {
            Self::Clear => target.clear(),
            Self::Draw(boxes) => target.draw(boxes),
        }
    }
}

/// Map one box from an `image_width` x `image_height` frame into `display`.
///
/// Returns `None` when the frame has a zero dimension.
pub fn remap_box(
    bbox: &Rect,
    image_width: u32,
    image_height: u32,
    display: &DisplayRect,
) -> Option<Rect> {
    if image_width == 0 || image_height == 0 {
        return None;
    }
    let sx = display.width / image_width as f32;
    let sy = display.height / image_height as f32;
    Some(Rect::new(
        display.left + bbox.left * sx,
        display.top + bbox.top * sy,
        display.left + bbox.right * sx,
        display.top + bbox.bottom * sy,
    ))
}

/// `"<label> <confidence as whole percent>%"`.
pub fn caption(detection: &Detection) -> String {
    format!(
        "{} {}%",
        detection.label(),
        (detection.confidence() * 100.0).round() as i32
    )
}

/// Plan the overlay for a set of detections.
pub fn plan_overlay(
    detections: &[Detection],
    image_width: u32,
    image_height: u32,
    display: Option<&DisplayRect>,
) -> OverlayInstruction {
    let Some(display) = display.filter(|d| !d.is_empty()) else {
        return OverlayInstruction::Clear;
    };
    if image_width == 0 || image_height == 0 {
        return OverlayInstruction::Clear;
    }

    let boxes = detections
        .iter()
        .filter_map(|det| {
            remap_box(det.bounding_box(), image_width, image_height, display).map(|rect| {
                OverlayBox {
                    rect,
                    caption: caption(det),
                }
            })
        })
        .collect();
    OverlayInstruction::Draw(boxes)
}
