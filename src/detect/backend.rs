use anyhow::Result;

use crate::detect::result::DetectionBatch;
use crate::frame::DecodedImage;

/// Detector adapter trait.
///
/// A backend wraps one loaded model. Backends are stateful (model handles,
/// scratch buffers) and are only ever driven from the pipeline worker thread,
/// so `detect` takes `&mut self` and implementations need no internal locking.
pub trait DetectorBackend: Send {
    /// Backend identifier, used in logs and error messages.
    fn name(&self) -> &'static str;

    /// Run detection on a decoded image.
    ///
    /// `rotation_degrees` is the clockwise rotation to apply before inference
    /// (0, 90, 180 or 270). Returned boxes are in pixels of the frame the
    /// backend actually ran on, and the batch carries that frame's size.
    ///
    /// Errors cover a model that is not loaded, an image the model cannot
    /// accept, and inference runtime failures.
    fn detect(&mut self, image: &DecodedImage, rotation_degrees: u32) -> Result<DetectionBatch>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<B: DetectorBackend + ?Sized> DetectorBackend for Box<B> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn detect(&mut self, image: &DecodedImage, rotation_degrees: u32) -> Result<DetectionBatch> {
        (**self).detect(image, rotation_degrees)
    }

    fn warm_up(&mut self) -> Result<()> {
        (**self).warm_up()
    }
}
