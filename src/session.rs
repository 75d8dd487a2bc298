//! Caller-side glue for one reading screen.
//!
//! Holds the selected image and the display rectangle it is shown in,
//! submits predictions, and applies pipeline events to the result text and
//! overlay. Controls are locked from submission until the matching result
//! or error has been applied.

use std::time::Duration;

use crate::frame::DecodedImage;
use crate::overlay::{plan_overlay, DisplayRect, OverlayInstruction, RenderTarget};
use crate::pipeline::{
    FusedResults, PipelineError, PipelineListener, ShutdownHandle, SubmissionId, TwoStagePipeline,
};
use crate::reading::{overlay_detections, reconstruct, Reading, Vocabulary};

pub struct ReaderSession<R: RenderTarget> {
    pipeline: TwoStagePipeline,
    view: SessionView<R>,
    image: Option<DecodedImage>,
}

/// The part of the session events are applied to.
struct SessionView<R: RenderTarget> {
    vocabulary: Vocabulary,
    target: R,
    display_rect: Option<DisplayRect>,
    controls_enabled: bool,
    result_text: String,
    last_reading: Option<Reading>,
    last_inference_ms: Option<u64>,
    last_overlay: Option<OverlayInstruction>,
}

impl<R: RenderTarget> ReaderSession<R> {
    pub fn new(pipeline: TwoStagePipeline, vocabulary: Vocabulary, target: R) -> Self {
        Self {
            pipeline,
            view: SessionView {
                vocabulary,
                target,
                display_rect: None,
                controls_enabled: true,
                result_text: String::new(),
                last_reading: None,
                last_inference_ms: None,
                last_overlay: None,
            },
            image: None,
        }
    }

    /// Replace (or clear) the selected image. Any overlay for the previous
    /// image is removed.
    pub fn select_image(&mut self, image: Option<DecodedImage>) {
        self.image = image;
        self.view.present(OverlayInstruction::Clear);
    }

    pub fn set_display_rect(&mut self, rect: Option<DisplayRect>) {
        self.view.display_rect = rect;
    }

    pub fn selected_image(&self) -> Option<&DecodedImage> {
        self.image.as_ref()
    }

    /// Submit the selected image. Fails with [`PipelineError::NoImage`]
    /// without touching the pipeline when nothing is selected.
    pub fn predict(&mut self) -> Result<SubmissionId, PipelineError> {
        let image = self.image.clone().ok_or(PipelineError::NoImage)?;
        let id = self.pipeline.submit(Some(image))?;
        self.view.controls_enabled = false;
        self.view.present(OverlayInstruction::Clear);
        Ok(id)
    }

    /// Apply every ready event. Returns how many were applied.
    pub fn pump(&mut self) -> usize {
        let applied = self.pipeline.dispatch(&mut self.view);
        self.sync_controls();
        applied
    }

    /// Wait up to `timeout` for an event, then apply everything ready.
    pub fn pump_timeout(&mut self, timeout: Duration) -> usize {
        let applied = self.pipeline.dispatch_timeout(&mut self.view, timeout);
        self.sync_controls();
        applied
    }

    // Queued submissions keep the controls locked until the last one lands.
    // After shutdown nothing will land, so the lock is released.
    fn sync_controls(&mut self) {
        if self.pipeline.is_shut_down() {
            self.view.controls_enabled = true;
        } else if self.pipeline.is_busy() {
            self.view.controls_enabled = false;
        }
    }

    pub fn controls_enabled(&self) -> bool {
        self.view.controls_enabled
    }

    pub fn result_text(&self) -> &str {
        &self.view.result_text
    }

    pub fn last_reading(&self) -> Option<&Reading> {
        self.view.last_reading.as_ref()
    }

    pub fn last_inference_ms(&self) -> Option<u64> {
        self.view.last_inference_ms
    }

    pub fn last_overlay(&self) -> Option<&OverlayInstruction> {
        self.view.last_overlay.as_ref()
    }

    pub fn is_busy(&self) -> bool {
        self.pipeline.is_busy()
    }

    pub fn target(&self) -> &R {
        &self.view.target
    }

    pub fn target_mut(&mut self) -> &mut R {
        &mut self.view.target
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.pipeline.shutdown_handle()
    }

    pub fn into_parts(self) -> (TwoStagePipeline, R) {
        (self.pipeline, self.view.target)
    }
}

impl<R: RenderTarget> SessionView<R> {
    fn present(&mut self, instruction: OverlayInstruction) {
        instruction.present(&mut self.target);
        self.last_overlay = Some(instruction);
    }
}

impl<R: RenderTarget> PipelineListener for SessionView<R> {
    fn on_results(&mut self, results: FusedResults) {
        let reading = reconstruct(&results.detections, &self.vocabulary);
        log::info!(
            "submission {}: {} ({} detections, {} ms)",
            results.submission,
            reading,
            results.detections.len(),
            results.inference_time_ms
        );
        self.result_text = reading.display_text();

        let selected = overlay_detections(&results.detections, &self.vocabulary);
        let plan = plan_overlay(
            &selected,
            results.image_width,
            results.image_height,
            self.display_rect.as_ref(),
        );
        self.present(plan);

        self.last_reading = Some(reading);
        self.last_inference_ms = Some(results.inference_time_ms);
        self.controls_enabled = true;
    }

    fn on_error(&mut self, submission: SubmissionId, error: PipelineError) {
        log::error!("submission {}: {}", submission, error);
        self.result_text = format!("Error: {}", error);
        self.last_reading = None;
        self.controls_enabled = true;
    }
}
