//! Gauge reader.
//!
//! Reads a photographed scale or gauge display: a unit detector and a
//! digit detector run one after the other on a background worker, their
//! detections are fused, and the fused list is turned into a reading string
//! (`"7.2 Kg"`) plus display-space overlay boxes.
//!
//! - [`detect`]: detection records, the detector backend trait, YOLO
//!   post-processing and the bundled backends.
//! - [`pipeline`]: the two-stage orchestrator and its wait-state machine.
//! - [`reading`]: reading reconstruction from fused detections.
//! - [`overlay`]: mapping boxes into the rectangle an image is shown in.
//! - [`session`]: caller-side glue (selected image, UI lock, result text).

pub mod config;
pub mod detect;
pub mod frame;
pub mod overlay;
pub mod pipeline;
pub mod reading;
pub mod session;

pub use config::{BackendKind, ReaderConfig};
pub use detect::{Category, Detection, DetectionBatch, DetectorBackend, Rect};
pub use frame::DecodedImage;
pub use overlay::{plan_overlay, DisplayRect, OverlayBox, OverlayInstruction, RenderTarget};
pub use pipeline::{
    FusedResults, PipelineError, PipelineEvent, PipelineListener, ShutdownHandle, Stage,
    SubmissionId, TwoStagePipeline, WaitState,
};
pub use reading::{reconstruct, LabelPolicy, Reading, Vocabulary, NO_READING};
pub use session::ReaderSession;
