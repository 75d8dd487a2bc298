mod backend;
pub mod backends;
pub mod metadata;
pub mod postprocess;
mod result;

pub use backend::DetectorBackend;
pub use backends::{build_backend, ReplayBackend, ReplayDetection};
pub use metadata::ModelMetadata;
pub use postprocess::PostprocessParams;
pub use result::{Category, Detection, DetectionBatch, Rect};

#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
