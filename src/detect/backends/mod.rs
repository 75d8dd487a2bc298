pub mod replay;

#[cfg(feature = "backend-tract")]
pub mod tract;

use anyhow::{anyhow, Result};

use crate::config::{BackendKind, ModelSettings, ReaderConfig};
use crate::detect::backend::DetectorBackend;
use crate::pipeline::Stage;

pub use replay::{ReplayBackend, ReplayDetection};

#[cfg(feature = "backend-tract")]
pub use tract::TractBackend;

/// Build the detector for one stage from configuration.
pub fn build_backend(stage: Stage, config: &ReaderConfig) -> Result<Box<dyn DetectorBackend>> {
    let model = match stage {
        Stage::Unit => &config.unit_model,
        Stage::Measurement => &config.measurement_model,
    };
    log::debug!(
        "building {} backend for {} stage",
        config.detector.backend,
        stage
    );
    match config.detector.backend {
        BackendKind::Replay => build_replay(stage, model),
        BackendKind::Tract => build_tract(stage, model, config),
    }
}

fn build_replay(stage: Stage, model: &ModelSettings) -> Result<Box<dyn DetectorBackend>> {
    let path = model
        .replay_path
        .as_ref()
        .ok_or_else(|| anyhow!("{} stage has no replay_path configured", stage))?;
    Ok(Box::new(ReplayBackend::from_json_file(path)?))
}

#[cfg(feature = "backend-tract")]
fn build_tract(
    _stage: Stage,
    model: &ModelSettings,
    config: &ReaderConfig,
) -> Result<Box<dyn DetectorBackend>> {
    let backend = TractBackend::new(&model.model_path, &model.metadata_path, model.input_size)?
        .with_params(config.detector.postprocess_params());
    Ok(Box::new(backend))
}

#[cfg(not(feature = "backend-tract"))]
fn build_tract(
    stage: Stage,
    _model: &ModelSettings,
    _config: &ReaderConfig,
) -> Result<Box<dyn DetectorBackend>> {
    Err(anyhow!(
        "{} stage: the tract backend requires the backend-tract feature",
        stage
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::DecodedImage;
    use std::io::Write;

    #[test]
    fn replay_backend_from_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            br#"[{"label": "Kg", "confidence": 0.9, "left": 0.1, "top": 0.1, "right": 0.3, "bottom": 0.2}]"#,
        )
        .unwrap();

        let mut config = ReaderConfig::default();
        config.unit_model.replay_path = Some(file.path().to_path_buf());
        let mut backend = build_backend(Stage::Unit, &config).unwrap();
        assert_eq!(backend.name(), "replay");

        let image = DecodedImage::filled(100, 50, [0, 0, 0]).unwrap();
        let batch = backend.detect(&image, 0).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.dimensions(), (100, 50));
    }

    #[test]
    fn missing_replay_path_is_an_error() {
        let mut config = ReaderConfig::default();
        config.measurement_model.replay_path = None;
        let err = build_backend(Stage::Measurement, &config).err().unwrap();
        assert!(err.to_string().contains("replay_path"));
    }

    #[cfg(not(feature = "backend-tract"))]
    #[test]
    fn tract_requires_feature() {
        let mut config = ReaderConfig::default();
        config.detector.backend = BackendKind::Tract;
        let err = build_backend(Stage::Unit, &config).err().unwrap();
        assert!(err.to_string().contains("backend-tract"));
    }
}
