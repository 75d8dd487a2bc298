//! Reader configuration: TOML file, defaults and environment overrides.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::detect::PostprocessParams;
use crate::frame::SUPPORTED_ROTATIONS;
use crate::reading::{LabelPolicy, Vocabulary, DEFAULT_DIGITS, DEFAULT_UNITS};

const DEFAULT_CONFIDENCE: f32 = 0.5;
const DEFAULT_IOU: f32 = 0.3;
const DEFAULT_MAX_RESULTS: usize = 30;
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_UNIT_MODEL: &str = "digital_characters.onnx";
const DEFAULT_UNIT_METADATA: &str = "digital_characters_metadata.yaml";
const DEFAULT_UNIT_REPLAY: &str = "unit_replay.json";
const DEFAULT_MEASUREMENT_MODEL: &str = "separated_characters.onnx";
const DEFAULT_MEASUREMENT_METADATA: &str = "separated_characters_metadata.yaml";
const DEFAULT_MEASUREMENT_REPLAY: &str = "measurement_replay.json";

pub const CONFIG_ENV: &str = "GAUGE_READER_CONFIG";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ReaderConfigFile {
    rotation_degrees: Option<u32>,
    detector: Option<DetectorConfigFile>,
    unit_model: Option<ModelConfigFile>,
    measurement_model: Option<ModelConfigFile>,
    vocabulary: Option<VocabularyConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DetectorConfigFile {
    backend: Option<String>,
    confidence_threshold: Option<f32>,
    iou_threshold: Option<f32>,
    max_results: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ModelConfigFile {
    model_path: Option<PathBuf>,
    metadata_path: Option<PathBuf>,
    replay_path: Option<PathBuf>,
    input_size: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct VocabularyConfigFile {
    digits: Option<Vec<String>>,
    units: Option<Vec<String>>,
    label_policy: Option<String>,
}

/// Which detector implementation backs both stages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BackendKind {
    #[default]
    Replay,
    Tract,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "replay" => Ok(Self::Replay),
            "tract" => Ok(Self::Tract),
            other => Err(anyhow!("unknown detector backend '{}' (replay|tract)", other)),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Replay => write!(f, "replay"),
            Self::Tract => write!(f, "tract"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectorSettings {
    pub backend: BackendKind,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub max_results: usize,
}

impl DetectorSettings {
    pub fn postprocess_params(&self) -> PostprocessParams {
        PostprocessParams {
            confidence_threshold: self.confidence_threshold,
            iou_threshold: self.iou_threshold,
            max_results: self.max_results,
        }
    }
}

/// Files and input size of one detector stage.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSettings {
    pub model_path: PathBuf,
    pub metadata_path: PathBuf,
    pub replay_path: Option<PathBuf>,
    pub input_size: u32,
}

#[derive(Debug, Clone)]
pub struct ReaderConfig {
    pub rotation_degrees: u32,
    pub detector: DetectorSettings,
    pub unit_model: ModelSettings,
    pub measurement_model: ModelSettings,
    pub vocabulary: Vocabulary,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            rotation_degrees: 0,
            detector: detector_settings(None),
            unit_model: model_settings(
                None,
                DEFAULT_UNIT_MODEL,
                DEFAULT_UNIT_METADATA,
                DEFAULT_UNIT_REPLAY,
            ),
            measurement_model: model_settings(
                None,
                DEFAULT_MEASUREMENT_MODEL,
                DEFAULT_MEASUREMENT_METADATA,
                DEFAULT_MEASUREMENT_REPLAY,
            ),
            vocabulary: Vocabulary::default(),
        }
    }
}

impl ReaderConfig {
    /// Load from the file named by `GAUGE_READER_CONFIG` (if set), then
    /// apply environment overrides and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var(CONFIG_ENV)
            .ok()
            .filter(|path| !path.trim().is_empty());
        Self::load_optional(config_path.as_deref().map(Path::new))
    }

    /// Like [`ReaderConfig::load`] with an explicit file path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load_optional(Some(path.as_ref()))
    }

    fn load_optional(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => ReaderConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse TOML text directly. Environment overrides are not applied.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let file: ReaderConfigFile =
            toml::from_str(raw).map_err(|e| anyhow!("invalid config: {}", e))?;
        let cfg = Self::from_file(file)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ReaderConfigFile) -> Result<Self> {
        let detector = detector_settings_checked(file.detector)?;
        let unit_model = model_settings(
            file.unit_model,
            DEFAULT_UNIT_MODEL,
            DEFAULT_UNIT_METADATA,
            DEFAULT_UNIT_REPLAY,
        );
        let measurement_model = model_settings(
            file.measurement_model,
            DEFAULT_MEASUREMENT_MODEL,
            DEFAULT_MEASUREMENT_METADATA,
            DEFAULT_MEASUREMENT_REPLAY,
        );

        let vocabulary = match file.vocabulary {
            Some(vocab) => {
                let policy = match vocab.label_policy {
                    Some(policy) => policy.parse()?,
                    None => LabelPolicy::default(),
                };
                Vocabulary::new(
                    vocab.digits.unwrap_or_else(|| to_strings(&DEFAULT_DIGITS)),
                    vocab.units.unwrap_or_else(|| to_strings(&DEFAULT_UNITS)),
                    policy,
                )?
            }
            None => Vocabulary::default(),
        };

        Ok(Self {
            rotation_degrees: file.rotation_degrees.unwrap_or(0),
            detector,
            unit_model,
            measurement_model,
            vocabulary,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(backend) = env_value("GAUGE_READER_BACKEND") {
            self.detector.backend = backend.parse()?;
        }
        if let Some(confidence) = env_value("GAUGE_READER_CONFIDENCE") {
            self.detector.confidence_threshold = confidence
                .parse()
                .map_err(|_| anyhow!("GAUGE_READER_CONFIDENCE must be a number in [0, 1]"))?;
        }
        if let Some(iou) = env_value("GAUGE_READER_IOU") {
            self.detector.iou_threshold = iou
                .parse()
                .map_err(|_| anyhow!("GAUGE_READER_IOU must be a number in [0, 1]"))?;
        }
        if let Some(max) = env_value("GAUGE_READER_MAX_RESULTS") {
            self.detector.max_results = max
                .parse()
                .map_err(|_| anyhow!("GAUGE_READER_MAX_RESULTS must be a positive integer"))?;
        }
        if let Some(rotation) = env_value("GAUGE_READER_ROTATION") {
            self.rotation_degrees = rotation
                .parse()
                .map_err(|_| anyhow!("GAUGE_READER_ROTATION must be 0, 90, 180 or 270"))?;
        }
        if let Some(units) = env_value("GAUGE_READER_UNITS") {
            let parsed = split_csv(&units);
            if !parsed.is_empty() {
                self.vocabulary = Vocabulary::new(
                    self.vocabulary.digits().to_vec(),
                    parsed,
                    self.vocabulary.policy(),
                )?;
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if !SUPPORTED_ROTATIONS.contains(&self.rotation_degrees) {
            return Err(anyhow!(
                "rotation_degrees must be one of {:?}, got {}",
                SUPPORTED_ROTATIONS,
                self.rotation_degrees
            ));
        }
        check_unit_interval("confidence_threshold", self.detector.confidence_threshold)?;
        check_unit_interval("iou_threshold", self.detector.iou_threshold)?;
        if self.detector.max_results == 0 {
            return Err(anyhow!("max_results must be greater than zero"));
        }
        for (stage, model) in [
            ("unit_model", &self.unit_model),
            ("measurement_model", &self.measurement_model),
        ] {
            if model.input_size == 0 {
                return Err(anyhow!("{}.input_size must be greater than zero", stage));
            }
        }
        Ok(())
    }
}

fn detector_settings(file: Option<DetectorConfigFile>) -> DetectorSettings {
    let file = file.unwrap_or_default();
    DetectorSettings {
        backend: BackendKind::default(),
        confidence_threshold: file.confidence_threshold.unwrap_or(DEFAULT_CONFIDENCE),
        iou_threshold: file.iou_threshold.unwrap_or(DEFAULT_IOU),
        max_results: file.max_results.unwrap_or(DEFAULT_MAX_RESULTS),
    }
}

fn detector_settings_checked(file: Option<DetectorConfigFile>) -> Result<DetectorSettings> {
    let backend = match file.as_ref().and_then(|d| d.backend.as_deref()) {
        Some(name) => name.parse()?,
        None => BackendKind::default(),
    };
    Ok(DetectorSettings {
        backend,
        ..detector_settings(file)
    })
}

fn model_settings(
    file: Option<ModelConfigFile>,
    model: &str,
    metadata: &str,
    replay: &str,
) -> ModelSettings {
    let file = file.unwrap_or_default();
    ModelSettings {
        model_path: file.model_path.unwrap_or_else(|| PathBuf::from(model)),
        metadata_path: file.metadata_path.unwrap_or_else(|| PathBuf::from(metadata)),
        replay_path: Some(file.replay_path.unwrap_or_else(|| PathBuf::from(replay))),
        input_size: file.input_size.unwrap_or(DEFAULT_INPUT_SIZE),
    }
}

fn check_unit_interval(name: &str, value: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(anyhow!("{} must be within [0, 1], got {}", name, value));
    }
    Ok(())
}

fn read_config_file(path: &Path) -> Result<ReaderConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

fn to_strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}
