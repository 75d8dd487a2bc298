use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

/// Subset of the Ultralytics export metadata YAML the backends need.
#[derive(Debug, Deserialize, Default)]
struct MetadataFile {
    names: Option<BTreeMap<usize, serde_yaml::Value>>,
    imgsz: Option<Vec<u32>>,
}

/// Class labels (indexed by class id) and the declared input size.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelMetadata {
    pub labels: Vec<String>,
    pub input_size: Option<u32>,
}

impl ModelMetadata {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read model metadata {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid model metadata {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let file: MetadataFile = serde_yaml::from_str(raw)?;
        let names = file
            .names
            .filter(|names| !names.is_empty())
            .ok_or_else(|| anyhow!("metadata declares no class names"))?;

        // Class ids index the label table and must run 0..n.
        let mut labels = Vec::with_capacity(names.len());
        for (expected, (id, value)) in names.into_iter().enumerate() {
            if id != expected {
                return Err(anyhow!(
                    "class names must be contiguous from 0; class {} has no name",
                    expected
                ));
            }
            labels.push(match value {
                serde_yaml::Value::String(s) => s,
                serde_yaml::Value::Number(n) => n.to_string(),
                serde_yaml::Value::Bool(b) => b.to_string(),
                other => return Err(anyhow!("class {} has a non-scalar name: {:?}", id, other)),
            });
        }

        let input_size = match file.imgsz.as_deref() {
            Some([size]) => Some(*size),
            Some([h, w]) if h == w => Some(*h),
            Some(other) => {
                return Err(anyhow!(
                    "only square model inputs are supported (imgsz {:?})",
                    other
                ))
            }
            None => None,
        };

        Ok(Self { labels, input_size })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ultralytics_names() {
        let raw = "description: digits\nnames:\n  0: '0'\n  1: '1'\n  3: Kg\n  2: 7\nimgsz:\n- 640\n- 640\n";
        let meta = ModelMetadata::parse(raw).unwrap();
        assert_eq!(meta.labels, vec!["0", "1", "7", "Kg"]);
        assert_eq!(meta.input_size, Some(640));
    }

    #[test]
    fn rejects_gaps_in_class_ids() {
        let err = ModelMetadata::parse("names:\n  0: Kg\n  2: Lb\n").unwrap_err();
        assert!(err.to_string().contains("class 1 has no name"));

        assert!(ModelMetadata::parse("names:\n  2: jin\n").is_err());
        assert!(ModelMetadata::parse("names:\n  0: a\n  4000000000: b\n").is_err());
    }

    #[test]
    fn rejects_rectangular_input() {
        let meta = ModelMetadata::parse("names:\n  0: jin\n").unwrap();
        assert_eq!(meta.labels, vec!["jin"]);
        assert_eq!(meta.input_size, None);

        assert!(ModelMetadata::parse("names:\n  0: a\nimgsz: [480, 640]\n").is_err());
        assert!(ModelMetadata::parse("imgsz: [640, 640]\n").is_err());
    }
}
