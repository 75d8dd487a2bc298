//! Reading reconstruction.
//!
//! Turns the fused detections of both stages into the reading string shown
//! to the user (characters left to right) plus the most confident unit.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::Serialize;

use crate::detect::Detection;

/// Shown instead of an empty reading. Means "no reading", never a value.
pub const NO_READING: &str = "—";

pub const DEFAULT_DIGITS: [&str; 11] = ["0", "1", "2", "3", "4", "5", "6", "7", "8", "9", "."];
pub const DEFAULT_UNITS: [&str; 4] = ["Lb", "Kg", "OZ", "jin"];

/// How a detection label is mapped onto reading characters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelPolicy {
    /// Trimmed label must equal a digit/point vocabulary entry.
    #[default]
    Exact,
    /// Keep the ASCII digits and `.` of any trimmed label ("7." -> "7.",
    /// "10" -> "10"); labels with none are ignored.
    Lenient,
}

impl FromStr for LabelPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exact" => Ok(Self::Exact),
            "lenient" => Ok(Self::Lenient),
            other => Err(anyhow!("unknown label policy '{}' (exact|lenient)", other)),
        }
    }
}

impl fmt::Display for LabelPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact => write!(f, "exact"),
            Self::Lenient => write!(f, "lenient"),
        }
    }
}

/// Closed label vocabularies for reading characters and units.
///
/// The two sets are disjoint, so a unit can never be taken from the
/// digit/point vocabulary.
#[derive(Clone, Debug, PartialEq)]
pub struct Vocabulary {
    digits: Vec<String>,
    units: Vec<String>,
    policy: LabelPolicy,
}

impl Vocabulary {
    pub fn new(digits: Vec<String>, units: Vec<String>, policy: LabelPolicy) -> Result<Self> {
        let digits: Vec<String> = digits.into_iter().map(|d| d.trim().to_string()).collect();
        let units: Vec<String> = units.into_iter().map(|u| u.trim().to_string()).collect();
        if digits.is_empty() || digits.iter().any(|d| d.is_empty()) {
            return Err(anyhow!("digit vocabulary must list non-empty labels"));
        }
        if units.is_empty() || units.iter().any(|u| u.is_empty()) {
            return Err(anyhow!("unit vocabulary must list non-empty labels"));
        }
        if let Some(shared) = units.iter().find(|u| digits.contains(u)) {
            return Err(anyhow!(
                "label '{}' is in both the digit and the unit vocabulary",
                shared
            ));
        }
        Ok(Self {
            digits,
            units,
            policy,
        })
    }

    pub fn with_policy(mut self, policy: LabelPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn digits(&self) -> &[String] {
        &self.digits
    }

    pub fn units(&self) -> &[String] {
        &self.units
    }

    pub fn policy(&self) -> LabelPolicy {
        self.policy
    }

    /// Characters this label contributes to the reading, if any.
    pub fn reading_token<'a>(&self, label: &'a str) -> Option<Cow<'a, str>> {
        let label = label.trim();
        if self.is_unit(label) {
            return None;
        }
        match self.policy {
            LabelPolicy::Exact => self
                .digits
                .iter()
                .any(|d| d == label)
                .then_some(Cow::Borrowed(label)),
            LabelPolicy::Lenient => {
                let kept: String = label
                    .chars()
                    .filter(|c| c.is_ascii_digit() || *c == '.')
                    .collect();
                (!kept.is_empty()).then_some(Cow::Owned(kept))
            }
        }
    }

    pub fn is_unit(&self, label: &str) -> bool {
        let label = label.trim();
        self.units.iter().any(|u| u == label)
    }
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self {
            digits: DEFAULT_DIGITS.iter().map(|d| d.to_string()).collect(),
            units: DEFAULT_UNITS.iter().map(|u| u.to_string()).collect(),
            policy: LabelPolicy::Exact,
        }
    }
}

/// Reconstructed measurement.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Reading {
    value: Option<String>,
    unit: Option<String>,
}

impl Reading {
    /// Reading characters, or [`NO_READING`] when none were detected.
    pub fn reading_str(&self) -> &str {
        self.value.as_deref().unwrap_or(NO_READING)
    }

    /// Best unit label, or `""` when no unit was detected.
    pub fn unit_label(&self) -> &str {
        self.unit.as_deref().unwrap_or("")
    }

    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }

    pub fn has_unit(&self) -> bool {
        self.unit.is_some()
    }

    /// `"<reading> <unit>"`, or the reading alone without a unit.
    pub fn display_text(&self) -> String {
        match &self.unit {
            Some(unit) => format!("{} {}", self.reading_str(), unit),
            None => self.reading_str().to_string(),
        }
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_text())
    }
}

/// Build the reading from fused detections. Pure; labels outside both
/// vocabularies are ignored.
pub fn reconstruct(detections: &[Detection], vocabulary: &Vocabulary) -> Reading {
    let mut characters: Vec<(f32, Cow<'_, str>)> = detections
        .iter()
        .filter_map(|d| {
            vocabulary
                .reading_token(d.label())
                .map(|token| (d.bounding_box().left, token))
        })
        .collect();
    // Stable sort: equal left edges keep detection order.
    characters.sort_by(|a, b| a.0.total_cmp(&b.0));

    let value: String = characters.iter().map(|(_, token)| token.as_ref()).collect();
    let unit = best_unit(detections, vocabulary).map(|d| d.label().trim().to_string());

    Reading {
        value: (!value.is_empty()).then_some(value),
        unit,
    }
}

/// Highest-confidence unit detection; the first one wins a tie.
pub fn best_unit<'a>(detections: &'a [Detection], vocabulary: &Vocabulary) -> Option<&'a Detection> {
    let mut best: Option<&Detection> = None;
    for det in detections.iter().filter(|d| vocabulary.is_unit(d.label())) {
        match best {
            Some(current) if det.confidence() <= current.confidence() => {}
            _ => best = Some(det),
        }
    }
    best
}

/// Detections worth drawing: every reading character plus the best unit.
pub fn overlay_detections(detections: &[Detection], vocabulary: &Vocabulary) -> Vec<Detection> {
    let mut selected: Vec<Detection> = detections
        .iter()
        .filter(|d| vocabulary.reading_token(d.label()).is_some())
        .cloned()
        .collect();
    if let Some(unit) = best_unit(detections, vocabulary) {
        selected.push(unit.clone());
    }
    selected
}
