use std::cmp::Ordering;

use anyhow::{anyhow, Result};

use crate::detect::result::{Category, Detection, Rect};

/// Box attributes preceding the class scores: cx, cy, w, h.
const BOX_ATTRS: usize = 4;

/// Thresholds applied after decoding.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PostprocessParams {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub max_results: usize,
}

impl Default for PostprocessParams {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            iou_threshold: 0.3,
            max_results: 30,
        }
    }
}

/// Orientation of a 2-D YOLO output tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputLayout {
    /// `[4 + classes, anchors]` (Ultralytics default export).
    ChannelFirst,
    /// `[anchors, 4 + classes]`.
    ChannelLast,
}

impl OutputLayout {
    /// Infer the layout from the tensor shape and the class count.
    pub fn detect(rows: usize, cols: usize, num_classes: usize) -> Result<Self> {
        let attrs = BOX_ATTRS + num_classes;
        if rows == attrs {
            Ok(Self::ChannelFirst)
        } else if cols == attrs {
            Ok(Self::ChannelLast)
        } else {
            Err(anyhow!(
                "output shape {}x{} does not carry {} box+class attributes",
                rows,
                cols,
                attrs
            ))
        }
    }
}

/// A decoded prediction with its box normalized to `[0, 1]`.
#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    pub class_id: usize,
    pub score: f32,
    pub rect: Rect,
}

impl Candidate {
    /// Scale the normalized box onto a `width` x `height` frame and attach a label.
    ///
    /// Class ids past the label table become `class_<id>`, which never matches
    /// a digit or unit label.
    pub fn into_detection(self, labels: &[String], width: u32, height: u32) -> Detection {
        let w = width as f32;
        let h = height as f32;
        let rect = Rect::new(
            self.rect.left * w,
            self.rect.top * h,
            self.rect.right * w,
            self.rect.bottom * h,
        );
        let label = labels
            .get(self.class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", self.class_id));
        Detection::new(rect, Category::new(label, self.score))
    }
}

/// Decode a raw `rows` x `cols` output into candidates above the threshold.
///
/// Box coordinates are model-input pixels and are divided by `input_size`.
pub fn decode_yolo(
    raw: &[f32],
    rows: usize,
    cols: usize,
    num_classes: usize,
    input_size: u32,
    confidence_threshold: f32,
) -> Result<Vec<Candidate>> {
    if num_classes == 0 {
        return Err(anyhow!("model declares no classes"));
    }
    if input_size == 0 {
        return Err(anyhow!("model input size must be > 0"));
    }
    let expected = rows
        .checked_mul(cols)
        .ok_or_else(|| anyhow!("output shape overflow"))?;
    if raw.len() != expected {
        return Err(anyhow!(
            "output has {} values, shape {}x{} needs {}",
            raw.len(),
            rows,
            cols,
            expected
        ));
    }

    let layout = OutputLayout::detect(rows, cols, num_classes)?;
    let anchors = match layout {
        OutputLayout::ChannelFirst => cols,
        OutputLayout::ChannelLast => rows,
    };
    let value = |anchor: usize, attr: usize| -> f32 {
        match layout {
            OutputLayout::ChannelFirst => raw[attr * cols + anchor],
            OutputLayout::ChannelLast => raw[anchor * cols + attr],
        }
    };

    let scale = input_size as f32;
    let mut out = Vec::new();
    for anchor in 0..anchors {
        let mut best_class = 0usize;
        let mut best_score = f32::NEG_INFINITY;
        for class in 0..num_classes {
            let score = value(anchor, BOX_ATTRS + class);
            if score > best_score {
                best_score = score;
                best_class = class;
            }
        }
        if !best_score.is_finite() || best_score < confidence_threshold {
            continue;
        }

        let cx = value(anchor, 0) / scale;
        let cy = value(anchor, 1) / scale;
        let w = value(anchor, 2) / scale;
        let h = value(anchor, 3) / scale;
        let rect = Rect::new(
            (cx - w / 2.0).clamp(0.0, 1.0),
            (cy - h / 2.0).clamp(0.0, 1.0),
            (cx + w / 2.0).clamp(0.0, 1.0),
            (cy + h / 2.0).clamp(0.0, 1.0),
        );
        out.push(Candidate {
            class_id: best_class,
            score: best_score,
            rect,
        });
    }
    Ok(out)
}

/// Class-agnostic greedy non-max suppression.
///
/// Candidates are visited by descending score (stable for equal scores);
/// a candidate is dropped when it overlaps a kept one at `iou_threshold` or
/// more. At most `max_results` survive.
pub fn non_max_suppression(
    mut candidates: Vec<Candidate>,
    iou_threshold: f32,
    max_results: usize,
) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    let mut kept: Vec<Candidate> = Vec::new();

    'outer: for candidate in candidates {
        if kept.len() >= max_results {
            break;
        }
        for k in &kept {
            if candidate.rect.iou(&k.rect) >= iou_threshold {
                continue 'outer;
            }
        }
        kept.push(candidate);
    }
    kept
}

/// Decode, suppress and scale in one pass.
#[allow(clippy::too_many_arguments)]
pub fn postprocess(
    raw: &[f32],
    rows: usize,
    cols: usize,
    labels: &[String],
    input_size: u32,
    params: &PostprocessParams,
    image_width: u32,
    image_height: u32,
) -> Result<Vec<Detection>> {
    let candidates = decode_yolo(
        raw,
        rows,
        cols,
        labels.len(),
        input_size,
        params.confidence_threshold,
    )?;
    let kept = non_max_suppression(candidates, params.iou_threshold, params.max_results);
    Ok(kept
        .into_iter()
        .map(|c| c.into_detection(labels, image_width, image_height))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> Vec<String> {
        vec!["7".to_string(), "Kg".to_string()]
    }

    // Two anchors, channel-first: rows = cx, cy, w, h, score("7"), score("Kg").
    fn channel_first() -> Vec<f32> {
        vec![
            32.0, 96.0, // cx
            32.0, 32.0, // cy
            16.0, 32.0, // w
            16.0, 16.0, // h
            0.9, 0.1, // "7"
            0.05, 0.7, // "Kg"
        ]
    }

    #[test]
    fn decodes_channel_first_output() {
        let cands = decode_yolo(&channel_first(), 6, 2, 2, 128, 0.5).unwrap();
        assert_eq!(cands.len(), 2);
        assert_eq!(cands[0].class_id, 0);
        assert!((cands[0].score - 0.9).abs() < 1e-6);
        assert!((cands[0].rect.left - 24.0 / 128.0).abs() < 1e-6);
        assert!((cands[0].rect.right - 40.0 / 128.0).abs() < 1e-6);
        assert_eq!(cands[1].class_id, 1);
    }

    #[test]
    fn decodes_channel_last_output() {
        let raw = vec![
            32.0, 32.0, 16.0, 16.0, 0.9, 0.05, //
            96.0, 32.0, 32.0, 16.0, 0.1, 0.7,
        ];
        let cands = decode_yolo(&raw, 2, 6, 2, 128, 0.5).unwrap();
        assert_eq!(cands.len(), 2);
        assert_eq!(cands[1].class_id, 1);
        assert!((cands[1].rect.left - 80.0 / 128.0).abs() < 1e-6);
    }

    #[test]
    fn drops_low_confidence_and_bad_shapes() {
        let cands = decode_yolo(&channel_first(), 6, 2, 2, 128, 0.8).unwrap();
        assert_eq!(cands.len(), 1);
        assert!(decode_yolo(&channel_first(), 5, 2, 2, 128, 0.5).is_err());
        assert!(decode_yolo(&channel_first(), 4, 3, 2, 128, 0.5).is_err());
    }

    #[test]
    fn nms_keeps_best_of_overlapping_boxes() {
        let a = Candidate {
            class_id: 0,
            score: 0.6,
            rect: Rect::new(0.0, 0.0, 0.2, 0.2),
        };
        let b = Candidate {
            class_id: 1,
            score: 0.9,
            rect: Rect::new(0.01, 0.0, 0.21, 0.2),
        };
        let c = Candidate {
            class_id: 0,
            score: 0.7,
            rect: Rect::new(0.5, 0.5, 0.7, 0.7),
        };
        let kept = non_max_suppression(vec![a, b.clone(), c.clone()], 0.3, 30);
        assert_eq!(kept, vec![b.clone(), c]);

        let capped = non_max_suppression(vec![b.clone()], 0.3, 0);
        assert!(capped.is_empty());
    }

    #[test]
    fn postprocess_scales_to_frame() {
        let params = PostprocessParams::default();
        let dets = postprocess(&channel_first(), 6, 2, &labels(), 128, &params, 256, 512).unwrap();
        assert_eq!(dets.len(), 2);
        assert_eq!(dets[0].label(), "7");
        assert!((dets[0].bounding_box().left - 48.0).abs() < 1e-4);
        assert!((dets[0].bounding_box().top - 96.0).abs() < 1e-4);
        assert_eq!(dets[1].label(), "Kg");
    }

    #[test]
    fn unlabeled_class_ids_do_not_read_as_digits() {
        let cand = Candidate {
            class_id: 7,
            score: 0.9,
            rect: Rect::new(0.0, 0.0, 0.5, 0.5),
        };
        let det = cand.into_detection(&labels(), 10, 10);
        assert_eq!(det.label(), "class_7");
    }
}
