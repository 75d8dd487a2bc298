//! gauge_read - Read scale/gauge displays from photos.
//!
//! Each image runs through the unit and measurement detectors on the
//! pipeline worker. One line per image is printed (`<file>: <reading>`), or a
//! JSON report with `--json`. Exit status is non-zero when any image failed.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use image::Rgb;
use imageproc::drawing::draw_hollow_rect_mut;
use serde::Serialize;
use std::collections::HashMap;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Duration;

use gauge_reader::detect::build_backend;
use gauge_reader::reading::overlay_detections;
use gauge_reader::{
    plan_overlay, reconstruct, DecodedImage, Detection, DisplayRect, OverlayInstruction,
    PipelineEvent, ReaderConfig, Stage, SubmissionId, TwoStagePipeline,
};

#[path = "../ui.rs"]
mod ui;

const EVENT_POLL: Duration = Duration::from_millis(200);
const BOX_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const UNIT_BOX_COLOR: Rgb<u8> = Rgb([0, 200, 255]);

#[derive(Parser, Debug)]
#[command(name = "gauge_read", about = "Read scale/gauge displays from photos")]
struct Args {
    /// TOML config file (defaults to $GAUGE_READER_CONFIG)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Rotation applied before detection (0|90|180|270)
    #[arg(long, value_name = "DEG")]
    rotation: Option<u32>,

    /// Rectangle the image is displayed in, for overlay coordinates
    #[arg(long, value_name = "L,T,W,H", value_parser = parse_display_rect)]
    display_rect: Option<DisplayRect>,

    /// Write an annotated PNG per image into this directory
    #[arg(long, value_name = "DIR")]
    annotate: Option<PathBuf>,

    /// Print a JSON report instead of one line per image
    #[arg(long)]
    json: bool,

    /// UI mode for stderr progress
    #[arg(long, value_enum, default_value = "auto", value_name = "MODE")]
    ui: ui::UiMode,

    /// Images to read
    #[arg(required = true, value_name = "IMAGE")]
    images: Vec<PathBuf>,
}

#[derive(Debug, Serialize)]
struct ImageReport {
    file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reading: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inference_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    detections: Vec<Detection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    overlay: Option<OverlayInstruction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    annotation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    annotate_error: Option<String>,
}

impl ImageReport {
    fn failed(file: &Path, error: String) -> Self {
        Self {
            file: file.display().to_string(),
            text: None,
            reading: None,
            unit: None,
            inference_time_ms: None,
            detections: Vec::new(),
            overlay: None,
            error: Some(error),
            annotation: None,
            annotate_error: None,
        }
    }

    fn is_failure(&self) -> bool {
        self.error.is_some() || self.annotate_error.is_some()
    }

    fn line(&self) -> String {
        let line = match (&self.text, &self.error) {
            (_, Some(error)) => format!("{}: Error: {}", self.file, error),
            (Some(text), None) => format!("{}: {}", self.file, text),
            (None, None) => format!("{}: (no result)", self.file),
        };
        match &self.annotate_error {
            Some(error) => format!("{} (annotation failed: {})", line, error),
            None => line,
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::new(args.ui, is_tty, !stdout_is_tty);

    let mut config = {
        let _stage = ui.stage("Load config");
        match &args.config {
            Some(path) => ReaderConfig::load_from(path)?,
            None => ReaderConfig::load()?,
        }
    };
    if let Some(rotation) = args.rotation {
        config.rotation_degrees = rotation;
    }

    let mut pipeline = {
        let _stage = ui.stage("Load detectors");
        let unit = build_backend(Stage::Unit, &config)?;
        let measurement = build_backend(Stage::Measurement, &config)?;
        TwoStagePipeline::spawn(unit, measurement, config.rotation_degrees)?
    };

    let shutdown = pipeline.shutdown_handle();
    ctrlc::set_handler(move || {
        log::warn!("interrupt received; stopping");
        shutdown.signal();
    })
    .context("failed to install Ctrl-C handler")?;

    let mut reports: Vec<Option<ImageReport>> = Vec::with_capacity(args.images.len());
    let mut images: HashMap<SubmissionId, (usize, DecodedImage)> = HashMap::new();
    {
        let _stage = ui.stage("Decode and submit images");
        for (index, path) in args.images.iter().enumerate() {
            let submitted = DecodedImage::open(path).map_err(|e| format!("{:#}", e)).and_then(
                |image| {
                    pipeline
                        .submit(Some(image.clone()))
                        .map(|id| (id, image))
                        .map_err(|e| e.to_string())
                },
            );
            match submitted {
                Ok((id, image)) => {
                    images.insert(id, (index, image));
                    reports.push(None);
                }
                Err(error) => {
                    log::error!("{}: {}", path.display(), error);
                    reports.push(Some(ImageReport::failed(path, error)));
                }
            }
        }
    }

    {
        let _stage = ui.stage("Read gauges");
        let progress = ui.images(images.len());
        let mut done = 0;
        while !images.is_empty() && !pipeline.shutdown_handle().is_signaled() {
            let Some(event) = pipeline.next_timeout(EVENT_POLL) else {
                continue;
            };
            let Some((index, image)) = images.remove(&event.submission()) else {
                log::warn!("event for unknown submission {}", event.submission());
                continue;
            };
            let path = &args.images[index];
            let report = match event {
                PipelineEvent::Results(results) => {
                    let reading = reconstruct(&results.detections, &config.vocabulary);
                    let selected = overlay_detections(&results.detections, &config.vocabulary);
                    let mut annotation = None;
                    let mut annotate_error = None;
                    if let Some(dir) = &args.annotate {
                        let out = annotation_path(dir, index, path);
                        match annotate(
                            &out,
                            &image,
                            config.rotation_degrees,
                            &selected,
                            &config.vocabulary,
                        ) {
                            Ok(()) => annotation = Some(out.display().to_string()),
                            Err(e) => {
                                log::error!("{}: {:#}", path.display(), e);
                                annotate_error = Some(format!("{:#}", e));
                            }
                        }
                    }
                    let display = args.display_rect.unwrap_or_else(|| {
                        DisplayRect::identity(results.image_width, results.image_height)
                    });
                    let overlay = plan_overlay(
                        &selected,
                        results.image_width,
                        results.image_height,
                        Some(&display),
                    );
                    ImageReport {
                        file: path.display().to_string(),
                        text: Some(reading.display_text()),
                        reading: Some(reading.reading_str().to_string()),
                        unit: reading.has_unit().then(|| reading.unit_label().to_string()),
                        inference_time_ms: Some(results.inference_time_ms),
                        detections: results.detections,
                        overlay: Some(overlay),
                        error: None,
                        annotation,
                        annotate_error,
                    }
                }
                PipelineEvent::Failed { error, .. } => {
                    ImageReport::failed(path, error.to_string())
                }
            };
            done += 1;
            progress.advance(done, &report.line());
            reports[index] = Some(report);
        }
        progress.finish();
    }

    let interrupted = pipeline.shutdown_handle().is_signaled();
    pipeline.shutdown()?;

    let reports: Vec<ImageReport> = reports
        .into_iter()
        .zip(&args.images)
        .map(|(report, path)| {
            report.unwrap_or_else(|| ImageReport::failed(path, "interrupted".to_string()))
        })
        .collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for report in &reports {
            println!("{}", report.line());
        }
    }

    let failed = reports.iter().filter(|r| r.is_failure()).count();
    if interrupted {
        return Err(anyhow!("interrupted"));
    }
    if failed > 0 {
        return Err(anyhow!("{} of {} images failed", failed, reports.len()));
    }
    Ok(())
}

fn parse_display_rect(raw: &str) -> Result<DisplayRect, String> {
    let parts: Vec<f32> = raw
        .split(',')
        .map(|part| part.trim().parse::<f32>())
        .collect::<Result<_, _>>()
        .map_err(|e| format!("invalid number in '{}': {}", raw, e))?;
    match parts.as_slice() {
        [left, top, width, height] => Ok(DisplayRect::new(*left, *top, *width, *height)),
        _ => Err(format!("expected L,T,W,H, got '{}'", raw)),
    }
}

/// `<index>_<stem>.png` under `dir`; the submission index keeps inputs with
/// the same file stem apart.
fn annotation_path(dir: &Path, index: usize, source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    dir.join(format!("{:03}_{}.png", index, stem))
}

fn annotate(
    out: &Path,
    image: &DecodedImage,
    rotation_degrees: u32,
    detections: &[Detection],
    vocabulary: &gauge_reader::Vocabulary,
) -> Result<()> {
    // Boxes are relative to the rotated frame the detectors saw.
    let mut canvas = image.rotated(rotation_degrees)?.as_rgb().clone();
    for det in detections {
        let bbox = det.bounding_box();
        let width = bbox.width().round().max(1.0) as u32;
        let height = bbox.height().round().max(1.0) as u32;
        let rect = imageproc::rect::Rect::at(bbox.left.round() as i32, bbox.top.round() as i32)
            .of_size(width, height);
        let color = if vocabulary.is_unit(det.label()) {
            UNIT_BOX_COLOR
        } else {
            BOX_COLOR
        };
        draw_hollow_rect_mut(&mut canvas, rect, color);
    }

    if let Some(dir) = out.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    canvas
        .save(out)
        .with_context(|| format!("failed to write {}", out.display()))?;
    log::debug!("annotated {}", out.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gauge_reader::Vocabulary;

    #[test]
    fn annotation_paths_keep_same_stems_apart() {
        let dir = Path::new("out");
        let first = annotation_path(dir, 0, Path::new("a/scale.jpg"));
        let second = annotation_path(dir, 1, Path::new("b/scale.png"));
        assert_eq!(first, dir.join("000_scale.png"));
        assert_eq!(second, dir.join("001_scale.png"));
        assert_ne!(first, second);
    }

    #[test]
    fn annotate_writes_png_and_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let out = annotation_path(&tmp.path().join("nested"), 2, Path::new("scale.jpg"));
        let image = DecodedImage::filled(16, 8, [0, 0, 0]).unwrap();
        annotate(&out, &image, 0, &[], &Vocabulary::default()).unwrap();
        assert!(out.is_file());
    }

    #[test]
    fn annotate_reports_unwritable_target() {
        let tmp = tempfile::tempdir().unwrap();
        let out = annotation_path(tmp.path(), 0, Path::new("scale.jpg"));
        std::fs::create_dir_all(&out).unwrap();
        let image = DecodedImage::filled(16, 8, [0, 0, 0]).unwrap();
        let err = annotate(&out, &image, 0, &[], &Vocabulary::default()).unwrap_err();
        assert!(err.to_string().contains("failed to write"));

        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();
        let out = annotation_path(&blocker, 0, Path::new("scale.jpg"));
        let err = annotate(&out, &image, 0, &[], &Vocabulary::default()).unwrap_err();
        assert!(err.to_string().contains("failed to create"));
    }

    #[test]
    fn annotation_failure_counts_as_failed_report() {
        let mut report = ImageReport::failed(Path::new("scale.jpg"), "x".to_string());
        report.error = None;
        report.text = Some("7.2 Kg".to_string());
        assert!(!report.is_failure());
        assert_eq!(report.line(), "scale.jpg: 7.2 Kg");

        report.annotate_error = Some("disk full".to_string());
        assert!(report.is_failure());
        assert_eq!(
            report.line(),
            "scale.jpg: 7.2 Kg (annotation failed: disk full)"
        );
    }
}
