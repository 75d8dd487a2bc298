use std::time::Duration;

use anyhow::anyhow;

use gauge_reader::detect::{ReplayBackend, ReplayDetection};
use gauge_reader::{
    DecodedImage, DetectionBatch, DetectorBackend, DisplayRect, OverlayBox, OverlayInstruction,
    PipelineError, ReaderSession, RenderTarget, TwoStagePipeline, Vocabulary, NO_READING,
};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct Canvas {
    drawn: Vec<Vec<OverlayBox>>,
    clears: usize,
}

impl RenderTarget for Canvas {
    fn draw(&mut self, boxes: &[OverlayBox]) {
        self.drawn.push(boxes.to_vec());
    }

    fn clear(&mut self) {
        self.clears += 1;
    }
}

struct Broken;

impl DetectorBackend for Broken {
    fn name(&self) -> &'static str {
        "broken"
    }

    fn detect(&mut self, _image: &DecodedImage, _rotation: u32) -> anyhow::Result<DetectionBatch> {
        Err(anyhow!("inference runtime failure"))
    }
}

fn unit_replay() -> ReplayBackend {
    ReplayBackend::new(vec![
        ReplayDetection::new("Lb", 0.4, 0.80, 0.1, 0.95, 0.3),
        ReplayDetection::new("Kg", 0.9, 0.60, 0.1, 0.75, 0.3),
    ])
    .unwrap()
}

fn measurement_replay() -> ReplayBackend {
    ReplayBackend::new(vec![
        ReplayDetection::new("2", 0.9, 0.50, 0.4, 0.60, 0.8),
        ReplayDetection::new("7", 0.8, 0.10, 0.4, 0.20, 0.8),
        ReplayDetection::new(".", 0.7, 0.30, 0.7, 0.35, 0.8),
    ])
    .unwrap()
}

fn session_with<U, M>(unit: U, measurement: M) -> ReaderSession<Canvas>
where
    U: DetectorBackend + 'static,
    M: DetectorBackend + 'static,
{
    let pipeline = TwoStagePipeline::spawn(unit, measurement, 0).unwrap();
    ReaderSession::new(pipeline, Vocabulary::default(), Canvas::default())
}

fn pump_until_idle(session: &mut ReaderSession<Canvas>) {
    while session.is_busy() {
        assert!(session.pump_timeout(WAIT) > 0, "timed out waiting for events");
    }
}

#[test]
fn predict_without_image_is_rejected() {
    let mut session = session_with(unit_replay(), measurement_replay());
    assert_eq!(session.predict(), Err(PipelineError::NoImage));
    assert!(session.controls_enabled());
    assert!(!session.is_busy());
    assert_eq!(session.pump(), 0);
}

#[test]
fn results_set_text_and_draw_overlay() {
    let mut session = session_with(unit_replay(), measurement_replay());
    session.select_image(Some(DecodedImage::filled(200, 100, [0, 0, 0]).unwrap()));
    session.set_display_rect(Some(DisplayRect::new(0.0, 50.0, 400.0, 200.0)));

    session.predict().unwrap();
    assert!(!session.controls_enabled());
    pump_until_idle(&mut session);

    assert!(session.controls_enabled());
    assert_eq!(session.result_text(), "7.2 Kg");
    assert_eq!(session.last_reading().unwrap().unit_label(), "Kg");

    let canvas = session.target();
    let boxes = canvas.drawn.last().expect("overlay drawn");
    let captions: Vec<&str> = boxes.iter().map(|b| b.caption.as_str()).collect();
    assert_eq!(captions, vec!["2 90%", "7 80%", ". 70%", "Kg 90%"]);

    // 200x100 frame shown in a 400x200 rect offset by 50 px vertically.
    let seven = &boxes[1].rect;
    assert!((seven.left - 40.0).abs() < 1e-3);
    assert!((seven.top - 130.0).abs() < 1e-3);
    assert!((seven.right - 80.0).abs() < 1e-3);
    assert!((seven.bottom - 210.0).abs() < 1e-3);
}

#[test]
fn missing_display_rect_clears_overlay() {
    let mut session = session_with(unit_replay(), measurement_replay());
    session.select_image(Some(DecodedImage::filled(64, 64, [0, 0, 0]).unwrap()));
    let clears_before = session.target().clears;

    session.predict().unwrap();
    pump_until_idle(&mut session);

    assert_eq!(session.result_text(), "7.2 Kg");
    assert_eq!(session.last_overlay(), Some(&OverlayInstruction::Clear));
    assert!(session.target().drawn.is_empty());
    assert!(session.target().clears > clears_before);
}

#[test]
fn stage_error_sets_error_text_and_unlocks() {
    let mut session = session_with(Broken, measurement_replay());
    session.select_image(Some(DecodedImage::filled(32, 32, [0, 0, 0]).unwrap()));

    session.predict().unwrap();
    pump_until_idle(&mut session);

    assert!(session.controls_enabled());
    assert!(session.result_text().starts_with("Error: "));
    assert!(session.result_text().contains("inference runtime failure"));
    assert!(session.last_reading().is_none());
}

#[test]
fn no_recognized_labels_show_placeholder() {
    let noise =
        ReplayBackend::new(vec![ReplayDetection::new("cat", 0.9, 0.1, 0.1, 0.2, 0.2)]).unwrap();
    let mut session = session_with(noise, ReplayBackend::default());
    session.select_image(Some(DecodedImage::filled(32, 32, [0, 0, 0]).unwrap()));
    session.set_display_rect(Some(DisplayRect::identity(32, 32)));

    session.predict().unwrap();
    pump_until_idle(&mut session);

    assert_eq!(session.result_text(), NO_READING);
    assert_eq!(session.last_overlay(), Some(&OverlayInstruction::Draw(vec![])));
}

#[test]
fn queued_predictions_keep_controls_locked_until_last() {
    let mut session = session_with(unit_replay(), measurement_replay());
    session.select_image(Some(DecodedImage::filled(32, 32, [0, 0, 0]).unwrap()));

    session.predict().unwrap();
    session.predict().unwrap();

    let mut applied = 0;
    while applied < 2 {
        let got = session.pump_timeout(WAIT);
        assert!(got > 0, "timed out waiting for events");
        applied += got;
        if applied < 2 {
            assert!(!session.controls_enabled());
        }
    }
    assert!(session.controls_enabled());
}

#[test]
fn shutdown_while_busy_releases_controls() {
    let mut session = session_with(unit_replay(), measurement_replay());
    session.select_image(Some(DecodedImage::filled(32, 32, [0, 0, 0]).unwrap()));

    session.predict().unwrap();
    assert!(session.is_busy());
    session.shutdown_handle().signal();

    for _ in 0..5 {
        assert_eq!(session.pump_timeout(Duration::from_millis(100)), 0);
    }
    assert!(!session.is_busy());
    assert!(session.controls_enabled());
    assert_eq!(session.predict(), Err(PipelineError::ShutDown));
}
