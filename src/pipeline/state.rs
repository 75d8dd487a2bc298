//! Two-stage wait-state machine.
//!
//! `NONE -> WAIT_UNIT` on begin, `WAIT_UNIT -> WAIT_MEASUREMENT` when the
//! unit batch arrives, `WAIT_MEASUREMENT -> NONE` when the measurement batch
//! arrives (producing the fused result). Any failure returns to `NONE`.
//!
//! The machine is owned and mutated by the worker only. Every transition is
//! mirrored into a [`SharedWaitState`] the caller can read from any thread.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use super::{FusedResults, PipelineError, Stage, SubmissionId};
use crate::detect::{Detection, DetectionBatch};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum WaitState {
    #[default]
    None = 0,
    WaitUnit = 1,
    WaitMeasurement = 2,
}

impl WaitState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::WaitUnit,
            2 => Self::WaitMeasurement,
            _ => Self::None,
        }
    }

    /// Stage whose result this state is waiting for.
    pub fn expected_stage(self) -> Option<Stage> {
        match self {
            Self::None => None,
            Self::WaitUnit => Some(Stage::Unit),
            Self::WaitMeasurement => Some(Stage::Measurement),
        }
    }
}

impl fmt::Display for WaitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "NONE"),
            Self::WaitUnit => write!(f, "WAIT_UNIT"),
            Self::WaitMeasurement => write!(f, "WAIT_MEASUREMENT"),
        }
    }
}

/// Cross-thread readable copy of the current wait state.
#[derive(Clone, Debug, Default)]
pub struct SharedWaitState {
    raw: Arc<AtomicU8>,
}

impl SharedWaitState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> WaitState {
        WaitState::from_u8(self.raw.load(Ordering::Acquire))
    }

    fn set(&self, state: WaitState) {
        self.raw.store(state as u8, Ordering::Release);
    }
}

/// Result of feeding one stage batch into the machine.
#[derive(Debug)]
pub enum StageOutcome {
    /// Unit batch stored; the measurement stage may run now.
    AwaitMeasurement,
    /// Both stages done; state is back to `NONE`.
    Complete(FusedResults),
    /// The batch did not match the current state and was discarded.
    Ignored,
}

#[derive(Debug)]
pub struct StageMachine {
    state: WaitState,
    shared: SharedWaitState,
    submission: Option<SubmissionId>,
    unit: Option<DetectionBatch>,
}

impl StageMachine {
    pub fn new(shared: SharedWaitState) -> Self {
        shared.set(WaitState::None);
        Self {
            state: WaitState::None,
            shared,
            submission: None,
            unit: None,
        }
    }

    pub fn state(&self) -> WaitState {
        self.state
    }

    pub fn submission(&self) -> Option<SubmissionId> {
        self.submission
    }

    /// Start a run. Fails if a run is already in progress.
    pub fn begin(&mut self, submission: SubmissionId) -> Result<(), PipelineError> {
        if self.state != WaitState::None {
            return Err(PipelineError::Internal(format!(
                "submission {} started while {} (previous run {:?})",
                submission, self.state, self.submission
            )));
        }
        self.submission = Some(submission);
        self.unit = None;
        self.transition(WaitState::WaitUnit);
        Ok(())
    }

    /// Feed a stage result.
    ///
    /// A batch for a stage the machine is not waiting on is a protocol
    /// violation: it is logged and discarded, and the state is untouched.
    /// Mismatched frame sizes between the two batches abort the run.
    pub fn accept(
        &mut self,
        stage: Stage,
        batch: DetectionBatch,
    ) -> Result<StageOutcome, PipelineError> {
        if self.state.expected_stage() != Some(stage) {
            log::warn!(
                "protocol violation: {} result arrived while {}; discarded",
                stage,
                self.state
            );
            return Ok(StageOutcome::Ignored);
        }

        match stage {
            Stage::Unit => {
                self.unit = Some(batch);
                self.transition(WaitState::WaitMeasurement);
                Ok(StageOutcome::AwaitMeasurement)
            }
            Stage::Measurement => {
                let submission = self.submission.take().unwrap_or_default();
                let unit = self.unit.take();
                self.transition(WaitState::None);

                let Some(unit) = unit else {
                    return Err(PipelineError::Internal(
                        "measurement stage finished without a unit batch".to_string(),
                    ));
                };
                if unit.dimensions() != batch.dimensions() {
                    return Err(PipelineError::DimensionMismatch {
                        unit: unit.dimensions(),
                        measurement: batch.dimensions(),
                    });
                }
                Ok(StageOutcome::Complete(fuse(submission, unit, batch)))
            }
        }
    }

    /// Abandon the current run after a failure. Always ends in `NONE`.
    pub fn abort(&mut self) {
        self.submission = None;
        self.unit = None;
        self.transition(WaitState::None);
    }

    fn transition(&mut self, next: WaitState) {
        log::trace!("wait state {} -> {}", self.state, next);
        self.state = next;
        self.shared.set(next);
    }
}

fn fuse(submission: SubmissionId, unit: DetectionBatch, measurement: DetectionBatch) -> FusedResults {
    let inference_time_ms = unit.inference_time_ms() + measurement.inference_time_ms();
    let (image_width, image_height) = measurement.dimensions();
    let mut detections: Vec<Detection> = unit.into_detections();
    detections.extend(measurement.into_detections());
    FusedResults {
        submission,
        detections,
        inference_time_ms,
        image_width,
        image_height,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{Category, Rect};

    fn batch(labels: &[&str], ms: u64, w: u32, h: u32) -> DetectionBatch {
        let dets = labels
            .iter()
            .enumerate()
            .map(|(i, l)| {
                let left = i as f32 * 10.0;
                Detection::new(Rect::new(left, 0.0, left + 5.0, 5.0), Category::new(*l, 0.9))
            })
            .collect();
        DetectionBatch::new(dets, ms, w, h).unwrap()
    }

    #[test]
    fn full_run_walks_every_state() {
        let shared = SharedWaitState::new();
        let mut machine = StageMachine::new(shared.clone());
        assert_eq!(shared.get(), WaitState::None);

        machine.begin(SubmissionId(7)).unwrap();
        assert_eq!(shared.get(), WaitState::WaitUnit);

        let outcome = machine.accept(Stage::Unit, batch(&["Kg"], 4, 64, 48)).unwrap();
        assert!(matches!(outcome, StageOutcome::AwaitMeasurement));
        assert_eq!(shared.get(), WaitState::WaitMeasurement);

        let outcome = machine
            .accept(Stage::Measurement, batch(&["7", "2"], 6, 64, 48))
            .unwrap();
        let StageOutcome::Complete(fused) = outcome else {
            panic!("expected a fused result");
        };
        assert_eq!(shared.get(), WaitState::None);
        assert_eq!(fused.submission, SubmissionId(7));
        assert_eq!(fused.inference_time_ms, 10);
        assert_eq!((fused.image_width, fused.image_height), (64, 48));
        let labels: Vec<&str> = fused.detections.iter().map(|d| d.label()).collect();
        assert_eq!(labels, vec!["Kg", "7", "2"]);
    }

    #[test]
    fn result_while_idle_is_ignored() {
        let mut machine = StageMachine::new(SharedWaitState::new());
        let outcome = machine.accept(Stage::Measurement, batch(&["1"], 1, 8, 8)).unwrap();
        assert!(matches!(outcome, StageOutcome::Ignored));
        assert_eq!(machine.state(), WaitState::None);
    }

    #[test]
    fn out_of_order_result_keeps_state() {
        let mut machine = StageMachine::new(SharedWaitState::new());
        machine.begin(SubmissionId(1)).unwrap();
        let outcome = machine.accept(Stage::Measurement, batch(&["1"], 1, 8, 8)).unwrap();
        assert!(matches!(outcome, StageOutcome::Ignored));
        assert_eq!(machine.state(), WaitState::WaitUnit);
    }

    #[test]
    fn dimension_mismatch_is_an_error_and_resets() {
        let mut machine = StageMachine::new(SharedWaitState::new());
        machine.begin(SubmissionId(2)).unwrap();
        machine.accept(Stage::Unit, batch(&[], 1, 64, 48)).unwrap();
        let err = machine
            .accept(Stage::Measurement, batch(&[], 1, 48, 64))
            .unwrap_err();
        assert_eq!(
            err,
            PipelineError::DimensionMismatch {
                unit: (64, 48),
                measurement: (48, 64)
            }
        );
        assert_eq!(machine.state(), WaitState::None);
    }

    #[test]
    fn abort_and_double_begin() {
        let shared = SharedWaitState::new();
        let mut machine = StageMachine::new(shared.clone());
        machine.begin(SubmissionId(3)).unwrap();
        assert!(machine.begin(SubmissionId(4)).is_err());

        machine.abort();
        assert_eq!(shared.get(), WaitState::None);
        assert!(machine.submission().is_none());
        machine.begin(SubmissionId(4)).unwrap();
    }
}
