//! Two-stage detection orchestrator.
//!
//! One submitted image runs through the unit detector (stage A) and then the
//! measurement detector (stage B) on a single background worker. The two
//! detection lists are fused into one [`FusedResults`] and posted back to the
//! caller as a [`PipelineEvent`]. Stage B never starts before stage A has
//! succeeded, and a failure in either stage produces exactly one error event
//! and no results.
//!
//! Submissions made while a run is in flight queue behind it on the worker.

pub mod state;

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;

use crate::detect::{Detection, DetectionBatch, DetectorBackend};
use crate::frame::{DecodedImage, SUPPORTED_ROTATIONS};

pub use state::{SharedWaitState, StageMachine, StageOutcome, WaitState};

const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(50);
const WORKER_THREAD_NAME: &str = "gauge-pipeline";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Detector A: unit labels.
    Unit,
    /// Detector B: digits and decimal point.
    Measurement,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unit => write!(f, "unit"),
            Self::Measurement => write!(f, "measurement"),
        }
    }
}

/// Monotonic id handed out by [`TwoStagePipeline::submit`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SubmissionId(pub u64);

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Both stages' detections for one image.
///
/// `detections` holds stage A's list followed by stage B's, each in backend
/// order. `inference_time_ms` is the sum of both stages.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FusedResults {
    pub submission: SubmissionId,
    pub detections: Vec<Detection>,
    pub inference_time_ms: u64,
    pub image_width: u32,
    pub image_height: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineError {
    /// Prediction requested with no image selected.
    NoImage,
    /// The pipeline no longer accepts work.
    ShutDown,
    /// A detector failed or panicked.
    Stage { stage: Stage, message: String },
    /// The two stages reported different frame sizes.
    DimensionMismatch {
        unit: (u32, u32),
        measurement: (u32, u32),
    },
    /// Orchestrator bookkeeping went wrong.
    Internal(String),
}

impl PipelineError {
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoImage => write!(f, "no image selected"),
            Self::ShutDown => write!(f, "pipeline is shut down"),
            Self::Stage { stage, message } => write!(f, "{} detector failed: {}", stage, message),
            Self::DimensionMismatch { unit, measurement } => write!(
                f,
                "stage frame sizes differ: unit {}x{}, measurement {}x{}",
                unit.0, unit.1, measurement.0, measurement.1
            ),
            Self::Internal(message) => write!(f, "internal pipeline error: {}", message),
        }
    }
}

impl std::error::Error for PipelineError {}

/// Message posted from the worker to the caller.
#[derive(Clone, Debug, PartialEq)]
pub enum PipelineEvent {
    Results(FusedResults),
    Failed {
        submission: SubmissionId,
        error: PipelineError,
    },
}

impl PipelineEvent {
    pub fn submission(&self) -> SubmissionId {
        match self {
            Self::Results(results) => results.submission,
            Self::Failed { submission, .. } => *submission,
        }
    }
}

/// Caller-side callbacks, invoked on the thread that drains events.
pub trait PipelineListener {
    fn on_results(&mut self, results: FusedResults);
    fn on_error(&mut self, submission: SubmissionId, error: PipelineError);
}

/// Cloneable stop switch, safe to trigger from a signal handler.
#[derive(Clone, Debug, Default)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn signal(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_signaled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

struct Job {
    id: SubmissionId,
    image: DecodedImage,
}

/// Orchestrator handle owned by the caller.
///
/// Dropping it signals shutdown without waiting for the worker; use
/// [`TwoStagePipeline::shutdown`] to also join it.
pub struct TwoStagePipeline {
    jobs: Option<Sender<Job>>,
    events: Receiver<PipelineEvent>,
    shutdown: ShutdownHandle,
    wait_state: SharedWaitState,
    next_id: u64,
    pending: usize,
    join: Option<JoinHandle<()>>,
}

impl TwoStagePipeline {
    /// Start the worker. `rotation_degrees` is passed to both detectors for
    /// every submission.
    pub fn spawn<U, M>(unit: U, measurement: M, rotation_degrees: u32) -> Result<Self>
    where
        U: DetectorBackend + 'static,
        M: DetectorBackend + 'static,
    {
        if !SUPPORTED_ROTATIONS.contains(&rotation_degrees) {
            return Err(anyhow!(
                "unsupported rotation {} (expected one of {:?})",
                rotation_degrees,
                SUPPORTED_ROTATIONS
            ));
        }

        let (job_tx, job_rx) = mpsc::channel();
        let (event_tx, event_rx) = mpsc::channel();
        let shutdown = ShutdownHandle::default();
        let wait_state = SharedWaitState::new();

        let worker = Worker {
            unit: Box::new(unit),
            measurement: Box::new(measurement),
            rotation_degrees,
            machine: StageMachine::new(wait_state.clone()),
            shutdown: shutdown.clone(),
        };
        log::info!(
            "pipeline starting (unit={}, measurement={}, rotation={})",
            worker.unit.name(),
            worker.measurement.name(),
            rotation_degrees
        );
        let join = std::thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || worker.run(job_rx, event_tx))
            .context("failed to spawn pipeline worker")?;

        Ok(Self {
            jobs: Some(job_tx),
            events: event_rx,
            shutdown,
            wait_state,
            next_id: 0,
            pending: 0,
            join: Some(join),
        })
    }

    /// Queue an image for both stages. Returns immediately.
    pub fn submit(&mut self, image: Option<DecodedImage>) -> Result<SubmissionId, PipelineError> {
        let image = image.ok_or(PipelineError::NoImage)?;
        if self.shutdown.is_signaled() {
            return Err(PipelineError::ShutDown);
        }
        let jobs = self.jobs.as_ref().ok_or(PipelineError::ShutDown)?;

        self.next_id += 1;
        let id = SubmissionId(self.next_id);
        jobs.send(Job { id, image })
            .map_err(|_| PipelineError::ShutDown)?;
        self.pending += 1;
        log::debug!("submission {} queued ({} pending)", id, self.pending);
        Ok(id)
    }

    /// Next delivered event, if one is ready.
    pub fn try_next(&mut self) -> Option<PipelineEvent> {
        if self.shutdown.is_signaled() {
            self.abandon_pending();
            return None;
        }
        match self.events.try_recv() {
            Ok(event) => Some(self.delivered(event)),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Wait up to `timeout` for the next event.
    pub fn next_timeout(&mut self, timeout: Duration) -> Option<PipelineEvent> {
        if self.shutdown.is_signaled() {
            self.abandon_pending();
            return None;
        }
        match self.events.recv_timeout(timeout) {
            Ok(event) if !self.shutdown.is_signaled() => Some(self.delivered(event)),
            Ok(event) => {
                log::debug!("dropping event for {} after shutdown", event.submission());
                self.abandon_pending();
                None
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Hand every ready event to `listener`. Returns how many were delivered.
    pub fn dispatch<L: PipelineListener + ?Sized>(&mut self, listener: &mut L) -> usize {
        let mut delivered = 0;
        while let Some(event) = self.try_next() {
            deliver(event, listener);
            delivered += 1;
        }
        delivered
    }

    /// Like [`TwoStagePipeline::dispatch`], waiting up to `timeout` for the
    /// first event.
    pub fn dispatch_timeout<L: PipelineListener + ?Sized>(
        &mut self,
        listener: &mut L,
        timeout: Duration,
    ) -> usize {
        match self.next_timeout(timeout) {
            Some(event) => {
                deliver(event, listener);
                1 + self.dispatch(listener)
            }
            None => 0,
        }
    }

    pub fn wait_state(&self) -> WaitState {
        self.wait_state.get()
    }

    /// Submissions whose event has not been delivered yet. Always zero once
    /// shutdown is signaled, since those events are never delivered.
    pub fn pending(&self) -> usize {
        if self.shutdown.is_signaled() {
            0
        } else {
            self.pending
        }
    }

    pub fn is_busy(&self) -> bool {
        self.pending() > 0
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_signaled()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Stop accepting work, skip queued jobs and wait for the worker to exit.
    pub fn shutdown(mut self) -> Result<()> {
        self.shutdown.signal();
        self.jobs.take();
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("pipeline worker thread panicked"))?;
        }
        log::info!("pipeline stopped");
        Ok(())
    }

    fn delivered(&mut self, event: PipelineEvent) -> PipelineEvent {
        self.pending = self.pending.saturating_sub(1);
        event
    }

    fn abandon_pending(&mut self) {
        if self.pending > 0 {
            log::debug!("abandoning {} undelivered submissions after shutdown", self.pending);
            self.pending = 0;
        }
    }
}

impl Drop for TwoStagePipeline {
    fn drop(&mut self) {
        self.shutdown.signal();
        self.jobs.take();
    }
}

fn deliver<L: PipelineListener + ?Sized>(event: PipelineEvent, listener: &mut L) {
    match event {
        PipelineEvent::Results(results) => listener.on_results(results),
        PipelineEvent::Failed { submission, error } => listener.on_error(submission, error),
    }
}

struct Worker {
    unit: Box<dyn DetectorBackend>,
    measurement: Box<dyn DetectorBackend>,
    rotation_degrees: u32,
    machine: StageMachine,
    shutdown: ShutdownHandle,
}

impl Worker {
    fn run(mut self, jobs: Receiver<Job>, events: Sender<PipelineEvent>) {
        for (stage, backend) in [
            (Stage::Unit, self.unit.as_mut()),
            (Stage::Measurement, self.measurement.as_mut()),
        ] {
            if let Err(err) = backend.warm_up() {
                log::warn!("{} detector warm-up failed: {:#}", stage, err);
            }
        }

        loop {
            if self.shutdown.is_signaled() {
                break;
            }
            let job = match jobs.recv_timeout(WORKER_POLL_INTERVAL) {
                Ok(job) => job,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            if self.shutdown.is_signaled() {
                log::debug!("skipping submission {} after shutdown", job.id);
                break;
            }

            let event = self.process(job);
            if self.shutdown.is_signaled() {
                log::debug!("dropping event for {} after shutdown", event.submission());
                break;
            }
            if events.send(event).is_err() {
                log::warn!("pipeline event receiver gone; worker exiting");
                break;
            }
        }
        log::debug!("pipeline worker exited");
    }

    fn process(&mut self, job: Job) -> PipelineEvent {
        let id = job.id;
        match self.run_stages(id, &job.image) {
            Ok(results) => {
                log::debug!(
                    "submission {}: {} detections in {} ms",
                    id,
                    results.detections.len(),
                    results.inference_time_ms
                );
                PipelineEvent::Results(results)
            }
            Err(error) => {
                self.machine.abort();
                log::error!("submission {} failed: {}", id, error);
                PipelineEvent::Failed {
                    submission: id,
                    error,
                }
            }
        }
    }

    fn run_stages(
        &mut self,
        id: SubmissionId,
        image: &DecodedImage,
    ) -> Result<FusedResults, PipelineError> {
        self.machine.begin(id)?;

        let unit = run_stage(Stage::Unit, self.unit.as_mut(), image, self.rotation_degrees)?;
        match self.machine.accept(Stage::Unit, unit)? {
            StageOutcome::AwaitMeasurement => {}
            other => {
                return Err(PipelineError::Internal(format!(
                    "unit stage ended in {:?}",
                    other
                )))
            }
        }

        let measurement = run_stage(
            Stage::Measurement,
            self.measurement.as_mut(),
            image,
            self.rotation_degrees,
        )?;
        match self.machine.accept(Stage::Measurement, measurement)? {
            StageOutcome::Complete(results) => Ok(results),
            other => Err(PipelineError::Internal(format!(
                "measurement stage ended in {:?}",
                other
            ))),
        }
    }
}

fn run_stage(
    stage: Stage,
    backend: &mut dyn DetectorBackend,
    image: &DecodedImage,
    rotation_degrees: u32,
) -> Result<DetectionBatch, PipelineError> {
    match panic::catch_unwind(AssertUnwindSafe(|| backend.detect(image, rotation_degrees))) {
        Ok(Ok(batch)) => {
            log::debug!(
                "{} stage ({}): {} detections in {} ms",
                stage,
                backend.name(),
                batch.len(),
                batch.inference_time_ms()
            );
            Ok(batch)
        }
        Ok(Err(err)) => Err(PipelineError::Stage {
            stage,
            message: format!("{:#}", err),
        }),
        Err(payload) => Err(PipelineError::Stage {
            stage,
            message: format!("detector panicked: {}", panic_message(payload.as_ref())),
        }),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
