//! Worker thread that converts captured frames and runs the model.
//!
//! A single worker serves the pipeline, so at most one frame is being
//! converted or inferred at any time.

use std::{
    io,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, never};
use image::RgbImage;
use ml_core::{InferenceEngine, InferenceResult};
use tracing::{Span, debug, info_span, warn};
use video_ingest::Frame;

use crate::pipeline::{
    convert::{self, FrameConverter},
    error::PipelineError,
    telemetry,
};

/// How long dropping the worker waits for a forward pass in progress.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Unit of work handed to the worker.
pub(crate) struct ProcessJob {
    pub(crate) request_id: u64,
    pub(crate) frame: Frame,
    pub(crate) span: Span,
}

/// What the worker made of one frame.
pub(crate) struct ProcessOutcome {
    pub(crate) request_id: u64,
    pub(crate) image: Result<RgbImage, PipelineError>,
    /// `None` when inference is disabled or the frame never became an image.
    pub(crate) inference: Option<Result<InferenceResult, PipelineError>>,
    pub(crate) elapsed: Duration,
}

pub(crate) struct InferenceWorker {
    jobs: Option<Sender<ProcessJob>>,
    outcomes: Receiver<ProcessOutcome>,
    thread: Option<thread::JoinHandle<()>>,
    exited: Receiver<()>,
}

impl InferenceWorker {
    pub(crate) fn spawn(
        converter: FrameConverter,
        engine: Option<Arc<InferenceEngine>>,
    ) -> io::Result<Self> {
        let (job_tx, job_rx) = bounded::<ProcessJob>(1);
        let (outcome_tx, outcome_rx) = bounded::<ProcessOutcome>(1);
        let (exited_tx, exited_rx) = bounded::<()>(0);
        let thread = telemetry::spawn_thread("inference-worker", move || {
            for job in job_rx {
                let outcome = process(&converter, engine.as_deref(), job);
                if outcome_tx.send(outcome).is_err() {
                    break;
                }
            }
            debug!("inference worker exiting");
            drop(exited_tx);
        })?;
        Ok(Self {
            jobs: Some(job_tx),
            outcomes: outcome_rx,
            thread: Some(thread),
            exited: exited_rx,
        })
    }

    /// Queue a frame. Fails when the worker is still holding an earlier job.
    pub(crate) fn submit(&self, job: ProcessJob) -> Result<(), ProcessJob> {
        match &self.jobs {
            Some(jobs) => jobs.try_send(job).map_err(|err| err.into_inner()),
            None => Err(job),
        }
    }

    pub(crate) fn outcomes(&self) -> &Receiver<ProcessOutcome> {
        &self.outcomes
    }
}

impl Drop for InferenceWorker {
    fn drop(&mut self) {
        self.jobs.take();
        self.outcomes = never();
        let Some(handle) = self.thread.take() else {
            return;
        };
        match self.exited.recv_timeout(SHUTDOWN_GRACE) {
            Err(RecvTimeoutError::Timeout) => warn!(
                grace_ms = SHUTDOWN_GRACE.as_millis() as u64,
                "inference worker still running a frame; detaching it"
            ),
            _ => {
                let _ = handle.join();
            }
        }
    }
}

fn process(
    converter: &FrameConverter,
    engine: Option<&InferenceEngine>,
    job: ProcessJob,
) -> ProcessOutcome {
    let started = Instant::now();
    let _job_guard = job.span.enter();

    let image = {
        let span = info_span!("frame.convert", format = %job.frame.format);
        let _entered = span.enter();
        let convert_start = Instant::now();
        let image = converter.upright(&job.frame).map_err(PipelineError::from);
        telemetry::record_stage("convert", convert_start.elapsed());
        image
    };

    let inference = match (&image, engine) {
        (Ok(upright), Some(engine)) => Some(run_model(engine, upright)),
        _ => None,
    };

    ProcessOutcome {
        request_id: job.request_id,
        image,
        inference,
        elapsed: started.elapsed(),
    }
}

fn run_model(
    engine: &InferenceEngine,
    upright: &RgbImage,
) -> Result<InferenceResult, PipelineError> {
    let span = info_span!("model.run", bundle = engine.bundle().name());
    let _entered = span.enter();
    let run_start = Instant::now();

    let input = convert::fit(upright, engine.input_spec())?;
    let result = engine.run(&input).map_err(PipelineError::from);
    telemetry::record_stage("inference", run_start.elapsed());
    match &result {
        Ok(values) => debug!(outputs = values.len(), "inference complete"),
        Err(err) => warn!(error = %err, "inference failed"),
    }
    result
}
