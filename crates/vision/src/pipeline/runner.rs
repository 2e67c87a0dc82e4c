//! Pipeline owned by the UI-affine thread.
//!
//! The camera session's hardware thread publishes completions, the inference
//! worker publishes processed frames, and [`Pipeline::pump`] on the owning
//! thread is the only code that reads either channel or touches the
//! [`ResultSink`].

use std::{
    marker::PhantomData,
    sync::Arc,
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use crossbeam_channel::select;
use ml_core::{EngineOptions, InferenceEngine, LoadError};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn};
use video_ingest::{
    CameraBackend, CaptureError, CaptureSession, Completion, DeviceRegistry, SessionState,
};

use crate::pipeline::{
    config::PipelineConfig,
    convert::FrameConverter,
    coordinator::{CaptureCoordinator, CompletionOutcome},
    error::{FailureKind, PipelineError},
    inference::{InferenceWorker, ProcessJob, ProcessOutcome},
    presentation::{Presentation, ResultSink},
    source, telemetry,
};

/// Whether a pipeline feature survived setup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum FeatureStatus {
    Enabled,
    Disabled(FailureKind),
}

impl FeatureStatus {
    pub fn is_enabled(self) -> bool {
        self == FeatureStatus::Enabled
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct PipelineStatus {
    pub camera: FeatureStatus,
    pub inference: FeatureStatus,
}

/// Something the owner of the pipeline may want to react to.
#[derive(Debug)]
pub enum PipelineEvent {
    /// The sink received a new image. `inference_error` is set when the photo
    /// was shown without a result because the forward pass failed.
    Presented {
        request_id: u64,
        inference_error: Option<PipelineError>,
    },
    /// The request ended without anything to show.
    Failed {
        request_id: u64,
        error: PipelineError,
    },
    /// A completion or outcome for a request that is no longer wanted.
    Discarded { request_id: u64 },
}

impl PipelineEvent {
    pub fn request_id(&self) -> u64 {
        match self {
            PipelineEvent::Presented { request_id, .. }
            | PipelineEvent::Failed { request_id, .. }
            | PipelineEvent::Discarded { request_id } => *request_id,
        }
    }
}

struct Processing {
    request_id: u64,
    deadline: Instant,
}

pub struct Pipeline {
    session: Result<CaptureSession, FailureKind>,
    coordinator: CaptureCoordinator,
    engine: Result<Arc<InferenceEngine>, FailureKind>,
    worker: InferenceWorker,
    processing: Option<Processing>,
    presentation: Presentation,
    sink: Box<dyn ResultSink>,
    inference_timeout: Duration,
    owner: ThreadId,
    // Presentation state lives on the thread that built the pipeline.
    _not_send: PhantomData<*const ()>,
}

impl Pipeline {
    /// Build the camera backend and engine described by `config`.
    pub fn from_config(config: &PipelineConfig, sink: Box<dyn ResultSink>) -> Result<Self> {
        let backend = source::camera_backend(&config.source)?;
        let options = EngineOptions {
            expected_outputs: Some(config.expected_outputs.clone()),
        };
        let engine = InferenceEngine::load(&config.model_path, &options);
        Self::setup(config, backend, engine, sink)
    }

    /// Configure the capture session and inference worker.
    ///
    /// Camera and inference setup failures are logged once and disable that
    /// feature; only a failure to spawn the worker thread is returned.
    pub fn setup(
        config: &PipelineConfig,
        backend: Arc<dyn CameraBackend>,
        engine: Result<InferenceEngine, LoadError>,
        sink: Box<dyn ResultSink>,
    ) -> Result<Self> {
        let session = configure_session(DeviceRegistry::new(backend), config);
        let engine = match engine {
            Ok(engine) => Ok(Arc::new(engine)),
            Err(err) => {
                error!(
                    error = %err,
                    path = %config.model_path.display(),
                    "model bundle failed to load; inference disabled"
                );
                Err(FailureKind::LoadFailed)
            }
        };

        let converter = FrameConverter::new(config.capture_format);
        let worker = InferenceWorker::spawn(converter, engine.as_ref().ok().cloned())
            .context("failed to spawn inference worker")?;

        Ok(Self {
            session,
            coordinator: CaptureCoordinator::new(config.capture_timeout),
            engine,
            worker,
            processing: None,
            presentation: Presentation::default(),
            sink,
            inference_timeout: config.inference_timeout,
            owner: thread::current().id(),
            _not_send: PhantomData,
        })
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            camera: feature_status(&self.session),
            inference: feature_status(&self.engine),
        }
    }

    pub fn session_state(&self) -> Option<SessionState> {
        self.session.as_ref().ok().map(CaptureSession::state)
    }

    pub fn presentation(&self) -> &Presentation {
        &self.presentation
    }

    pub fn engine(&self) -> Option<&InferenceEngine> {
        self.engine.as_deref().ok()
    }

    /// Whether a request is outstanding at any stage.
    pub fn is_busy(&self) -> bool {
        self.coordinator.is_pending() || self.processing.is_some()
    }

    pub fn start(&mut self) -> Result<(), PipelineError> {
        let session = session_mut(&mut self.session)?;
        session.start()?;
        Ok(())
    }

    /// Stop the session and abandon whatever request is in flight. Anything
    /// it produces later is discarded.
    pub fn stop(&mut self) {
        if let Ok(session) = self.session.as_mut() {
            session.stop();
        }
        if let Some(ticket) = self.coordinator.abandon() {
            info!(request = ticket.request_id, "capture abandoned by stop");
        }
        if let Some(processing) = self.processing.take() {
            info!(request = processing.request_id, "processing abandoned by stop");
        }
    }

    /// Request one photo. Returns the request id the resulting event carries.
    pub fn trigger(&mut self) -> Result<u64, PipelineError> {
        self.assert_owner();
        let session = match &self.session {
            Ok(session) => session,
            Err(kind) => {
                return Err(PipelineError::Unavailable {
                    feature: "camera",
                    kind: *kind,
                });
            }
        };
        if let Some(processing) = &self.processing {
            debug!(
                outstanding = processing.request_id,
                "capture rejected: previous photo still processing"
            );
            return Err(PipelineError::Capture(CaptureError::Busy));
        }
        let ticket = self.coordinator.request_capture(session)?;
        Ok(ticket.request_id)
    }

    /// Handle pipeline traffic for up to `wait`, returning the first event.
    pub fn pump(&mut self, wait: Duration) -> Option<PipelineEvent> {
        self.assert_owner();
        let until = Instant::now() + wait;
        let completions = self.coordinator.completions().clone();
        let outcomes = self.worker.outcomes().clone();

        loop {
            let now = Instant::now();
            if let Some(event) = self.expire(now) {
                return Some(event);
            }
            let slice = self
                .next_deadline(now)
                .map_or(until, |deadline| deadline.min(until))
                .saturating_duration_since(now);

            let event = select! {
                recv(completions) -> msg => match msg {
                    Ok(completion) => self.on_completion(completion),
                    Err(_) => None,
                },
                recv(outcomes) -> msg => match msg {
                    Ok(outcome) => Some(self.on_outcome(outcome)),
                    Err(_) => None,
                },
                default(slice) => None,
            };
            if event.is_some() {
                return event;
            }
            let now = Instant::now();
            if now >= until {
                return self.expire(now);
            }
        }
    }

    /// Trigger a capture and pump until it is presented or fails.
    pub fn capture_once(&mut self, timeout: Duration) -> Result<&Presentation, PipelineError> {
        let request_id = self.trigger()?;
        let until = Instant::now() + timeout;
        loop {
            let remaining = until.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.coordinator.abandon();
                self.processing = None;
                return Err(PipelineError::Timeout {
                    stage: "capture",
                    after_ms: timeout.as_millis() as u64,
                });
            }
            match self.pump(remaining) {
                Some(PipelineEvent::Presented {
                    request_id: id,
                    inference_error,
                }) if id == request_id => {
                    if let Some(err) = inference_error {
                        warn!(error = %err, "photo presented without inference");
                    }
                    return Ok(&self.presentation);
                }
                Some(PipelineEvent::Failed {
                    request_id: id,
                    error,
                }) if id == request_id => return Err(error),
                _ => {}
            }
        }
    }

    fn on_completion(&mut self, completion: Completion) -> Option<PipelineEvent> {
        let session = match &self.session {
            Ok(session) => session,
            Err(_) => {
                telemetry::record_discarded();
                return Some(PipelineEvent::Discarded {
                    request_id: completion.request_id,
                });
            }
        };

        match self.coordinator.complete(completion, session) {
            CompletionOutcome::Discarded { request_id } => {
                Some(PipelineEvent::Discarded { request_id })
            }
            CompletionOutcome::Failed { request_id, error } => {
                Some(self.fail(request_id, PipelineError::from(error)))
            }
            CompletionOutcome::Captured { request_id, frame } => {
                let job = ProcessJob {
                    request_id,
                    frame,
                    span: info_span!("capture.process", request = request_id),
                };
                match self.worker.submit(job) {
                    Ok(()) => {
                        self.processing = Some(Processing {
                            request_id,
                            deadline: Instant::now() + self.inference_timeout,
                        });
                        None
                    }
                    Err(_) => {
                        warn!(request = request_id, "inference worker still busy; photo dropped");
                        Some(self.fail(
                            request_id,
                            PipelineError::Capture(CaptureError::Busy),
                        ))
                    }
                }
            }
        }
    }

    fn on_outcome(&mut self, outcome: ProcessOutcome) -> PipelineEvent {
        let request_id = outcome.request_id;
        if self
            .processing
            .as_ref()
            .is_none_or(|processing| processing.request_id != request_id)
        {
            debug!(request = request_id, "discarding outcome of abandoned request");
            telemetry::record_discarded();
            return PipelineEvent::Discarded { request_id };
        }
        self.processing = None;
        telemetry::record_stage("process", outcome.elapsed);

        let image = match outcome.image {
            Ok(image) => image,
            Err(error) => return self.fail(request_id, error),
        };
        let (inference, inference_error) = match outcome.inference {
            Some(Ok(result)) => (Some(result), None),
            Some(Err(err)) => (None, Some(err)),
            None => (None, None),
        };

        let outcome_label = match (&inference, &inference_error) {
            (Some(_), _) => "presented",
            (None, Some(_)) => "inference_failed",
            (None, None) => "image_only",
        };
        self.present(Presentation {
            image: Some(image),
            inference,
        });
        telemetry::record_capture(outcome_label);
        PipelineEvent::Presented {
            request_id,
            inference_error,
        }
    }

    fn fail(&mut self, request_id: u64, error: PipelineError) -> PipelineEvent {
        telemetry::record_capture(error.kind().label());
        self.sink.capture_failed(&error);
        PipelineEvent::Failed { request_id, error }
    }

    fn present(&mut self, presentation: Presentation) {
        self.assert_owner();
        let span = info_span!("present", with_result = presentation.inference.is_some());
        let _entered = span.enter();
        self.presentation = presentation;
        self.sink.present(&self.presentation);
    }

    fn expire(&mut self, now: Instant) -> Option<PipelineEvent> {
        if let Ok(session) = &self.session {
            if let Some((request_id, error)) = self.coordinator.expire(now, session) {
                return Some(self.fail(request_id, PipelineError::from(error)));
            }
        }
        let overdue = self
            .processing
            .as_ref()
            .is_some_and(|processing| now >= processing.deadline);
        if overdue {
            let processing = self.processing.take()?;
            warn!(request = processing.request_id, "conversion and inference timed out");
            let error = PipelineError::Timeout {
                stage: "inference",
                after_ms: self.inference_timeout.as_millis() as u64,
            };
            return Some(self.fail(processing.request_id, error));
        }
        None
    }

    fn next_deadline(&self, now: Instant) -> Option<Instant> {
        let capture = self
            .coordinator
            .time_remaining(now)
            .map(|remaining| now + remaining);
        let processing = self.processing.as_ref().map(|processing| processing.deadline);
        match (capture, processing) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn assert_owner(&self) {
        debug_assert_eq!(
            thread::current().id(),
            self.owner,
            "pipeline used off its owning thread"
        );
    }
}

fn configure_session(
    registry: DeviceRegistry,
    config: &PipelineConfig,
) -> Result<CaptureSession, FailureKind> {
    let attempt = || -> Result<CaptureSession, CaptureError> {
        let devices = registry.list_devices()?;
        let device = DeviceRegistry::select_preferred(&devices, config.facing)?;
        CaptureSession::configure(registry.backend().as_ref(), &device, config.capture_format)
    };
    attempt().map_err(|err| {
        error!(
            error = %err,
            backend = registry.backend().name(),
            "camera setup failed; capture disabled"
        );
        PipelineError::from(err).kind()
    })
}

fn session_mut(
    session: &mut Result<CaptureSession, FailureKind>,
) -> Result<&mut CaptureSession, PipelineError> {
    session.as_mut().map_err(|kind| PipelineError::Unavailable {
        feature: "camera",
        kind: *kind,
    })
}

fn feature_status<T>(feature: &Result<T, FailureKind>) -> FeatureStatus {
    match feature {
        Ok(_) => FeatureStatus::Enabled,
        Err(kind) => FeatureStatus::Disabled(*kind),
    }
}
