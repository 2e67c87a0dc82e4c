use std::{
    cell::RefCell,
    fs,
    path::PathBuf,
    rc::Rc,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender, bounded};

use ml_core::{
    EngineOptions, ImageInputSpec, InferenceEngine, InferenceError, LoadError, ModelBackend,
    ModelInput,
};
use serde_json::json;
use tempfile::TempDir;
use video_ingest::{CaptureFormat, Facing, FacingPreference, PixelFormat, VirtualCamera};
use vision::{
    CameraSource, FailureKind, FeatureStatus, NullSink, Pipeline, PipelineConfig,
    PipelineError, PipelineEvent, Presentation, ResultSink, TelemetryOptions,
};

const WAIT: Duration = Duration::from_secs(2);
const OUTPUTS: [&str; 4] = ["Weight", "Height", "Age", "Sex"];

#[derive(Clone, Default)]
struct RecordingSink {
    presented: Rc<RefCell<Vec<Presentation>>>,
    failures: Rc<RefCell<Vec<FailureKind>>>,
}

impl ResultSink for RecordingSink {
    fn present(&mut self, presentation: &Presentation) {
        self.presented.borrow_mut().push(presentation.clone());
    }

    fn capture_failed(&mut self, error: &PipelineError) {
        self.failures.borrow_mut().push(error.kind());
    }
}

struct StubModel {
    values: Vec<f64>,
    seen: Arc<Mutex<Vec<(u32, u32)>>>,
}

impl ModelBackend for StubModel {
    fn name(&self) -> &str {
        "stub"
    }

    fn forward(
        &self,
        input: &ModelInput,
        _spec: &ImageInputSpec,
    ) -> Result<Vec<f64>, InferenceError> {
        self.seen
            .lock()
            .unwrap()
            .push((input.width(), input.height()));
        Ok(self.values.clone())
    }
}

/// Backend whose forward pass waits until the gate opens or closes.
struct GatedModel {
    gate: Receiver<()>,
}

impl ModelBackend for GatedModel {
    fn name(&self) -> &str {
        "gated"
    }

    fn forward(
        &self,
        _input: &ModelInput,
        _spec: &ImageInputSpec,
    ) -> Result<Vec<f64>, InferenceError> {
        let _ = self.gate.recv();
        Ok(vec![0.0; OUTPUTS.len()])
    }
}

fn write_bundle() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    let outputs: Vec<_> = OUTPUTS
        .iter()
        .map(|name| json!({ "name": name, "type": "array", "shape": [1] }))
        .collect();
    let manifest = json!({
        "name": "Phenomenal Face",
        "model": { "file": "model.pt", "backend": "stub" },
        "inputs": [{
            "name": "image", "type": "image", "shape": [8, 8, 3], "format": "RGB",
            "normalize": { "standard": "[0,1]" }
        }],
        "outputs": outputs,
    });
    fs::write(dir.path().join("model.json"), manifest.to_string()).unwrap();
    fs::write(dir.path().join("model.pt"), b"").unwrap();
    dir
}

fn stub_engine(
    bundle: &TempDir,
    values: Vec<f64>,
) -> (Result<InferenceEngine, LoadError>, Arc<Mutex<Vec<(u32, u32)>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let backend_seen = seen.clone();
    let options = EngineOptions {
        expected_outputs: Some(OUTPUTS.iter().map(|name| name.to_string()).collect()),
    };
    let engine = InferenceEngine::load_with(bundle.path(), &options, move |_| {
        Ok(Box::new(StubModel {
            values,
            seen: backend_seen,
        }))
    });
    (engine, seen)
}

fn config(format: CaptureFormat, model_path: PathBuf) -> PipelineConfig {
    PipelineConfig {
        source: CameraSource::Auto,
        facing: FacingPreference::Front,
        capture_format: format,
        model_path,
        expected_outputs: OUTPUTS.iter().map(|name| name.to_string()).collect(),
        capture_timeout: WAIT,
        inference_timeout: WAIT,
        telemetry: TelemetryOptions::default(),
    }
}

fn rgb(width: u32, height: u32) -> CaptureFormat {
    CaptureFormat::new(PixelFormat::Rgb8, width, height)
}

fn next_event(pipeline: &mut Pipeline) -> PipelineEvent {
    pipeline.pump(WAIT).expect("pipeline produced no event")
}

#[test]
fn front_camera_capture_presents_all_outputs() {
    let bundle = write_bundle();
    let camera = VirtualCamera::solid([120, 90, 60], 32, 24)
        .with_devices(vec![("rear", Facing::Back), ("selfie", Facing::Front)]);
    let (engine, seen) = stub_engine(&bundle, vec![70.2, 175.0, 30.0, 1.0]);
    let sink = RecordingSink::default();

    let mut pipeline = Pipeline::setup(
        &config(rgb(32, 24), bundle.path().to_path_buf()),
        Arc::new(camera),
        engine,
        Box::new(sink.clone()),
    )
    .unwrap();
    assert!(pipeline.status().camera.is_enabled());
    assert!(pipeline.status().inference.is_enabled());
    pipeline.start().unwrap();

    let presentation = pipeline.capture_once(WAIT).unwrap();
    let image = presentation.image.as_ref().unwrap();
    assert_eq!(image.dimensions(), (32, 24));
    let result = presentation.inference.as_ref().unwrap();
    assert_eq!(result.len(), 4);
    assert_eq!(result["Weight"], 70.2);
    assert_eq!(result["Height"], 175.0);
    assert_eq!(result["Age"], 30.0);
    assert_eq!(result["Sex"], 1.0);

    assert_eq!(seen.lock().unwrap().as_slice(), &[(8, 8)]);
    assert_eq!(sink.presented.borrow().len(), 1);
}

#[test]
fn missing_bundle_still_presents_the_image() {
    let camera = VirtualCamera::solid([10, 10, 10], 16, 16);
    let missing = PathBuf::from("/nonexistent/phenomenal-face.tiobundle");
    let engine = InferenceEngine::load(&missing, &EngineOptions::default());
    assert!(matches!(engine, Err(LoadError::Missing { .. })));
    let sink = RecordingSink::default();

    let mut pipeline = Pipeline::setup(
        &config(rgb(16, 16), missing),
        Arc::new(camera),
        engine,
        Box::new(sink.clone()),
    )
    .unwrap();
    assert_eq!(
        pipeline.status().inference,
        FeatureStatus::Disabled(FailureKind::LoadFailed)
    );
    pipeline.start().unwrap();

    let presentation = pipeline.capture_once(WAIT).unwrap();
    assert!(presentation.image.is_some());
    assert!(presentation.inference.is_none());
    assert_eq!(sink.presented.borrow().len(), 1);
}

#[test]
fn capture_failure_resets_the_guard() {
    let bundle = write_bundle();
    let (camera, shutter) = VirtualCamera::solid([0, 0, 0], 8, 8).with_shutter();
    let (engine, _) = stub_engine(&bundle, vec![1.0; 4]);
    let sink = RecordingSink::default();
    let mut pipeline = Pipeline::setup(
        &config(rgb(8, 8), bundle.path().to_path_buf()),
        Arc::new(camera),
        engine,
        Box::new(sink.clone()),
    )
    .unwrap();
    pipeline.start().unwrap();

    let first = pipeline.trigger().unwrap();
    shutter.fail("jpeg encoder error");
    match next_event(&mut pipeline) {
        PipelineEvent::Failed { request_id, error } => {
            assert_eq!(request_id, first);
            assert_eq!(error.kind(), FailureKind::CaptureFailed);
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(sink.presented.borrow().is_empty());
    assert_eq!(*sink.failures.borrow(), vec![FailureKind::CaptureFailed]);

    let second = pipeline.trigger().unwrap();
    assert_ne!(second, first);
    shutter.release();
    assert!(matches!(
        next_event(&mut pipeline),
        PipelineEvent::Presented { request_id, .. } if request_id == second
    ));
}

#[test]
fn late_completion_after_stop_leaves_presentation_unchanged() {
    let bundle = write_bundle();
    let (camera, shutter) = VirtualCamera::solid([50, 50, 50], 8, 8).with_shutter();
    let (engine, seen) = stub_engine(&bundle, vec![1.0; 4]);
    let sink = RecordingSink::default();
    let mut pipeline = Pipeline::setup(
        &config(rgb(8, 8), bundle.path().to_path_buf()),
        Arc::new(camera),
        engine,
        Box::new(sink.clone()),
    )
    .unwrap();
    pipeline.start().unwrap();

    let request = pipeline.trigger().unwrap();
    pipeline.stop();
    shutter.release();

    match next_event(&mut pipeline) {
        PipelineEvent::Discarded { request_id } => assert_eq!(request_id, request),
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(pipeline.presentation().is_empty());
    assert!(sink.presented.borrow().is_empty());
    assert!(sink.failures.borrow().is_empty());
    assert!(seen.lock().unwrap().is_empty());
    assert!(!pipeline.is_busy());
}

#[test]
fn second_request_while_pending_is_busy() {
    let bundle = write_bundle();
    let (camera, shutter) = VirtualCamera::solid([1, 2, 3], 8, 8).with_shutter();
    let (engine, _) = stub_engine(&bundle, vec![1.0; 4]);
    let mut pipeline = Pipeline::setup(
        &config(rgb(8, 8), bundle.path().to_path_buf()),
        Arc::new(camera),
        engine,
        Box::new(RecordingSink::default()),
    )
    .unwrap();
    pipeline.start().unwrap();

    pipeline.trigger().unwrap();
    let err = pipeline.trigger().unwrap_err();
    assert_eq!(err.kind(), FailureKind::Busy);

    shutter.release();
    assert!(matches!(
        next_event(&mut pipeline),
        PipelineEvent::Presented { .. }
    ));
    assert!(!pipeline.is_busy());
}

#[test]
fn stalled_capture_times_out() {
    let bundle = write_bundle();
    let (camera, shutter) = VirtualCamera::solid([1, 2, 3], 8, 8).with_shutter();
    let (engine, _) = stub_engine(&bundle, vec![1.0; 4]);
    let mut settings = config(rgb(8, 8), bundle.path().to_path_buf());
    settings.capture_timeout = Duration::from_millis(50);
    let mut pipeline = Pipeline::setup(
        &settings,
        Arc::new(camera),
        engine,
        Box::new(RecordingSink::default()),
    )
    .unwrap();
    pipeline.start().unwrap();

    let request = pipeline.trigger().unwrap();
    match next_event(&mut pipeline) {
        PipelineEvent::Failed { request_id, error } => {
            assert_eq!(request_id, request);
            assert_eq!(error.kind(), FailureKind::Timeout);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    shutter.release();
    assert!(matches!(
        next_event(&mut pipeline),
        PipelineEvent::Discarded { .. }
    ));
}

#[test]
fn request_before_start_is_served_once_running() {
    let bundle = write_bundle();
    let camera = VirtualCamera::solid([9, 9, 9], 8, 8);
    let (engine, _) = stub_engine(&bundle, vec![1.0; 4]);
    let mut pipeline = Pipeline::setup(
        &config(rgb(8, 8), bundle.path().to_path_buf()),
        Arc::new(camera),
        engine,
        Box::new(RecordingSink::default()),
    )
    .unwrap();

    let request = pipeline.trigger().unwrap();
    assert!(pipeline.pump(Duration::from_millis(100)).is_none());

    pipeline.start().unwrap();
    assert!(matches!(
        next_event(&mut pipeline),
        PipelineEvent::Presented { request_id, .. } if request_id == request
    ));
}

#[test]
fn inference_failure_presents_the_image_without_a_result() {
    let bundle = write_bundle();
    let camera = VirtualCamera::solid([9, 9, 9], 8, 8);
    let (engine, _) = stub_engine(&bundle, vec![1.0, 2.0]);
    let sink = RecordingSink::default();
    let mut pipeline = Pipeline::setup(
        &config(rgb(8, 8), bundle.path().to_path_buf()),
        Arc::new(camera),
        engine,
        Box::new(sink.clone()),
    )
    .unwrap();
    pipeline.start().unwrap();

    pipeline.trigger().unwrap();
    match next_event(&mut pipeline) {
        PipelineEvent::Presented {
            inference_error, ..
        } => {
            let err = inference_error.unwrap();
            assert_eq!(err.kind(), FailureKind::InferenceFailed);
        }
        other => panic!("unexpected event: {other:?}"),
    }
    let presented = sink.presented.borrow();
    assert_eq!(presented.len(), 1);
    assert!(presented[0].image.is_some());
    assert!(presented[0].inference.is_none());
}

#[test]
fn grayscale_output_is_an_unsupported_pixel_format() {
    let bundle = write_bundle();
    let camera = VirtualCamera::solid([9, 9, 9], 8, 8);
    let (engine, seen) = stub_engine(&bundle, vec![1.0; 4]);
    let mut pipeline = Pipeline::setup(
        &config(
            CaptureFormat::new(PixelFormat::Gray8, 8, 8),
            bundle.path().to_path_buf(),
        ),
        Arc::new(camera),
        engine,
        Box::new(RecordingSink::default()),
    )
    .unwrap();
    pipeline.start().unwrap();

    let err = pipeline.capture_once(WAIT).unwrap_err();
    assert_eq!(err.kind(), FailureKind::UnsupportedPixelFormat);
    assert!(seen.lock().unwrap().is_empty());
}

#[test]
fn no_devices_disables_the_camera() {
    let bundle = write_bundle();
    let camera = VirtualCamera::solid([0, 0, 0], 8, 8).with_devices(Vec::new());
    let (engine, _) = stub_engine(&bundle, vec![1.0; 4]);
    let mut pipeline = Pipeline::setup(
        &config(rgb(8, 8), bundle.path().to_path_buf()),
        Arc::new(camera),
        engine,
        Box::new(RecordingSink::default()),
    )
    .unwrap();

    assert_eq!(
        pipeline.status().camera,
        FeatureStatus::Disabled(FailureKind::NoDeviceAvailable)
    );
    assert!(pipeline.session_state().is_none());
    let err = pipeline.trigger().unwrap_err();
    assert_eq!(err.kind(), FailureKind::NoDeviceAvailable);
    assert_eq!(pipeline.start().unwrap_err().kind(), FailureKind::NoDeviceAvailable);
}

#[test]
fn headless_run_from_config_without_a_loadable_backend() {
    let bundle = write_bundle();
    let photo = bundle.path().join("face.png");
    image::RgbImage::from_pixel(8, 8, image::Rgb([200, 100, 50]))
        .save(&photo)
        .unwrap();
    let mut config = config(rgb(8, 8), bundle.path().to_path_buf());
    config.source = CameraSource::Virtual(photo);

    let mut pipeline = Pipeline::from_config(&config, Box::new(NullSink)).unwrap();
    assert!(pipeline.status().camera.is_enabled());
    assert_eq!(
        pipeline.status().inference,
        FeatureStatus::Disabled(FailureKind::LoadFailed)
    );
    assert!(pipeline.engine().is_none());

    pipeline.start().unwrap();
    let presentation = pipeline.capture_once(WAIT).unwrap();
    assert_eq!(
        presentation.image.as_ref().map(|image| image.get_pixel(0, 0).0),
        Some([200, 100, 50])
    );
    assert!(presentation.inference.is_none());
    assert!(!pipeline.is_busy());
    pipeline.stop();
}

/// Drop `pipeline` on its own thread, as the binary does on exit, and report
/// the error of the capture that preceded it.
fn capture_then_drop(
    settings: PipelineConfig,
    camera: VirtualCamera,
    engine: Result<InferenceEngine, LoadError>,
    done: Sender<FailureKind>,
) {
    thread::spawn(move || {
        let mut pipeline =
            Pipeline::setup(&settings, Arc::new(camera), engine, Box::new(NullSink)).unwrap();
        pipeline.start().unwrap();
        let err = pipeline
            .capture_once(Duration::from_millis(500))
            .unwrap_err();
        pipeline.stop();
        drop(pipeline);
        let _ = done.send(err.kind());
    });
}

#[test]
fn drop_after_capture_timeout_does_not_wait_for_the_camera() {
    let bundle = write_bundle();
    let (camera, shutter) = VirtualCamera::solid([1, 2, 3], 8, 8).with_shutter();
    let (engine, _) = stub_engine(&bundle, vec![1.0; 4]);
    let mut settings = config(rgb(8, 8), bundle.path().to_path_buf());
    settings.capture_timeout = Duration::from_millis(50);

    let (done_tx, done_rx) = bounded(1);
    capture_then_drop(settings, camera, engine, done_tx);
    let kind = done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("pipeline drop blocked on the stalled camera");
    assert_eq!(kind, FailureKind::Timeout);
    shutter.release();
}

#[test]
fn drop_after_inference_timeout_does_not_wait_for_the_model() {
    let bundle = write_bundle();
    let camera = VirtualCamera::solid([1, 2, 3], 8, 8);
    let (gate_tx, gate_rx) = bounded::<()>(0);
    let options = EngineOptions {
        expected_outputs: Some(OUTPUTS.iter().map(|name| name.to_string()).collect()),
    };
    let engine = InferenceEngine::load_with(bundle.path(), &options, move |_| {
        Ok(Box::new(GatedModel { gate: gate_rx }))
    });
    let mut settings = config(rgb(8, 8), bundle.path().to_path_buf());
    settings.inference_timeout = Duration::from_millis(50);

    let (done_tx, done_rx) = bounded(1);
    capture_then_drop(settings, camera, engine, done_tx);
    let kind = done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("pipeline drop blocked on the stalled model");
    assert_eq!(kind, FailureKind::Timeout);
    drop(gate_tx);
}
