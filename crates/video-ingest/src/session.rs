//! Capture session owning the camera input, the photo output and the hardware
//! thread that services capture requests.
//!
//! All hardware calls happen on a dedicated `camera-session` thread. The owning
//! thread talks to it through a command channel and never blocks on a photo;
//! completions are published into a channel supplied with each request.

use std::{
    thread,
    time::{Duration, Instant},
};

use chrono::Utc;
use crossbeam_channel::{
    Receiver, RecvTimeoutError, Sender, TrySendError, bounded, unbounded,
};
use tracing::{debug, info, warn};

use crate::{
    backend::{CameraBackend, CameraStream},
    types::{CaptureError, CaptureFormat, Device, Frame, SessionState},
};

/// Upper bound on how long `start` waits for the hardware to come up.
pub const START_TIMEOUT: Duration = Duration::from_secs(5);

/// How long dropping a session waits for the hardware thread to exit. A thread
/// still stuck in a photo after that is detached and exits once it returns.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Identifies one submitted capture request.
///
/// `epoch` is the run of the session expected to serve the request: the
/// current run when the session is running, or the next run when the request
/// was accepted while the session was only configured.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureTicket {
    pub request_id: u64,
    pub epoch: u64,
}

/// Result of one capture request as delivered by the hardware thread.
#[derive(Debug)]
pub struct Completion {
    pub request_id: u64,
    /// Session run during which the photo was taken.
    pub epoch: u64,
    pub result: Result<Frame, CaptureError>,
    pub completed_at: Instant,
}

struct CaptureJob {
    ticket: CaptureTicket,
    reply: Sender<Completion>,
}

enum SessionCommand {
    Start {
        epoch: u64,
        ack: Sender<Result<(), CaptureError>>,
    },
    Stop,
    Capture(CaptureJob),
    Shutdown,
}

pub struct CaptureSession {
    device: Device,
    format: CaptureFormat,
    state: SessionState,
    epoch: u64,
    commands: Sender<SessionCommand>,
    worker: Option<thread::JoinHandle<()>>,
    // Disconnects when the hardware thread returns.
    exited: Receiver<()>,
}

impl CaptureSession {
    /// Attach `device` as input and a photo sink producing `format` as output.
    ///
    /// Any failure is reported as [`CaptureError::AttachmentFailed`] and no
    /// session is created.
    pub fn configure(
        backend: &dyn CameraBackend,
        device: &Device,
        format: CaptureFormat,
    ) -> Result<Self, CaptureError> {
        if !device.capabilities.supports(&format) {
            return Err(CaptureError::attachment_failed(
                &device.id,
                format!(
                    "device cannot produce {} at {}x{}",
                    format.pixel_format, format.width, format.height
                ),
            ));
        }

        let mut stream = backend
            .open(device)
            .map_err(|err| attachment_error(device, "input", err))?;
        stream
            .attach_output(&format)
            .map_err(|err| attachment_error(device, "output", err))?;

        let (tx, rx) = unbounded();
        let (exited_tx, exited_rx) = bounded::<()>(0);
        let dispatch = tracing::dispatcher::get_default(|current| current.clone());
        let worker = thread::Builder::new()
            .name("camera-session".into())
            .spawn(move || {
                tracing::dispatcher::with_default(&dispatch, || session_loop(stream, rx));
                drop(exited_tx);
            })
            .map_err(|err| CaptureError::attachment_failed(&device.id, err.to_string()))?;

        info!(
            device = %device.id,
            facing = %device.facing,
            format = %format.pixel_format,
            width = format.width,
            height = format.height,
            backend = backend.name(),
            "capture session configured"
        );

        Ok(Self {
            device: device.clone(),
            format,
            state: SessionState::Configured,
            epoch: 0,
            commands: tx,
            worker: Some(worker),
            exited: exited_rx,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn format(&self) -> &CaptureFormat {
        &self.format
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Current run counter; increments on every successful `start`.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_running(&self) -> bool {
        self.state == SessionState::Running
    }

    /// Whether a capture request may be submitted in the current state.
    pub fn accepts_requests(&self) -> bool {
        matches!(self.state, SessionState::Configured | SessionState::Running)
    }

    /// Start frame delivery and arm the photo output. No-op when running.
    pub fn start(&mut self) -> Result<(), CaptureError> {
        match self.state {
            SessionState::Running => return Ok(()),
            SessionState::Unconfigured => {
                return Err(CaptureError::InvalidState {
                    state: self.state,
                    action: "start",
                });
            }
            SessionState::Configured | SessionState::Stopped => {}
        }

        let epoch = self.epoch + 1;
        let (ack_tx, ack_rx) = bounded(1);
        self.send(SessionCommand::Start { epoch, ack: ack_tx })?;
        match ack_rx.recv_timeout(START_TIMEOUT) {
            Ok(Ok(())) => {
                self.epoch = epoch;
                self.state = SessionState::Running;
                info!(device = %self.device.id, epoch, "capture session running");
                Ok(())
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(CaptureError::Timeout {
                operation: "session start",
                after_ms: START_TIMEOUT.as_millis() as u64,
            }),
        }
    }

    /// Halt frame delivery.
    ///
    /// Returns immediately. A photo already being taken is not cancelled; its
    /// completion still arrives and carries the epoch of the stopped run.
    pub fn stop(&mut self) {
        if !self.accepts_requests() {
            return;
        }
        self.state = SessionState::Stopped;
        if self.send(SessionCommand::Stop).is_err() {
            warn!(device = %self.device.id, "camera thread gone while stopping session");
        }
        info!(device = %self.device.id, epoch = self.epoch, "capture session stopped");
    }

    /// Hand a capture request to the hardware thread.
    ///
    /// Requests accepted while `Configured` are held until the next `start`.
    /// Completions are published into `reply` without blocking the hardware
    /// thread.
    pub fn submit_capture(
        &self,
        request_id: u64,
        reply: Sender<Completion>,
    ) -> Result<CaptureTicket, CaptureError> {
        let epoch = match self.state {
            SessionState::Running => self.epoch,
            SessionState::Configured => self.epoch + 1,
            state => {
                return Err(CaptureError::InvalidState {
                    state,
                    action: "capture",
                });
            }
        };
        let ticket = CaptureTicket { request_id, epoch };
        self.send(SessionCommand::Capture(CaptureJob { ticket, reply }))?;
        debug!(request = request_id, epoch, "capture request submitted");
        Ok(ticket)
    }

    fn send(&self, command: SessionCommand) -> Result<(), CaptureError> {
        self.commands.send(command).map_err(|_| {
            CaptureError::capture_failed(format!("camera thread for {} exited", self.device.id))
        })
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        let _ = self.commands.send(SessionCommand::Shutdown);
        let Some(handle) = self.worker.take() else {
            return;
        };
        match self.exited.recv_timeout(SHUTDOWN_GRACE) {
            Err(RecvTimeoutError::Timeout) => warn!(
                device = %self.device.id,
                grace_ms = SHUTDOWN_GRACE.as_millis() as u64,
                "camera thread still busy with a photo; detaching it"
            ),
            _ => {
                let _ = handle.join();
            }
        }
    }
}

fn attachment_error(device: &Device, side: &str, err: CaptureError) -> CaptureError {
    match err {
        CaptureError::AttachmentFailed { .. } => err,
        other => CaptureError::attachment_failed(&device.id, format!("{side}: {other}")),
    }
}

/// Hardware thread: owns the stream and services commands in order.
fn session_loop(mut stream: Box<dyn CameraStream>, commands: Receiver<SessionCommand>) {
    let mut running: Option<u64> = None;
    let mut held: Option<CaptureJob> = None;

    for command in commands {
        match command {
            SessionCommand::Start { epoch, ack } => {
                let result = stream.start();
                let started = result.is_ok();
                let _ = ack.send(result);
                if started {
                    running = Some(epoch);
                    if let Some(job) = held.take() {
                        take_photo(stream.as_mut(), job, epoch);
                    }
                }
            }
            SessionCommand::Stop => {
                if running.take().is_some() {
                    stream.stop();
                }
                if let Some(job) = held.take() {
                    debug!(
                        request = job.ticket.request_id,
                        "dropping capture request held before start"
                    );
                }
            }
            SessionCommand::Capture(job) => match running {
                Some(epoch) => take_photo(stream.as_mut(), job, epoch),
                None => held = Some(job),
            },
            SessionCommand::Shutdown => break,
        }
    }

    if running.is_some() {
        stream.stop();
    }
}

fn take_photo(stream: &mut dyn CameraStream, job: CaptureJob, epoch: u64) {
    let started = Utc::now().timestamp_millis();
    let result = stream.capture_photo();
    let completion = Completion {
        request_id: job.ticket.request_id,
        epoch,
        result,
        completed_at: Instant::now(),
    };
    debug!(
        request = job.ticket.request_id,
        epoch,
        ok = completion.result.is_ok(),
        elapsed_ms = Utc::now().timestamp_millis() - started,
        "photo capture finished"
    );
    match job.reply.try_send(completion) {
        Ok(()) => {}
        Err(TrySendError::Full(completion)) => warn!(
            request = completion.request_id,
            "completion queue full; dropping capture completion"
        ),
        Err(TrySendError::Disconnected(_)) => {
            debug!("capture coordinator gone; completion dropped")
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::{Arc, Mutex},
    };

    use super::*;
    use crate::{
        types::{Facing, PixelFormat},
        virtual_camera::VirtualCamera,
    };

    fn format() -> CaptureFormat {
        CaptureFormat::new(PixelFormat::Rgb8, 8, 6)
    }

    fn configured(camera: &VirtualCamera) -> CaptureSession {
        let device = camera.devices()[0].clone();
        CaptureSession::configure(camera, &device, format()).unwrap()
    }

    #[test]
    fn start_is_idempotent_and_bumps_epoch_once() {
        let camera = VirtualCamera::solid([10, 20, 30], 8, 6);
        let mut session = configured(&camera);
        assert_eq!(session.state(), SessionState::Configured);
        session.start().unwrap();
        session.start().unwrap();
        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(session.epoch(), 1);
    }

    #[test]
    fn stopped_session_rejects_requests_until_restarted() {
        let camera = VirtualCamera::solid([0, 0, 0], 8, 6);
        let mut session = configured(&camera);
        session.start().unwrap();
        session.stop();
        let (tx, _rx) = bounded(1);
        let err = session.submit_capture(1, tx.clone()).unwrap_err();
        assert!(matches!(
            err,
            CaptureError::InvalidState {
                state: SessionState::Stopped,
                ..
            }
        ));

        session.start().unwrap();
        assert_eq!(session.epoch(), 2);
        let ticket = session.submit_capture(2, tx).unwrap();
        assert_eq!(ticket.epoch, 2);
    }

    #[test]
    fn request_while_configured_is_served_after_start() {
        let camera = VirtualCamera::solid([1, 2, 3], 8, 6);
        let mut session = configured(&camera);
        let (tx, rx) = bounded(1);
        let ticket = session.submit_capture(7, tx).unwrap();
        assert_eq!(ticket.epoch, 1);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        session.start().unwrap();
        let completion = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(completion.request_id, 7);
        assert_eq!(completion.epoch, 1);
        let frame = completion.result.unwrap();
        assert_eq!((frame.width, frame.height), (8, 6));
    }

    struct SharedLog(Arc<Mutex<Vec<u8>>>);

    impl io::Write for SharedLog {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn hardware_thread_logs_through_the_callers_subscriber() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let writer = log.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || SharedLog(writer.clone()))
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let camera = VirtualCamera::solid([7, 8, 9], 8, 6);
            let mut session = configured(&camera);
            session.start().unwrap();
            let (tx, rx) = bounded(1);
            session.submit_capture(1, tx).unwrap();
            rx.recv_timeout(Duration::from_secs(2)).unwrap();
        });

        let output = String::from_utf8(log.lock().unwrap().clone()).unwrap();
        assert!(output.contains("photo capture finished"), "{output}");
    }

    #[test]
    fn drop_detaches_a_thread_stuck_in_a_photo() {
        let (camera, shutter) = VirtualCamera::solid([4, 5, 6], 8, 6).with_shutter();
        let mut session = configured(&camera);
        session.start().unwrap();
        let (tx, rx) = bounded(1);
        session.submit_capture(3, tx).unwrap();

        let (dropped_tx, dropped_rx) = bounded(1);
        thread::spawn(move || {
            drop(session);
            let _ = dropped_tx.send(());
        });
        dropped_rx
            .recv_timeout(SHUTDOWN_GRACE + Duration::from_secs(2))
            .expect("dropping the session blocked on the stuck photo");

        // The detached thread still finishes its photo once the shutter opens.
        shutter.release();
        let completion = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(completion.request_id, 3);
    }

    #[test]
    fn unsupported_format_fails_attachment() {
        let camera = VirtualCamera::solid([0, 0, 0], 8, 6).with_max_size(4, 4);
        let device = camera.devices()[0].clone();
        let err = CaptureSession::configure(&camera, &device, format())
            .err()
            .unwrap();
        assert!(matches!(err, CaptureError::AttachmentFailed { .. }));
    }

    #[test]
    fn busy_device_fails_attachment() {
        let camera = VirtualCamera::solid([0, 0, 0], 8, 6).busy();
        let device = camera.devices()[0].clone();
        assert_eq!(device.facing, Facing::Front);
        let err = CaptureSession::configure(&camera, &device, format())
            .err()
            .unwrap();
        match err {
            CaptureError::AttachmentFailed { device, reason } => {
                assert_eq!(device, "virtual-front");
                assert!(reason.contains("input"), "{reason}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
