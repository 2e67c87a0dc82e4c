//! Single in-flight capture request and its asynchronous completion.
//!
//! The coordinator owns the completion channel. The hardware thread publishes
//! into it, the owning thread drains it, and only the coordinator decides
//! whether a completion belongs to the outstanding request.

use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::{debug, info_span, warn};
use video_ingest::{CaptureError, CaptureSession, CaptureTicket, Completion, Frame};

use crate::pipeline::telemetry;

/// Room for the outstanding completion plus one straggler from an abandoned run.
const COMPLETION_QUEUE: usize = 2;

#[derive(Debug)]
struct PendingCapture {
    ticket: CaptureTicket,
    requested_at: Instant,
    /// Set the first time the session is seen running; the timeout counts from here.
    armed_at: Option<Instant>,
}

/// What became of one completion pulled off the channel.
#[derive(Debug)]
pub enum CompletionOutcome {
    Captured { request_id: u64, frame: Frame },
    Failed { request_id: u64, error: CaptureError },
    /// Not the outstanding request, or the session run it belonged to is over.
    Discarded { request_id: u64 },
}

pub struct CaptureCoordinator {
    tx: Sender<Completion>,
    rx: Receiver<Completion>,
    pending: Option<PendingCapture>,
    next_request: u64,
    timeout: Duration,
}

impl CaptureCoordinator {
    pub fn new(timeout: Duration) -> Self {
        let (tx, rx) = bounded(COMPLETION_QUEUE);
        Self {
            tx,
            rx,
            pending: None,
            next_request: 1,
            timeout,
        }
    }

    /// Ask `session` for one photo.
    ///
    /// Rejected with [`CaptureError::Busy`] while another request is
    /// outstanding. The guard is released by the matching completion, a
    /// timeout, or [`abandon`](Self::abandon).
    pub fn request_capture(
        &mut self,
        session: &CaptureSession,
    ) -> Result<CaptureTicket, CaptureError> {
        let span = info_span!("capture.request", request = self.next_request);
        let _entered = span.enter();

        if let Some(pending) = &self.pending {
            debug!(
                outstanding = pending.ticket.request_id,
                "capture rejected: request already in flight"
            );
            return Err(CaptureError::Busy);
        }

        let request_id = self.next_request;
        let ticket = session.submit_capture(request_id, self.tx.clone())?;
        self.next_request += 1;
        let now = Instant::now();
        self.pending = Some(PendingCapture {
            ticket,
            requested_at: now,
            armed_at: session.is_running().then_some(now),
        });
        debug!(epoch = ticket.epoch, "capture requested");
        Ok(ticket)
    }

    /// Channel completions arrive on; pass what it yields to [`complete`](Self::complete).
    pub fn completions(&self) -> &Receiver<Completion> {
        &self.rx
    }

    pub fn pending(&self) -> Option<CaptureTicket> {
        self.pending.as_ref().map(|pending| pending.ticket)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Match a completion against the outstanding request.
    ///
    /// Completions for another request, or arriving while `session` is not
    /// running the epoch they were taken in, are discarded and leave the
    /// guard untouched.
    pub fn complete(
        &mut self,
        completion: Completion,
        session: &CaptureSession,
    ) -> CompletionOutcome {
        let request_id = completion.request_id;
        let span = info_span!("capture.complete", request = request_id, epoch = completion.epoch);
        let _entered = span.enter();

        let matches = self.pending.as_ref().is_some_and(|pending| {
            pending.ticket.request_id == request_id && pending.ticket.epoch == completion.epoch
        });
        if !matches || !session.is_running() || session.epoch() != completion.epoch {
            debug!(
                running = session.is_running(),
                session_epoch = session.epoch(),
                "discarding stale capture completion"
            );
            telemetry::record_discarded();
            return CompletionOutcome::Discarded { request_id };
        }

        if let Some(pending) = self.pending.take() {
            telemetry::record_stage(
                "capture",
                completion
                    .completed_at
                    .saturating_duration_since(pending.requested_at),
            );
        }
        match completion.result {
            Ok(frame) => {
                debug!(
                    width = frame.width,
                    height = frame.height,
                    format = %frame.format,
                    "photo captured"
                );
                CompletionOutcome::Captured { request_id, frame }
            }
            Err(error) => {
                warn!(%error, "capture failed");
                CompletionOutcome::Failed { request_id, error }
            }
        }
    }

    /// Drain one completion without blocking.
    pub fn poll(&mut self, session: &CaptureSession) -> Option<CompletionOutcome> {
        let completion = self.rx.try_recv().ok()?;
        Some(self.complete(completion, session))
    }

    /// Release the guard when the outstanding request has waited longer than
    /// the timeout while `session` was running.
    pub fn expire(
        &mut self,
        now: Instant,
        session: &CaptureSession,
    ) -> Option<(u64, CaptureError)> {
        let pending = self.pending.as_mut()?;
        if pending.armed_at.is_none() && !session.is_running() {
            return None;
        }
        let armed_at = *pending.armed_at.get_or_insert(now);
        if now.saturating_duration_since(armed_at) < self.timeout {
            return None;
        }

        let request_id = pending.ticket.request_id;
        self.pending = None;
        warn!(
            request = request_id,
            timeout_ms = self.timeout.as_millis() as u64,
            "capture timed out"
        );
        Some((
            request_id,
            CaptureError::Timeout {
                operation: "capture",
                after_ms: self.timeout.as_millis() as u64,
            },
        ))
    }

    /// Time left before the outstanding request expires, if it is armed.
    pub fn time_remaining(&self, now: Instant) -> Option<Duration> {
        let armed_at = self.pending.as_ref()?.armed_at?;
        Some(self.timeout.saturating_sub(now.saturating_duration_since(armed_at)))
    }

    /// Forget the outstanding request; its completion will be discarded.
    pub fn abandon(&mut self) -> Option<CaptureTicket> {
        let pending = self.pending.take()?;
        debug!(
            request = pending.ticket.request_id,
            "abandoning outstanding capture request"
        );
        Some(pending.ticket)
    }
}
