//! Session lifecycle and polling loop

use crate::camera::{CameraHandle, CameraManager, FrameSource};
use crate::detect::{DetectionKind, DetectionResult, Detector, OcrEngine, OcrExtractor, QrDecoder};
use crate::error::{Error, Result, ScanErrorKind};
use crate::frame::FrameSampler;
use crate::metrics;
use crate::scanner::session::{CodeOutcome, ScanSession, SessionSnapshot, TickDecision};
use crate::scanner::{
    ResultSink, STATUS_DETECTED, STATUS_HINT, STATUS_IDLE, STATUS_INITIALIZING, STATUS_RELEASING,
    STATUS_SCANNING, ScanMode, ScanOptions, ScanState,
};
use crate::voucher::{Detection, parse_qr_payload, validate};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{Instrument, debug, info, info_span, trace, warn};

/// Drives scan sessions against one camera and one result sink.
///
/// All methods take `&self`; wrap the controller in an `Arc` to share it.
pub struct ScanController {
    shared: Arc<Shared>,
}

struct Shared {
    camera: CameraManager,
    sink: Arc<dyn ResultSink>,
    sampler: FrameSampler,
    qr: Detector,
    ocr: Detector,
    options: ScanOptions,
    // Lock order: `inner` before the camera slot.
    inner: Mutex<Inner>,
    // Mirrors `Inner::ticker` so `Drop` can cancel without the async lock.
    ticker_abort: StdMutex<Option<AbortHandle>>,
}

#[derive(Default)]
struct Inner {
    state: ScanState,
    session: Option<ScanSession>,
    generation: u64,
    last_detected: Option<String>,
    ticker: Option<JoinHandle<()>>,
}

enum TickFlow {
    Continue,
    Skipped,
    Halt,
}

enum Attempt {
    Found(Detection),
    Empty,
    Rejected(Error),
}

impl ScanController {
    /// Create a controller.
    pub fn new(
        source: Arc<dyn FrameSource>,
        engine: Arc<dyn OcrEngine>,
        sink: Arc<dyn ResultSink>,
        options: ScanOptions,
    ) -> Self {
        let camera = CameraManager::with_switch_delay(source, options.switch_delay);
        let shared = Shared {
            camera,
            sink,
            sampler: FrameSampler::new(options.region),
            qr: Detector::Qr(QrDecoder::new()),
            ocr: Detector::Ocr(OcrExtractor::new(engine)),
            options,
            inner: Mutex::new(Inner::default()),
            ticker_abort: StdMutex::new(None),
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Tuning in effect
    pub fn options(&self) -> &ScanOptions {
        &self.shared.options
    }

    /// Start scanning in `mode`, stopping any live session first.
    ///
    /// Camera failures are reported through [`ResultSink::on_error`] and
    /// returned. A start superseded by `stop` or another `start` while the
    /// camera was being acquired returns `Ok(())` without polling.
    pub async fn start(&self, mode: ScanMode) -> Result<()> {
        let live = self.shared.inner.lock().await.state.is_live();
        if live {
            self.stop().await;
        }

        let generation = {
            let mut inner = self.shared.inner.lock().await;
            inner.generation += 1;
            let session = ScanSession::new(
                mode,
                inner.generation,
                inner.last_detected.clone(),
                self.shared.options.hint_threshold,
            );
            info!(
                target: "voucherscan::scanner",
                session = %session.id(),
                %mode,
                "Starting scan session"
            );
            inner.session = Some(session);
            self.shared
                .transition(&mut inner, ScanState::RequestingPermission, STATUS_INITIALIZING);
            inner.generation
        };

        let acquired = self
            .shared
            .camera
            .acquire(&self.shared.options.constraints)
            .await;

        let mut inner = self.shared.inner.lock().await;
        if inner.generation != generation {
            if let Ok(handle) = &acquired {
                self.shared.camera.release_handle(handle).await;
            }
            debug!(target: "voucherscan::scanner", generation, "Start superseded while acquiring camera");
            return Ok(());
        }

        match acquired {
            Ok(handle) => {
                self.shared
                    .transition(&mut inner, ScanState::Active(mode), STATUS_SCANNING);
                let span = info_span!(
                    "scan_session",
                    session = %inner.session.as_ref().map(|s| s.id()).unwrap_or_default(),
                    %mode
                );
                let ticker = tokio::spawn(
                    run_ticker(Arc::clone(&self.shared), generation, mode, handle).instrument(span),
                );
                *self.shared.abort_slot() = Some(ticker.abort_handle());
                inner.ticker = Some(ticker);
                Ok(())
            }
            Err(err) => {
                let kind = err.kind().unwrap_or(ScanErrorKind::DeviceUnavailable);
                warn!(target: "voucherscan::scanner", error = %err, "Camera acquisition failed");
                self.shared.fail(&mut inner, kind, false).await;
                Err(err)
            }
        }
    }

    /// Stop the live session and release the camera. Idempotent.
    pub async fn stop(&self) {
        let mut inner = self.shared.inner.lock().await;
        inner.generation += 1;
        if let Some(ticker) = inner.ticker.take() {
            ticker.abort();
        }
        let session = inner.session.take();
        if session.is_none() && !self.shared.camera.is_held().await {
            if inner.state != ScanState::Idle {
                self.shared.transition(&mut inner, ScanState::Idle, STATUS_IDLE);
            }
            return;
        }

        if let Some(session) = &session {
            info!(
                target: "voucherscan::scanner",
                session = %session.id(),
                attempts = session.attempt_count(),
                "Stopping scan session"
            );
        }
        self.shared
            .transition(&mut inner, ScanState::Releasing, STATUS_RELEASING);
        self.shared.camera.release().await;
        self.shared.transition(&mut inner, ScanState::Idle, STATUS_IDLE);
    }

    /// Stop, forget the last detected code, and start again in `mode`.
    ///
    /// The camera manager enforces the release-to-acquire delay.
    pub async fn switch_mode(&self, mode: ScanMode) -> Result<()> {
        self.stop().await;
        self.reset().await;
        self.start(mode).await
    }

    /// Forget the last detected code so it may be reported again.
    pub async fn reset(&self) {
        let mut inner = self.shared.inner.lock().await;
        inner.last_detected = None;
        if let Some(session) = inner.session.as_mut() {
            session.clear_last_detected();
        }
    }

    /// Current controller state
    pub async fn state(&self) -> ScanState {
        self.shared.inner.lock().await.state
    }

    /// Snapshot of the live session, if any
    pub async fn snapshot(&self) -> Option<SessionSnapshot> {
        let inner = self.shared.inner.lock().await;
        inner
            .session
            .as_ref()
            .map(|session| session.snapshot(inner.state))
    }

    /// Code reported most recently, kept across sessions until reset
    pub async fn last_detected(&self) -> Option<String> {
        self.shared.inner.lock().await.last_detected.clone()
    }

    /// Whether the polling task is running
    pub async fn is_polling(&self) -> bool {
        self.shared
            .inner
            .lock()
            .await
            .ticker
            .as_ref()
            .is_some_and(|ticker| !ticker.is_finished())
    }

    /// Whether the camera is currently held
    pub async fn camera_held(&self) -> bool {
        self.shared.camera.is_held().await
    }
}

impl Drop for ScanController {
    fn drop(&mut self) {
        if let Some(ticker) = self.shared.abort_slot().take() {
            ticker.abort();
        }
        match self.shared.inner.try_lock() {
            Ok(mut inner) => close(&mut inner),
            Err(_) => debug!(target: "voucherscan::scanner", "Controller dropped while busy, closing asynchronously"),
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let shared = Arc::clone(&self.shared);
            runtime.spawn(async move {
                close(&mut *shared.inner.lock().await);
                shared.camera.release().await;
            });
        }
    }
}

/// Invalidate in-flight work after the controller is gone.
fn close(inner: &mut Inner) {
    inner.generation += 1;
    inner.session = None;
    if let Some(ticker) = inner.ticker.take() {
        ticker.abort();
    }
}

async fn run_ticker(shared: Arc<Shared>, generation: u64, mode: ScanMode, handle: CameraHandle) {
    let period = shared.options.interval(mode);
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut last_tick: Option<Instant> = None;
    let mut skipped = 0u64;
    loop {
        let tick = interval.tick().await;
        if let Some(previous) = last_tick {
            metrics::record_frame_interval(tick.saturating_duration_since(previous));
        }
        last_tick = Some(tick);

        match shared.poll_once(generation, mode, &handle).await {
            TickFlow::Continue => skipped = 0,
            TickFlow::Skipped => {
                skipped += 1;
                metrics::record_backpressure(skipped);
                trace!(target: "voucherscan::scanner", skipped, "Detection in flight, skipping tick");
            }
            TickFlow::Halt => break,
        }
    }
    debug!(target: "voucherscan::scanner", generation, "Polling stopped");
}

impl Shared {
    fn abort_slot(&self) -> std::sync::MutexGuard<'_, Option<AbortHandle>> {
        self.ticker_abort
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, inner: &mut Inner, state: ScanState, message: &str) {
        inner.state = state;
        debug!(target: "voucherscan::scanner", %state, "{message}");
        self.sink.on_status(&state, message);
    }

    fn detector(&self, mode: ScanMode) -> &Detector {
        match mode {
            ScanMode::Qr => &self.qr,
            ScanMode::Ocr => &self.ocr,
        }
    }

    /// End the session with `kind`: stop polling, release the camera once,
    /// then report. `from_ticker` is set when the polling task itself fails.
    async fn fail(&self, inner: &mut Inner, kind: ScanErrorKind, from_ticker: bool) {
        inner.generation += 1;
        if let Some(ticker) = inner.ticker.take() {
            if !from_ticker {
                ticker.abort();
            }
        }
        inner.session = None;
        self.camera.release().await;
        self.transition(inner, ScanState::Error(kind), kind.message());
        self.sink.on_error(kind);
    }

    async fn poll_once(
        self: &Arc<Self>,
        generation: u64,
        mode: ScanMode,
        handle: &CameraHandle,
    ) -> TickFlow {
        {
            let mut inner = self.inner.lock().await;
            if inner.generation != generation {
                return TickFlow::Halt;
            }
            let Some(session) = inner.session.as_mut() else {
                return TickFlow::Halt;
            };
            if session.begin_tick() == TickDecision::Skip {
                return TickFlow::Skipped;
            }
            inner.state = ScanState::Processing(mode);
        }

        let frame = match self.camera.pull_frame(handle).await {
            Ok(Some(raw)) => self.sampler.prepare(mode, raw).await,
            Ok(None) => None,
            Err(err) if err.is_fatal() => {
                warn!(target: "voucherscan::scanner", error = %err, "Frame capture failed");
                let mut inner = self.inner.lock().await;
                if inner.generation == generation {
                    let kind = err.kind().unwrap_or(ScanErrorKind::DeviceUnavailable);
                    self.fail(&mut inner, kind, true).await;
                }
                return TickFlow::Halt;
            }
            Err(err) => {
                debug!(target: "voucherscan::scanner", error = %err, "Frame dropped");
                None
            }
        };

        let Some(frame) = frame else {
            let mut inner = self.inner.lock().await;
            if inner.generation != generation {
                return TickFlow::Halt;
            }
            if let Some(session) = inner.session.as_mut() {
                session.abandon_tick();
            }
            inner.state = ScanState::Active(mode);
            return TickFlow::Continue;
        };

        let frame = Arc::new(frame);
        let detector = self.detector(mode).clone();
        let shared = Arc::clone(self);
        let timeout = self.options.recognition_timeout;
        tokio::spawn(
            async move {
                let started = Instant::now();
                let outcome = match timeout {
                    Some(limit) => match time::timeout(limit, detector.detect(frame)).await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(Error::RecognitionFailure(format!(
                            "no result within {limit:?}"
                        ))),
                    },
                    None => detector.detect(frame).await,
                };
                shared
                    .complete(generation, mode, outcome, started.elapsed())
                    .await;
            }
            .in_current_span(),
        );
        TickFlow::Continue
    }

    async fn complete(
        &self,
        generation: u64,
        mode: ScanMode,
        outcome: Result<Option<DetectionResult>>,
        elapsed: Duration,
    ) {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation {
            debug!(target: "voucherscan::scanner", generation, "Discarding result from superseded session");
            return;
        }

        match interpret(outcome) {
            Attempt::Found(detection) => {
                metrics::record(elapsed, true, Some(mode.as_str()));
                let Some(session) = inner.session.as_mut() else {
                    return;
                };
                match session.record_code(detection.dedup_key()) {
                    CodeOutcome::Repeated => {
                        debug!(target: "voucherscan::scanner", "Ignoring repeated code");
                        inner.state = ScanState::Active(mode);
                    }
                    CodeOutcome::New => self.finish_detected(&mut inner, detection).await,
                }
            }
            Attempt::Empty => {
                metrics::record(elapsed, false, Some(mode.as_str()));
                let Some(session) = inner.session.as_mut() else {
                    return;
                };
                let hint = session.record_empty();
                let attempts = session.attempt_count();
                inner.state = ScanState::Active(mode);
                if hint {
                    metrics::record_hint();
                    info!(target: "voucherscan::scanner", attempts, "No code found yet");
                    self.sink.on_status(&inner.state, STATUS_HINT);
                }
            }
            Attempt::Rejected(err) => {
                metrics::record(elapsed, false, Some(mode.as_str()));
                warn!(target: "voucherscan::scanner", error = %err, "Rejected scanned payload");
                let kind = err.kind().unwrap_or(ScanErrorKind::MalformedPayload);
                self.fail(&mut inner, kind, false).await;
            }
        }
    }

    async fn finish_detected(&self, inner: &mut Inner, detection: Detection) {
        inner.generation += 1;
        if let Some(ticker) = inner.ticker.take() {
            ticker.abort();
        }
        let session = inner.session.take();
        inner.last_detected = Some(detection.dedup_key().to_string());
        self.camera.release().await;

        info!(
            target: "voucherscan::scanner",
            session = %session.map(|s| s.id()).unwrap_or_default(),
            code = detection.formatted_code(),
            "Code detected"
        );
        self.transition(inner, ScanState::Detected, STATUS_DETECTED);
        self.sink.on_detected(&detection);
    }
}

fn interpret(outcome: Result<Option<DetectionResult>>) -> Attempt {
    match outcome {
        Ok(Some(DetectionResult {
            raw_payload,
            kind: DetectionKind::Qr,
        })) => match parse_qr_payload(&raw_payload) {
            Ok(detection) => Attempt::Found(detection),
            Err(err) => Attempt::Rejected(err),
        },
        Ok(Some(DetectionResult {
            raw_payload,
            kind: DetectionKind::Ocr,
        })) => match validate(&raw_payload) {
            Ok(code) => Attempt::Found(Detection::Code(code)),
            Err(err) => {
                debug!(target: "voucherscan::scanner", error = %err, "Discarding OCR candidate");
                Attempt::Empty
            }
        },
        Ok(None) => Attempt::Empty,
        Err(err) => {
            debug!(target: "voucherscan::scanner", error = %err, "Recognition attempt failed");
            Attempt::Empty
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Constraints;
    use crate::detect::{Recognition, RecognizeOptions};
    use async_trait::async_trait;
    use image::DynamicImage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct StillSource {
        pulls: AtomicUsize,
    }

    #[async_trait]
    impl FrameSource for StillSource {
        async fn acquire(&self, _constraints: &Constraints) -> Result<CameraHandle> {
            Ok(CameraHandle::new(1, "still"))
        }

        async fn pull_frame(&self, _handle: &CameraHandle) -> Result<Option<DynamicImage>> {
            self.pulls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(DynamicImage::new_rgb8(8, 8)))
        }

        async fn release(&self, _handle: &CameraHandle) {}
    }

    struct SilentEngine;

    #[async_trait]
    impl OcrEngine for SilentEngine {
        async fn recognize(
            &self,
            _image: &DynamicImage,
            _options: &RecognizeOptions,
        ) -> Result<Recognition> {
            Ok(Recognition::text(""))
        }
    }

    struct NullSink;

    impl ResultSink for NullSink {
        fn on_detected(&self, _detection: &Detection) {}
        fn on_status(&self, _state: &ScanState, _message: &str) {}
        fn on_error(&self, _kind: ScanErrorKind) {}
    }

    #[tokio::test(start_paused = true)]
    async fn drop_while_state_is_locked_still_stops_polling() {
        let source = Arc::new(StillSource::default());
        let controller = ScanController::new(
            source.clone(),
            Arc::new(SilentEngine),
            Arc::new(NullSink),
            ScanOptions::default(),
        );
        controller.start(ScanMode::Qr).await.unwrap();
        time::sleep(Duration::from_millis(1200)).await;
        let pulls = source.pulls.load(Ordering::SeqCst);
        assert_eq!(pulls, 2);

        let shared = Arc::clone(&controller.shared);
        let guard = shared.inner.lock().await;
        drop(controller);
        drop(guard);

        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(source.pulls.load(Ordering::SeqCst), pulls);
        {
            let inner = shared.inner.lock().await;
            assert!(inner.session.is_none());
            assert!(inner.ticker.is_none());
        }
        assert!(!shared.camera.is_held().await);
    }

    #[test]
    fn ocr_candidates_failing_validation_are_empty_attempts() {
        let attempt = interpret(Ok(Some(DetectionResult {
            raw_payload: "123".to_string(),
            kind: DetectionKind::Ocr,
        })));
        assert!(matches!(attempt, Attempt::Empty));
    }

    #[test]
    fn malformed_qr_payloads_are_rejected() {
        let attempt = interpret(Ok(Some(DetectionResult {
            raw_payload: "https://example.com".to_string(),
            kind: DetectionKind::Qr,
        })));
        assert!(matches!(attempt, Attempt::Rejected(Error::MalformedPayload(_))));
    }

    #[test]
    fn recognition_errors_are_empty_attempts() {
        let attempt = interpret(Err(Error::RecognitionFailure("timeout".into())));
        assert!(matches!(attempt, Attempt::Empty));
    }

    #[test]
    fn structured_qr_payloads_are_found() {
        let attempt = interpret(Ok(Some(DetectionResult {
            raw_payload: "mtn|100|1234567890".to_string(),
            kind: DetectionKind::Qr,
        })));
        match attempt {
            Attempt::Found(detection) => assert_eq!(detection.formatted_code(), "*311*1234567890#"),
            _ => panic!("expected a detection"),
        }
    }
}
