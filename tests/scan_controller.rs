use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use image::{DynamicImage, Luma};
use qrcode::QrCode;
use tokio::sync::{Notify, oneshot};
use tokio::time::{Instant, sleep, timeout};

use voucherscan::error::{Error, Result, ScanErrorKind};
use voucherscan::scanner::{STATUS_HINT, STATUS_RELEASING};
use voucherscan::{
    CameraHandle, Constraints, Detection, FrameSource, OcrEngine, Recognition, RecognizeOptions,
    ResultSink, ScanController, ScanEvent, ScanMode, ScanOptions, ScanState,
};

struct FakeCamera {
    frame: DynamicImage,
    deny: bool,
    fail_pulls: bool,
    prompt: Option<Arc<Notify>>,
    acquires: AtomicUsize,
    pulls: AtomicUsize,
    acquired_at: Mutex<Vec<Instant>>,
    released_at: Mutex<Vec<Instant>>,
}

impl FakeCamera {
    fn showing(frame: DynamicImage) -> Self {
        Self {
            frame,
            deny: false,
            fail_pulls: false,
            prompt: None,
            acquires: AtomicUsize::new(0),
            pulls: AtomicUsize::new(0),
            acquired_at: Mutex::new(Vec::new()),
            released_at: Mutex::new(Vec::new()),
        }
    }

    fn blank() -> Self {
        Self::showing(DynamicImage::new_rgb8(640, 480))
    }

    fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    fn releases(&self) -> usize {
        self.released_at.lock().unwrap().len()
    }
}

#[async_trait]
impl FrameSource for FakeCamera {
    async fn acquire(&self, _constraints: &Constraints) -> Result<CameraHandle> {
        if let Some(prompt) = &self.prompt {
            prompt.notified().await;
        }
        let id = self.acquires.fetch_add(1, Ordering::SeqCst) as u64 + 1;
        if self.deny {
            return Err(Error::PermissionDenied("denied by user".into()));
        }
        self.acquired_at.lock().unwrap().push(Instant::now());
        Ok(CameraHandle::new(id, "fake camera"))
    }

    async fn pull_frame(&self, _handle: &CameraHandle) -> Result<Option<DynamicImage>> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        if self.fail_pulls {
            return Err(Error::DeviceUnavailable("device unplugged".into()));
        }
        Ok(Some(self.frame.clone()))
    }

    async fn release(&self, _handle: &CameraHandle) {
        self.released_at.lock().unwrap().push(Instant::now());
    }
}

enum Reply {
    Wait(oneshot::Receiver<String>),
    Hang,
}

struct ScriptedEngine {
    replies: Mutex<VecDeque<Reply>>,
    fallback: &'static str,
    calls: AtomicUsize,
}

impl ScriptedEngine {
    fn answering(fallback: &'static str) -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            fallback,
            calls: AtomicUsize::new(0),
        }
    }

    fn then(self, reply: Reply) -> Self {
        self.replies.lock().unwrap().push_back(reply);
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OcrEngine for ScriptedEngine {
    async fn recognize(
        &self,
        _image: &DynamicImage,
        _options: &RecognizeOptions,
    ) -> Result<Recognition> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(Reply::Wait(rx)) => rx
                .await
                .map(Recognition::text)
                .map_err(|_| Error::RecognitionFailure("reply dropped".into())),
            Some(Reply::Hang) => std::future::pending().await,
            None => Ok(Recognition::text(self.fallback)),
        }
    }
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<ScanEvent>>,
}

impl RecordingSink {
    fn detections(&self) -> Vec<Detection> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                ScanEvent::Detected { detection } => Some(detection.clone()),
                _ => None,
            })
            .collect()
    }

    fn errors(&self) -> Vec<ScanErrorKind> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                ScanEvent::Error { kind } => Some(*kind),
                _ => None,
            })
            .collect()
    }

    fn statuses(&self) -> Vec<(ScanState, String)> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                ScanEvent::Status { state, message } => Some((*state, message.clone())),
                _ => None,
            })
            .collect()
    }

    fn count_status(&self, message: &str) -> usize {
        self.statuses().iter().filter(|(_, m)| m == message).count()
    }
}

impl ResultSink for RecordingSink {
    fn on_detected(&self, detection: &Detection) {
        self.events.lock().unwrap().push(ScanEvent::Detected {
            detection: detection.clone(),
        });
    }

    fn on_status(&self, state: &ScanState, message: &str) {
        self.events.lock().unwrap().push(ScanEvent::Status {
            state: *state,
            message: message.to_string(),
        });
    }

    fn on_error(&self, kind: ScanErrorKind) {
        self.events.lock().unwrap().push(ScanEvent::Error { kind });
    }
}

struct Harness {
    camera: Arc<FakeCamera>,
    engine: Arc<ScriptedEngine>,
    sink: Arc<RecordingSink>,
    controller: ScanController,
}

fn harness(camera: FakeCamera, engine: ScriptedEngine, options: ScanOptions) -> Harness {
    let camera = Arc::new(camera);
    let engine = Arc::new(engine);
    let sink = Arc::new(RecordingSink::default());
    let controller = ScanController::new(camera.clone(), engine.clone(), sink.clone(), options);
    Harness {
        camera,
        engine,
        sink,
        controller,
    }
}

fn qr_image(payload: &str) -> DynamicImage {
    let code = QrCode::new(payload.as_bytes()).unwrap();
    let image = code.render::<Luma<u8>>().min_dimensions(300, 300).build();
    DynamicImage::ImageLuma8(image)
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

#[tokio::test(start_paused = true)]
async fn ocr_scan_emits_dial_code_and_releases_camera_once() {
    let h = harness(
        FakeCamera::blank(),
        ScriptedEngine::answering("A1B2C34567890C"),
        ScanOptions::default(),
    );

    h.controller.start(ScanMode::Ocr).await.unwrap();
    assert_eq!(h.controller.state().await, ScanState::Active(ScanMode::Ocr));

    sleep(ms(1100)).await;

    let detections = h.sink.detections();
    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0].formatted_code(), "*311*1234567890#");
    assert_eq!(h.controller.state().await, ScanState::Detected);
    assert_eq!(h.camera.releases(), 1);
    assert!(!h.controller.camera_held().await);
    assert!(!h.controller.is_polling().await);

    sleep(ms(5000)).await;
    assert_eq!(h.engine.calls(), 1);
    assert_eq!(h.sink.detections().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn structured_qr_payload_is_detected() {
    let h = harness(
        FakeCamera::showing(qr_image("MTN|100|1234567890")),
        ScriptedEngine::answering(""),
        ScanOptions::default(),
    );

    h.controller.start(ScanMode::Qr).await.unwrap();
    sleep(ms(600)).await;

    let detections = h.sink.detections();
    assert_eq!(detections.len(), 1);
    match &detections[0] {
        Detection::Voucher(record) => {
            assert_eq!(record.network, "MTN");
            assert_eq!(record.price, "100");
            assert_eq!(record.code.formatted_code(), "*311*1234567890#");
        }
        other => panic!("expected a structured voucher, got {other:?}"),
    }
    assert_eq!(h.camera.releases(), 1);
    assert_eq!(h.engine.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn permission_denied_reports_once_and_never_polls() {
    let mut camera = FakeCamera::blank();
    camera.deny = true;
    let h = harness(camera, ScriptedEngine::answering(""), ScanOptions::default());

    let err = h.controller.start(ScanMode::Ocr).await.unwrap_err();
    assert!(matches!(err, Error::PermissionDenied(_)));
    assert_eq!(
        h.controller.state().await,
        ScanState::Error(ScanErrorKind::PermissionDenied)
    );

    sleep(ms(5000)).await;
    assert_eq!(h.sink.errors(), vec![ScanErrorKind::PermissionDenied]);
    assert_eq!(h.camera.pulls(), 0);
    assert_eq!(h.engine.calls(), 0);
    assert!(!h.controller.is_polling().await);
    assert!(h.controller.snapshot().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn hint_after_sixth_empty_attempt_and_polling_continues() {
    let h = harness(
        FakeCamera::blank(),
        ScriptedEngine::answering("no digits here"),
        ScanOptions::default(),
    );

    h.controller.start(ScanMode::Ocr).await.unwrap();

    sleep(ms(5500)).await;
    assert_eq!(h.engine.calls(), 5);
    assert_eq!(h.sink.count_status(STATUS_HINT), 0);

    sleep(ms(1000)).await;
    assert_eq!(h.engine.calls(), 6);
    assert_eq!(h.sink.count_status(STATUS_HINT), 1);
    assert!(h.controller.is_polling().await);
    assert_eq!(h.controller.state().await, ScanState::Active(ScanMode::Ocr));

    sleep(ms(5000)).await;
    assert_eq!(h.controller.snapshot().await.unwrap().attempt_count, 11);
    assert_eq!(h.sink.count_status(STATUS_HINT), 2);
    assert!(h.sink.errors().is_empty());
}

#[tokio::test(start_paused = true)]
async fn busy_session_never_starts_a_second_recognition() {
    let (tx, rx) = oneshot::channel();
    let mut options = ScanOptions::default();
    options.recognition_timeout = None;
    let h = harness(
        FakeCamera::blank(),
        ScriptedEngine::answering("").then(Reply::Wait(rx)),
        options,
    );

    h.controller.start(ScanMode::Ocr).await.unwrap();
    sleep(ms(5500)).await;

    assert_eq!(h.engine.calls(), 1);
    let snapshot = h.controller.snapshot().await.unwrap();
    assert!(snapshot.busy);
    assert_eq!(snapshot.state, ScanState::Processing(ScanMode::Ocr));

    tx.send("9876543210".to_string()).unwrap();
    sleep(ms(10)).await;

    let detections = h.sink.detections();
    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0].formatted_code(), "*311*9876543210#");
    assert_eq!(h.engine.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn mode_switch_discards_late_result_and_waits_for_camera() {
    let (tx, rx) = oneshot::channel();
    let h = harness(
        FakeCamera::blank(),
        ScriptedEngine::answering("").then(Reply::Wait(rx)),
        ScanOptions::default(),
    );

    h.controller.start(ScanMode::Ocr).await.unwrap();
    sleep(ms(1100)).await;
    assert_eq!(h.engine.calls(), 1);

    h.controller.switch_mode(ScanMode::Qr).await.unwrap();
    assert_eq!(h.camera.releases(), 1);
    {
        let released = h.camera.released_at.lock().unwrap()[0];
        let reacquired = h.camera.acquired_at.lock().unwrap()[1];
        assert!(reacquired.duration_since(released) >= ms(500));
    }

    tx.send("1234567890".to_string()).unwrap();
    sleep(ms(1200)).await;

    assert!(h.sink.detections().is_empty());
    assert_eq!(h.controller.last_detected().await, None);
    let snapshot = h.controller.snapshot().await.unwrap();
    assert_eq!(snapshot.mode, ScanMode::Qr);
    assert!(snapshot.attempt_count >= 1);
    assert!(h.controller.is_polling().await);
}

#[tokio::test(start_paused = true)]
async fn repeated_code_is_suppressed_until_reset() {
    let h = harness(
        FakeCamera::showing(qr_image("*311*5555566666#")),
        ScriptedEngine::answering(""),
        ScanOptions::default(),
    );

    h.controller.start(ScanMode::Qr).await.unwrap();
    sleep(ms(600)).await;
    assert_eq!(h.sink.detections().len(), 1);

    h.controller.start(ScanMode::Qr).await.unwrap();
    sleep(ms(2200)).await;
    assert_eq!(h.sink.detections().len(), 1);
    assert!(h.controller.is_polling().await);
    assert_eq!(
        h.controller.last_detected().await.as_deref(),
        Some("5555566666")
    );

    h.controller.reset().await;
    sleep(ms(600)).await;
    let detections = h.sink.detections();
    assert_eq!(detections.len(), 2);
    assert_eq!(detections[1].formatted_code(), "*311*5555566666#");
}

#[tokio::test(start_paused = true)]
async fn malformed_qr_payload_ends_session_with_error() {
    let h = harness(
        FakeCamera::showing(qr_image("https://example.com/promo")),
        ScriptedEngine::answering(""),
        ScanOptions::default(),
    );

    h.controller.start(ScanMode::Qr).await.unwrap();
    sleep(ms(2000)).await;

    assert_eq!(h.sink.errors(), vec![ScanErrorKind::MalformedPayload]);
    assert!(h.sink.detections().is_empty());
    assert_eq!(
        h.controller.state().await,
        ScanState::Error(ScanErrorKind::MalformedPayload)
    );
    assert_eq!(h.camera.releases(), 1);
    assert!(!h.controller.is_polling().await);
    assert_eq!(h.camera.pulls(), 1);
}

#[tokio::test(start_paused = true)]
async fn frame_capture_failure_is_fatal() {
    let mut camera = FakeCamera::blank();
    camera.fail_pulls = true;
    let h = harness(camera, ScriptedEngine::answering(""), ScanOptions::default());

    h.controller.start(ScanMode::Qr).await.unwrap();
    sleep(ms(2000)).await;

    assert_eq!(h.sink.errors(), vec![ScanErrorKind::DeviceUnavailable]);
    assert_eq!(h.camera.pulls(), 1);
    assert_eq!(h.camera.releases(), 1);
    assert!(!h.controller.is_polling().await);
}

#[tokio::test(start_paused = true)]
async fn stop_is_idempotent() {
    let h = harness(
        FakeCamera::blank(),
        ScriptedEngine::answering(""),
        ScanOptions::default(),
    );

    h.controller.start(ScanMode::Qr).await.unwrap();
    h.controller.stop().await;
    h.controller.stop().await;

    assert_eq!(h.controller.state().await, ScanState::Idle);
    assert_eq!(h.camera.releases(), 1);
    assert_eq!(h.sink.count_status(STATUS_RELEASING), 1);

    sleep(ms(2000)).await;
    assert_eq!(h.camera.pulls(), 0);
}

#[tokio::test(start_paused = true)]
async fn restarting_a_live_session_releases_first() {
    let h = harness(
        FakeCamera::blank(),
        ScriptedEngine::answering(""),
        ScanOptions::default(),
    );

    h.controller.start(ScanMode::Qr).await.unwrap();
    h.controller.start(ScanMode::Ocr).await.unwrap();

    assert_eq!(h.camera.releases(), 1);
    assert_eq!(h.camera.acquires.load(Ordering::SeqCst), 2);
    assert_eq!(h.controller.state().await, ScanState::Active(ScanMode::Ocr));
    assert_eq!(
        h.controller.snapshot().await.map(|s| s.mode),
        Some(ScanMode::Ocr)
    );
}

#[tokio::test(start_paused = true)]
async fn stalled_recognition_times_out_as_empty_attempt() {
    let mut options = ScanOptions::default();
    options.recognition_timeout = Some(ms(1500));
    let h = harness(
        FakeCamera::blank(),
        ScriptedEngine::answering("").then(Reply::Hang),
        options,
    );

    h.controller.start(ScanMode::Ocr).await.unwrap();
    sleep(ms(1100)).await;
    assert_eq!(h.engine.calls(), 1);

    // Timeout fires at 2.5s; the 2s tick is skipped, the 3s tick runs.
    sleep(ms(2400)).await;
    assert_eq!(h.engine.calls(), 2);
    assert!(h.sink.errors().is_empty());
    assert!(h.controller.is_polling().await);
}

#[tokio::test(start_paused = true)]
async fn stop_returns_while_permission_prompt_is_open() {
    let prompt = Arc::new(Notify::new());
    let mut camera = FakeCamera::blank();
    camera.prompt = Some(prompt.clone());
    let h = harness(camera, ScriptedEngine::answering(""), ScanOptions::default());

    let start = h.controller.start(ScanMode::Ocr);
    tokio::pin!(start);
    assert!(timeout(ms(50), &mut start).await.is_err());
    assert_eq!(h.controller.state().await, ScanState::RequestingPermission);

    timeout(ms(50), h.controller.stop())
        .await
        .expect("stop waited for the permission prompt");
    assert_eq!(h.controller.state().await, ScanState::Idle);

    prompt.notify_one();
    start.await.unwrap();

    // The late handle from the superseded start is handed straight back.
    assert_eq!(h.camera.acquires.load(Ordering::SeqCst), 1);
    assert_eq!(h.camera.releases(), 1);
    assert!(!h.controller.camera_held().await);
    assert!(!h.controller.is_polling().await);
    assert_eq!(h.controller.state().await, ScanState::Idle);

    sleep(ms(3000)).await;
    assert_eq!(h.camera.pulls(), 0);
    assert!(h.sink.errors().is_empty());
}

#[tokio::test]
async fn stop_is_not_held_up_by_a_running_decode() {
    let mut options = ScanOptions::default();
    options.qr_interval = ms(10);
    let h = harness(
        FakeCamera::showing(DynamicImage::new_rgb8(3840, 2160)),
        ScriptedEngine::answering(""),
        options,
    );

    h.controller.start(ScanMode::Qr).await.unwrap();
    while h.camera.pulls() == 0 {
        sleep(ms(5)).await;
    }

    timeout(Duration::from_secs(1), h.controller.stop())
        .await
        .expect("stop blocked behind QR decoding");
    assert_eq!(h.controller.state().await, ScanState::Idle);
    assert_eq!(h.camera.releases(), 1);
}
