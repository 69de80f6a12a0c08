//! Scan-loop metrics: attempt outcomes per mode, polling cadence, skipped
//! ticks and hints, aggregated over a rolling window.
//!
//! Recording is a no-op until [`enable`] is called, so library users pay
//! nothing unless they opt in.

use crate::config::MetricsFormat;
use crate::error::{Error, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{self, MissedTickBehavior};
use tracing::{info, warn};

const MIN_WINDOW_SECS: u64 = 5;

static METRICS: OnceLock<Arc<Aggregator>> = OnceLock::new();
static LAST_WINDOW: OnceLock<Mutex<Option<Window>>> = OnceLock::new();

/// Start aggregating and log a summary every `interval_secs` (at least 5).
pub fn enable(interval_secs: u64) {
    let aggregator = Arc::clone(METRICS.get_or_init(|| Arc::new(Aggregator::new(interval_secs))));
    aggregator.set_interval(interval_secs);
    aggregator.ensure_reporter();
}

/// Record one finished detection attempt.
///
/// `detected` is true when the attempt produced a code; `mode` labels the
/// per-mode breakdown.
pub fn record(duration: Duration, detected: bool, mode: Option<&str>) {
    if let Some(aggregator) = METRICS.get() {
        aggregator.with_state(|state| state.record_attempt(duration, detected, mode));
    }
}

/// Record the gap between two polling ticks.
pub fn record_frame_interval(interval: Duration) {
    if let Some(aggregator) = METRICS.get() {
        aggregator.with_state(|state| state.record_frame_interval(interval));
    }
}

/// Record a tick skipped because detection was still in flight.
/// `consecutive` is the number of ticks skipped in a row so far.
pub fn record_backpressure(consecutive: u64) {
    if let Some(aggregator) = METRICS.get() {
        aggregator.with_state(|state| state.record_skip(consecutive));
    }
}

/// Record a position/lighting hint shown to the user.
pub fn record_hint() {
    if let Some(aggregator) = METRICS.get() {
        aggregator.with_state(|state| state.hints += 1);
    }
}

/// Serve the latest window over HTTP on `addr`.
pub fn spawn_http_endpoint(addr: SocketAddr, format: MetricsFormat) -> Result<()> {
    let std_listener = std::net::TcpListener::bind(addr)?;
    std_listener.set_nonblocking(true)?;
    let listener = TcpListener::from_std(std_listener)?;

    tokio::spawn(async move {
        if let Err(err) = serve(listener, format).await {
            tracing::error!(target: "voucherscan::metrics", error = %err, "Metrics endpoint stopped");
        }
    });

    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Aggregator {
    state: Mutex<WindowState>,
    interval_secs: AtomicU64,
    reporter_started: AtomicBool,
}

impl Aggregator {
    fn new(interval_secs: u64) -> Self {
        Self {
            state: Mutex::new(WindowState::new()),
            interval_secs: AtomicU64::new(interval_secs.max(MIN_WINDOW_SECS)),
            reporter_started: AtomicBool::new(false),
        }
    }

    fn set_interval(&self, interval_secs: u64) {
        self.interval_secs
            .store(interval_secs.max(MIN_WINDOW_SECS), Ordering::Relaxed);
    }

    fn with_state(&self, f: impl FnOnce(&mut WindowState)) {
        f(&mut lock(&self.state));
    }

    fn ensure_reporter(self: &Arc<Self>) {
        if self
            .reporter_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            tokio::spawn(Arc::clone(self).report());
        }
    }

    async fn report(self: Arc<Self>) {
        loop {
            let secs = self.interval_secs.load(Ordering::Relaxed);
            let period = Duration::from_secs(secs);
            let mut ticker = time::interval_at(time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let window = lock(&self.state).close_window();
                log_window(&window);
                *lock(LAST_WINDOW.get_or_init(|| Mutex::new(None))) = Some(window);

                if self.interval_secs.load(Ordering::Relaxed) != secs {
                    break;
                }
            }
        }
    }
}

#[derive(Default, Clone)]
struct ModeCounters {
    detected: u64,
    empty: u64,
    detect_time: Duration,
}

struct WindowState {
    opened: Instant,
    per_mode: BTreeMap<String, ModeCounters>,
    attempts: u64,
    detected: u64,
    detect_time: Duration,
    interval_sum: Duration,
    interval_count: u64,
    interval_max: Duration,
    interval_last: Option<Duration>,
    skipped_ticks: u64,
    backpressure: u64,
    backpressure_peak: u64,
    hints: u64,
}

impl WindowState {
    fn new() -> Self {
        Self {
            opened: Instant::now(),
            per_mode: BTreeMap::new(),
            attempts: 0,
            detected: 0,
            detect_time: Duration::ZERO,
            interval_sum: Duration::ZERO,
            interval_count: 0,
            interval_max: Duration::ZERO,
            interval_last: None,
            skipped_ticks: 0,
            backpressure: 0,
            backpressure_peak: 0,
            hints: 0,
        }
    }

    fn record_attempt(&mut self, duration: Duration, detected: bool, mode: Option<&str>) {
        self.attempts += 1;
        if detected {
            self.detected += 1;
            self.detect_time += duration;
        }
        // A finished attempt means the loop is no longer backed up.
        self.backpressure = 0;

        if let Some(mode) = mode {
            let counters = self.per_mode.entry(mode.to_string()).or_default();
            if detected {
                counters.detected += 1;
                counters.detect_time += duration;
            } else {
                counters.empty += 1;
            }
        }
    }

    fn record_frame_interval(&mut self, interval: Duration) {
        self.interval_sum += interval;
        self.interval_count += 1;
        self.interval_max = self.interval_max.max(interval);
        self.interval_last = Some(interval);
    }

    fn record_skip(&mut self, consecutive: u64) {
        self.skipped_ticks += 1;
        self.backpressure = consecutive;
        self.backpressure_peak = self.backpressure_peak.max(consecutive);
    }

    fn window(&self) -> Window {
        let interval_avg = match u32::try_from(self.interval_count) {
            Ok(0) => None,
            Ok(count) => self.interval_sum.checked_div(count),
            Err(_) => self.interval_sum.checked_div(u32::MAX),
        };

        Window {
            elapsed: self.opened.elapsed(),
            attempts: self.attempts,
            detected: self.detected,
            detect_time: self.detect_time,
            per_mode: self
                .per_mode
                .iter()
                .map(|(mode, counters)| (mode.clone(), counters.clone()))
                .collect(),
            interval_avg,
            interval_max: (self.interval_count > 0).then_some(self.interval_max),
            interval_last: self.interval_last,
            skipped_ticks: self.skipped_ticks,
            backpressure: self.backpressure,
            backpressure_peak: self.backpressure_peak,
            hints: self.hints,
        }
    }

    fn close_window(&mut self) -> Window {
        let window = self.window();
        let backpressure = self.backpressure;
        let interval_last = self.interval_last;
        *self = Self::new();
        self.backpressure = backpressure;
        self.backpressure_peak = backpressure;
        self.interval_last = interval_last;
        window
    }
}

#[derive(Clone)]
struct Window {
    elapsed: Duration,
    attempts: u64,
    detected: u64,
    detect_time: Duration,
    per_mode: Vec<(String, ModeCounters)>,
    interval_avg: Option<Duration>,
    interval_max: Option<Duration>,
    interval_last: Option<Duration>,
    skipped_ticks: u64,
    backpressure: u64,
    backpressure_peak: u64,
    hints: u64,
}

fn avg_secs(total: Duration, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        total.as_secs_f64() / count as f64
    }
}

fn ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1_000.0
}

impl Window {
    fn detection_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.detected as f64 / self.attempts as f64
        }
    }
}

fn log_window(window: &Window) {
    info!(
        target: "voucherscan::metrics",
        window_secs = window.elapsed.as_secs(),
        attempts = window.attempts,
        detected = window.detected,
        detection_rate = format_args!("{:.1}%", window.detection_rate() * 100.0),
        avg_detect_ms = avg_secs(window.detect_time, window.detected) * 1_000.0,
        tick_interval_avg_ms = window.interval_avg.map(ms),
        tick_interval_max_ms = window.interval_max.map(ms),
        skipped_ticks = window.skipped_ticks,
        backpressure_peak = window.backpressure_peak,
        hints = window.hints,
        "Scan metrics window"
    );

    for (mode, counters) in &window.per_mode {
        info!(
            target: "voucherscan::metrics",
            mode = mode.as_str(),
            detected = counters.detected,
            empty = counters.empty,
            avg_detect_ms = avg_secs(counters.detect_time, counters.detected) * 1_000.0,
            "Per-mode metrics"
        );
    }
}

fn current_window() -> Option<Window> {
    let stored = lock(LAST_WINDOW.get_or_init(|| Mutex::new(None))).clone();
    stored.or_else(|| METRICS.get().map(|aggregator| lock(&aggregator.state).window()))
}

async fn serve(listener: TcpListener, format: MetricsFormat) -> Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(target: "voucherscan::metrics", error = %err, "Metrics accept failed");
                time::sleep(Duration::from_millis(250)).await;
                continue;
            }
        };

        tokio::spawn(async move {
            if let Err(err) = respond(stream, format).await {
                tracing::debug!(target: "voucherscan::metrics", %peer, error = %err, "Metrics connection closed");
            }
        });
    }
}

async fn respond(mut stream: TcpStream, format: MetricsFormat) -> Result<()> {
    let mut request = [0u8; 1024];
    let _ = stream.read(&mut request).await?;

    let (status, content_type, body) = match current_window() {
        Some(window) => match format {
            MetricsFormat::Json => (
                "200 OK",
                Some("application/json"),
                serde_json::to_vec(&HttpWindow::from(&window))?,
            ),
            MetricsFormat::Prometheus => (
                "200 OK",
                Some("text/plain; version=0.0.4"),
                render_prometheus(&window).into_bytes(),
            ),
        },
        None => ("204 No Content", None, Vec::new()),
    };

    let mut head = format!("HTTP/1.1 {status}\r\nConnection: close\r\nCache-Control: no-store\r\n");
    if let Some(content_type) = content_type {
        let _ = write!(head, "Content-Type: {content_type}\r\n");
    }
    let _ = write!(head, "Content-Length: {}\r\n\r\n", body.len());

    stream.write_all(head.as_bytes()).await?;
    stream.write_all(&body).await?;
    stream.shutdown().await.map_err(Error::Io)?;
    Ok(())
}

#[derive(Serialize)]
struct HttpWindow {
    window_secs: u64,
    attempts: u64,
    detected: u64,
    detection_rate: f64,
    avg_detect_ms: f64,
    tick_interval: Option<HttpTickInterval>,
    skipped_ticks: u64,
    backpressure: HttpBackpressure,
    hints: u64,
    per_mode: Vec<HttpMode>,
}

#[derive(Serialize)]
struct HttpTickInterval {
    avg_ms: f64,
    max_ms: f64,
    last_ms: f64,
}

#[derive(Serialize)]
struct HttpBackpressure {
    current: u64,
    peak: u64,
}

#[derive(Serialize)]
struct HttpMode {
    mode: String,
    detected: u64,
    empty: u64,
    avg_detect_ms: f64,
}

impl From<&Window> for HttpWindow {
    fn from(window: &Window) -> Self {
        Self {
            window_secs: window.elapsed.as_secs(),
            attempts: window.attempts,
            detected: window.detected,
            detection_rate: window.detection_rate() * 100.0,
            avg_detect_ms: avg_secs(window.detect_time, window.detected) * 1_000.0,
            tick_interval: window.interval_avg.map(|avg| HttpTickInterval {
                avg_ms: ms(avg),
                max_ms: ms(window.interval_max.unwrap_or(avg)),
                last_ms: ms(window.interval_last.unwrap_or(avg)),
            }),
            skipped_ticks: window.skipped_ticks,
            backpressure: HttpBackpressure {
                current: window.backpressure,
                peak: window.backpressure_peak,
            },
            hints: window.hints,
            per_mode: window
                .per_mode
                .iter()
                .map(|(mode, counters)| HttpMode {
                    mode: mode.clone(),
                    detected: counters.detected,
                    empty: counters.empty,
                    avg_detect_ms: avg_secs(counters.detect_time, counters.detected) * 1_000.0,
                })
                .collect(),
        }
    }
}

fn header(out: &mut String, name: &str, kind: &str, help: &str) {
    let _ = writeln!(out, "# HELP voucherscan_{name} {help}");
    let _ = writeln!(out, "# TYPE voucherscan_{name} {kind}");
}

fn render_prometheus(window: &Window) -> String {
    let mut out = String::new();

    let scalars: [(&str, &str, &str, String); 8] = [
        ("window_seconds", "gauge", "Length of the aggregation window", window.elapsed.as_secs().to_string()),
        ("attempts_total", "counter", "Detection attempts finished in the window", window.attempts.to_string()),
        ("detections_total", "counter", "Attempts that produced a code", window.detected.to_string()),
        ("detection_rate", "gauge", "Share of attempts that produced a code", format!("{:.6}", window.detection_rate())),
        ("detect_latency_avg_seconds", "gauge", "Average time to a successful detection", format!("{:.6}", avg_secs(window.detect_time, window.detected))),
        ("skipped_ticks_total", "counter", "Ticks skipped while detection was in flight", window.skipped_ticks.to_string()),
        ("backpressure_peak", "gauge", "Most consecutive skipped ticks in the window", window.backpressure_peak.to_string()),
        ("hints_total", "counter", "Position or lighting hints shown", window.hints.to_string()),
    ];
    for (name, kind, help, value) in scalars {
        header(&mut out, name, kind, help);
        let _ = writeln!(out, "voucherscan_{name} {value}");
    }

    if let Some(avg) = window.interval_avg {
        header(&mut out, "tick_interval_seconds", "gauge", "Observed polling interval");
        let stats = [
            ("avg", Some(avg)),
            ("max", window.interval_max),
            ("last", window.interval_last),
        ];
        for (stat, value) in stats {
            if let Some(value) = value {
                let _ = writeln!(
                    out,
                    "voucherscan_tick_interval_seconds{{stat=\"{stat}\"}} {:.6}",
                    value.as_secs_f64()
                );
            }
        }
    }

    if !window.per_mode.is_empty() {
        header(&mut out, "attempts_by_mode_total", "counter", "Attempts by scan mode and result");
        for (mode, counters) in &window.per_mode {
            let mode = escape_label(mode);
            let _ = writeln!(
                out,
                "voucherscan_attempts_by_mode_total{{mode=\"{mode}\",result=\"detected\"}} {}",
                counters.detected
            );
            let _ = writeln!(
                out,
                "voucherscan_attempts_by_mode_total{{mode=\"{mode}\",result=\"empty\"}} {}",
                counters.empty
            );
        }
    }

    out
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\n', "\\n")
        .replace('"', "\\\"")
}
