//! Result sink consumed by UI collaborators

use crate::error::ScanErrorKind;
use crate::scanner::ScanState;
use crate::voucher::Detection;
use serde::Serialize;
use tokio::sync::mpsc;

/// The three signals the scan engine emits
pub trait ResultSink: Send + Sync {
    /// A new code was accepted
    fn on_detected(&self, detection: &Detection);

    /// The polling state changed or a hint is available
    fn on_status(&self, state: &ScanState, message: &str);

    /// The session failed
    fn on_error(&self, kind: ScanErrorKind);
}

/// Owned form of a sink signal
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScanEvent {
    /// See [`ResultSink::on_detected`]
    Detected {
        /// Accepted detection
        detection: Detection,
    },
    /// See [`ResultSink::on_status`]
    Status {
        /// State at the time of the update
        state: ScanState,
        /// User-facing message
        message: String,
    },
    /// See [`ResultSink::on_error`]
    Error {
        /// Failure category
        kind: ScanErrorKind,
    },
}

/// Forwards sink signals into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ScanEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiver its events arrive on
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ScanEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: ScanEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!(target: "voucherscan::scanner", "Scan event receiver dropped");
        }
    }
}

impl ResultSink for ChannelSink {
    fn on_detected(&self, detection: &Detection) {
        self.send(ScanEvent::Detected {
            detection: detection.clone(),
        });
    }

    fn on_status(&self, state: &ScanState, message: &str) {
        self.send(ScanEvent::Status {
            state: *state,
            message: message.to_string(),
        });
    }

    fn on_error(&self, kind: ScanErrorKind) {
        self.send(ScanEvent::Error { kind });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::ScanMode;
    use crate::voucher::validate;

    #[test]
    fn channel_sink_forwards_events_in_order() {
        let (sink, mut rx) = ChannelSink::new();
        sink.on_status(&ScanState::Active(ScanMode::Qr), "Scanning for code…");
        sink.on_detected(&Detection::Code(validate("1234567890").unwrap()));
        sink.on_error(ScanErrorKind::MalformedPayload);

        assert!(matches!(rx.try_recv(), Ok(ScanEvent::Status { .. })));
        match rx.try_recv() {
            Ok(ScanEvent::Detected { detection }) => {
                assert_eq!(detection.formatted_code(), "*311*1234567890#")
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(
            rx.try_recv().ok(),
            Some(ScanEvent::Error {
                kind: ScanErrorKind::MalformedPayload
            })
        );
    }

    #[test]
    fn events_serialize_with_tags() {
        let value = serde_json::to_value(ScanEvent::Status {
            state: ScanState::Active(ScanMode::Ocr),
            message: "Scanning".to_string(),
        })
        .unwrap();
        assert_eq!(value["event"], "status");
        assert_eq!(value["state"]["state"], "active");
        assert_eq!(value["state"]["detail"], "ocr");
    }
}
