//! Rendering and distribution of scan results

#[cfg(target_family = "unix")]
pub mod unix;

use crate::scanner::ScanEvent;
use crate::voucher::{Detection, VoucherRecord};
use serde_json::{Value, json};

/// A detection rendered for machines and for terminals
#[derive(Debug, Clone)]
pub struct RenderedDetection {
    /// Structured form for JSON output and socket clients
    pub json: Value,
    /// Lines for terminal output
    pub human: Vec<String>,
}

/// Render a detection into JSON and human-readable lines.
pub fn render_detection(detection: &Detection) -> RenderedDetection {
    let mut human = vec![
        "Voucher code detected".to_string(),
        format!("  Dial: {}", detection.formatted_code()),
        format!("  PIN: {}", detection.code().digits()),
    ];
    if let Detection::Voucher(record) = detection {
        human.push(format!("  Network: {}", network_label(record)));
        human.push(format!("  Price: {}", record.price));
    }

    RenderedDetection {
        json: detection_value(detection),
        human,
    }
}

/// JSON object describing a detection
pub fn detection_value(detection: &Detection) -> Value {
    let code = detection.code();
    let mut value = json!({
        "kind": match detection {
            Detection::Code(_) => "code",
            Detection::Voucher(_) => "voucher",
        },
        "pin": code.digits(),
        "formatted_code": code.formatted_code(),
    });

    if let Detection::Voucher(record) = detection {
        value["network"] = Value::String(record.network.clone());
        value["network_name"] = record
            .network_kind()
            .map_or(Value::Null, |n| Value::String(n.display_name().to_string()));
        value["price"] = record
            .price_value()
            .map_or_else(|| Value::String(record.price.clone()), Value::from);
    }
    value
}

/// JSON line for any scan event
pub fn event_value(event: &ScanEvent) -> Value {
    match event {
        ScanEvent::Detected { detection } => json!({
            "event": "detected",
            "detection": detection_value(detection),
        }),
        ScanEvent::Status { state, message } => json!({
            "event": "status",
            "state": state.label(),
            "detail": state.to_string(),
            "message": message,
        }),
        ScanEvent::Error { kind } => json!({
            "event": "error",
            "kind": kind.as_str(),
            "message": kind.message(),
        }),
    }
}

fn network_label(record: &VoucherRecord) -> &str {
    record
        .network_kind()
        .map_or(record.network.as_str(), |network| network.display_name())
}
