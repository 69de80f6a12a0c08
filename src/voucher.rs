//! Voucher code validation and dial-string formatting
//!
//! Digit strings extracted by a detector are only surfaced once they pass
//! [`validate`]. Accepted codes render into the carrier dial string
//! `*311*<digits>#`.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Service prefix dialed in front of every voucher PIN
pub const SERVICE_PREFIX: &str = "311";

/// Minimum number of digits in a voucher PIN
pub const MIN_CODE_LEN: usize = 10;

/// Maximum number of digits in a voucher PIN
pub const MAX_CODE_LEN: usize = 16;

/// Field delimiter used by structured voucher QR payloads
pub const FIELD_DELIMITER: char = '|';

/// A validated voucher PIN together with its dial string
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VoucherCode {
    digits: String,
    formatted_code: String,
}

impl VoucherCode {
    /// The raw PIN digits
    pub fn digits(&self) -> &str {
        &self.digits
    }

    /// The dial string, e.g. `*311*1234567890#`
    pub fn formatted_code(&self) -> &str {
        &self.formatted_code
    }
}

impl fmt::Display for VoucherCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.formatted_code)
    }
}

/// Validate a digit string and render it into a [`VoucherCode`].
pub fn validate(digits: &str) -> Result<VoucherCode> {
    if digits.is_empty() {
        return Err(Error::InvalidCode("empty code".to_string()));
    }
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidCode(format!(
            "'{digits}' contains non-numeric characters"
        )));
    }
    if !(MIN_CODE_LEN..=MAX_CODE_LEN).contains(&digits.len()) {
        return Err(Error::InvalidCode(format!(
            "'{digits}' has {} digits, expected {MIN_CODE_LEN}-{MAX_CODE_LEN}",
            digits.len()
        )));
    }

    Ok(VoucherCode {
        digits: digits.to_string(),
        formatted_code: format_dial_code(digits),
    })
}

/// Render digits into the fixed dial-string template.
pub fn format_dial_code(digits: &str) -> String {
    format!("*{SERVICE_PREFIX}*{digits}#")
}

/// Whether a string has the `*<digits>*<digits>#` dial-code shape.
pub fn is_dial_code(value: &str) -> bool {
    split_dial_code(value).is_some()
}

fn split_dial_code(value: &str) -> Option<(&str, &str)> {
    let body = value.strip_prefix('*')?.strip_suffix('#')?;
    let (prefix, digits) = body.split_once('*')?;
    let numeric = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    (numeric(prefix) && numeric(digits)).then_some((prefix, digits))
}

/// Carrier networks that issue recharge vouchers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// MTN
    Mtn,
    /// Airtel
    Airtel,
    /// Glo
    Glo,
    /// 9mobile
    #[serde(rename = "9mobile")]
    NineMobile,
}

impl Network {
    /// Parse a network identifier (case-insensitive)
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mtn" => Some(Network::Mtn),
            "airtel" => Some(Network::Airtel),
            "glo" => Some(Network::Glo),
            "9mobile" | "etisalat" => Some(Network::NineMobile),
            _ => None,
        }
    }

    /// Display name used in rendered output
    pub fn display_name(self) -> &'static str {
        match self {
            Network::Mtn => "MTN",
            Network::Airtel => "Airtel",
            Network::Glo => "Glo",
            Network::NineMobile => "9Mobile",
        }
    }
}

/// A structured voucher decoded from a `NETWORK|PRICE|PIN` QR payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoucherRecord {
    /// Network field as scanned
    pub network: String,
    /// Price field as scanned
    pub price: String,
    /// The validated PIN
    pub code: VoucherCode,
}

impl VoucherRecord {
    /// The recognised carrier, if the network field names one
    pub fn network_kind(&self) -> Option<Network> {
        Network::parse(&self.network)
    }

    /// Price as an integer amount, if numeric
    pub fn price_value(&self) -> Option<u32> {
        self.price.parse().ok()
    }
}

/// Split a structured payload into a [`VoucherRecord`].
pub fn parse_structured(payload: &str) -> Result<VoucherRecord> {
    let mut fields = payload.split(FIELD_DELIMITER).map(str::trim);
    let (network, price, pin) = match (fields.next(), fields.next(), fields.next()) {
        (Some(n), Some(p), Some(c)) if !n.is_empty() && !p.is_empty() && !c.is_empty() => {
            (n, p, c)
        }
        _ => {
            return Err(Error::MalformedPayload(format!(
                "expected NETWORK|PRICE|PIN, got '{payload}'"
            )));
        }
    };

    let code = validate(pin).map_err(|e| Error::MalformedPayload(e.to_string()))?;

    Ok(VoucherRecord {
        network: network.to_string(),
        price: price.to_string(),
        code,
    })
}

/// The artifact handed to result sinks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Detection {
    /// A bare PIN rendered as a dial string
    Code(VoucherCode),
    /// A structured voucher record
    Voucher(VoucherRecord),
}

impl Detection {
    /// The PIN carried by the detection
    pub fn code(&self) -> &VoucherCode {
        match self {
            Detection::Code(code) => code,
            Detection::Voucher(record) => &record.code,
        }
    }

    /// Key used for duplicate suppression
    pub fn dedup_key(&self) -> &str {
        self.code().digits()
    }

    /// The dial string for the detected PIN
    pub fn formatted_code(&self) -> &str {
        self.code().formatted_code()
    }
}

/// Interpret a decoded QR payload.
///
/// Structured payloads are tried first, then dial strings, then bare PINs.
/// Anything else is a [`Error::MalformedPayload`].
pub fn parse_qr_payload(payload: &str) -> Result<Detection> {
    let payload = payload.trim();

    if payload.contains(FIELD_DELIMITER) {
        return parse_structured(payload).map(Detection::Voucher);
    }

    if let Some((_, digits)) = split_dial_code(payload) {
        return validate(digits)
            .map(Detection::Code)
            .map_err(|e| Error::MalformedPayload(e.to_string()));
    }

    if !payload.is_empty() && payload.bytes().all(|b| b.is_ascii_digit()) {
        return validate(payload)
            .map(Detection::Code)
            .map_err(|e| Error::MalformedPayload(e.to_string()));
    }

    Err(Error::MalformedPayload(format!(
        "unrecognised payload '{payload}'"
    )))
}
