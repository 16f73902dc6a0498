//! Parser for NUT `upsc` output
//!
//! `upsc` prints one `key: value` pair per line:
//!
//! ```text
//! battery.charge: 87
//! battery.runtime: 1200
//! device.mfr: EATON
//! ups.load: 14
//! ```
//!
//! Only the three keys the poller publishes are interpreted. Values are
//! coerced with leading-prefix semantics, so `87 %` reads as 87 and a value
//! without any numeric prefix is treated as absent.

use regex::Regex;
use std::sync::LazyLock;

/// Battery charge in percent
pub const KEY_BATTERY_CHARGE: &str = "battery.charge";

/// Remaining runtime in seconds
pub const KEY_BATTERY_RUNTIME: &str = "battery.runtime";

/// Output load in percent of nominal
pub const KEY_UPS_LOAD: &str = "ups.load";

/// Values recovered from a single `upsc` run.
///
/// `None` means the key was missing or its value failed coercion; either way
/// the caller keeps whatever it had before.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UpsReading {
    pub charge: Option<i64>,
    pub runtime_seconds: Option<u64>,
    pub load_percent: Option<f64>,
}

impl UpsReading {
    pub fn is_empty(&self) -> bool {
        self.charge.is_none() && self.runtime_seconds.is_none() && self.load_percent.is_none()
    }
}

/// Split one line into a trimmed `(key, value)` pair.
///
/// Blank lines and lines without a `:` yield `None`. Only the first colon
/// delimits, so values such as timestamps keep their own colons.
pub fn parse_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let (key, value) = line.split_once(':')?;
    Some((key.trim(), value.trim()))
}

/// Parse full `upsc` output. Later lines win over earlier ones.
pub fn parse(raw: &str) -> UpsReading {
    let mut reading = UpsReading::default();

    for (key, value) in raw.lines().filter_map(parse_line) {
        match key {
            KEY_BATTERY_CHARGE => {
                if let Some(charge) = parse_int_prefix(value) {
                    reading.charge = Some(charge);
                }
            }
            KEY_BATTERY_RUNTIME => {
                if let Some(runtime) = parse_int_prefix(value).and_then(|v| u64::try_from(v).ok()) {
                    reading.runtime_seconds = Some(runtime);
                }
            }
            KEY_UPS_LOAD => {
                if let Some(load) = parse_float_prefix(value) {
                    reading.load_percent = Some(load);
                }
            }
            _ => {}
        }
    }

    reading
}

static INT_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[+-]?\d+").unwrap());

static FLOAT_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[+-]?(?:\d+\.?\d*|\.\d+)(?:[eE][+-]?\d+)?").unwrap());

/// Base-10 integer from the longest `[+-]?digits` prefix.
///
/// A digit run too long for `i64` counts as no value.
pub fn parse_int_prefix(value: &str) -> Option<i64> {
    INT_PREFIX.find(value.trim_start())?.as_str().parse().ok()
}

/// Decimal float from the longest `[+-]?digits[.digits][e[+-]digits]` prefix.
/// An exponent marker only counts when digits follow it.
pub fn parse_float_prefix(value: &str) -> Option<f64> {
    FLOAT_PREFIX.find(value.trim_start())?.as_str().parse().ok()
}
