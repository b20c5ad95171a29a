use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

use super::types::*;
use crate::serial::protocol::TransportProtocol;

static SENSOR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(.+?)\s*-\s*(.+?):\s*(.+)$").unwrap());
static RAIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^Rain Tip Detected!\s*Hourly:\s*(\d+)\s*Daily:\s*(\d+)\s*Weekly:\s*(\d+)").unwrap()
});
static NUMBER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(-?\d+(?:\.\d+)?)\s*(.*)$").unwrap());
static FIELD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(ssl_enabled|ssl|host|user|broker|url|topic|port)=([^,]+)").unwrap()
});

const ERROR_MARKERS: [&str; 5] = ["Error", "error", "failed", "ENOENT", "not active"];
const SUCCESS_MARKERS: [&str; 5] = [
    "Successfully",
    "saved OK",
    "Connected to",
    "Current interval",
    "protocol initialized",
];
const INFO_MARKERS: [&str; 2] = ["/usr contents", "Device ID:"];

/// Classify one decoded line. Never fails; unknown lines come back as
/// `Unclassified`.
pub fn parse_line(line: &str) -> TelemetryEvent {
    let line = line.trim();

    if let Some(fragment) = parse_config_fragment(line) {
        return TelemetryEvent::ConfigFragment(fragment);
    }
    if let Some(tip) = parse_rain_tip(line) {
        return TelemetryEvent::RainTip(tip);
    }
    if let Some(reading) = parse_sensor_reading(line) {
        return TelemetryEvent::SensorReading(reading);
    }
    TelemetryEvent::Unclassified(line.to_string())
}

pub fn parse_rain_tip(line: &str) -> Option<RainTip> {
    let caps = RAIN_RE.captures(line)?;
    Some(RainTip {
        hourly: caps[1].parse().ok()?,
        daily: caps[2].parse().ok()?,
        weekly: caps[3].parse().ok()?,
    })
}

pub fn parse_sensor_reading(line: &str) -> Option<SensorReading> {
    let caps = SENSOR_RE.captures(line)?;
    let raw_value = caps[3].trim().to_string();
    let (value, unit) = match NUMBER_RE.captures(&raw_value) {
        Some(num) => {
            let unit = num[2].trim();
            (num[1].parse::<f64>().ok(), (!unit.is_empty()).then(|| unit.to_string()))
        }
        None => (None, None),
    };
    Some(SensorReading {
        sensor: caps[1].trim().to_string(),
        parameter: caps[2].trim().to_string(),
        raw_value,
        value,
        unit,
    })
}

pub fn parse_config_fragment(line: &str) -> Option<ConfigFragment> {
    let protocol = if line.starts_with("FTP protocol") {
        TransportProtocol::Ftp
    } else if line.starts_with("MQTT protocol") || line.contains("MQTT extras") {
        TransportProtocol::Mqtt
    } else if line.starts_with("HTTP protocol") {
        TransportProtocol::Http
    } else {
        return None;
    };

    let mut fields = BTreeMap::new();
    for caps in FIELD_RE.captures_iter(line) {
        fields.entry(caps[1].to_string()).or_insert_with(|| caps[2].trim().to_string());
    }
    Some(ConfigFragment { protocol, fields })
}

/// Severity used when presenting a line to the operator.
pub fn classify_severity(line: &str) -> Severity {
    if ERROR_MARKERS.iter().any(|m| line.contains(m)) {
        Severity::Error
    } else if SUCCESS_MARKERS.iter().any(|m| line.contains(m)) {
        Severity::Success
    } else if INFO_MARKERS.iter().any(|m| line.contains(m)) {
        Severity::Info
    } else {
        Severity::Default
    }
}
