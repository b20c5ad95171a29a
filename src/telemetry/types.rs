use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::serial::protocol::TransportProtocol;

/// What an inbound line turned out to be.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum TelemetryEvent {
    SensorReading(SensorReading),
    RainTip(RainTip),
    ConfigFragment(ConfigFragment),
    Unclassified(String),
}

/// `<sensor> - <parameter>: <value>`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SensorReading {
    pub sensor: String,
    pub parameter: String,
    /// Value text as the firmware printed it.
    pub raw_value: String,
    /// `None` when the sensor reported `null` or nothing numeric.
    pub value: Option<f64>,
    pub unit: Option<String>,
}

impl SensorReading {
    /// A sensor that answers with `null` is wired but not responding.
    pub fn is_present(&self) -> bool {
        self.value.is_some()
    }
}

/// Tip counters from the rain gauge.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RainTip {
    pub hourly: u32,
    pub daily: u32,
    pub weekly: u32,
}

/// `key=value` pairs from a configuration report line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigFragment {
    pub protocol: TransportProtocol,
    pub fields: BTreeMap<String, String>,
}

impl ConfigFragment {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// TLS flag from `ssl=` or `ssl_enabled=`; `true`/`on` mean enabled.
    pub fn ssl_enabled(&self) -> Option<bool> {
        self.get("ssl")
            .or_else(|| self.get("ssl_enabled"))
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "on"))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Severity {
    Error,
    Success,
    Info,
    Default,
}
