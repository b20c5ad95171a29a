//! Observer side channel for everything the operator should see.
//!
//! The transport core never depends on a UI; it reports outbound echoes,
//! inbound lines and notices through an injected [`EventSink`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::telemetry::{classify_severity, Severity};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventKind {
    /// A command or framing line we wrote to the device.
    Outbound,
    /// A deliverable line received from the device.
    Inbound,
    /// Link lifecycle and error notices.
    Notice,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SerialEvent {
    pub kind: EventKind,
    pub text: String,
    pub at: DateTime<Utc>,
}

impl SerialEvent {
    pub fn outbound(command: &str) -> Self {
        Self::new(EventKind::Outbound, format!("> {}", command))
    }

    pub fn inbound(line: impl Into<String>) -> Self {
        Self::new(EventKind::Inbound, line.into())
    }

    pub fn notice(text: impl Into<String>) -> Self {
        Self::new(EventKind::Notice, text.into())
    }

    fn new(kind: EventKind, text: String) -> Self {
        Self { kind, text, at: Utc::now() }
    }
}

/// Fire-and-forget notification target. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn notify(&self, event: SerialEvent);
}

/// Mirrors events into the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn notify(&self, event: SerialEvent) {
        match event.kind {
            EventKind::Outbound => log::debug!("{}", event.text),
            EventKind::Inbound => match classify_severity(&event.text) {
                Severity::Error => log::warn!("< {}", event.text),
                _ => log::info!("< {}", event.text),
            },
            EventKind::Notice => log::info!("{}", event.text),
        }
    }
}

/// Broadcasts events to any number of subscribers (UI bridge, recorders, tests).
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: broadcast::Sender<SerialEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SerialEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for ChannelSink {
    fn notify(&self, event: SerialEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}
