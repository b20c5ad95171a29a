//! Session core types: response matchers, waiter specs and the command
//! messages the session task accepts.
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::serial::SerialError;

/// Identity of one open link.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionInfo {
    pub id: Uuid,
    pub port_name: String,
    pub baud_rate: u32,
    pub opened_at: DateTime<Utc>,
}

impl SessionInfo {
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self { id: Uuid::new_v4(), port_name: port_name.into(), baud_rate, opened_at: Utc::now() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum LinkState {
    Open,
    Closed { reason: Option<String> },
}

/// Predicate over the lines a waiter has seen so far.
#[derive(Debug, Clone)]
pub enum ResponseMatcher {
    UntilPrefix(String),
    FixedLines(usize),
    Contains(String),
    ContainsAny(Vec<String>),
    Custom(fn(&[String]) -> bool),
}

impl ResponseMatcher {
    pub fn contains(marker: impl Into<String>) -> Self {
        ResponseMatcher::Contains(marker.into())
    }

    pub fn contains_any<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ResponseMatcher::ContainsAny(markers.into_iter().map(Into::into).collect())
    }

    pub fn is_complete(&self, lines: &[String]) -> bool {
        match self {
            ResponseMatcher::UntilPrefix(p) => lines.iter().any(|l| l.starts_with(p.as_str())),
            ResponseMatcher::FixedLines(n) => lines.len() >= *n,
            ResponseMatcher::Contains(s) => lines.iter().any(|l| l.contains(s.as_str())),
            ResponseMatcher::ContainsAny(set) => {
                lines.iter().any(|l| set.iter().any(|s| l.contains(s.as_str())))
            }
            ResponseMatcher::Custom(f) => f(lines),
        }
    }
}

/// What a waiter listens for and for how long.
#[derive(Debug, Clone)]
pub struct ResponseSpec {
    pub name: String,
    pub timeout: Duration,
    pub success: ResponseMatcher,
    pub failure: Option<ResponseMatcher>,
    pub timeout_message: String,
    pub rejection_context: String,
    pub snippet_len: usize,
}

impl ResponseSpec {
    pub fn new(name: impl Into<String>, timeout: Duration, success: ResponseMatcher) -> Self {
        let name = name.into();
        Self {
            timeout_message: format!("No response to {}", name),
            rejection_context: format!("{} rejected by device", name),
            name,
            timeout,
            success,
            failure: None,
            snippet_len: 200,
        }
    }

    pub fn with_failure(mut self, failure: ResponseMatcher) -> Self {
        self.failure = Some(failure);
        self
    }

    pub fn with_timeout_message(mut self, message: impl Into<String>) -> Self {
        self.timeout_message = message.into();
        self
    }

    pub fn with_rejection_context(mut self, context: impl Into<String>) -> Self {
        self.rejection_context = context.into();
        self
    }

    pub fn with_snippet_len(mut self, len: usize) -> Self {
        self.snippet_len = len;
        self
    }
}

#[derive(Debug, Clone)]
pub struct CommandResponse {
    pub lines: Vec<String>,
    pub latency: Duration,
}

impl CommandResponse {
    /// The line that satisfied the matcher.
    pub fn last_line(&self) -> Option<&str> {
        self.lines.last().map(String::as_str)
    }
}

pub type Responder<T> = oneshot::Sender<Result<T, SerialError>>;

#[derive(Debug)]
pub enum SessionCommand {
    Write { data: Vec<u8>, command: Option<String>, responder: Responder<usize> },
    DiscardInput { responder: Responder<()> },
    Subscribe { spec: ResponseSpec, responder: Responder<CommandResponse> },
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub lines_read: u64,
    pub lines_suppressed: u64,
    pub events_delivered: u64,
    pub bytes_written: u64,
    pub waiters_completed: u64,
    pub waiters_rejected: u64,
    pub waiters_timed_out: u64,
    pub utf8_decode_errors: u64,
    pub last_error: Option<String>,
}
