//! Line classification and delivery.
//!
//! Each decoded line is either dropped (blank, firmware echo), kept quiet
//! (offered to waiters only) or delivered as an event to the sink and to
//! every registered waiter. Waiters are single-shot: the first line that
//! satisfies a waiter's predicate resolves it and removes it.
use tokio::time::Instant;

use crate::config::RouterConfig;
use crate::serial::session::types::{CommandResponse, MetricsSnapshot, Responder, ResponseSpec};
use crate::serial::sink::{EventSink, SerialEvent};
use crate::serial::SerialError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineClass {
    Blank,
    Echo,
    Quiet,
    Event,
}

/// Prefix table driving echo suppression.
#[derive(Debug, Clone, Default)]
pub struct EchoTable {
    echo_prefixes: Vec<String>,
    quiet_prefixes: Vec<String>,
}

impl EchoTable {
    pub fn new(echo_prefixes: Vec<String>, quiet_prefixes: Vec<String>) -> Self {
        Self { echo_prefixes, quiet_prefixes }
    }

    pub fn from_config(config: &RouterConfig) -> Self {
        Self::new(config.echo_prefixes.clone(), config.quiet_prefixes.clone())
    }

    pub fn classify(&self, line: &str) -> LineClass {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            LineClass::Blank
        } else if self.echo_prefixes.iter().any(|p| trimmed.starts_with(p.as_str())) {
            LineClass::Echo
        } else if self.quiet_prefixes.iter().any(|p| trimmed.starts_with(p.as_str())) {
            LineClass::Quiet
        } else {
            LineClass::Event
        }
    }
}

struct Waiter {
    id: u64,
    spec: ResponseSpec,
    started: Instant,
    deadline: Instant,
    responder: Responder<CommandResponse>,
    lines: Vec<String>,
}

enum Verdict {
    Pending,
    Satisfied,
    Rejected,
}

impl Waiter {
    fn offer(&mut self, line: &str) -> Verdict {
        self.lines.push(line.to_string());
        if self.spec.success.is_complete(&self.lines) {
            Verdict::Satisfied
        } else if self.spec.failure.as_ref().is_some_and(|f| f.is_complete(&self.lines)) {
            Verdict::Rejected
        } else {
            Verdict::Pending
        }
    }

    fn snippet(&self) -> String {
        self.lines.join("\n").chars().take(self.spec.snippet_len).collect()
    }
}

pub struct LineRouter {
    table: EchoTable,
    suppress_command_echo: bool,
    last_command: Option<String>,
    waiters: Vec<Waiter>,
    next_id: u64,
}

impl LineRouter {
    pub fn new(config: &RouterConfig) -> Self {
        Self {
            table: EchoTable::from_config(config),
            suppress_command_echo: config.suppress_command_echo,
            last_command: None,
            waiters: Vec::new(),
            next_id: 1,
        }
    }

    /// Remember the command just written so its verbatim echo is dropped.
    pub fn note_command(&mut self, command: impl Into<String>) {
        self.last_command = Some(command.into());
    }

    pub fn classify(&self, line: &str) -> LineClass {
        let class = self.table.classify(line);
        if class == LineClass::Event && self.suppress_command_echo {
            if let Some(last) = &self.last_command {
                if line.trim() == last.as_str() {
                    return LineClass::Echo;
                }
            }
        }
        class
    }

    pub fn register(&mut self, spec: ResponseSpec, responder: Responder<CommandResponse>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let started = Instant::now();
        log::debug!("Waiter {} registered for '{}' ({:?})", id, spec.name, spec.timeout);
        self.waiters.push(Waiter {
            id,
            deadline: started + spec.timeout,
            started,
            spec,
            responder,
            lines: Vec::new(),
        });
        id
    }

    pub fn pending(&self) -> usize {
        self.waiters.len()
    }

    /// Classify `line`, notify the sink and resolve matching waiters.
    pub fn route(&mut self, line: &str, sink: &dyn EventSink, metrics: &mut MetricsSnapshot) -> LineClass {
        let class = self.classify(line);
        match class {
            LineClass::Blank => return class,
            LineClass::Echo => {
                metrics.lines_suppressed += 1;
                log::debug!("Suppressed echo: {}", line.trim());
                return class;
            }
            LineClass::Quiet => {
                metrics.lines_suppressed += 1;
            }
            LineClass::Event => {
                metrics.events_delivered += 1;
                sink.notify(SerialEvent::inbound(line.trim()));
            }
        }

        let trimmed = line.trim();
        let mut idx = 0;
        while idx < self.waiters.len() {
            if self.waiters[idx].responder.is_closed() {
                self.waiters.swap_remove(idx);
                continue;
            }
            match self.waiters[idx].offer(trimmed) {
                Verdict::Pending => idx += 1,
                Verdict::Satisfied => {
                    let waiter = self.waiters.swap_remove(idx);
                    metrics.waiters_completed += 1;
                    log::debug!("Waiter {} satisfied by '{}'", waiter.id, trimmed);
                    let response = CommandResponse { latency: waiter.started.elapsed(), lines: waiter.lines };
                    let _ = waiter.responder.send(Ok(response));
                }
                Verdict::Rejected => {
                    let waiter = self.waiters.swap_remove(idx);
                    metrics.waiters_rejected += 1;
                    let snippet = waiter.snippet();
                    log::warn!("Waiter {} rejected: {}", waiter.id, snippet);
                    let _ = waiter.responder.send(Err(SerialError::RemoteRejected {
                        context: waiter.spec.rejection_context,
                        snippet,
                    }));
                }
            }
        }
        class
    }

    /// Earliest deadline among live waiters. Drops waiters nobody awaits.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.waiters.retain(|w| !w.responder.is_closed());
        self.waiters.iter().map(|w| w.deadline).min()
    }

    /// Resolve every waiter whose deadline has passed with a timeout.
    pub fn expire(&mut self, now: Instant, metrics: &mut MetricsSnapshot) -> usize {
        let mut expired = 0;
        let mut idx = 0;
        while idx < self.waiters.len() {
            if self.waiters[idx].deadline <= now {
                let waiter = self.waiters.swap_remove(idx);
                expired += 1;
                metrics.waiters_timed_out += 1;
                if waiter.lines.is_empty() {
                    log::warn!("'{}' timed out after {:?}; no lines received", waiter.spec.name, waiter.spec.timeout);
                } else {
                    log::warn!("'{}' timed out after {:?}; partial lines: {:?}", waiter.spec.name, waiter.spec.timeout, waiter.lines);
                }
                let _ = waiter.responder.send(Err(SerialError::Timeout(waiter.spec.timeout_message)));
            } else {
                idx += 1;
            }
        }
        expired
    }

    /// Fail all waiters, used when the link goes away.
    pub fn reject_all(&mut self, make_error: impl Fn() -> SerialError) -> usize {
        let count = self.waiters.len();
        for waiter in self.waiters.drain(..) {
            let _ = waiter.responder.send(Err(make_error()));
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::session::types::ResponseMatcher;
    use crate::serial::sink::ChannelSink;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn waiter_channel() -> (Responder<CommandResponse>, oneshot::Receiver<Result<CommandResponse, SerialError>>) {
        oneshot::channel()
    }

    fn router() -> LineRouter {
        LineRouter::new(&RouterConfig::default())
    }

    fn spec(success: &str, failure: Option<&str>) -> ResponseSpec {
        let spec = ResponseSpec::new("test", Duration::from_secs(5), ResponseMatcher::contains(success));
        match failure {
            Some(f) => spec.with_failure(ResponseMatcher::contains(f)),
            None => spec,
        }
    }

    #[test]
    fn echo_prefixes_never_reach_the_sink() {
        let sink = ChannelSink::new(16);
        let mut rx = sink.subscribe();
        let mut r = router();
        let mut metrics = MetricsSnapshot::default();
        for line in ["RX Received: SET_INTERVAL:5", "  Text: 'hello'", "Config saved", "   ", "Current interval: 5"] {
            r.route(line, &sink, &mut metrics);
        }
        let delivered: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok()).map(|e| e.text).collect();
        assert_eq!(delivered, vec!["Current interval: 5"]);
        assert_eq!(metrics.lines_suppressed, 3);
        assert_eq!(metrics.events_delivered, 1);
    }

    #[test]
    fn verbatim_command_echo_is_suppressed() {
        let mut r = router();
        r.note_command("GET_INTERVAL");
        assert_eq!(r.classify("GET_INTERVAL"), LineClass::Echo);
        assert_eq!(r.classify("GET_INTERVAL done"), LineClass::Event);
    }

    #[tokio::test]
    async fn first_match_resolves_and_detaches() {
        let sink = ChannelSink::new(16);
        let mut r = router();
        let mut metrics = MetricsSnapshot::default();
        let (tx, rx) = waiter_channel();
        r.register(spec("saved OK", Some("Error")), tx);
        r.route("File /usr/a received and saved OK", &sink, &mut metrics);
        assert_eq!(r.pending(), 0);
        r.route("Error: late", &sink, &mut metrics);
        let response = rx.await.expect("resolved").expect("success");
        assert_eq!(response.last_line(), Some("File /usr/a received and saved OK"));
        assert_eq!(metrics.waiters_completed, 1);
        assert_eq!(metrics.waiters_rejected, 0);
    }

    #[tokio::test]
    async fn failure_marker_rejects_with_snippet() {
        let sink = ChannelSink::new(16);
        let mut r = router();
        let mut metrics = MetricsSnapshot::default();
        let (tx, rx) = waiter_channel();
        r.register(spec("saved OK", Some("Error")).with_snippet_len(10), tx);
        r.route("Error opening /usr/a for write", &sink, &mut metrics);
        match rx.await.expect("resolved") {
            Err(SerialError::RemoteRejected { snippet, .. }) => assert_eq!(snippet, "Error open"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn quiet_lines_still_reach_waiters() {
        let sink = ChannelSink::new(16);
        let mut events = sink.subscribe();
        let mut r = router();
        let mut metrics = MetricsSnapshot::default();
        let (tx, rx) = waiter_channel();
        r.register(spec("saved OK", None), tx);
        r.route("Config saved OK", &sink, &mut metrics);
        assert!(rx.await.expect("resolved").is_ok());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn echoes_do_not_satisfy_waiters() {
        let sink = ChannelSink::new(16);
        let mut r = router();
        let mut metrics = MetricsSnapshot::default();
        let (tx, _rx) = waiter_channel();
        r.register(spec("Error", None), tx);
        r.route("RX Received: Error.txt", &sink, &mut metrics);
        assert_eq!(r.pending(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expire_times_out_exactly_once() {
        let mut r = router();
        let mut metrics = MetricsSnapshot::default();
        let (tx, rx) = waiter_channel();
        r.register(spec("never", None).with_timeout_message("No confirmation received for a.txt"), tx);
        assert_eq!(r.expire(Instant::now(), &mut metrics), 0);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(r.expire(Instant::now(), &mut metrics), 1);
        assert_eq!(r.expire(Instant::now(), &mut metrics), 0);
        match rx.await.expect("resolved") {
            Err(e) => assert_eq!(e.to_string(), "Timeout: No confirmation received for a.txt"),
            Ok(_) => panic!("should time out"),
        }
    }

    #[tokio::test]
    async fn dropped_receivers_are_pruned() {
        let mut r = router();
        let (tx, rx) = waiter_channel();
        r.register(spec("x", None), tx);
        drop(rx);
        assert!(r.next_deadline().is_none());
        assert_eq!(r.pending(), 0);
    }

    #[tokio::test]
    async fn reject_all_on_close() {
        let mut r = router();
        let (tx1, rx1) = waiter_channel();
        let (tx2, rx2) = waiter_channel();
        r.register(spec("a", None), tx1);
        r.register(spec("b", None), tx2);
        assert_eq!(r.reject_all(|| SerialError::Disconnected), 2);
        assert!(matches!(rx1.await, Ok(Err(SerialError::Disconnected))));
        assert!(matches!(rx2.await, Ok(Err(SerialError::Disconnected))));
    }
}
