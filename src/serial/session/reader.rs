//! The session task: sole owner of the link, the decode buffer and the
//! waiter registry for one connection.
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;

use super::types::*;
use super::SessionHandle;
use crate::config::LinkConfig;
use crate::serial::framer::LineFramer;
use crate::serial::interface::SerialPortIO;
use crate::serial::router::LineRouter;
use crate::serial::sink::{EventSink, SerialEvent};
use crate::serial::SerialError;

const READ_CHUNK: usize = 512;

pub struct SessionBuilder {
    pub io: Box<dyn SerialPortIO>,
    pub info: SessionInfo,
    pub config: Arc<LinkConfig>,
    pub sink: Arc<dyn EventSink>,
    pub command_capacity: usize,
}

impl SessionBuilder {
    pub fn new(io: Box<dyn SerialPortIO>, info: SessionInfo, config: Arc<LinkConfig>, sink: Arc<dyn EventSink>) -> Self {
        Self { io, info, config, sink, command_capacity: 64 }
    }

    /// Spawn the session task and hand back a cloneable handle to it.
    pub fn build(self) -> SessionHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(self.command_capacity);
        let (state_tx, state_rx) = watch::channel(LinkState::Open);
        let (metrics_tx, metrics_rx) = watch::channel(MetricsSnapshot::default());

        log::info!("Session {} started on {}", self.info.id, self.info.port_name);
        tokio::spawn(session_task(
            self.io,
            self.config.clone(),
            self.sink.clone(),
            cmd_rx,
            state_tx,
            metrics_tx,
        ));

        SessionHandle {
            cmd_tx,
            state_rx,
            metrics_rx,
            exchange_lock: Arc::new(Mutex::new(())),
            info: self.info,
            config: self.config,
            sink: self.sink,
        }
    }
}

pub(crate) async fn session_task(
    mut io: Box<dyn SerialPortIO>,
    config: Arc<LinkConfig>,
    sink: Arc<dyn EventSink>,
    mut cmd_rx: mpsc::Receiver<SessionCommand>,
    state_tx: watch::Sender<LinkState>,
    metrics_tx: watch::Sender<MetricsSnapshot>,
) {
    use tokio::select;

    let mut framer = LineFramer::new();
    let mut router = LineRouter::new(&config.router);
    let mut metrics = MetricsSnapshot::default();
    let mut buf = [0u8; READ_CHUNK];
    let poll_ms = config.read_poll_ms.max(1);

    let close_reason: Option<String> = loop {
        let deadline = router.next_deadline();
        select! {
            maybe_cmd = cmd_rx.recv() => {
                match maybe_cmd {
                    Some(SessionCommand::Write { data, command, responder }) => {
                        if let Some(command) = command {
                            router.note_command(command);
                        }
                        match io.send_data(&data).await {
                            Ok(()) => {
                                metrics.bytes_written += data.len() as u64;
                                let _ = responder.send(Ok(data.len()));
                            }
                            Err(e) => {
                                log::error!("Write failed: {}", e);
                                metrics.last_error = Some(e.to_string());
                                let _ = responder.send(Err(e));
                            }
                        }
                        let _ = metrics_tx.send(metrics.clone());
                    }
                    Some(SessionCommand::DiscardInput { responder }) => {
                        let res = io.discard_input();
                        if res.is_ok() {
                            // A stale partial line must not prefix the next reply.
                            if !framer.is_empty() {
                                log::debug!("Discarding unterminated tail: {:?}", framer.tail_text());
                            }
                            framer.reset();
                            log::debug!("Discarded unread input");
                        }
                        let _ = responder.send(res);
                    }
                    Some(SessionCommand::Subscribe { spec, responder }) => {
                        router.register(spec, responder);
                    }
                    Some(SessionCommand::Shutdown) | None => break None,
                }
            },
            read_res = io.read_data(&mut buf, poll_ms) => {
                match read_res {
                    Ok(n) if n > 0 => {
                        for line in framer.push(&buf[..n]) {
                            metrics.lines_read += 1;
                            router.route(&line, sink.as_ref(), &mut metrics);
                        }
                        metrics.utf8_decode_errors = framer.decode_errors();
                        let _ = metrics_tx.send(metrics.clone());
                    }
                    Ok(_) => {}
                    Err(SerialError::Timeout(_)) => {}
                    Err(e) => {
                        let msg = e.to_string();
                        log::error!("Serial port error: {}", msg);
                        sink.notify(SerialEvent::notice(format!("Port error: {}", msg)));
                        metrics.last_error = Some(msg.clone());
                        let _ = metrics_tx.send(metrics.clone());
                        break Some(msg);
                    }
                }
            },
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(far_future)), if deadline.is_some() => {
                if router.expire(Instant::now(), &mut metrics) > 0 {
                    let _ = metrics_tx.send(metrics.clone());
                }
            }
        }
    };

    // Nobody may write to a closed link; publish the state before anything else.
    let _ = state_tx.send(LinkState::Closed { reason: close_reason.clone() });
    cmd_rx.close();
    let rejected = router.reject_all(|| SerialError::Disconnected);
    if rejected > 0 {
        log::warn!("Rejected {} pending waiter(s) on close", rejected);
    }
    while let Ok(cmd) = cmd_rx.try_recv() {
        reject_command(cmd);
    }
    if !framer.is_empty() {
        log::debug!("Discarding unterminated tail on close: {:?}", framer.tail_text());
    }
    if let Err(e) = io.flush().await {
        log::debug!("Flush on close failed: {}", e);
    }
    log::info!("Session task terminated ({})", close_reason.as_deref().unwrap_or("shutdown"));
}

fn reject_command(cmd: SessionCommand) {
    match cmd {
        SessionCommand::Write { responder, .. } => {
            let _ = responder.send(Err(SerialError::NotConnected));
        }
        SessionCommand::DiscardInput { responder } => {
            let _ = responder.send(Err(SerialError::NotConnected));
        }
        SessionCommand::Subscribe { responder, .. } => {
            let _ = responder.send(Err(SerialError::Disconnected));
        }
        SessionCommand::Shutdown => {}
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400)
}
