pub mod types;
pub mod reader;

pub use reader::SessionBuilder;
pub use types::{CommandResponse, LinkState, MetricsSnapshot, ResponseMatcher, ResponseSpec, SessionCommand, SessionInfo};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, Mutex, OwnedMutexGuard};

use crate::config::LinkConfig;
use crate::serial::sink::{EventSink, SerialEvent};
use crate::serial::{Result, SerialError};

/// Cloneable handle to a running session task.
#[derive(Clone)]
pub struct SessionHandle {
    pub(crate) cmd_tx: mpsc::Sender<SessionCommand>,
    pub(crate) state_rx: watch::Receiver<LinkState>,
    pub(crate) metrics_rx: watch::Receiver<MetricsSnapshot>,
    pub(crate) exchange_lock: Arc<Mutex<()>>,
    pub(crate) info: SessionInfo,
    pub(crate) config: Arc<LinkConfig>,
    pub(crate) sink: Arc<dyn EventSink>,
}

impl SessionHandle {
    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.state_rx.borrow(), LinkState::Open) && !self.cmd_tx.is_closed()
    }

    pub fn state(&self) -> LinkState {
        self.state_rx.borrow().clone()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics_rx.borrow().clone()
    }

    pub fn state_receiver(&self) -> watch::Receiver<LinkState> {
        self.state_rx.clone()
    }

    /// Take the exclusive exchange token. Fails fast when the link is closed.
    pub async fn begin_exchange(&self) -> Result<Exchange> {
        if !self.is_open() {
            return Err(SerialError::NotConnected);
        }
        let guard = self.exchange_lock.clone().lock_owned().await;
        let exchange = Exchange { handle: self.clone(), _guard: guard };
        exchange.ensure_open()?;
        Ok(exchange)
    }

    /// Single command under its own exchange.
    pub async fn send_command(&self, command: &str) -> Result<String> {
        self.begin_exchange().await?.send_command(command).await
    }

    /// Command followed by a bounded wait for a matching response.
    pub async fn request(&self, command: &str, spec: ResponseSpec) -> Result<CommandResponse> {
        self.begin_exchange().await?.request(command, spec).await
    }

    /// Ask the session task to stop and wait until it has closed the link.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Shutdown).await;
        let mut state = self.state_rx.clone();
        let closed = tokio::time::timeout(Duration::from_secs(2), async {
            while matches!(*state.borrow_and_update(), LinkState::Open) {
                if state.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;
        if closed.is_err() {
            log::warn!("Session {} did not close within 2s", self.info.id);
        }
    }
}

/// Exclusive access to the link for one logical exchange. Dropping it
/// releases the link for the next caller.
pub struct Exchange {
    handle: SessionHandle,
    _guard: OwnedMutexGuard<()>,
}

impl Exchange {
    pub fn config(&self) -> &LinkConfig {
        &self.handle.config
    }

    pub fn session(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn notify(&self, event: SerialEvent) {
        self.handle.sink.notify(event);
    }

    pub fn ensure_open(&self) -> Result<()> {
        if self.handle.is_open() {
            Ok(())
        } else {
            Err(SerialError::NotConnected)
        }
    }

    pub async fn discard_input(&self) -> Result<()> {
        self.ensure_open()?;
        let (tx, rx) = oneshot::channel();
        self.dispatch(SessionCommand::DiscardInput { responder: tx }).await?;
        rx.await.map_err(|_| SerialError::NotConnected)?
    }

    /// Write raw bytes. `command` is remembered for echo suppression.
    pub async fn write_raw(&self, data: Vec<u8>, command: Option<String>) -> Result<usize> {
        self.ensure_open()?;
        let (tx, rx) = oneshot::channel();
        self.dispatch(SessionCommand::Write { data, command, responder: tx }).await?;
        rx.await.map_err(|_| SerialError::NotConnected)?
    }

    /// Write one protocol line with the configured terminator.
    pub async fn write_line(&self, line: &str) -> Result<usize> {
        let data = format!("{}{}", line, self.config().line_terminator).into_bytes();
        self.write_raw(data, Some(line.to_string())).await
    }

    /// The command channel: optional input flush, outbound echo, write.
    pub async fn send_command(&self, command: &str) -> Result<String> {
        self.ensure_open()?;
        if self.config().flush_before_send {
            self.discard_input().await?;
        }
        self.send_line(command).await
    }

    /// Like `send_command` but keeps unread input, for follow-up commands
    /// whose predecessors' replies are still being watched.
    pub async fn send_line(&self, command: &str) -> Result<String> {
        self.ensure_open()?;
        log::debug!("Sending command: {:?}", command);
        self.notify(SerialEvent::outbound(command));
        match self.write_line(command).await {
            Ok(_) => Ok(format!("Successfully sent: {}", command)),
            Err(e) => {
                log::error!("Failed to send command \"{}\": {}", command, e);
                Err(e)
            }
        }
    }

    /// Register a waiter. Lines routed after this call are offered to it.
    pub async fn subscribe(&self, spec: ResponseSpec) -> Result<PendingResponse> {
        self.ensure_open()?;
        let name = spec.name.clone();
        let (tx, rx) = oneshot::channel();
        self.dispatch(SessionCommand::Subscribe { spec, responder: tx }).await?;
        Ok(PendingResponse { name, rx })
    }

    /// Subscribe first, then send, so a fast reply cannot be missed.
    pub async fn request(&self, command: &str, spec: ResponseSpec) -> Result<CommandResponse> {
        let pending = self.subscribe(spec).await?;
        self.send_command(command).await?;
        pending.wait().await
    }

    pub async fn pause(&self, ms: u64) {
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    async fn dispatch(&self, cmd: SessionCommand) -> Result<()> {
        self.handle.cmd_tx.send(cmd).await.map_err(|_| SerialError::NotConnected)
    }
}

/// A registered waiter. Dropping it deregisters the waiter.
pub struct PendingResponse {
    name: String,
    rx: oneshot::Receiver<Result<CommandResponse>>,
}

impl PendingResponse {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn wait(self) -> Result<CommandResponse> {
        self.rx.await.map_err(|_| SerialError::Disconnected)?
    }
}
