use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use super::{ConnectionState, DeviceError, LinkTarget, Result};
use crate::config::LinkConfig;
use crate::serial::session::SessionInfo;
use crate::serial::{
    DeviceProtocol, EventSink, FileSource, FsFileSource, LinkProvider, NativeLinkProvider, SerialDeviceInfo,
    SessionBuilder, SessionHandle,
};

/// Owns the link lifecycle. At most one session is live at a time; opening a
/// new one closes the previous one first.
pub struct DeviceManager {
    provider: Arc<dyn LinkProvider>,
    files: Arc<dyn FileSource>,
    config: Arc<LinkConfig>,
    sink: Arc<dyn EventSink>,
    session: Arc<Mutex<Option<SessionHandle>>>,
    state: Arc<RwLock<ConnectionState>>,
    last_target: Arc<RwLock<Option<LinkTarget>>>,
}

impl DeviceManager {
    pub fn new(config: LinkConfig, sink: Arc<dyn EventSink>) -> Self {
        Self::with_provider(Arc::new(NativeLinkProvider), config, sink)
    }

    pub fn with_provider(provider: Arc<dyn LinkProvider>, config: LinkConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            provider,
            files: Arc::new(FsFileSource),
            config: Arc::new(config),
            sink,
            session: Arc::new(Mutex::new(None)),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            last_target: Arc::new(RwLock::new(None)),
        }
    }

    pub fn with_file_source(mut self, files: Arc<dyn FileSource>) -> Self {
        self.files = files;
        self
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn file_source(&self) -> Arc<dyn FileSource> {
        self.files.clone()
    }

    pub fn list_ports(&self) -> Result<Vec<SerialDeviceInfo>> {
        Ok(self.provider.list()?)
    }

    /// Open `port_name`, wait for the board to come out of reset and start a
    /// session with a fresh decode buffer.
    pub async fn connect(&self, port_name: &str, baud_rate: u32) -> Result<SessionInfo> {
        if port_name.trim().is_empty() {
            return Err(DeviceError::InvalidConfiguration("Please select a port.".to_string()));
        }
        if baud_rate == 0 {
            return Err(DeviceError::InvalidConfiguration("Please select a valid baud rate.".to_string()));
        }

        let mut session_guard = self.session.lock().await;
        if let Some(previous) = session_guard.take() {
            log::info!("Closing {} before opening {}", previous.info().port_name, port_name);
            previous.shutdown().await;
        }

        self.set_state(ConnectionState::Connecting).await;
        log::info!("Attempting to connect to port: {} at {} baud", port_name, baud_rate);

        let io = match self.provider.open(port_name, baud_rate).await {
            Ok(io) => io,
            Err(e) => {
                let error_msg = format!("Connection failed: {}", e);
                log::error!("{}", error_msg);
                self.set_state(ConnectionState::Error(error_msg)).await;
                return Err(DeviceError::SerialError(e));
            }
        };

        tokio::time::sleep(self.config.open_settle()).await;

        let info = SessionInfo::new(port_name, baud_rate);
        let handle = SessionBuilder::new(io, info.clone(), self.config.clone(), self.sink.clone()).build();
        *session_guard = Some(handle);
        *self.last_target.write().await = Some(LinkTarget::from(&info));
        self.set_state(ConnectionState::Connected).await;

        log::info!("Connected to {} at {} baud (session {})", port_name, baud_rate, info.id);
        Ok(info)
    }

    /// Close the live session. Pending waiters are rejected by the session
    /// task on its way out.
    pub async fn disconnect(&self) -> Result<()> {
        let mut session_guard = self.session.lock().await;
        match session_guard.take() {
            Some(handle) => {
                handle.shutdown().await;
                self.set_state(ConnectionState::Disconnected).await;
                log::info!("Disconnected from {}", handle.info().port_name);
                Ok(())
            }
            None => Err(DeviceError::NotConnected),
        }
    }

    /// Reopen the last port at the last baud rate.
    pub async fn reconnect(&self) -> Result<SessionInfo> {
        let target = self.last_target.read().await.clone().ok_or(DeviceError::NoPreviousConnection)?;
        log::info!("Reconnecting to {}", target.port_name);
        self.connect(&target.port_name, target.baud_rate).await
    }

    /// The live session, if its link is still open.
    pub async fn session(&self) -> Result<SessionHandle> {
        let session_guard = self.session.lock().await;
        match session_guard.as_ref() {
            Some(handle) if handle.is_open() => Ok(handle.clone()),
            _ => Err(DeviceError::NotConnected),
        }
    }

    pub async fn protocol(&self) -> Result<DeviceProtocol> {
        Ok(DeviceProtocol::new(self.session().await?))
    }

    pub async fn is_connected(&self) -> bool {
        self.connection_state().await.is_connected()
    }

    /// A session that died on an I/O error reports `Error` here.
    pub async fn connection_state(&self) -> ConnectionState {
        let state = self.state.read().await.clone();
        if !state.is_connected() {
            return state;
        }
        match self.session.lock().await.as_ref() {
            Some(handle) => ConnectionState::from_link(&handle.state()),
            None => ConnectionState::Disconnected,
        }
    }

    pub async fn session_info(&self) -> Option<SessionInfo> {
        self.session.lock().await.as_ref().map(|h| h.info().clone())
    }

    pub async fn last_target(&self) -> Option<LinkTarget> {
        self.last_target.read().await.clone()
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }
}
