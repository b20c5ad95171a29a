pub mod interface;
pub mod framer;
pub mod router;
pub mod sink;
pub mod session;
pub mod upload;
pub mod protocol;

pub use interface::{LinkProvider, NativeLinkProvider, NativeSerialPort, SerialInterface, SerialPortIO};
pub use framer::LineFramer;
pub use router::{EchoTable, LineClass, LineRouter};
pub use sink::{ChannelSink, EventKind, EventSink, LogSink, SerialEvent};
pub use session::{Exchange, PendingResponse, SessionBuilder, SessionHandle};
pub use upload::{FileSource, FsFileSource, UploadPhase, UploadReport};
pub use protocol::DeviceProtocol;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SerialDeviceInfo {
    pub port_name: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Port not open!")]
    NotConnected,

    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("{context}: {snippet}")]
    RemoteRejected { context: String, snippet: String },

    #[error("{0}")]
    Validation(String),

    #[error("Port disconnected")]
    Disconnected,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

impl SerialError {
    /// Transient failures that a fresh attempt of the same exchange may clear.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SerialError::Timeout(_)
                | SerialError::RemoteRejected { .. }
                | SerialError::IoError(_)
                | SerialError::SerialportError(_)
                | SerialError::ConnectionFailed(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SerialError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, SerialError>;
