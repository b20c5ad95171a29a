pub mod manager;
pub mod models;

pub use manager::DeviceManager;
pub use models::*;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Port not open!")]
    NotConnected,

    #[error("No previous connection to restore")]
    NoPreviousConnection,

    #[error("Invalid device configuration: {0}")]
    InvalidConfiguration(String),

    #[error("{0}")]
    SerialError(#[from] crate::serial::SerialError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DeviceError>;
