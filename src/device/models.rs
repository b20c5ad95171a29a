use serde::{Deserialize, Serialize};

use crate::serial::session::{LinkState, SessionInfo};

/// Device connection state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// State as seen through a session's link state.
    pub fn from_link(state: &LinkState) -> Self {
        match state {
            LinkState::Open => ConnectionState::Connected,
            LinkState::Closed { reason: Some(reason) } => ConnectionState::Error(reason.clone()),
            LinkState::Closed { reason: None } => ConnectionState::Disconnected,
        }
    }
}

/// Where the manager last connected, for `reconnect`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkTarget {
    pub port_name: String,
    pub baud_rate: u32,
}

impl From<&SessionInfo> for LinkTarget {
    fn from(info: &SessionInfo) -> Self {
        Self { port_name: info.port_name.clone(), baud_rate: info.baud_rate }
    }
}
