pub mod sequencer;

pub use sequencer::provision_mqtt_credentials;

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::serial::{FileSource, SerialError, UploadReport};

pub const SUCCESS_MESSAGE: &str =
    "Certificates uploaded and MQTT configured successfully. SSL applied and client reinitialized.";

/// The scripted steps, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProvisioningStep {
    CreateDirectory,
    UploadCertificate,
    UploadKey,
    SetCredentialPaths,
    EnableTls,
    Reinitialize,
    StatusQuery,
}

impl fmt::Display for ProvisioningStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProvisioningStep::CreateDirectory => "directory creation",
            ProvisioningStep::UploadCertificate => "certificate upload",
            ProvisioningStep::UploadKey => "private key upload",
            ProvisioningStep::SetCredentialPaths => "MQTT certificate/key configuration",
            ProvisioningStep::EnableTls => "MQTT SSL configuration",
            ProvisioningStep::Reinitialize => "MQTT reinitialization",
            ProvisioningStep::StatusQuery => "MQTT status query",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("{step} failed after {attempts} attempt(s): {source}")]
    StepFailed {
        step: ProvisioningStep,
        attempts: u32,
        source: SerialError,
    },

    #[error(transparent)]
    Serial(#[from] SerialError),
}

impl ProvisionError {
    pub fn step(&self) -> Option<ProvisioningStep> {
        match self {
            ProvisionError::StepFailed { step, .. } => Some(*step),
            ProvisionError::Serial(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProvisionError>;

/// Credential material to install on the device.
#[derive(Debug, Clone)]
pub struct ProvisioningRequest {
    pub certificate: Vec<u8>,
    pub private_key: Vec<u8>,
}

impl ProvisioningRequest {
    pub fn new(certificate: Vec<u8>, private_key: Vec<u8>) -> Self {
        Self { certificate, private_key }
    }

    /// Read both artifacts before touching the link.
    pub async fn from_files(source: &dyn FileSource, certificate: &Path, private_key: &Path) -> Result<Self> {
        let certificate = source.read_all(certificate).await?;
        let private_key = source.read_all(private_key).await?;
        Ok(Self { certificate, private_key })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    pub step: ProvisioningStep,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProvisioningReport {
    pub steps: Vec<StepRecord>,
    pub certificate: UploadReport,
    pub private_key: UploadReport,
    /// Final status query result; informational only.
    pub status: Option<String>,
}

impl ProvisioningReport {
    pub fn attempts(&self, step: ProvisioningStep) -> Option<u32> {
        self.steps.iter().find(|r| r.step == step).map(|r| r.attempts)
    }
}

impl fmt::Display for ProvisioningReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(SUCCESS_MESSAGE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_failure_names_step_and_attempts() {
        let err = ProvisionError::StepFailed {
            step: ProvisioningStep::UploadCertificate,
            attempts: 3,
            source: SerialError::Timeout("No confirmation received for device_cert.pem.crt".into()),
        };
        assert_eq!(
            err.to_string(),
            "certificate upload failed after 3 attempt(s): Timeout: No confirmation received for device_cert.pem.crt"
        );
        assert_eq!(err.step(), Some(ProvisioningStep::UploadCertificate));
    }

    #[test]
    fn serial_errors_pass_through() {
        let err: ProvisionError = SerialError::NotConnected.into();
        assert_eq!(err.to_string(), "Port not open!");
        assert_eq!(err.step(), None);
    }
}
