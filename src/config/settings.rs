use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

// Values measured against the field device firmware
pub const DEFAULT_BAUD_RATE: u32 = 115200;
pub const REMOTE_DIR: &str = "/usr/";
pub const CERT_FILE_NAME: &str = "device_cert.pem.crt";
pub const KEY_FILE_NAME: &str = "private_key.pem.key";
pub const MQTT_TLS_PORT: u16 = 8883;
pub const MAX_RETRIES: u32 = 3;

/// Everything that tunes the link, the router and the scripted flows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LinkConfig {
    pub baud_rate: u32,
    /// The board resets when the port opens; give it time to boot.
    pub open_settle_ms: u64,
    pub read_poll_ms: u64,
    pub line_terminator: String,
    pub flush_before_send: bool,
    pub router: RouterConfig,
    pub upload: UploadConfig,
    pub provisioning: ProvisioningConfig,
    pub commands: CommandConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            open_settle_ms: 2000,
            read_poll_ms: 25,
            line_terminator: "\r\n".to_string(),
            flush_before_send: true,
            router: RouterConfig::default(),
            upload: UploadConfig::default(),
            provisioning: ProvisioningConfig::default(),
            commands: CommandConfig::default(),
        }
    }
}

/// Echo and noise table used by the line router.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RouterConfig {
    /// Firmware echoes; dropped everywhere.
    pub echo_prefixes: Vec<String>,
    /// Hidden from the event sink but still offered to waiters.
    pub quiet_prefixes: Vec<String>,
    /// Treat a line equal to the last sent command as an echo.
    pub suppress_command_echo: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            echo_prefixes: vec!["RX Received".to_string(), "Text: '".to_string()],
            quiet_prefixes: vec!["Config saved".to_string()],
            suppress_command_echo: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UploadConfig {
    pub remote_dir: String,
    /// Pause between the header line and the payload while the firmware
    /// switches into receive mode.
    pub settle_ms: u64,
    pub confirm_timeout_ms: u64,
    /// `{path}` is replaced with the remote file path.
    pub success_template: String,
    pub error_marker: String,
    pub snippet_len: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            remote_dir: REMOTE_DIR.to_string(),
            settle_ms: 1000,
            confirm_timeout_ms: 30_000,
            success_template: "File {path} received and saved OK".to_string(),
            error_marker: "Error".to_string(),
            snippet_len: 200,
        }
    }
}

impl UploadConfig {
    pub fn remote_path(&self, file_name: &str) -> String {
        if self.remote_dir.ends_with('/') {
            format!("{}{}", self.remote_dir, file_name)
        } else {
            format!("{}/{}", self.remote_dir, file_name)
        }
    }

    pub fn success_marker(&self, remote_path: &str) -> String {
        self.success_template.replace("{path}", remote_path)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProvisioningConfig {
    pub max_retries: u32,
    pub cert_file_name: String,
    pub key_file_name: String,
    pub tls_port: u16,
    pub retry_backoff_ms: u64,
    pub verify_retry_backoff_ms: u64,
    pub mkdir_settle_ms: u64,
    pub after_cert_ms: u64,
    pub after_key_ms: u64,
    pub inter_command_ms: u64,
    pub ssl_settle_ms: u64,
    pub config_read_settle_ms: u64,
    pub reinit_settle_ms: u64,
    pub verify_window_ms: u64,
    pub verify_credentials: bool,
    pub verify_tls: bool,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            cert_file_name: CERT_FILE_NAME.to_string(),
            key_file_name: KEY_FILE_NAME.to_string(),
            tls_port: MQTT_TLS_PORT,
            retry_backoff_ms: 2000,
            verify_retry_backoff_ms: 1000,
            mkdir_settle_ms: 1000,
            after_cert_ms: 2000,
            after_key_ms: 3000,
            inter_command_ms: 500,
            ssl_settle_ms: 1000,
            config_read_settle_ms: 1000,
            reinit_settle_ms: 2000,
            verify_window_ms: 5000,
            verify_credentials: true,
            verify_tls: true,
        }
    }
}

/// Pacing for the grouped configuration commands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CommandConfig {
    pub inter_command_ms: u64,
    pub protocol_settle_ms: u64,
    pub mqtt_verify_settle_ms: u64,
    pub verify_window_ms: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            inter_command_ms: 1500,
            protocol_settle_ms: 2000,
            mqtt_verify_settle_ms: 3000,
            verify_window_ms: 5000,
        }
    }
}

impl LinkConfig {
    /// Load a JSON config file; missing fields fall back to defaults.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read link config {}", path.display()))?;
        let config = Self::from_json(&raw)
            .with_context(|| format!("Invalid link config {}", path.display()))?;
        Ok(config)
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let config: LinkConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.baud_rate == 0 {
            bail!("baud_rate must be positive");
        }
        if self.read_poll_ms == 0 {
            bail!("read_poll_ms must be positive");
        }
        if self.line_terminator.is_empty() {
            bail!("line_terminator must not be empty");
        }
        if self.upload.confirm_timeout_ms == 0 {
            bail!("upload.confirm_timeout_ms must be positive");
        }
        if !self.upload.success_template.contains("{path}") {
            bail!("upload.success_template must contain {{path}}");
        }
        if self.provisioning.max_retries == 0 {
            bail!("provisioning.max_retries must be at least 1");
        }
        if self.provisioning.cert_file_name.is_empty() || self.provisioning.key_file_name.is_empty() {
            bail!("provisioning artifact names must not be empty");
        }
        Ok(())
    }

    pub fn open_settle(&self) -> Duration {
        Duration::from_millis(self.open_settle_ms)
    }
}
