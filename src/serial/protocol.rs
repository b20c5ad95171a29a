//! Typed configuration commands for the field device.
//!
//! Every argument is validated before anything touches the link. Grouped
//! `apply_*` calls hold one exchange for the whole group so nothing else can
//! interleave with the firmware's reconfiguration.
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::session::{Exchange, ResponseMatcher, ResponseSpec, SessionHandle};
use super::{Result, SerialError};

static DEVICE_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());
static HOST_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9.-]+$").unwrap());
static URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^https?://.+$").unwrap());

pub const MQTT_NOT_ACTIVE: &str = "MQTT not active";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransportProtocol {
    #[serde(rename = "FTP")]
    Ftp,
    #[serde(rename = "MQTT")]
    Mqtt,
    #[serde(rename = "HTTP")]
    Http,
}

impl TransportProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportProtocol::Ftp => "FTP",
            TransportProtocol::Mqtt => "MQTT",
            TransportProtocol::Http => "HTTP",
        }
    }

    fn config_query(&self) -> &'static str {
        match self {
            TransportProtocol::Ftp => "GET_FTP_CONFIG",
            TransportProtocol::Mqtt => "GET_MQTT_CONFIG",
            TransportProtocol::Http => "GET_HTTP_CONFIG",
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportProtocol {
    type Err = SerialError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "FTP" => Ok(TransportProtocol::Ftp),
            "MQTT" => Ok(TransportProtocol::Mqtt),
            "HTTP" => Ok(TransportProtocol::Http),
            _ => Err(SerialError::Validation("Invalid protocol".to_string())),
        }
    }
}

fn invalid(message: impl Into<String>) -> SerialError {
    SerialError::Validation(message.into())
}

/// Reject arguments that would break line framing.
pub fn validate_arg(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(invalid(format!("{} must not be empty", what)));
    }
    if value.contains(['\r', '\n']) {
        return Err(invalid(format!("{} must not contain line breaks", what)));
    }
    Ok(())
}

pub fn validate_device_id(id: &str) -> Result<()> {
    if DEVICE_ID_RE.is_match(id) {
        Ok(())
    } else {
        Err(invalid("Invalid device ID"))
    }
}

pub fn validate_host(what: &str, host: &str) -> Result<()> {
    if HOST_RE.is_match(host) {
        Ok(())
    } else {
        Err(invalid(format!("Invalid {} host format.", what)))
    }
}

pub fn validate_url(url: &str) -> Result<()> {
    if URL_RE.is_match(url) && !url.contains(['\r', '\n']) {
        Ok(())
    } else {
        Err(invalid("Invalid HTTP URL format."))
    }
}

pub fn validate_port(port: u16) -> Result<u16> {
    if port == 0 {
        Err(invalid("Invalid port"))
    } else {
        Ok(port)
    }
}

/// Parse a port number typed by an operator.
pub fn parse_port(raw: &str) -> Result<u16> {
    raw.trim().parse::<u16>().map_err(|_| invalid("Invalid port")).and_then(validate_port)
}

/// Parse a reporting interval in whole seconds.
pub fn parse_interval(raw: &str) -> Result<u32> {
    match raw.trim().parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(invalid("Invalid interval")),
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn present_secret(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FtpSettings {
    pub host: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub port: Option<u16>,
}

impl FtpSettings {
    /// Commands in the order the firmware expects them.
    pub fn commands(&self) -> Result<Vec<String>> {
        let mut commands = Vec::new();
        if let Some(host) = present(&self.host) {
            validate_host("FTP", host)?;
            commands.push(format!("SET_FTP_HOST:{}", host));
        }
        if let Some(user) = present(&self.user) {
            validate_arg("FTP user", user)?;
            commands.push(format!("SET_FTP_USER:{}", user));
        }
        if let Some(password) = present_secret(&self.password) {
            validate_arg("FTP password", password)?;
            commands.push(format!("SET_FTP_PASS:{}", password));
        }
        if let Some(port) = self.port {
            commands.push(format!("SET_FTP_PORT:{}", validate_port(port)?));
        }
        if commands.is_empty() {
            return Err(invalid("Please enter at least one FTP configuration field."));
        }
        Ok(commands)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MqttSettings {
    pub broker: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub port: Option<u16>,
    pub ssl: Option<bool>,
}

impl MqttSettings {
    pub fn commands(&self) -> Result<Vec<String>> {
        let mut commands = Vec::new();
        // TLS mode goes first; the broker settings are read under it.
        if let Some(ssl) = self.ssl {
            commands.push(format!("SET_MQTT_SSL:{}", if ssl { "ON" } else { "OFF" }));
        }
        if let Some(broker) = present(&self.broker) {
            validate_host("MQTT broker", broker).map_err(|_| invalid("Invalid MQTT broker format."))?;
            commands.push(format!("SET_MQTT_BROKER:{}", broker));
        }
        if let Some(user) = present(&self.user) {
            validate_arg("MQTT user", user)?;
            commands.push(format!("SET_MQTT_USER:{}", user));
        }
        if let Some(password) = present_secret(&self.password) {
            validate_arg("MQTT password", password)?;
            commands.push(format!("SET_MQTT_PASS:{}", password));
        }
        if let Some(port) = self.port {
            commands.push(format!("SET_MQTT_PORT:{}", validate_port(port)?));
        }
        // TLS left off is the unticked default, not a field the user entered.
        let only_tls_off = self.ssl == Some(false) && commands.len() == 1;
        if commands.is_empty() || only_tls_off {
            return Err(invalid("Please enter at least one MQTT configuration field."));
        }
        Ok(commands)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HttpSettings {
    pub url: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl HttpSettings {
    pub fn commands(&self) -> Result<Vec<String>> {
        let url = present(&self.url);
        let user = present(&self.user);
        let password = present_secret(&self.password);
        if url.is_none() && user.is_none() && password.is_none() {
            return Err(invalid("Please enter at least one HTTP configuration field."));
        }

        let mut commands = Vec::new();
        if let Some(url) = url {
            validate_url(url)?;
            commands.push(format!("SET_HTTP_URL:{}", url));
        }
        // Credentials only travel as a pair.
        if let (Some(user), Some(password)) = (user, password) {
            validate_arg("HTTP user", user)?;
            validate_arg("HTTP password", password)?;
            commands.push(format!("SET_HTTP_AUTH:{}:{}", user, password));
        }
        Ok(commands)
    }
}

/// Validated configuration commands over a session.
#[derive(Clone)]
pub struct DeviceProtocol {
    session: SessionHandle,
}

impl DeviceProtocol {
    pub fn new(session: SessionHandle) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    /// Pass-through for commands typed by the operator.
    pub async fn send_raw(&self, command: &str) -> Result<String> {
        validate_arg("Command", command)?;
        self.session.send_command(command).await
    }

    pub async fn set_device_id(&self, id: &str) -> Result<String> {
        validate_device_id(id.trim())?;
        self.session.send_command(&format!("SET_DEVICE_ID:{}", id.trim())).await
    }

    pub async fn get_device_id(&self) -> Result<String> {
        self.session.send_command("GET_DEVICE_ID").await
    }

    pub async fn set_interval(&self, seconds: u32) -> Result<String> {
        if seconds == 0 {
            return Err(invalid("Invalid interval"));
        }
        self.session.send_command(&format!("SET_INTERVAL:{}", seconds)).await
    }

    pub async fn get_interval(&self) -> Result<String> {
        self.session.send_command("GET_INTERVAL").await
    }

    pub async fn set_protocol(&self, protocol: TransportProtocol) -> Result<String> {
        self.session.send_command(&format!("SET_PROTOCOL:{}", protocol)).await
    }

    pub async fn set_ftp_host(&self, host: &str) -> Result<String> {
        validate_host("FTP", host)?;
        self.session.send_command(&format!("SET_FTP_HOST:{}", host)).await
    }

    pub async fn set_ftp_user(&self, user: &str) -> Result<String> {
        validate_arg("FTP user", user)?;
        self.session.send_command(&format!("SET_FTP_USER:{}", user)).await
    }

    pub async fn set_ftp_password(&self, password: &str) -> Result<String> {
        validate_arg("FTP password", password)?;
        self.session.send_command(&format!("SET_FTP_PASS:{}", password)).await
    }

    pub async fn set_ftp_port(&self, port: u16) -> Result<String> {
        self.session.send_command(&format!("SET_FTP_PORT:{}", validate_port(port)?)).await
    }

    pub async fn get_ftp_config(&self) -> Result<String> {
        self.session.send_command("GET_FTP_CONFIG").await
    }

    pub async fn set_mqtt_broker(&self, broker: &str) -> Result<String> {
        validate_host("MQTT broker", broker).map_err(|_| invalid("Invalid MQTT broker format."))?;
        self.session.send_command(&format!("SET_MQTT_BROKER:{}", broker)).await
    }

    pub async fn set_mqtt_user(&self, user: &str) -> Result<String> {
        validate_arg("MQTT user", user)?;
        self.session.send_command(&format!("SET_MQTT_USER:{}", user)).await
    }

    pub async fn set_mqtt_password(&self, password: &str) -> Result<String> {
        validate_arg("MQTT password", password)?;
        self.session.send_command(&format!("SET_MQTT_PASS:{}", password)).await
    }

    pub async fn set_mqtt_port(&self, port: u16) -> Result<String> {
        self.session.send_command(&format!("SET_MQTT_PORT:{}", validate_port(port)?)).await
    }

    pub async fn set_mqtt_cert(&self, remote_path: &str) -> Result<String> {
        validate_arg("Certificate path", remote_path)?;
        self.session.send_command(&format!("SET_MQTT_CERT:{}", remote_path)).await
    }

    pub async fn set_mqtt_key(&self, remote_path: &str) -> Result<String> {
        validate_arg("Key path", remote_path)?;
        self.session.send_command(&format!("SET_MQTT_KEY:{}", remote_path)).await
    }

    pub async fn set_mqtt_ssl(&self, enabled: bool) -> Result<String> {
        self.session
            .send_command(&format!("SET_MQTT_SSL:{}", if enabled { "ON" } else { "OFF" }))
            .await
    }

    pub async fn get_mqtt_config(&self) -> Result<String> {
        self.session.send_command("GET_MQTT_CONFIG").await
    }

    pub async fn set_http_url(&self, url: &str) -> Result<String> {
        validate_url(url)?;
        self.session.send_command(&format!("SET_HTTP_URL:{}", url)).await
    }

    pub async fn set_http_auth(&self, user: &str, password: &str) -> Result<String> {
        validate_arg("HTTP user", user)?;
        validate_arg("HTTP password", password)?;
        self.session.send_command(&format!("SET_HTTP_AUTH:{}:{}", user, password)).await
    }

    pub async fn get_http_config(&self) -> Result<String> {
        self.session.send_command("GET_HTTP_CONFIG").await
    }

    pub async fn set_tcp_host(&self, host: &str) -> Result<String> {
        validate_host("TCP", host)?;
        self.session.send_command(&format!("SET_TCP_HOST:{}", host)).await
    }

    pub async fn set_tcp_port(&self, port: u16) -> Result<String> {
        self.session.send_command(&format!("SET_TCP_PORT:{}", validate_port(port)?)).await
    }

    pub async fn get_tcp_config(&self) -> Result<String> {
        self.session.send_command("GET_TCP_CONFIG").await
    }

    pub async fn set_sensor_type(&self, sensor_type: &str) -> Result<String> {
        validate_arg("Sensor type", sensor_type)?;
        self.session.send_command(&format!("SET_SENSOR_TYPE:{}", sensor_type)).await
    }

    pub async fn set_sensor_format(&self, format: &str) -> Result<String> {
        validate_arg("Sensor format", format)?;
        self.session.send_command(&format!("SET_SENSOR_FORMAT:{}", format)).await
    }

    pub async fn get_sensor_config(&self) -> Result<String> {
        self.session.send_command("GET_SENSOR_CONFIG").await
    }

    pub async fn make_dir(&self, remote_dir: &str) -> Result<String> {
        validate_arg("Directory", remote_dir)?;
        self.session.send_command(&format!("MKDIR:{}", remote_dir)).await
    }

    pub async fn apply_ftp_config(&self, settings: &FtpSettings) -> Result<Vec<String>> {
        let commands = settings.commands()?;
        let exchange = self.session.begin_exchange().await?;
        apply_group(&exchange, TransportProtocol::Ftp, &commands).await
    }

    pub async fn apply_mqtt_config(&self, settings: &MqttSettings) -> Result<Vec<String>> {
        let commands = settings.commands()?;
        let exchange = self.session.begin_exchange().await?;
        apply_group(&exchange, TransportProtocol::Mqtt, &commands).await
    }

    pub async fn apply_http_config(&self, settings: &HttpSettings) -> Result<Vec<String>> {
        let commands = settings.commands()?;
        let exchange = self.session.begin_exchange().await?;
        apply_group(&exchange, TransportProtocol::Http, &commands).await
    }
}

/// Send a group of set commands, switch the active protocol and read the
/// resulting configuration back. Stops at the first failed command.
async fn apply_group(exchange: &Exchange, protocol: TransportProtocol, commands: &[String]) -> Result<Vec<String>> {
    let pacing = exchange.config().commands.clone();
    let mut results = Vec::with_capacity(commands.len() + 2);

    log::info!("Applying {} {} setting(s)", commands.len(), protocol);
    for command in commands {
        results.push(exchange.send_command(command).await?);
        exchange.pause(pacing.inter_command_ms).await;
    }

    results.push(exchange.send_command(&format!("SET_PROTOCOL:{}", protocol)).await?);

    if protocol == TransportProtocol::Mqtt {
        exchange.pause(pacing.mqtt_verify_settle_ms).await;
        results.push(verify_mqtt_active(exchange, Duration::from_millis(pacing.verify_window_ms)).await?);
    } else {
        exchange.pause(pacing.protocol_settle_ms).await;
        results.push(exchange.send_command(protocol.config_query()).await?);
    }
    Ok(results)
}

/// Watch for the firmware complaining that MQTT did not come up.
/// Silence within the window counts as success.
async fn verify_mqtt_active(exchange: &Exchange, window: Duration) -> Result<String> {
    let spec = ResponseSpec::new("MQTT activation check", window, ResponseMatcher::contains(MQTT_NOT_ACTIVE))
        .with_snippet_len(exchange.config().upload.snippet_len);
    let snippet_len = spec.snippet_len;
    let pending = exchange.subscribe(spec).await?;
    let sent = exchange.send_command(TransportProtocol::Mqtt.config_query()).await?;

    match pending.wait().await {
        Ok(response) => {
            let snippet: String = response.lines.join("\n").chars().take(snippet_len).collect();
            log::warn!("MQTT protocol not active after SET_PROTOCOL: {}", snippet);
            Err(SerialError::RemoteRejected {
                context: "MQTT protocol not active after setting. Please check device.".to_string(),
                snippet,
            })
        }
        Err(e) if e.is_timeout() => Ok(sent),
        Err(e) => Err(e),
    }
}
