//! Operator-facing operations. A GUI shell binds these to its IPC layer; every
//! result is either a display message or an error string, never a panic.
use std::future::Future;
use std::path::Path;

use crate::device::{DeviceError, DeviceManager};
use crate::provisioning::{provision_mqtt_credentials, ProvisioningRequest};
use crate::serial::protocol::{
    parse_interval, parse_port, FtpSettings, HttpSettings, MqttSettings, TransportProtocol,
};
use crate::serial::upload::{upload_file as send_file, upload_name};
use crate::serial::{DeviceProtocol, SerialError};

/// Text for a failed single command, in the wording operators know.
fn command_error(e: SerialError) -> String {
    match e {
        SerialError::NotConnected | SerialError::Validation(_) => e.to_string(),
        other => format!("Failed to send data: {}", other),
    }
}

fn device_error(e: DeviceError) -> String {
    match e {
        DeviceError::SerialError(inner) => command_error(inner),
        other => other.to_string(),
    }
}

async fn with_protocol<F, Fut, T>(device_manager: &DeviceManager, f: F) -> Result<T, String>
where
    F: FnOnce(DeviceProtocol) -> Fut,
    Fut: Future<Output = crate::serial::Result<T>>,
{
    let protocol = device_manager.protocol().await.map_err(device_error)?;
    f(protocol).await.map_err(command_error)
}

/// Names of the serial ports the OS reports.
pub async fn list_ports(device_manager: &DeviceManager) -> Result<Vec<String>, String> {
    device_manager
        .list_ports()
        .map(|ports| ports.into_iter().map(|p| p.port_name).collect())
        .map_err(|e| format!("Failed to list ports: {}", e))
}

pub async fn connect_port(device_manager: &DeviceManager, port_name: &str, baud_rate: Option<u32>) -> Result<String, String> {
    let baud_rate = baud_rate.unwrap_or(device_manager.config().baud_rate);
    match device_manager.connect(port_name, baud_rate).await {
        Ok(info) => Ok(format!("Connected to {} at {} baud", info.port_name, info.baud_rate)),
        Err(DeviceError::InvalidConfiguration(msg)) => Err(msg),
        Err(e) => Err(format!("Failed to connect to {}: {}", port_name, e)),
    }
}

pub async fn disconnect_port(device_manager: &DeviceManager) -> Result<String, String> {
    match device_manager.disconnect().await {
        Ok(()) => Ok("Disconnected from port.".to_string()),
        Err(DeviceError::NotConnected) => Ok("No port to disconnect.".to_string()),
        Err(e) => Err(format!("Failed to disconnect: {}", e)),
    }
}

pub async fn reconnect_port(device_manager: &DeviceManager) -> Result<String, String> {
    device_manager
        .reconnect()
        .await
        .map(|info| format!("Connected to {} at {} baud", info.port_name, info.baud_rate))
        .map_err(|e| format!("Failed to reconnect: {}", e))
}

/// Raw command typed by the operator.
pub async fn send_data(device_manager: &DeviceManager, message: &str) -> Result<String, String> {
    with_protocol(device_manager, |p| async move { p.send_raw(message).await }).await
}

pub async fn set_device_id(device_manager: &DeviceManager, device_id: &str) -> Result<String, String> {
    with_protocol(device_manager, |p| async move { p.set_device_id(device_id).await }).await
}

pub async fn get_device_id(device_manager: &DeviceManager) -> Result<String, String> {
    with_protocol(device_manager, |p| async move { p.get_device_id().await }).await
}

pub async fn set_interval(device_manager: &DeviceManager, interval: &str) -> Result<String, String> {
    let seconds = parse_interval(interval).map_err(command_error)?;
    with_protocol(device_manager, |p| async move { p.set_interval(seconds).await }).await
}

pub async fn get_interval(device_manager: &DeviceManager) -> Result<String, String> {
    with_protocol(device_manager, |p| async move { p.get_interval().await }).await
}

pub async fn set_protocol(device_manager: &DeviceManager, protocol: &str) -> Result<String, String> {
    let protocol: TransportProtocol = protocol.parse().map_err(command_error)?;
    with_protocol(device_manager, |p| async move { p.set_protocol(protocol).await }).await
}

pub async fn set_ftp_host(device_manager: &DeviceManager, host: &str) -> Result<String, String> {
    with_protocol(device_manager, |p| async move { p.set_ftp_host(host).await }).await
}

pub async fn set_ftp_user(device_manager: &DeviceManager, user: &str) -> Result<String, String> {
    with_protocol(device_manager, |p| async move { p.set_ftp_user(user).await }).await
}

pub async fn set_ftp_password(device_manager: &DeviceManager, password: &str) -> Result<String, String> {
    with_protocol(device_manager, |p| async move { p.set_ftp_password(password).await }).await
}

pub async fn set_ftp_port(device_manager: &DeviceManager, port: &str) -> Result<String, String> {
    let port = parse_port(port).map_err(command_error)?;
    with_protocol(device_manager, |p| async move { p.set_ftp_port(port).await }).await
}

pub async fn get_ftp_config(device_manager: &DeviceManager) -> Result<String, String> {
    with_protocol(device_manager, |p| async move { p.get_ftp_config().await }).await
}

pub async fn set_mqtt_broker(device_manager: &DeviceManager, broker: &str) -> Result<String, String> {
    with_protocol(device_manager, |p| async move { p.set_mqtt_broker(broker).await }).await
}

pub async fn set_mqtt_user(device_manager: &DeviceManager, user: &str) -> Result<String, String> {
    with_protocol(device_manager, |p| async move { p.set_mqtt_user(user).await }).await
}

pub async fn set_mqtt_password(device_manager: &DeviceManager, password: &str) -> Result<String, String> {
    with_protocol(device_manager, |p| async move { p.set_mqtt_password(password).await }).await
}

pub async fn set_mqtt_port(device_manager: &DeviceManager, port: &str) -> Result<String, String> {
    let port = parse_port(port).map_err(command_error)?;
    with_protocol(device_manager, |p| async move { p.set_mqtt_port(port).await }).await
}

pub async fn set_mqtt_ca_cert(device_manager: &DeviceManager, remote_path: &str) -> Result<String, String> {
    with_protocol(device_manager, |p| async move { p.set_mqtt_cert(remote_path).await }).await
}

pub async fn set_mqtt_client_key(device_manager: &DeviceManager, remote_path: &str) -> Result<String, String> {
    with_protocol(device_manager, |p| async move { p.set_mqtt_key(remote_path).await }).await
}

pub async fn set_mqtt_ssl(device_manager: &DeviceManager, enabled: bool) -> Result<String, String> {
    with_protocol(device_manager, |p| async move { p.set_mqtt_ssl(enabled).await }).await
}

pub async fn get_mqtt_config(device_manager: &DeviceManager) -> Result<String, String> {
    with_protocol(device_manager, |p| async move { p.get_mqtt_config().await }).await
}

pub async fn set_http_url(device_manager: &DeviceManager, url: &str) -> Result<String, String> {
    with_protocol(device_manager, |p| async move { p.set_http_url(url).await }).await
}

/// `auth` is `user:password`.
pub async fn set_http_auth(device_manager: &DeviceManager, auth: &str) -> Result<String, String> {
    let (user, password) = auth.split_once(':').ok_or_else(|| "Invalid HTTP auth format.".to_string())?;
    with_protocol(device_manager, |p| async move { p.set_http_auth(user, password).await }).await
}

pub async fn get_http_config(device_manager: &DeviceManager) -> Result<String, String> {
    with_protocol(device_manager, |p| async move { p.get_http_config().await }).await
}

pub async fn set_tcp_host(device_manager: &DeviceManager, host: &str) -> Result<String, String> {
    with_protocol(device_manager, |p| async move { p.set_tcp_host(host).await }).await
}

pub async fn set_tcp_port(device_manager: &DeviceManager, port: &str) -> Result<String, String> {
    let port = parse_port(port).map_err(command_error)?;
    with_protocol(device_manager, |p| async move { p.set_tcp_port(port).await }).await
}

pub async fn get_tcp_config(device_manager: &DeviceManager) -> Result<String, String> {
    with_protocol(device_manager, |p| async move { p.get_tcp_config().await }).await
}

pub async fn set_sensor_type(device_manager: &DeviceManager, sensor_type: &str) -> Result<String, String> {
    with_protocol(device_manager, |p| async move { p.set_sensor_type(sensor_type).await }).await
}

pub async fn set_sensor_format(device_manager: &DeviceManager, format: &str) -> Result<String, String> {
    with_protocol(device_manager, |p| async move { p.set_sensor_format(format).await }).await
}

pub async fn get_sensor_config(device_manager: &DeviceManager) -> Result<String, String> {
    with_protocol(device_manager, |p| async move { p.get_sensor_config().await }).await
}

pub async fn make_dir(device_manager: &DeviceManager, remote_dir: &str) -> Result<String, String> {
    with_protocol(device_manager, |p| async move { p.make_dir(remote_dir).await }).await
}

/// Grouped FTP settings followed by `SET_PROTOCOL:FTP`. Returns one message
/// per command sent.
pub async fn apply_ftp_config(device_manager: &DeviceManager, settings: &FtpSettings) -> Result<Vec<String>, String> {
    with_protocol(device_manager, |p| async move { p.apply_ftp_config(settings).await }).await
}

pub async fn apply_mqtt_config(device_manager: &DeviceManager, settings: &MqttSettings) -> Result<Vec<String>, String> {
    with_protocol(device_manager, |p| async move { p.apply_mqtt_config(settings).await }).await
}

pub async fn apply_http_config(device_manager: &DeviceManager, settings: &HttpSettings) -> Result<Vec<String>, String> {
    with_protocol(device_manager, |p| async move { p.apply_http_config(settings).await }).await
}

/// Upload a local file to `/usr/<base name>`.
pub async fn upload_file(device_manager: &DeviceManager, path: &Path) -> Result<String, String> {
    let session = device_manager.session().await.map_err(device_error)?;
    let file_name = upload_name(path).map_err(|e| e.to_string())?;

    let result: crate::serial::Result<_> = async {
        let payload = device_manager.file_source().read_all(path).await?;
        let exchange = session.begin_exchange().await?;
        send_file(&exchange, &file_name, &payload).await
    }
    .await;

    match result {
        Ok(report) => Ok(report.to_string()),
        Err(SerialError::NotConnected) => Err(SerialError::NotConnected.to_string()),
        Err(e) => Err(format!("Failed to send file {}: {}", file_name, e)),
    }
}

/// Install the MQTT client certificate and key and switch the device to TLS.
pub async fn set_mqtt_certificates(device_manager: &DeviceManager, cert_path: &Path, key_path: &Path) -> Result<String, String> {
    if cert_path.as_os_str().is_empty() || key_path.as_os_str().is_empty() {
        return Err("Please select both certificate and private key.".to_string());
    }
    let session = device_manager.session().await.map_err(device_error)?;

    let files = device_manager.file_source();
    let result: crate::provisioning::Result<_> = async {
        let request = ProvisioningRequest::from_files(files.as_ref(), cert_path, key_path).await?;
        provision_mqtt_credentials(&session, &request).await
    }
    .await;

    match result {
        Ok(report) => Ok(report.to_string()),
        Err(e) => {
            log::error!("Failed to upload certificates or configure MQTT: {}", e);
            Err(format!("Failed to upload certificates or configure MQTT: {}", e))
        }
    }
}
