use std::time::Duration;

use serialport::SerialPortType;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_serial::{
    ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialPortBuilderExt, SerialStream,
    StopBits,
};

use super::{Result, SerialDeviceInfo, SerialError};

/// Byte-level access to an open link. The session task is the only caller.
#[async_trait::async_trait]
pub trait SerialPortIO: Send {
    async fn send_data(&mut self, data: &[u8]) -> Result<()>;

    /// Read whatever is available, waiting at most `timeout_ms`.
    /// Returns `SerialError::Timeout` when nothing arrived.
    async fn read_data(&mut self, buf: &mut [u8], timeout_ms: u64) -> Result<usize>;

    async fn flush(&mut self) -> Result<()>;

    /// Drop input the OS has buffered but we have not read yet.
    fn discard_input(&mut self) -> Result<()>;
}

/// Opens links. Swappable so the connection manager can run against fakes.
#[async_trait::async_trait]
pub trait LinkProvider: Send + Sync {
    fn list(&self) -> Result<Vec<SerialDeviceInfo>>;

    async fn open(&self, port_name: &str, baud_rate: u32) -> Result<Box<dyn SerialPortIO>>;
}

pub struct SerialInterface;

impl SerialInterface {
    /// Enumerate every serial port the OS reports.
    pub fn list_ports() -> Result<Vec<SerialDeviceInfo>> {
        let ports = serialport::available_ports()?;
        let mut devices = Vec::with_capacity(ports.len());

        for port in ports {
            let device = match port.port_type {
                SerialPortType::UsbPort(usb_info) => SerialDeviceInfo {
                    port_name: port.port_name,
                    vid: Some(usb_info.vid),
                    pid: Some(usb_info.pid),
                    serial_number: usb_info.serial_number,
                    manufacturer: usb_info.manufacturer,
                    product: usb_info.product,
                },
                _ => SerialDeviceInfo {
                    port_name: port.port_name,
                    vid: None,
                    pid: None,
                    serial_number: None,
                    manufacturer: None,
                    product: None,
                },
            };
            devices.push(device);
        }

        Ok(devices)
    }

    /// Open `port_name` as 8N1 without flow control.
    pub fn open(port_name: &str, baud_rate: u32) -> Result<NativeSerialPort> {
        let stream = tokio_serial::new(port_name, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open_native_async()
            .map_err(|e| SerialError::ConnectionFailed(e.to_string()))?;

        log::info!("Opened {} at {} baud", port_name, baud_rate);
        Ok(NativeSerialPort { stream, port_name: port_name.to_string() })
    }
}

pub struct NativeSerialPort {
    stream: SerialStream,
    port_name: String,
}

impl NativeSerialPort {
    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

#[async_trait::async_trait]
impl SerialPortIO for NativeSerialPort {
    async fn send_data(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_data(&mut self, buf: &mut [u8], timeout_ms: u64) -> Result<usize> {
        match timeout(Duration::from_millis(timeout_ms), self.stream.read(buf)).await {
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => {
                Err(SerialError::Timeout(format!("read on {}", self.port_name)))
            }
            Ok(Err(e)) => Err(SerialError::IoError(e)),
            Err(_) => Err(SerialError::Timeout(format!("read on {}", self.port_name))),
        }
    }

    async fn flush(&mut self) -> Result<()> {
        self.stream.flush().await?;
        Ok(())
    }

    fn discard_input(&mut self) -> Result<()> {
        self.stream
            .clear(ClearBuffer::Input)
            .map_err(|e| SerialError::ConnectionFailed(e.to_string()))
    }
}

impl Drop for NativeSerialPort {
    fn drop(&mut self) {
        log::info!("Closing {}", self.port_name);
    }
}

/// Link provider backed by the OS serial driver.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeLinkProvider;

#[async_trait::async_trait]
impl LinkProvider for NativeLinkProvider {
    fn list(&self) -> Result<Vec<SerialDeviceInfo>> {
        SerialInterface::list_ports()
    }

    async fn open(&self, port_name: &str, baud_rate: u32) -> Result<Box<dyn SerialPortIO>> {
        let port = SerialInterface::open(port_name, baud_rate)?;
        Ok(Box::new(port))
    }
}
