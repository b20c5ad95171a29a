#![allow(dead_code)]

//! In-memory stand-in for the field device firmware.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fieldlink_lib::config::LinkConfig;
use fieldlink_lib::serial::session::SessionInfo;
use fieldlink_lib::serial::{
    EventKind, EventSink, FileSource, LinkProvider, SerialDeviceInfo, SerialError, SerialEvent, SerialPortIO,
    SessionBuilder, SessionHandle,
};
use tokio::sync::mpsc;

pub const PORT: &str = "/dev/ttyFAKE0";

enum Inbound {
    Data(Vec<u8>),
    Fail(String),
}

/// How the fake answers an `END_FILE`.
#[derive(Debug, Clone)]
pub enum UploadReply {
    SavedOk,
    Error(String),
    Silent,
}

#[derive(Default)]
struct DeviceState {
    rx: Vec<u8>,
    uploading: Option<(String, Vec<u8>)>,
    commands: Vec<String>,
    files: HashMap<String, Vec<u8>>,
    upload_attempts: HashMap<String, usize>,
    upload_replies: HashMap<String, VecDeque<UploadReply>>,
    sticky: HashMap<String, Vec<String>>,
    once: HashMap<String, VecDeque<Vec<String>>>,
    echo: bool,
    fail_writes: bool,
    discards: usize,
}

impl DeviceState {
    fn accept(&mut self, data: &[u8]) -> Vec<String> {
        let mut out = Vec::new();
        if let Some((_, payload)) = self.uploading.as_mut() {
            payload.extend_from_slice(data);
            if payload.ends_with(b"END_FILE\r\n") {
                out.extend(self.finish_upload());
            }
            return out;
        }

        self.rx.extend_from_slice(data);
        while let Some(pos) = self.rx.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.rx.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw).trim_end_matches(['\r', '\n']).to_string();
            out.extend(self.handle_line(&line));
            if self.uploading.is_some() {
                // Whatever follows the header is payload.
                let rest: Vec<u8> = self.rx.drain(..).collect();
                if !rest.is_empty() {
                    out.extend(self.accept(&rest));
                }
                break;
            }
        }
        out
    }

    fn handle_line(&mut self, line: &str) -> Vec<String> {
        self.commands.push(line.to_string());
        let mut out = Vec::new();
        if self.echo {
            out.push(format!("RX Received: {}", line));
            out.push(line.to_string());
        }
        if let Some(name) = line.strip_prefix("UPLOAD_FILE:") {
            *self.upload_attempts.entry(name.to_string()).or_default() += 1;
            self.uploading = Some((name.to_string(), Vec::new()));
            return out;
        }
        if let Some(queue) = self.once.get_mut(line) {
            if let Some(reply) = queue.pop_front() {
                out.extend(reply);
                return out;
            }
        }
        if let Some(reply) = self.sticky.get(line) {
            out.extend(reply.iter().cloned());
        }
        out
    }

    fn finish_upload(&mut self) -> Vec<String> {
        let Some((name, mut payload)) = self.uploading.take() else {
            return Vec::new();
        };
        payload.truncate(payload.len() - b"END_FILE\r\n".len());
        self.commands.push("END_FILE".to_string());
        let reply = self
            .upload_replies
            .get_mut(&name)
            .and_then(|q| q.pop_front())
            .unwrap_or(UploadReply::SavedOk);
        match reply {
            UploadReply::SavedOk => {
                self.files.insert(name.clone(), payload);
                vec![format!("File /usr/{} received and saved OK", name)]
            }
            UploadReply::Error(text) => vec![text],
            UploadReply::Silent => Vec::new(),
        }
    }
}

/// Shared control surface for the fake firmware. Every `link()` is a fresh
/// connection to the same device state.
#[derive(Clone)]
pub struct FakeDevice {
    state: Arc<Mutex<DeviceState>>,
    inbound: Arc<Mutex<Option<mpsc::UnboundedSender<Inbound>>>>,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self { state: Arc::new(Mutex::new(DeviceState::default())), inbound: Arc::new(Mutex::new(None)) }
    }

    pub fn link(&self) -> FakeLink {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inbound.lock().unwrap() = Some(tx.clone());
        FakeLink { state: self.state.clone(), tx, rx, leftover: Vec::new() }
    }

    /// Reply to `command` with `lines` every time.
    pub fn on(&self, command: &str, lines: &[&str]) {
        let lines = lines.iter().map(|s| s.to_string()).collect();
        self.state.lock().unwrap().sticky.insert(command.to_string(), lines);
    }

    /// Reply to the next `command` only; queued ahead of any sticky reply.
    pub fn on_next(&self, command: &str, lines: &[&str]) {
        let lines = lines.iter().map(|s| s.to_string()).collect();
        self.state.lock().unwrap().once.entry(command.to_string()).or_default().push_back(lines);
    }

    pub fn upload_replies(&self, file_name: &str, replies: Vec<UploadReply>) {
        self.state.lock().unwrap().upload_replies.insert(file_name.to_string(), replies.into());
    }

    pub fn set_echo(&self, on: bool) {
        self.state.lock().unwrap().echo = on;
    }

    pub fn fail_writes(&self, on: bool) {
        self.state.lock().unwrap().fail_writes = on;
    }

    pub fn push_bytes(&self, bytes: &[u8]) {
        if let Some(tx) = self.inbound.lock().unwrap().as_ref() {
            let _ = tx.send(Inbound::Data(bytes.to_vec()));
        }
    }

    pub fn push_line(&self, line: &str) {
        self.push_bytes(format!("{}\r\n", line).as_bytes());
    }

    /// Make the next read fail as if the cable was pulled.
    pub fn unplug(&self, reason: &str) {
        if let Some(tx) = self.inbound.lock().unwrap().as_ref() {
            let _ = tx.send(Inbound::Fail(reason.to_string()));
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn file(&self, name: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().files.get(name).cloned()
    }

    pub fn upload_attempts(&self, name: &str) -> usize {
        self.state.lock().unwrap().upload_attempts.get(name).copied().unwrap_or(0)
    }

    pub fn discards(&self) -> usize {
        self.state.lock().unwrap().discards
    }
}

pub struct FakeLink {
    state: Arc<Mutex<DeviceState>>,
    tx: mpsc::UnboundedSender<Inbound>,
    rx: mpsc::UnboundedReceiver<Inbound>,
    leftover: Vec<u8>,
}

impl FakeLink {
    fn fill(&mut self, buf: &mut [u8], mut data: Vec<u8>) -> usize {
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        self.leftover = data.split_off(n);
        n
    }
}

#[async_trait::async_trait]
impl SerialPortIO for FakeLink {
    async fn send_data(&mut self, data: &[u8]) -> Result<(), SerialError> {
        let replies = {
            let mut state = self.state.lock().unwrap();
            if state.fail_writes {
                return Err(SerialError::IoError(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "write refused",
                )));
            }
            state.accept(data)
        };
        for line in replies {
            let _ = self.tx.send(Inbound::Data(format!("{}\r\n", line).into_bytes()));
        }
        Ok(())
    }

    async fn read_data(&mut self, buf: &mut [u8], timeout_ms: u64) -> Result<usize, SerialError> {
        if !self.leftover.is_empty() {
            let data = std::mem::take(&mut self.leftover);
            return Ok(self.fill(buf, data));
        }
        match tokio::time::timeout(Duration::from_millis(timeout_ms), self.rx.recv()).await {
            Ok(Some(Inbound::Data(data))) => Ok(self.fill(buf, data)),
            Ok(Some(Inbound::Fail(reason))) => Err(SerialError::IoError(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                reason,
            ))),
            Ok(None) | Err(_) => Err(SerialError::Timeout("read".to_string())),
        }
    }

    async fn flush(&mut self) -> Result<(), SerialError> {
        Ok(())
    }

    fn discard_input(&mut self) -> Result<(), SerialError> {
        self.leftover.clear();
        let mut kept = Vec::new();
        while let Ok(item) = self.rx.try_recv() {
            if let Inbound::Fail(_) = item {
                kept.push(item);
            }
        }
        for item in kept {
            let _ = self.tx.send(item);
        }
        self.state.lock().unwrap().discards += 1;
        Ok(())
    }
}

/// Link provider that hands out connections to one `FakeDevice`.
pub struct FakeProvider {
    pub device: FakeDevice,
    refuse: Mutex<Option<String>>,
    opened: Mutex<Vec<(String, u32)>>,
}

impl FakeProvider {
    pub fn new(device: FakeDevice) -> Self {
        Self { device, refuse: Mutex::new(None), opened: Mutex::new(Vec::new()) }
    }

    pub fn refuse_open(&self, reason: &str) {
        *self.refuse.lock().unwrap() = Some(reason.to_string());
    }

    pub fn opened(&self) -> Vec<(String, u32)> {
        self.opened.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl LinkProvider for FakeProvider {
    fn list(&self) -> Result<Vec<SerialDeviceInfo>, SerialError> {
        Ok(vec![SerialDeviceInfo {
            port_name: PORT.to_string(),
            vid: Some(0x2e8a),
            pid: Some(0x000a),
            serial_number: Some("E660583883".to_string()),
            manufacturer: Some("Raspberry Pi".to_string()),
            product: Some("Pico".to_string()),
        }])
    }

    async fn open(&self, port_name: &str, baud_rate: u32) -> Result<Box<dyn SerialPortIO>, SerialError> {
        if let Some(reason) = self.refuse.lock().unwrap().clone() {
            return Err(SerialError::ConnectionFailed(reason));
        }
        self.opened.lock().unwrap().push((port_name.to_string(), baud_rate));
        Ok(Box::new(self.device.link()))
    }
}

/// Sink that keeps every event for inspection.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SerialEvent>>,
}

impl RecordingSink {
    pub fn texts(&self) -> Vec<String> {
        self.events.lock().unwrap().iter().map(|e| e.text.clone()).collect()
    }

    pub fn of_kind(&self, kind: EventKind) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.text.clone())
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn notify(&self, event: SerialEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// In-memory file source keyed by path.
#[derive(Default)]
pub struct MemoryFiles {
    files: Mutex<HashMap<PathBuf, Vec<u8>>>,
}

impl MemoryFiles {
    pub fn insert(&self, path: &str, bytes: &[u8]) {
        self.files.lock().unwrap().insert(PathBuf::from(path), bytes.to_vec());
    }
}

#[async_trait::async_trait]
impl FileSource for MemoryFiles {
    async fn read_all(&self, path: &Path) -> Result<Vec<u8>, SerialError> {
        self.files.lock().unwrap().get(path).cloned().ok_or_else(|| {
            SerialError::IoError(std::io::Error::new(std::io::ErrorKind::NotFound, format!("{}", path.display())))
        })
    }
}

/// Config with the firmware timings, minus the open settle.
pub fn test_config() -> LinkConfig {
    LinkConfig { open_settle_ms: 0, ..LinkConfig::default() }
}

/// A running session against a fresh fake device.
pub fn open_session(config: LinkConfig) -> (SessionHandle, FakeDevice, Arc<RecordingSink>) {
    let device = FakeDevice::new();
    let sink = Arc::new(RecordingSink::default());
    let handle = SessionBuilder::new(
        Box::new(device.link()),
        SessionInfo::new(PORT, config.baud_rate),
        Arc::new(config),
        sink.clone(),
    )
    .build();
    (handle, device, sink)
}

/// Let the session task drain whatever the device has queued.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}
