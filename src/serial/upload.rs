//! File upload over the command link.
//!
//! Framing: discard input, `UPLOAD_FILE:<name>`, settle, raw payload,
//! `END_FILE`, then wait for `File <path> received and saved OK` or a line
//! carrying the error marker. A failed attempt is never resumed; callers
//! that want retries start a fresh upload.
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::session::{Exchange, ResponseMatcher, ResponseSpec};
use super::sink::SerialEvent;
use super::{Result, SerialError};
use crate::config::UploadConfig;

pub const UPLOAD_HEADER: &str = "UPLOAD_FILE";
pub const UPLOAD_TRAILER: &str = "END_FILE";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum UploadPhase {
    Flushing,
    HeaderSent,
    PayloadSent,
    TrailerSent,
    AwaitingConfirmation,
    Done,
    Failed,
}

/// Phase tracker for one upload attempt.
#[derive(Debug)]
pub struct UploadSession {
    file_name: String,
    remote_path: String,
    phase: UploadPhase,
}

impl UploadSession {
    pub fn new(file_name: &str, config: &UploadConfig) -> Self {
        Self {
            file_name: file_name.to_string(),
            remote_path: config.remote_path(file_name),
            phase: UploadPhase::Flushing,
        }
    }

    pub fn phase(&self) -> UploadPhase {
        self.phase
    }

    pub fn remote_path(&self) -> &str {
        &self.remote_path
    }

    /// Move strictly forward. `Failed` is reachable from any live phase.
    pub fn advance(&mut self, next: UploadPhase) -> Result<()> {
        let allowed = match next {
            UploadPhase::Failed => !matches!(self.phase, UploadPhase::Done | UploadPhase::Failed),
            _ => next > self.phase && self.phase != UploadPhase::Failed,
        };
        if !allowed {
            return Err(SerialError::ProtocolError(format!(
                "upload of {} cannot move from {:?} to {:?}",
                self.file_name, self.phase, next
            )));
        }
        log::debug!("Upload {}: {:?} -> {:?}", self.file_name, self.phase, next);
        self.phase = next;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadReport {
    pub file_name: String,
    pub remote_path: String,
    pub size: usize,
    pub sha256: String,
    pub confirmation: String,
}

impl fmt::Display for UploadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Successfully uploaded {}", self.file_name)
    }
}

/// Waiter spec for the firmware's save confirmation.
pub fn confirmation_spec(config: &UploadConfig, file_name: &str, remote_path: &str) -> ResponseSpec {
    ResponseSpec::new(format!("upload {}", file_name), config.confirm_timeout(), ResponseMatcher::contains(config.success_marker(remote_path)))
        .with_failure(ResponseMatcher::contains(config.error_marker.clone()))
        .with_timeout_message(format!("No confirmation received for {}", file_name))
        .with_rejection_context(format!("Firmware error while receiving {}", file_name))
        .with_snippet_len(config.snippet_len)
}

/// Upload `payload` as `/usr/<file_name>` (or the configured directory).
pub async fn upload_file(exchange: &Exchange, file_name: &str, payload: &[u8]) -> Result<UploadReport> {
    if file_name.is_empty() || file_name.contains(['/', '\\', '\r', '\n']) {
        return Err(SerialError::Validation(format!("Invalid upload file name: {:?}", file_name)));
    }
    exchange.ensure_open()?;

    let mut session = UploadSession::new(file_name, &exchange.config().upload);
    log::info!("Uploading {} ({} bytes) to {}", file_name, payload.len(), session.remote_path());
    match run_upload(exchange, &mut session, payload).await {
        Ok(report) => {
            log::info!("{} (sha256 {})", report, report.sha256);
            Ok(report)
        }
        Err(e) => {
            let _ = session.advance(UploadPhase::Failed);
            log::error!("Failed to send file \"{}\": {}", file_name, e);
            Err(e)
        }
    }
}

async fn run_upload(exchange: &Exchange, session: &mut UploadSession, payload: &[u8]) -> Result<UploadReport> {
    let config = exchange.config().upload.clone();
    let file_name = session.file_name.clone();

    exchange.discard_input().await?;
    log::debug!("Flushed input before {}", UPLOAD_HEADER);
    exchange.notify(SerialEvent::notice(format!("Flushed input before upload of {}", file_name)));

    let header = format!("{}:{}", UPLOAD_HEADER, file_name);
    exchange.notify(SerialEvent::outbound(&header));
    exchange.write_line(&header).await?;
    session.advance(UploadPhase::HeaderSent)?;

    tokio::time::sleep(config.settle()).await;

    exchange.write_raw(payload.to_vec(), None).await?;
    let sent = format!("Sent {} bytes for {}", payload.len(), file_name);
    log::debug!("{}", sent);
    exchange.notify(SerialEvent::notice(sent));
    session.advance(UploadPhase::PayloadSent)?;

    // Register before the trailer so a fast confirmation is not lost.
    let pending = exchange
        .subscribe(confirmation_spec(&config, &file_name, session.remote_path()))
        .await?;

    exchange.write_line(UPLOAD_TRAILER).await?;
    exchange.notify(SerialEvent::outbound(UPLOAD_TRAILER));
    session.advance(UploadPhase::TrailerSent)?;

    session.advance(UploadPhase::AwaitingConfirmation)?;
    let response = pending.wait().await?;
    session.advance(UploadPhase::Done)?;

    Ok(UploadReport {
        file_name,
        remote_path: session.remote_path().to_string(),
        size: payload.len(),
        sha256: hex::encode(Sha256::digest(payload)),
        confirmation: response.last_line().unwrap_or_default().to_string(),
    })
}

/// Where payload bytes come from before they are handed to the upload.
#[async_trait::async_trait]
pub trait FileSource: Send + Sync {
    async fn read_all(&self, path: &Path) -> Result<Vec<u8>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FsFileSource;

#[async_trait::async_trait]
impl FileSource for FsFileSource {
    async fn read_all(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(path).await?)
    }
}

/// Base name of `path`, used as the remote file name.
pub fn upload_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| SerialError::Validation(format!("No file name in {}", path.display())))
}

/// Read `path` through `source` and upload it under its base name.
pub async fn upload_path(exchange: &Exchange, source: &dyn FileSource, path: &Path) -> Result<UploadReport> {
    let file_name = upload_name(path)?;
    let payload = source.read_all(path).await?;
    upload_file(exchange, &file_name, &payload).await
}
