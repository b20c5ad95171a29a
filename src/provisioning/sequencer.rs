//! Scripted MQTT credential installation.
//!
//! The whole run holds one exchange, so no other command can interleave with
//! the uploads or the reconfiguration. Each step is retried up to
//! `max_retries` times; a retry waits the step's backoff and discards unread
//! input first. Validation and link-loss failures end the run immediately.
use std::future::Future;
use std::time::Duration;

use super::{ProvisionError, ProvisioningReport, ProvisioningRequest, ProvisioningStep, Result, StepRecord};
use crate::config::ProvisioningConfig;
use crate::serial::session::{Exchange, ResponseMatcher, ResponseSpec, SessionHandle};
use crate::serial::upload::upload_file;
use crate::serial::SerialError;

const ENOENT: &str = "ENOENT";
const SAVED_OK: &str = "saved OK";
const TLS_ON: [&str; 2] = ["ssl=True", "ssl_enabled: True"];
const TLS_OFF: [&str; 2] = ["ssl=False", "ssl_enabled: False"];

/// Upload the certificate and key, point the MQTT client at them, switch it
/// to TLS and restart it.
pub async fn provision_mqtt_credentials(session: &SessionHandle, request: &ProvisioningRequest) -> Result<ProvisioningReport> {
    let exchange = session.begin_exchange().await?;
    let cfg = exchange.config().provisioning.clone();
    let upload_cfg = exchange.config().upload.clone();
    let cert_path = upload_cfg.remote_path(&cfg.cert_file_name);
    let key_path = upload_cfg.remote_path(&cfg.key_file_name);
    let mut steps = Vec::with_capacity(7);
    let ex = &exchange;
    let cfg_ref = &cfg;

    log::info!("Starting certificate upload sequence on {}", session.info().port_name);
    exchange.discard_input().await?;

    // 1. Make sure the target directory exists.
    let mkdir = format!("MKDIR:{}", upload_cfg.remote_dir);
    let mkdir = mkdir.as_str();
    let (_, attempts) = with_retries(ex, ProvisioningStep::CreateDirectory, &cfg, cfg.retry_backoff_ms, move |_| async move {
        ex.send_command(mkdir).await
    })
    .await?;
    steps.push(StepRecord { step: ProvisioningStep::CreateDirectory, attempts });
    exchange.pause(cfg.mkdir_settle_ms).await;

    // 2. Certificate.
    let (certificate, attempts) =
        with_retries(ex, ProvisioningStep::UploadCertificate, &cfg, cfg.retry_backoff_ms, move |_| {
            upload_file(ex, &cfg_ref.cert_file_name, &request.certificate)
        })
        .await?;
    steps.push(StepRecord { step: ProvisioningStep::UploadCertificate, attempts });
    exchange.pause(cfg.after_cert_ms).await;
    exchange.discard_input().await?;

    // 3. Private key.
    let (private_key, attempts) = with_retries(ex, ProvisioningStep::UploadKey, &cfg, cfg.retry_backoff_ms, move |_| {
        upload_file(ex, &cfg_ref.key_file_name, &request.private_key)
    })
    .await?;
    steps.push(StepRecord { step: ProvisioningStep::UploadKey, attempts });
    exchange.pause(cfg.after_key_ms).await;

    // 4. Credential paths.
    let (cert_path, key_path) = (cert_path.as_str(), key_path.as_str());
    let (_, attempts) = with_retries(
        ex,
        ProvisioningStep::SetCredentialPaths,
        &cfg,
        cfg.verify_retry_backoff_ms,
        move |_| set_credential_paths(ex, cfg_ref, cert_path, key_path),
    )
    .await?;
    steps.push(StepRecord { step: ProvisioningStep::SetCredentialPaths, attempts });

    // 5. TLS on the standard port.
    let (_, attempts) =
        with_retries(ex, ProvisioningStep::EnableTls, &cfg, cfg.verify_retry_backoff_ms, move |_| {
            enable_tls(ex, cfg_ref)
        })
        .await?;
    steps.push(StepRecord { step: ProvisioningStep::EnableTls, attempts });

    // 6. Re-selecting the protocol restarts the MQTT client with the new settings.
    let (_, attempts) = with_retries(ex, ProvisioningStep::Reinitialize, &cfg, cfg.retry_backoff_ms, move |_| async move {
        ex.send_command("SET_PROTOCOL:MQTT").await
    })
    .await?;
    steps.push(StepRecord { step: ProvisioningStep::Reinitialize, attempts });
    exchange.pause(cfg.reinit_settle_ms).await;

    // 7. Status query; the outcome does not gate the result.
    let status = match exchange.send_command("GET_MQTT_CONFIG").await {
        Ok(sent) => {
            steps.push(StepRecord { step: ProvisioningStep::StatusQuery, attempts: 1 });
            Some(sent)
        }
        Err(e) => {
            log::warn!("Final MQTT status query failed: {}", e);
            None
        }
    };

    log::info!(
        "Provisioned {} ({}) and {} ({})",
        certificate.remote_path,
        certificate.sha256,
        private_key.remote_path,
        private_key.sha256
    );
    Ok(ProvisioningReport { steps, certificate, private_key, status })
}

/// Run `op` until it succeeds, fails terminally or runs out of attempts.
async fn with_retries<T, F, Fut>(
    exchange: &Exchange,
    step: ProvisioningStep,
    cfg: &ProvisioningConfig,
    backoff_ms: u64,
    mut op: F,
) -> Result<(T, u32)>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, SerialError>>,
{
    let max = cfg.max_retries.max(1);
    let mut attempt = 1;
    loop {
        log::info!("Attempt {} of {} for {}", attempt, max, step);
        match op(attempt).await {
            Ok(value) => return Ok((value, attempt)),
            Err(e) if !e.is_retryable() || attempt >= max => {
                log::error!("{} failed on attempt {}: {}", step, attempt, e);
                return Err(ProvisionError::StepFailed { step, attempts: attempt, source: e });
            }
            Err(e) => {
                log::warn!("Attempt {} for {} failed: {}", attempt, step, e);
                exchange.pause(backoff_ms).await;
                if let Err(e) = exchange.discard_input().await {
                    return Err(ProvisionError::StepFailed { step, attempts: attempt, source: e });
                }
                attempt += 1;
            }
        }
    }
}

async fn set_credential_paths(
    exchange: &Exchange,
    cfg: &ProvisioningConfig,
    cert_path: &str,
    key_path: &str,
) -> std::result::Result<(), SerialError> {
    set_path(exchange, cfg, &format!("SET_MQTT_CERT:{}", cert_path), true).await?;
    set_path(exchange, cfg, &format!("SET_MQTT_KEY:{}", key_path), false).await?;
    log::info!("Certificate and key set successfully");
    Ok(())
}

/// Send one path command; its reply is judged in a window of its own.
async fn set_path(
    exchange: &Exchange,
    cfg: &ProvisioningConfig,
    line: &str,
    flush: bool,
) -> std::result::Result<(), SerialError> {
    let pending = if cfg.verify_credentials {
        let window = cfg.inter_command_ms + cfg.verify_window_ms;
        let spec = ResponseSpec::new(line, Duration::from_millis(window), ResponseMatcher::contains(SAVED_OK))
            .with_failure(ResponseMatcher::contains(ENOENT))
            .with_rejection_context("File not found (ENOENT) during SET_MQTT_CERT/KEY");
        Some(exchange.subscribe(spec).await?)
    } else {
        None
    };

    if flush {
        exchange.send_command(line).await?;
    } else {
        exchange.send_line(line).await?;
    }
    exchange.pause(cfg.inter_command_ms).await;

    let Some(pending) = pending else {
        return Ok(());
    };
    match pending.wait().await {
        Ok(_) => Ok(()),
        Err(e) if e.is_timeout() => {
            log::info!("No ENOENT detected after {}", line);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn enable_tls(exchange: &Exchange, cfg: &ProvisioningConfig) -> std::result::Result<(), SerialError> {
    let pending = if cfg.verify_tls {
        let window = cfg.ssl_settle_ms + cfg.inter_command_ms + cfg.config_read_settle_ms + cfg.verify_window_ms;
        let spec = ResponseSpec::new("GET_MQTT_CONFIG", Duration::from_millis(window), ResponseMatcher::contains_any(TLS_ON))
            .with_failure(ResponseMatcher::contains_any(TLS_OFF))
            .with_rejection_context("SSL configuration not applied");
        Some(exchange.subscribe(spec).await?)
    } else {
        None
    };

    exchange.send_command("SET_MQTT_SSL:ON").await?;
    exchange.pause(cfg.ssl_settle_ms).await;
    exchange.send_line(&format!("SET_MQTT_PORT:{}", cfg.tls_port)).await?;
    exchange.pause(cfg.inter_command_ms).await;
    exchange.send_line("GET_MQTT_CONFIG").await?;
    exchange.pause(cfg.config_read_settle_ms).await;

    let Some(pending) = pending else {
        return Ok(());
    };
    match pending.wait().await {
        Ok(_) => {
            log::info!("SSL configuration applied");
            Ok(())
        }
        Err(e) if e.is_timeout() => {
            log::warn!("No SSL confirmation, proceeding");
            Ok(())
        }
        Err(e) => Err(e),
    }
}
