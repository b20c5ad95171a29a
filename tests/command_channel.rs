mod common;

use std::time::Duration;

use common::{open_session, settle, test_config};
use fieldlink_lib::serial::session::{LinkState, ResponseMatcher, ResponseSpec};
use fieldlink_lib::serial::{EventKind, SerialError};

#[tokio::test(start_paused = true)]
async fn test_send_command_writes_line_and_echoes_outbound() {
    let (session, device, sink) = open_session(test_config());

    let msg = session.send_command("GET_INTERVAL").await.expect("send");
    assert_eq!(msg, "Successfully sent: GET_INTERVAL");
    settle().await;

    assert_eq!(device.commands(), vec!["GET_INTERVAL"]);
    assert_eq!(sink.of_kind(EventKind::Outbound), vec!["> GET_INTERVAL"]);
    // Input is flushed before every command by default.
    assert_eq!(device.discards(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_closed_link_fails_fast_without_writing() {
    let (session, device, sink) = open_session(test_config());
    session.shutdown().await;
    assert!(!session.is_open());

    let err = session.send_command("GET_DEVICE_ID").await.unwrap_err();
    assert!(matches!(err, SerialError::NotConnected));
    assert_eq!(err.to_string(), "Port not open!");
    assert!(device.commands().is_empty());
    assert!(sink.of_kind(EventKind::Outbound).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_echo_and_noise_lines_are_filtered() {
    let (session, device, sink) = open_session(test_config());
    device.set_echo(true);
    device.on("GET_INTERVAL", &["Current interval: 60"]);

    session.send_command("GET_INTERVAL").await.unwrap();
    device.push_line("Text: 'GET_INTERVAL'");
    device.push_line("Config saved to flash");
    device.push_line("   ");
    settle().await;

    assert_eq!(sink.of_kind(EventKind::Inbound), vec!["Current interval: 60"]);
    let metrics = session.metrics();
    assert!(metrics.lines_read >= 5);
    assert!(metrics.lines_suppressed >= 3);
}

#[tokio::test(start_paused = true)]
async fn test_lines_split_across_chunks_reach_the_sink_once() {
    let (_session, device, sink) = open_session(test_config());

    device.push_bytes(b"BME680 - T");
    settle().await;
    assert!(sink.of_kind(EventKind::Inbound).is_empty());

    device.push_bytes("emperature: 26.5\u{b0}C\n".as_bytes());
    settle().await;
    assert_eq!(sink.of_kind(EventKind::Inbound), vec!["BME680 - Temperature: 26.5°C"]);
}

#[tokio::test(start_paused = true)]
async fn test_request_waits_for_matching_line() {
    let (session, device, _sink) = open_session(test_config());
    device.on("GET_MQTT_CONFIG", &["booting", "MQTT protocol: broker=b.example.com, ssl=True"]);

    let spec = ResponseSpec::new("GET_MQTT_CONFIG", Duration::from_secs(5), ResponseMatcher::contains("MQTT protocol"));
    let response = session.request("GET_MQTT_CONFIG", spec).await.expect("response");
    assert_eq!(response.last_line(), Some("MQTT protocol: broker=b.example.com, ssl=True"));
    assert_eq!(response.lines.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_request_times_out_with_its_message() {
    let (session, _device, _sink) = open_session(test_config());
    let spec = ResponseSpec::new("GET_TCP_CONFIG", Duration::from_secs(5), ResponseMatcher::contains("TCP"))
        .with_timeout_message("No TCP configuration reported");

    let started = tokio::time::Instant::now();
    let err = session.request("GET_TCP_CONFIG", spec).await.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(err.to_string(), "Timeout: No TCP configuration reported");
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert_eq!(session.metrics().waiters_timed_out, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failure_marker_rejects_with_truncated_snippet() {
    let (session, device, _sink) = open_session(test_config());
    let long = format!("Error: {}", "x".repeat(400));
    device.on("SET_MQTT_KEY:/usr/k", &[long.as_str()]);

    let spec = ResponseSpec::new("SET_MQTT_KEY", Duration::from_secs(5), ResponseMatcher::contains("saved OK"))
        .with_failure(ResponseMatcher::contains("Error"))
        .with_rejection_context("Key rejected");
    match session.request("SET_MQTT_KEY:/usr/k", spec).await {
        Err(SerialError::RemoteRejected { context, snippet }) => {
            assert_eq!(context, "Key rejected");
            assert_eq!(snippet.chars().count(), 200);
            assert!(snippet.starts_with("Error: xxx"));
        }
        other => panic!("expected rejection, got {:?}", other.map(|r| r.lines)),
    }
}

#[tokio::test(start_paused = true)]
async fn test_unplug_rejects_pending_waiters() {
    let (session, device, sink) = open_session(test_config());

    let exchange = session.begin_exchange().await.unwrap();
    let spec = ResponseSpec::new("GET_SENSOR_CONFIG", Duration::from_secs(30), ResponseMatcher::contains("Sensor"));
    let pending = exchange.subscribe(spec).await.unwrap();
    exchange.send_command("GET_SENSOR_CONFIG").await.unwrap();

    device.unplug("device reports readiness to read but returned no data");
    let started = tokio::time::Instant::now();
    let err = pending.wait().await.unwrap_err();
    assert!(matches!(err, SerialError::Disconnected));
    // Rejected on close, not after the 30 s deadline.
    assert!(started.elapsed() < Duration::from_secs(1));

    assert!(matches!(session.state(), LinkState::Closed { reason: Some(_) }));
    assert!(sink
        .of_kind(EventKind::Notice)
        .iter()
        .any(|n| n.starts_with("Port error: ")));
    assert!(matches!(exchange.send_command("GET_INTERVAL").await, Err(SerialError::NotConnected)));
}

#[tokio::test(start_paused = true)]
async fn test_write_failure_is_reported_not_fatal() {
    let (session, device, _sink) = open_session(test_config());
    device.fail_writes(true);
    let err = session.send_command("GET_INTERVAL").await.unwrap_err();
    assert!(matches!(err, SerialError::IoError(_)));
    assert!(err.to_string().contains("write refused"));

    device.fail_writes(false);
    assert!(session.send_command("GET_INTERVAL").await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_exchanges_do_not_interleave() {
    let (session, device, _sink) = open_session(test_config());
    let first = session.begin_exchange().await.unwrap();

    let other = session.clone();
    let contender = tokio::spawn(async move { other.send_command("GET_DEVICE_ID").await });

    first.send_command("SET_FTP_HOST:ftp.example.com").await.unwrap();
    first.pause(1500).await;
    first.send_command("SET_PROTOCOL:FTP").await.unwrap();
    assert!(!contender.is_finished());
    drop(first);

    contender.await.unwrap().unwrap();
    assert_eq!(
        device.commands(),
        vec!["SET_FTP_HOST:ftp.example.com", "SET_PROTOCOL:FTP", "GET_DEVICE_ID"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_quiet_lines_satisfy_waiters_but_stay_hidden() {
    let (session, device, sink) = open_session(test_config());
    device.on("SET_MQTT_CERT:/usr/c", &["Config saved OK"]);

    let spec = ResponseSpec::new("SET_MQTT_CERT", Duration::from_secs(5), ResponseMatcher::contains("saved OK"));
    session.request("SET_MQTT_CERT:/usr/c", spec).await.expect("quiet ack resolves");
    settle().await;
    assert!(sink.of_kind(EventKind::Inbound).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_sink_sees_lines_in_arrival_order() {
    let (_session, device, sink) = open_session(test_config());
    for i in 0..20 {
        device.push_line(&format!("line {}", i));
    }
    settle().await;
    let expected: Vec<String> = (0..20).map(|i| format!("line {}", i)).collect();
    assert_eq!(sink.of_kind(EventKind::Inbound), expected);
}
