//! End-to-end discovery tests: a real notification channel and launch
//! sequencer, with mock CDP endpoints standing in for WebView targets and
//! the test itself playing the host's debug bootstrap (writing records to
//! the channel).

#![cfg(unix)]

use std::time::Duration;

use ember_cdp::mock::MockCdpServer;
use ember_discovery::{launch, DiscoveryError, LaunchConfig, LaunchedSession};
use serde_json::json;
use tokio::io::AsyncWriteExt;

fn webview_config(url_filter: &str) -> LaunchConfig {
    serde_json::from_value(json!({
        "runtimeExecutable": "sleep",
        "runtimeArgs": ["5"],
        "useWebView": "advanced",
        "urlFilter": url_filter,
        "port": 0,
    }))
    .unwrap()
}

async fn write_record(endpoint: &str, record: serde_json::Value) {
    let mut stream = tokio::net::UnixStream::connect(endpoint).await.unwrap();
    let mut line = record.to_string();
    line.push('\n');
    stream.write_all(line.as_bytes()).await.unwrap();
    stream.shutdown().await.unwrap();
}

fn view_record(id: &str, devtools_port: u16) -> serde_json::Value {
    json!({
        "id": id,
        "url": "about:blank",
        "type": "page",
        "title": "",
        "description": "",
        "faviconUrl": "",
        "devtoolsActivePort": format!("{devtools_port}\nws/path"),
    })
}

async fn wait_until(mut probe: impl FnMut() -> bool) {
    for _ in 0..500 {
        if probe() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}

fn endpoint(session: &LaunchedSession) -> String {
    session.channel.as_ref().unwrap().endpoint().to_string()
}

#[tokio::test]
async fn matching_candidate_wins_and_all_probes_close() {
    let mock = MockCdpServer::spawn().await.unwrap();
    let config = webview_config("https://example.com/*");

    let mut session = launch(&config).await.unwrap();
    let endpoint = endpoint(&session);

    write_record(&endpoint, view_record("view-a", mock.port())).await;
    mock.wait_for_connection("view-a").await.unwrap();

    // The probe must enable Page (or it would never see navigations) and
    // unblock the candidate while it is merely under evaluation.
    wait_until(|| {
        let methods = mock.methods_received("view-a");
        methods.contains(&"Page.enable".to_string())
            && methods.contains(&"Runtime.runIfWaitingForDebugger".to_string())
    })
    .await;

    mock.emit_frame_navigated("view-a", "https://example.com/app/index.html")
        .await
        .unwrap();

    let port = session.wait_for_port(Duration::from_secs(5)).await.unwrap();
    assert_eq!(port, mock.port());

    // The winner's probe is closed too; the confirmed attach uses a fresh
    // connection.
    wait_until(|| mock.open_connection_count() == 0).await;

    session.host.terminate();
}

#[tokio::test]
async fn navigation_order_decides_the_race_not_notification_order() {
    let mock_a = MockCdpServer::spawn().await.unwrap();
    let mock_b = MockCdpServer::spawn().await.unwrap();
    let config = webview_config("https://app.example.test/*");

    let mut session = launch(&config).await.unwrap();
    let endpoint = endpoint(&session);

    // `a` is announced first but never matches; `b` navigates to the
    // requested URL first and must win with *its* port.
    write_record(&endpoint, view_record("view-a", mock_a.port())).await;
    write_record(&endpoint, view_record("view-b", mock_b.port())).await;
    mock_a.wait_for_connection("view-a").await.unwrap();
    mock_b.wait_for_connection("view-b").await.unwrap();

    mock_b
        .emit_frame_navigated("view-b", "https://app.example.test/index.html")
        .await
        .unwrap();
    mock_a
        .emit_frame_navigated("view-a", "https://unrelated.test/")
        .await
        .unwrap();

    let port = session.wait_for_port(Duration::from_secs(5)).await.unwrap();
    assert_eq!(port, mock_b.port());

    wait_until(|| mock_a.open_connection_count() == 0 && mock_b.open_connection_count() == 0)
        .await;

    session.host.terminate();
}

#[tokio::test]
async fn records_after_resolution_are_ignored() {
    let mock = MockCdpServer::spawn().await.unwrap();
    let late = MockCdpServer::spawn().await.unwrap();
    let config = webview_config("https://example.com/*");

    let mut session = launch(&config).await.unwrap();
    let endpoint = endpoint(&session);

    write_record(&endpoint, view_record("view-a", mock.port())).await;
    mock.wait_for_connection("view-a").await.unwrap();
    mock.emit_frame_navigated("view-a", "https://example.com/")
        .await
        .unwrap();
    let port = session.wait_for_port(Duration::from_secs(5)).await.unwrap();
    assert_eq!(port, mock.port());

    // Resolution closes the channel; a late record must not open a probe.
    if let Ok(mut stream) = tokio::net::UnixStream::connect(&endpoint).await {
        let mut line = view_record("view-late", late.port()).to_string();
        line.push('\n');
        let _ = stream.write_all(line.as_bytes()).await;
        let _ = stream.shutdown().await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(late.connection_count(), 0);

    session.host.terminate();
}

#[tokio::test]
async fn channel_close_without_match_resolves_no_target() {
    let mock = MockCdpServer::spawn().await.unwrap();
    let config = webview_config("https://example.com/*");

    let mut session = launch(&config).await.unwrap();
    let endpoint = endpoint(&session);

    write_record(&endpoint, view_record("view-a", mock.port())).await;
    mock.wait_for_connection("view-a").await.unwrap();

    // Universal cancellation: closing the channel resolves the pending
    // session and closes every in-flight probe.
    session.close_channel().await;

    let err = session
        .wait_for_port(Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, DiscoveryError::NoTarget), "got {err}");

    wait_until(|| mock.open_connection_count() == 0).await;

    session.host.terminate();
}

#[tokio::test]
async fn host_exit_before_any_notification_fails_the_launch() {
    let config: LaunchConfig = serde_json::from_value(json!({
        "runtimeExecutable": "true",
        "useWebView": "advanced",
        "urlFilter": "https://example.com/*",
    }))
    .unwrap();

    let mut session = launch(&config).await.unwrap();
    let err = session
        .wait_for_port(Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, DiscoveryError::HostExited), "got {err}");
}

#[tokio::test]
async fn unopened_probe_failures_do_not_poison_the_race() {
    let mock = MockCdpServer::spawn().await.unwrap();
    let config = webview_config("https://example.com/*");

    let mut session = launch(&config).await.unwrap();
    let endpoint = endpoint(&session);

    // No listener on this port: the candidate is dropped, the race goes on.
    write_record(&endpoint, view_record("view-dead", 1)).await;
    write_record(&endpoint, view_record("view-a", mock.port())).await;

    mock.wait_for_connection("view-a").await.unwrap();
    mock.emit_frame_navigated("view-a", "https://example.com/")
        .await
        .unwrap();

    let port = session.wait_for_port(Duration::from_secs(5)).await.unwrap();
    assert_eq!(port, mock.port());

    session.host.terminate();
}

#[tokio::test]
async fn hung_candidate_does_not_stall_the_race() {
    // Accepts TCP but never completes a WebSocket handshake, so its probe
    // open only ends when the connect timeout (5s) fires.
    let hung = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let hung_port = hung.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _addr)) = hung.accept().await {
            held.push(stream);
        }
    });

    let mock = MockCdpServer::spawn().await.unwrap();
    let config = webview_config("https://example.com/*");

    let mut session = launch(&config).await.unwrap();
    let endpoint = endpoint(&session);

    // The hung candidate is announced first; the good one must still be
    // probed and matched while that open is in flight.
    write_record(&endpoint, view_record("view-hung", hung_port)).await;
    write_record(&endpoint, view_record("view-a", mock.port())).await;

    mock.wait_for_connection("view-a").await.unwrap();
    mock.emit_frame_navigated("view-a", "https://example.com/")
        .await
        .unwrap();

    // Resolving within 3s proves the good probe was not serialized behind
    // the hung candidate's connect attempt.
    let port = session.wait_for_port(Duration::from_secs(3)).await.unwrap();
    assert_eq!(port, mock.port());

    session.host.terminate();
}

#[tokio::test]
async fn launch_without_use_web_view_is_rejected() {
    let config: LaunchConfig = serde_json::from_value(json!({
        "runtimeExecutable": "sleep",
        "runtimeArgs": ["5"],
    }))
    .unwrap();

    let err = launch(&config).await.unwrap_err();
    assert!(matches!(err, DiscoveryError::NotWebView), "got {err}");
}

#[tokio::test]
async fn fixed_port_mode_resolves_immediately_without_a_channel() {
    let config: LaunchConfig = serde_json::from_value(json!({
        "runtimeExecutable": "sleep",
        "runtimeArgs": ["5"],
        "useWebView": true,
        "port": 4567,
        "url": "https://example.com",
    }))
    .unwrap();

    let mut session = launch(&config).await.unwrap();
    assert!(session.channel.is_none());

    let port = session.wait_for_port(Duration::from_secs(1)).await.unwrap();
    assert_eq!(port, 4567);

    session.host.terminate();
}

#[tokio::test]
async fn missing_runtime_executable_is_a_configuration_error() {
    let config: LaunchConfig = serde_json::from_value(json!({
        "useWebView": "advanced",
        "urlFilter": "https://example.com/*",
    }))
    .unwrap();

    let err = launch(&config).await.unwrap_err();
    assert!(
        matches!(err, DiscoveryError::MissingField("runtimeExecutable")),
        "got {err}"
    );
}

#[tokio::test]
async fn discovery_times_out_rather_than_hanging() {
    let config = webview_config("https://example.com/*");

    let mut session = launch(&config).await.unwrap();
    let err = session
        .wait_for_port(Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, DiscoveryError::AttachTimeout), "got {err}");

    session.close_channel().await;
    session.host.terminate();
}
