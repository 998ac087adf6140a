//! End-to-end adapter tests: a DAP client scripted over in-memory pipes, a
//! real launch sequencer, and a mock CDP endpoint standing in for the
//! WebView2 runtime.

#![cfg(unix)]

use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{duplex, split, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

use ember_cdp::mock::MockCdpServer;
use ember_dap::dap::{DapReader, DapWriter};
use ember_dap::server::serve;

struct TestClient {
    reader: DapReader<ReadHalf<tokio::io::DuplexStream>>,
    writer: DapWriter<WriteHalf<tokio::io::DuplexStream>>,
    seq: i64,
    server: JoinHandle<()>,
}

impl TestClient {
    fn spawn() -> Self {
        let (client_side, server_side) = duplex(64 * 1024);
        let (server_read, server_write) = split(server_side);
        let server = tokio::spawn(async move {
            serve(server_read, server_write).await.unwrap();
        });

        let (client_read, client_write) = split(client_side);
        Self {
            reader: DapReader::new(client_read),
            writer: DapWriter::new(client_write),
            seq: 0,
            server,
        }
    }

    async fn send(&mut self, command: &str, arguments: Value) {
        self.seq += 1;
        self.writer
            .write_value(&json!({
                "seq": self.seq,
                "type": "request",
                "command": command,
                "arguments": arguments,
            }))
            .await
            .unwrap();
    }

    async fn recv(&mut self) -> Value {
        tokio::time::timeout(Duration::from_secs(30), self.reader.read_value())
            .await
            .expect("timed out waiting for a DAP message")
            .unwrap()
            .expect("adapter closed the stream unexpectedly")
    }

    /// Read until the response for `command` arrives, collecting any events
    /// seen on the way.
    async fn recv_response(&mut self, command: &str) -> (Value, Vec<Value>) {
        let mut events = Vec::new();
        loop {
            let message = self.recv().await;
            if message["type"] == "response" && message["command"] == command {
                return (message, events);
            }
            if message["type"] == "event" {
                events.push(message);
            }
        }
    }

    async fn recv_event(&mut self, name: &str) -> Value {
        loop {
            let message = self.recv().await;
            if message["type"] == "event" && message["event"] == name {
                return message;
            }
        }
    }
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

#[tokio::test]
async fn initialize_reports_capabilities_then_initialized() {
    let mut client = TestClient::spawn();

    client.send("initialize", json!({ "adapterID": "ember" })).await;
    let response = client.recv().await;
    assert_eq!(response["type"], "response");
    assert_eq!(response["command"], "initialize");
    assert_eq!(response["success"], true);
    assert_eq!(response["body"]["supportsConfigurationDoneRequest"], true);

    let event = client.recv().await;
    assert_eq!(event["type"], "event");
    assert_eq!(event["event"], "initialized");

    client.send("disconnect", json!({})).await;
    let (response, _events) = client.recv_response("disconnect").await;
    assert_eq!(response["success"], true);
}

#[tokio::test]
async fn fixed_port_launch_attaches_enables_domains_and_resumes_once() {
    let mock = MockCdpServer::spawn().await.unwrap();
    mock.add_json_target("tab-1", "https://example.com/");

    let mut client = TestClient::spawn();
    client.send("initialize", json!({})).await;
    client.recv_response("initialize").await;

    client
        .send(
            "launch",
            json!({
                "runtimeExecutable": "sleep",
                "runtimeArgs": ["5"],
                "useWebView": true,
                "port": mock.port(),
                "url": "https://example.com",
            }),
        )
        .await;

    let (response, _events) = client.recv_response("launch").await;
    assert_eq!(response["success"], true, "launch failed: {response}");

    // The confirmed attach enables the baseline domains and releases the
    // target exactly once.
    wait_until(|| {
        mock.methods_received("tab-1")
            .iter()
            .any(|m| m == "Network.enable")
    })
    .await;
    let methods = mock.methods_received("tab-1");
    for required in ["Debugger.enable", "Runtime.enable", "Page.enable", "Network.enable"] {
        assert!(
            methods.iter().any(|m| m == required),
            "missing {required} in {methods:?}"
        );
    }
    let resumes = methods
        .iter()
        .filter(|m| *m == "Runtime.runIfWaitingForDebugger")
        .count();
    assert_eq!(resumes, 1, "target must be released exactly once: {methods:?}");

    client.send("threads", json!({})).await;
    let (response, _events) = client.recv_response("threads").await;
    assert_eq!(response["body"]["threads"][0]["id"], 1);

    client.send("disconnect", json!({})).await;
    let (response, events) = client.recv_response("disconnect").await;
    assert_eq!(response["success"], true);
    // terminated may arrive before or after the response.
    if !events.iter().any(|e| e["event"] == "terminated") {
        client.recv_event("terminated").await;
    }

    wait_until(|| mock.open_connection_count() == 0).await;
    client.server.await.unwrap();
}

#[tokio::test]
async fn launch_without_use_web_view_fails_and_terminates() {
    let mut client = TestClient::spawn();

    client
        .send(
            "launch",
            json!({
                "runtimeExecutable": "sleep",
                "runtimeArgs": ["5"],
            }),
        )
        .await;

    let (response, _events) = client.recv_response("launch").await;
    assert_eq!(response["success"], false);
    assert!(
        response["message"]
            .as_str()
            .unwrap_or_default()
            .contains("useWebView"),
        "unexpected message: {response}"
    );
    client.recv_event("terminated").await;

    client.send("disconnect", json!({})).await;
    client.recv_response("disconnect").await;
}

#[tokio::test]
async fn no_debug_launch_spawns_without_attaching() {
    let mut client = TestClient::spawn();

    client
        .send(
            "launch",
            json!({
                "runtimeExecutable": "sleep",
                "runtimeArgs": ["5"],
                "useWebView": true,
                "port": 4567,
                "noDebug": true,
            }),
        )
        .await;

    let (response, _events) = client.recv_response("launch").await;
    assert_eq!(response["success"], true, "noDebug launch failed: {response}");

    client.send("disconnect", json!({})).await;
    client.recv_response("disconnect").await;
}

#[tokio::test]
async fn unknown_commands_get_a_failing_response() {
    let mut client = TestClient::spawn();

    client.send("restartFrame", json!({})).await;
    let (response, _events) = client.recv_response("restartFrame").await;
    assert_eq!(response["success"], false);

    client.send("disconnect", json!({})).await;
    client.recv_response("disconnect").await;
}
