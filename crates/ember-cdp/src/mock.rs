//! A tiny mock CDP endpoint used for unit/integration testing.
//!
//! It intentionally supports a *small* subset of CDP sufficient to exercise
//! ember-cdp, ember-discovery and ember-dap without requiring a real browser
//! to be installed: every command is acked with an empty result, received
//! method names are recorded per connection, and tests can script
//! `Page.frameNavigated` events for a given target once that connection has
//! enabled the Page domain.

use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_tungstenite::{accept_hdr_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

pub struct MockCdpServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    state: Arc<State>,
}

#[derive(Default)]
struct State {
    connections: Mutex<Vec<Arc<Connection>>>,
    /// Targets advertised on the plain-HTTP `/json/list` endpoint.
    json_targets: Mutex<Vec<JsonTarget>>,
}

#[derive(Clone)]
struct JsonTarget {
    id: String,
    url: String,
}

struct Connection {
    /// Last path segment of the WebSocket URL, i.e. the target id from
    /// `/devtools/{type}/{id}`.
    target_id: String,
    methods: Mutex<Vec<String>>,
    page_enabled: AtomicBool,
    open: AtomicBool,
    outbound: mpsc::UnboundedSender<Value>,
}

impl MockCdpServer {
    pub async fn spawn() -> io::Result<Self> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let state = Arc::new(State::default());

        let accept_state = state.clone();
        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = accept_shutdown.cancelled() => break,
                    res = listener.accept() => res,
                };
                let Ok((stream, _peer)) = accepted else { break };
                tokio::spawn(run_connection(
                    stream,
                    addr,
                    accept_state.clone(),
                    accept_shutdown.clone(),
                ));
            }
        });

        Ok(Self {
            addr,
            shutdown,
            state,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Advertise a target on `/json/list`, the way a real DevTools endpoint
    /// lists its debuggable pages next to the WebSocket server.
    pub fn add_json_target(&self, id: &str, url: &str) {
        self.state.json_targets.lock().unwrap().push(JsonTarget {
            id: id.to_string(),
            url: url.to_string(),
        });
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.lock().unwrap().len()
    }

    pub fn open_connection_count(&self) -> usize {
        self.state
            .connections
            .lock()
            .unwrap()
            .iter()
            .filter(|conn| conn.open.load(Ordering::SeqCst))
            .count()
    }

    pub fn is_open(&self, target_id: &str) -> bool {
        self.connection(target_id)
            .map(|conn| conn.open.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn methods_received(&self, target_id: &str) -> Vec<String> {
        self.connection(target_id)
            .map(|conn| conn.methods.lock().unwrap().clone())
            .unwrap_or_default()
    }

    /// Wait until a client has connected for `target_id` (handshake done).
    pub async fn wait_for_connection(&self, target_id: &str) -> io::Result<()> {
        self.poll_connection(target_id, |_conn| true).await
    }

    /// Emit `Page.frameNavigated` on the connection for `target_id`.
    ///
    /// Waits for the connection to exist *and* to have enabled the Page
    /// domain first, mirroring the real browser which drops navigation
    /// events for disabled domains.
    pub async fn emit_frame_navigated(&self, target_id: &str, url: &str) -> io::Result<()> {
        self.poll_connection(target_id, |conn| conn.page_enabled.load(Ordering::SeqCst))
            .await?;

        let conn = self
            .connection(target_id)
            .ok_or_else(|| io::Error::other(format!("no connection for target {target_id}")))?;

        let event = json!({
            "method": "Page.frameNavigated",
            "params": {
                "frame": { "id": target_id, "url": url }
            }
        });
        conn.outbound
            .send(event)
            .map_err(|_| io::Error::other("connection outbound channel closed"))
    }

    fn connection(&self, target_id: &str) -> Option<Arc<Connection>> {
        self.state
            .connections
            .lock()
            .unwrap()
            .iter()
            .find(|conn| conn.target_id == target_id)
            .cloned()
    }

    async fn poll_connection(
        &self,
        target_id: &str,
        ready: impl Fn(&Connection) -> bool,
    ) -> io::Result<()> {
        for _ in 0..500 {
            if let Some(conn) = self.connection(target_id) {
                if ready(&conn) {
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Err(io::Error::other(format!(
            "timed out waiting for target {target_id}"
        )))
    }
}

impl Drop for MockCdpServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<State>,
    shutdown: CancellationToken,
) {
    // A DevTools endpoint serves both the WebSocket targets and a plain-HTTP
    // target list on the same port; peek at the request line to tell them
    // apart.
    let mut head = [0u8; 16];
    for _ in 0..20 {
        match stream.peek(&mut head).await {
            Ok(0) => return,
            Ok(n) if n >= 10 => break,
            Ok(_) => tokio::time::sleep(Duration::from_millis(5)).await,
            Err(_) => return,
        }
    }
    if head.starts_with(b"GET /json") {
        serve_json_list(stream, addr, &state).await;
        return;
    }

    let mut path = String::new();
    let socket = match accept_hdr_async(stream, |req: &tokio_tungstenite::tungstenite::handshake::server::Request, resp| {
        path = req.uri().path().to_string();
        Ok(resp)
    })
    .await
    {
        Ok(socket) => socket,
        Err(_handshake_failed) => return,
    };

    let target_id = path.rsplit('/').next().unwrap_or_default().to_string();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Value>();
    let conn = Arc::new(Connection {
        target_id,
        methods: Mutex::new(Vec::new()),
        page_enabled: AtomicBool::new(false),
        open: AtomicBool::new(true),
        outbound,
    });
    state.connections.lock().unwrap().push(conn.clone());

    let (mut sink, mut reader) = socket.split();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = outbound_rx.recv() => {
                let Some(event) = event else { break };
                let Ok(text) = serde_json::to_string(&event) else { continue };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            message = reader.next() => {
                let frame = match message {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = sink.send(Message::Pong(payload)).await;
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => break,
                };

                let Ok(value) = serde_json::from_str::<Value>(&frame) else {
                    continue;
                };
                let method = value["method"].as_str().unwrap_or_default().to_string();
                if !method.is_empty() {
                    conn.methods.lock().unwrap().push(method.clone());
                }
                if method == "Page.enable" {
                    conn.page_enabled.store(true, Ordering::SeqCst);
                }

                if let Some(id) = value["id"].as_u64() {
                    let reply = json!({ "id": id, "result": {} });
                    let Ok(text) = serde_json::to_string(&reply) else { continue };
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    conn.open.store(false, Ordering::SeqCst);
}

async fn serve_json_list(mut stream: TcpStream, addr: SocketAddr, state: &Arc<State>) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    // Drain the request headers before replying.
    let mut buf = [0u8; 1024];
    let mut request = Vec::new();
    loop {
        let Ok(n) = stream.read(&mut buf).await else {
            return;
        };
        if n == 0 {
            break;
        }
        request.extend_from_slice(&buf[..n]);
        if request.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }

    let targets: Vec<Value> = state
        .json_targets
        .lock()
        .unwrap()
        .iter()
        .map(|target| {
            json!({
                "id": target.id,
                "type": "page",
                "title": "",
                "url": target.url,
                "webSocketDebuggerUrl": format!("ws://{addr}/devtools/page/{}", target.id),
            })
        })
        .collect();

    let body = serde_json::to_string(&targets).unwrap_or_else(|_| "[]".to_string());
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}
