use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::{
    net::TcpStream,
    sync::{broadcast, oneshot, Mutex},
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::{CdpError, Result};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Debug, Clone)]
pub struct CdpClientConfig {
    pub connect_timeout: Duration,
    pub reply_timeout: Duration,
    pub event_channel_size: usize,
}

impl Default for CdpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            reply_timeout: Duration::from_secs(10),
            event_channel_size: 64,
        }
    }
}

/// An asynchronous CDP notification (a frame without an `id`).
#[derive(Debug, Clone)]
pub struct CdpEvent {
    /// Qualified method name, e.g. `Page.frameNavigated`.
    pub method: String,
    pub params: Value,
}

/// Inbound CDP frame: either a command reply (`id` set) or an event
/// (`method` set). CDP never sets both on the same frame.
#[derive(Debug, Deserialize)]
struct Incoming {
    id: Option<u64>,
    result: Option<Value>,
    error: Option<CommandError>,
    method: Option<String>,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Deserialize)]
struct CommandError {
    code: i64,
    message: String,
}

#[derive(Debug)]
struct Reply {
    result: Option<Value>,
    error: Option<CommandError>,
}

struct Inner {
    sink: Mutex<WsSink>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    next_id: AtomicU64,
    events: broadcast::Sender<CdpEvent>,
    shutdown: CancellationToken,
    config: CdpClientConfig,
}

/// CDP client bound to a single DevTools WebSocket endpoint.
///
/// Cloning is cheap and all clones share the underlying connection.
#[derive(Clone)]
pub struct CdpClient {
    inner: Arc<Inner>,
}

impl CdpClient {
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_config(url, CdpClientConfig::default()).await
    }

    pub async fn connect_with_config(url: &str, config: CdpClientConfig) -> Result<Self> {
        let (socket, _response) =
            tokio::time::timeout(config.connect_timeout, connect_async(url))
                .await
                .map_err(|_| CdpError::Timeout)??;

        let (sink, stream) = socket.split();
        let (events, _) = broadcast::channel(config.event_channel_size);

        let inner = Arc::new(Inner {
            sink: Mutex::new(sink),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            events,
            shutdown: CancellationToken::new(),
            config,
        });

        tokio::spawn(read_loop(stream, inner.clone()));

        Ok(Self { inner })
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// A token that is cancelled when the client is shut down, either
    /// explicitly via [`CdpClient::shutdown`]/[`CdpClient::close`] or
    /// implicitly when the browser side closes the socket.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CdpEvent> {
        self.inner.events.subscribe()
    }

    /// Gracefully close the connection. Idempotent; a close frame is sent
    /// best-effort and the read loop is cancelled either way.
    pub async fn close(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        {
            let mut sink = self.inner.sink.lock().await;
            let _ = sink.send(Message::Close(None)).await;
        }
        self.inner.shutdown.cancel();
    }

    pub async fn send_command(&self, method: &str, params: Value) -> Result<Value> {
        if self.inner.shutdown.is_cancelled() {
            return Err(CdpError::Cancelled);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.inner.pending.lock().await;
            pending.insert(id, tx);
        }

        let frame = serde_json::to_string(&json!({
            "id": id,
            "method": method,
            "params": params,
        }))?;

        {
            let mut sink = self.inner.sink.lock().await;
            if let Err(err) = sink.send(Message::Text(frame)).await {
                self.remove_pending(id).await;
                return Err(err.into());
            }
        }

        let reply = tokio::select! {
            _ = self.inner.shutdown.cancelled() => {
                self.remove_pending(id).await;
                return Err(CdpError::Cancelled);
            }
            res = tokio::time::timeout(self.inner.config.reply_timeout, rx) => {
                match res {
                    Ok(Ok(reply)) => reply,
                    Ok(Err(_closed)) => return Err(CdpError::ConnectionClosed),
                    Err(_elapsed) => {
                        self.remove_pending(id).await;
                        return Err(CdpError::Timeout);
                    }
                }
            }
        };

        if let Some(error) = reply.error {
            return Err(CdpError::CommandFailed {
                method: method.to_string(),
                code: error.code,
                message: error.message,
            });
        }

        Ok(reply.result.unwrap_or(Value::Null))
    }

    /// `Page.enable`. Mandatory before any `Page.frameNavigated` events are
    /// delivered; the browser does not emit navigation events for disabled
    /// domains.
    pub async fn page_enable(&self) -> Result<()> {
        self.send_command("Page.enable", json!({})).await.map(drop)
    }

    pub async fn runtime_enable(&self) -> Result<()> {
        self.send_command("Runtime.enable", json!({})).await.map(drop)
    }

    pub async fn debugger_enable(&self) -> Result<()> {
        self.send_command("Debugger.enable", json!({})).await.map(drop)
    }

    pub async fn network_enable(&self) -> Result<()> {
        self.send_command("Network.enable", json!({})).await.map(drop)
    }

    /// `Console.enable` is pass-through and not supported by every target;
    /// callers treat failures as non-fatal.
    pub async fn console_enable(&self) -> Result<()> {
        self.send_command("Console.enable", json!({})).await.map(drop)
    }

    /// `Log.enable`, same caveat as [`CdpClient::console_enable`].
    pub async fn log_enable(&self) -> Result<()> {
        self.send_command("Log.enable", json!({})).await.map(drop)
    }

    /// `Runtime.runIfWaitingForDebugger`: releases a target that was spawned
    /// with wait-for-debugger semantics. A no-op on targets that are already
    /// running.
    pub async fn runtime_run_if_waiting_for_debugger(&self) -> Result<()> {
        self.send_command("Runtime.runIfWaitingForDebugger", json!({}))
            .await
            .map(drop)
    }

    async fn remove_pending(&self, id: u64) {
        let mut pending = self.inner.pending.lock().await;
        pending.remove(&id);
    }
}

async fn read_loop(mut stream: WsStream, inner: Arc<Inner>) {
    loop {
        let message = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            msg = stream.next() => msg,
        };

        let message = match message {
            Some(Ok(msg)) => msg,
            Some(Err(err)) => {
                tracing::debug!(target: "ember.cdp", error = %err, "websocket read failed");
                break;
            }
            None => break,
        };

        let text = match message {
            Message::Text(text) => text,
            Message::Ping(payload) => {
                let mut sink = inner.sink.lock().await;
                let _ = sink.send(Message::Pong(payload)).await;
                continue;
            }
            Message::Close(_) => break,
            // CDP is text-only; binary/pong frames are ignored.
            _ => continue,
        };

        let incoming: Incoming = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(target: "ember.cdp", error = %err, "dropping unparseable CDP frame");
                continue;
            }
        };

        if let Some(id) = incoming.id {
            let tx = {
                let mut pending = inner.pending.lock().await;
                pending.remove(&id)
            };
            if let Some(tx) = tx {
                let _ = tx.send(Reply {
                    result: incoming.result,
                    error: incoming.error,
                });
            }
        } else if let Some(method) = incoming.method {
            let _ = inner.events.send(CdpEvent {
                method,
                params: incoming.params,
            });
        }
    }

    inner.shutdown.cancel();

    let pending = {
        let mut pending = inner.pending.lock().await;
        std::mem::take(&mut *pending)
    };
    drop(pending); // dropping the senders fails every waiter with ConnectionClosed
}
