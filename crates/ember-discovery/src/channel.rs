//! Out-of-band WebView creation notification channel.
//!
//! The WebView2 debug bootstrap writes one JSON record to a local endpoint
//! (a named pipe on Windows, a Unix domain socket elsewhere) for every
//! debuggable view the host process creates. The channel parses those
//! records and hands them to the target correlator; a malformed record is
//! dropped, never fatal to the channel.

use std::{
    io,
    sync::atomic::{AtomicU64, Ordering},
};

use serde::Deserialize;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;

use crate::{DiscoveryError, Result};

/// One record from the channel: a debuggable view was created.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewNotification {
    /// Devtools target id, stable for the lifetime of the view.
    pub id: String,
    #[serde(default)]
    pub url: String,
    /// Devtools target type; part of the WebSocket URL path.
    #[serde(rename = "type", default = "default_target_type")]
    pub target_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub favicon_url: String,
    /// Contents of the `DevToolsActivePort` file when the host was asked for
    /// an automatic port: a multi-line blob whose first line is the decimal
    /// port number.
    pub devtools_active_port: Option<String>,
}

fn default_target_type() -> String {
    "page".to_string()
}

/// Endpoint name for one launch session's channel.
///
/// Windows hosts derive the full pipe path from the executable name plus the
/// short name passed through the environment; on other platforms (used by the
/// test suite) the endpoint is a socket path in the temp directory.
#[derive(Debug, Clone)]
pub struct ChannelName {
    executable: String,
    name: String,
}

impl ChannelName {
    pub fn for_executable(executable: &str) -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        let executable = executable
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(executable)
            .to_string();
        let name = format!(
            "EmberDebug_{}_{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        );
        Self { executable, name }
    }

    /// The value injected into `WEBVIEW2_PIPE_FOR_SCRIPT_DEBUGGER`.
    pub fn endpoint(&self) -> String {
        #[cfg(windows)]
        {
            self.name.clone()
        }
        #[cfg(not(windows))]
        {
            self.socket_path().display().to_string()
        }
    }

    #[cfg(windows)]
    fn pipe_path(&self) -> String {
        format!(
            r"\\.\pipe\WebView2\Debugger\{}\{}",
            self.executable, self.name
        )
    }

    #[cfg(not(windows))]
    fn socket_path(&self) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("{}_{}.sock", self.executable, self.name))
    }
}

/// The listening half of the notification channel.
///
/// At most one channel is live per adapter session; re-launching must close
/// the previous channel before binding the same name again.
#[derive(Debug)]
pub struct NotificationChannel {
    endpoint: String,
    shutdown: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
}

impl NotificationChannel {
    /// Bind the endpoint and start accepting records.
    ///
    /// Fails with [`DiscoveryError::ChannelBind`] when the name is already
    /// taken by a live listener. A stale socket file left behind by a dead
    /// listener is reclaimed.
    pub async fn bind(name: &ChannelName) -> Result<(Self, mpsc::Receiver<ViewNotification>)> {
        let listener = bind_listener(name).await?;
        let (tx, rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(listener, tx, shutdown.clone()));

        Ok((
            Self {
                endpoint: name.endpoint(),
                shutdown,
                accept_task: Some(accept_task),
            },
            rx,
        ))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Cancelling this token tears the channel down; the correlator cancels
    /// it once a winner is resolved.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Close the channel. Idempotent; once it returns, no further records
    /// will be delivered and the endpoint name can be bound again.
    pub async fn close(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for NotificationChannel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(not(windows))]
struct Listener {
    inner: tokio::net::UnixListener,
    path: std::path::PathBuf,
}

#[cfg(not(windows))]
async fn bind_listener(name: &ChannelName) -> Result<Listener> {
    use tokio::net::{UnixListener, UnixStream};

    let path = name.socket_path();
    let inner = match UnixListener::bind(&path) {
        Ok(listener) => listener,
        Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
            // A previous listener may have died without unlinking its socket.
            // Only reclaim the name if nothing is actually accepting on it.
            if UnixStream::connect(&path).await.is_ok() {
                return Err(DiscoveryError::ChannelBind {
                    endpoint: path.display().to_string(),
                    source: err,
                });
            }
            let _ = std::fs::remove_file(&path);
            UnixListener::bind(&path).map_err(|source| DiscoveryError::ChannelBind {
                endpoint: path.display().to_string(),
                source,
            })?
        }
        Err(source) => {
            return Err(DiscoveryError::ChannelBind {
                endpoint: path.display().to_string(),
                source,
            })
        }
    };

    Ok(Listener { inner, path })
}

#[cfg(not(windows))]
async fn accept_loop(
    listener: Listener,
    tx: mpsc::Sender<ViewNotification>,
    shutdown: CancellationToken,
) {
    let mut readers = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.inner.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        readers.spawn(read_records(stream, tx.clone(), shutdown.clone()));
                    }
                    Err(err) => {
                        tracing::warn!(
                            target: "ember.discovery",
                            error = %err,
                            "notification channel accept failed"
                        );
                        break;
                    }
                }
            }
            Some(_done) = readers.join_next(), if !readers.is_empty() => {}
        }
    }

    // Abort in-flight readers so no record is delivered after close() resolves.
    readers.shutdown().await;
    let _ = std::fs::remove_file(&listener.path);
}

#[cfg(windows)]
struct Listener {
    next: tokio::net::windows::named_pipe::NamedPipeServer,
    path: String,
}

#[cfg(windows)]
async fn bind_listener(name: &ChannelName) -> Result<Listener> {
    use tokio::net::windows::named_pipe::ServerOptions;

    let path = name.pipe_path();
    let next = ServerOptions::new()
        .first_pipe_instance(true)
        .create(&path)
        .map_err(|source| DiscoveryError::ChannelBind {
            endpoint: path.clone(),
            source,
        })?;

    Ok(Listener { next, path })
}

#[cfg(windows)]
async fn accept_loop(
    mut listener: Listener,
    tx: mpsc::Sender<ViewNotification>,
    shutdown: CancellationToken,
) {
    use tokio::net::windows::named_pipe::ServerOptions;

    let mut readers = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            connected = listener.next.connect() => {
                if let Err(err) = connected {
                    tracing::warn!(
                        target: "ember.discovery",
                        error = %err,
                        "notification channel accept failed"
                    );
                    break;
                }
                // Each accepted client takes the current pipe instance; a
                // fresh instance keeps listening for the next view.
                let replacement = match ServerOptions::new().create(&listener.path) {
                    Ok(server) => server,
                    Err(err) => {
                        tracing::warn!(
                            target: "ember.discovery",
                            error = %err,
                            "failed to re-create pipe instance"
                        );
                        break;
                    }
                };
                let stream = std::mem::replace(&mut listener.next, replacement);
                readers.spawn(read_records(stream, tx.clone(), shutdown.clone()));
            }
            Some(_done) = readers.join_next(), if !readers.is_empty() => {}
        }
    }

    readers.shutdown().await;
}

async fn read_records<S>(
    stream: S,
    tx: mpsc::Sender<ViewNotification>,
    shutdown: CancellationToken,
) where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => return,
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(err) => {
                tracing::debug!(
                    target: "ember.discovery",
                    error = %err,
                    "notification connection read failed"
                );
                return;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<ViewNotification>(&line) {
            Ok(record) => {
                if tx.send(record).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                // Per-record failure only; the channel keeps going.
                tracing::warn!(
                    target: "ember.discovery",
                    error = %err,
                    "dropping malformed view notification record"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(windows))]
    #[tokio::test]
    async fn records_are_parsed_and_malformed_lines_dropped() {
        use tokio::io::AsyncWriteExt;

        let name = ChannelName::for_executable("/opt/host/app.exe");
        let (mut channel, mut records) = NotificationChannel::bind(&name).await.unwrap();

        let mut stream = tokio::net::UnixStream::connect(channel.endpoint())
            .await
            .unwrap();
        stream
            .write_all(b"{not json}\n{\"id\":\"view-1\",\"url\":\"about:blank\",\"type\":\"page\",\"devtoolsActivePort\":\"9230\\nrest\"}\n")
            .await
            .unwrap();
        stream.shutdown().await.unwrap();

        let record = records.recv().await.unwrap();
        assert_eq!(record.id, "view-1");
        assert_eq!(record.target_type, "page");
        assert_eq!(record.devtools_active_port.as_deref(), Some("9230\nrest"));

        channel.close().await;
        assert!(records.recv().await.is_none());
    }

    #[cfg(not(windows))]
    #[tokio::test]
    async fn rebinding_after_close_does_not_fail() {
        let name = ChannelName::for_executable("host.exe");

        let (mut first, _records) = NotificationChannel::bind(&name).await.unwrap();
        first.close().await;

        let (mut second, _records) = NotificationChannel::bind(&name).await.unwrap();
        second.close().await;
    }

    #[cfg(not(windows))]
    #[tokio::test]
    async fn binding_over_a_live_listener_fails() {
        let name = ChannelName::for_executable("host.exe");

        let (mut live, _records) = NotificationChannel::bind(&name).await.unwrap();
        let err = NotificationChannel::bind(&name).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::ChannelBind { .. }));

        live.close().await;
    }

    #[cfg(not(windows))]
    #[tokio::test]
    async fn close_is_idempotent() {
        let name = ChannelName::for_executable("host.exe");
        let (mut channel, _records) = NotificationChannel::bind(&name).await.unwrap();
        channel.close().await;
        channel.close().await;
    }
}
