//! The launch sequencer: spawn the host process with the right debug
//! environment and gate the IDE-facing attach on target resolution.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use tokio::{process::Command, sync::oneshot};
use tokio_util::sync::CancellationToken;

use crate::{
    channel::{ChannelName, NotificationChannel},
    config::{LaunchConfig, UseWebView},
    correlator::{self, CorrelatorParams},
    error::DiscoveryError,
    matcher::TargetFilter,
    session::SessionResolver,
    Result, DEFAULT_DEBUG_PORT,
};

/// Environment contract with the WebView2 debug bootstrap.
const ENV_PIPE: &str = "WEBVIEW2_PIPE_FOR_SCRIPT_DEBUGGER";
const ENV_USER_DATA: &str = "WEBVIEW2_USER_DATA_FOLDER";
const ENV_BROWSER_ARGS: &str = "WEBVIEW2_ADDITIONAL_BROWSER_ARGUMENTS";
const ENV_WAIT_FOR_DEBUGGER: &str = "WEBVIEW2_WAIT_FOR_SCRIPT_DEBUGGER";

/// A spawned host process plus the pending port resolution the attach step
/// waits on. The notification channel handle is surfaced so the session
/// adapter owns its lifetime (closed at shutdown; already closed by the
/// correlator when a winner was found).
#[derive(Debug)]
pub struct LaunchedSession {
    pub channel: Option<NotificationChannel>,
    pub host: HostProcess,
    /// False for `noDebug` launches: the host runs, nothing attaches.
    pub attach: bool,
    port_rx: Option<oneshot::Receiver<u16>>,
    host_exited: Arc<AtomicBool>,
}

impl LaunchedSession {
    /// Wait for the winner port.
    ///
    /// Maps the sentinel and the failure paths onto descriptive errors: the
    /// IDE gets a terminated launch with a reason, never a silent hang.
    pub async fn wait_for_port(&mut self, timeout: Duration) -> Result<u16> {
        let rx = self.port_rx.take().ok_or(DiscoveryError::AlreadyAwaited)?;

        match tokio::time::timeout(timeout, rx).await {
            Err(_elapsed) => Err(DiscoveryError::AttachTimeout),
            Ok(Err(_dropped)) => Err(DiscoveryError::NoTarget),
            Ok(Ok(0)) => {
                if self.host_exited.load(Ordering::SeqCst) {
                    Err(DiscoveryError::HostExited)
                } else {
                    Err(DiscoveryError::NoTarget)
                }
            }
            Ok(Ok(port)) => Ok(port),
        }
    }

    /// Close the notification channel if still open. Idempotent.
    pub async fn close_channel(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close().await;
        }
    }
}

/// Handle to the spawned host process.
#[derive(Debug)]
pub struct HostProcess {
    kill: CancellationToken,
    id: Option<u32>,
}

impl HostProcess {
    fn watch(
        mut child: tokio::process::Child,
        resolver: SessionResolver,
        host_exited: Arc<AtomicBool>,
    ) -> Self {
        let kill = CancellationToken::new();
        let id = child.id();

        let token = kill.clone();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    // Exactly-once resolution doubles as listener
                    // deregistration: once a real port was obtained this
                    // resolve is a no-op and a later, unrelated exit is
                    // ignored.
                    host_exited.store(true, Ordering::SeqCst);
                    if resolver.resolve(0) {
                        tracing::warn!(
                            target: "ember.discovery",
                            status = ?status.ok(),
                            "host process exited before a WebView target was resolved"
                        );
                    }
                }
                _ = token.cancelled() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        });

        Self { kill, id }
    }

    pub fn id(&self) -> Option<u32> {
        self.id
    }

    /// Ask the watcher to kill the host process. Safe to call after the
    /// process already exited.
    pub fn terminate(&self) {
        self.kill.cancel();
    }
}

/// Launch the host process and start target discovery.
///
/// Validation happens before anything is spawned; the returned session's
/// [`LaunchedSession::wait_for_port`] gates the attach.
pub async fn launch(config: &LaunchConfig) -> Result<LaunchedSession> {
    let advanced = match config.use_web_view {
        UseWebView::Disabled => return Err(DiscoveryError::NotWebView),
        UseWebView::Simple => false,
        UseWebView::Advanced => true,
    };
    let executable = config
        .runtime_executable
        .clone()
        .ok_or(DiscoveryError::MissingField("runtimeExecutable"))?;

    let (resolver, port_rx) = SessionResolver::new();
    let host_exited = Arc::new(AtomicBool::new(false));
    let mut env = config.env.clone();
    let mut channel = None;

    let debug = !config.no_debug;
    if debug {
        if advanced {
            // Advanced discovery wants an automatic port unless the user
            // pinned one explicitly; the well-known default counts as
            // "not pinned".
            let requested_port = if config.port == DEFAULT_DEBUG_PORT {
                0
            } else {
                config.port
            };

            let name = ChannelName::for_executable(&executable);
            let (chan, records) = NotificationChannel::bind(&name).await?;
            env.insert(ENV_PIPE.to_string(), chan.endpoint().to_string());

            correlator::spawn(
                records,
                CorrelatorParams {
                    filter: TargetFilter::new(config.target_url().as_deref()),
                    requested_port,
                    address: config.address().to_string(),
                    resolver: resolver.clone(),
                    channel_shutdown: chan.shutdown_token(),
                },
            );
            channel = Some(chan);

            // Never override an explicit user data dir; discovery must
            // not disturb the host application's own profile handling.
            if let Some(dir) = &config.user_data_dir {
                env.insert(ENV_USER_DATA.to_string(), dir.display().to_string());
            }
            env.insert(
                ENV_BROWSER_ARGS.to_string(),
                format!("--remote-debugging-port={requested_port}"),
            );
        } else {
            let port = if config.port == 0 {
                DEFAULT_DEBUG_PORT
            } else {
                config.port
            };
            let user_data_dir = config.user_data_dir.clone().unwrap_or_else(|| {
                std::env::temp_dir().join(format!("ember-debug-userdatadir_{port}"))
            });
            env.insert(ENV_USER_DATA.to_string(), user_data_dir.display().to_string());
            env.insert(
                ENV_BROWSER_ARGS.to_string(),
                format!("--remote-debugging-port={port}"),
            );

            // Fixed-port mode: no discovery, the winner is known now.
            resolver.resolve(port);
        }

        env.insert(ENV_WAIT_FOR_DEBUGGER.to_string(), "true".to_string());
    }

    let mut command = Command::new(&executable);
    command.args(&config.runtime_args).envs(&env);
    if let Some(cwd) = &config.cwd {
        command.current_dir(cwd);
    }

    tracing::info!(
        target: "ember.discovery",
        executable = %executable,
        dynamic = advanced,
        "spawning WebView host process"
    );

    let child = command.spawn().map_err(|source| DiscoveryError::Spawn {
        executable: executable.clone(),
        source,
    })?;

    let host = HostProcess::watch(child, resolver, host_exited.clone());

    Ok(LaunchedSession {
        channel,
        host,
        attach: debug,
        port_rx: Some(port_rx),
        host_exited,
    })
}
