//! The DAP session adapter: a request loop over stdio (or any byte streams)
//! that drives the launch sequencer, waits for the discovery winner, attaches
//! over CDP and releases the target exactly once.

use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};

use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{info, warn};

use ember_cdp::CdpClient;
use ember_discovery::{
    launch, DiscoveryError, LaunchConfig, LaunchedSession, TargetFilter, DEFAULT_DEBUG_PORT,
};

use crate::{
    attach::{attach, AttachError},
    dap::{make_event, make_response, DapError, DapReader, DapWriter, Request},
};

#[derive(Debug, Error)]
enum SessionError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Attach(#[from] AttachError),

    #[error("CDP setup failed: {0}")]
    Cdp(#[from] ember_cdp::CdpError),

    #[error("invalid launch arguments: {0}")]
    Arguments(String),
}

/// Sequenced outbound side of the DAP connection. All responses and events
/// funnel through one writer task so `seq` stays monotonic no matter which
/// task produced the message.
#[derive(Clone)]
struct Outbox {
    tx: mpsc::UnboundedSender<Value>,
    seq: Arc<AtomicI64>,
}

impl Outbox {
    fn next_seq(&self) -> i64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    fn respond(&self, request: &Request, success: bool, body: Option<Value>, message: Option<String>) {
        let response = make_response(self.next_seq(), request, success, body, message);
        if let Ok(value) = serde_json::to_value(&response) {
            let _ = self.tx.send(value);
        }
    }

    fn event(&self, name: &str, body: Option<Value>) {
        let event = make_event(self.next_seq(), name, body);
        if let Ok(value) = serde_json::to_value(&event) {
            let _ = self.tx.send(value);
        }
    }
}

/// State of the single debug session this adapter instance serves.
#[derive(Default)]
struct Session {
    launched: Option<LaunchedSession>,
    cdp: Option<CdpClient>,
    /// `Runtime.runIfWaitingForDebugger` must be sent at most once per
    /// session; probes during discovery do not count against this because
    /// they run on connections that are closed before the confirmed attach.
    resumed: bool,
}

impl Session {
    async fn shutdown(&mut self) {
        if let Some(cdp) = self.cdp.take() {
            cdp.close().await;
        }
        if let Some(mut launched) = self.launched.take() {
            launched.close_channel().await;
            launched.host.terminate();
        }
    }
}

/// Serve one DAP session over the given streams. Returns when the client
/// disconnects or sends `disconnect`/`terminate`.
pub async fn serve<R, W>(input: R, output: W) -> Result<(), DapError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut reader = DapReader::new(input);
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();

    let writer_task = tokio::spawn(async move {
        let mut writer = DapWriter::new(output);
        while let Some(value) = rx.recv().await {
            if let Err(err) = writer.write_value(&value).await {
                warn!(target: "ember.dap", error = %err, "failed to write DAP message");
                break;
            }
        }
    });

    let outbox = Outbox {
        tx,
        seq: Arc::new(AtomicI64::new(1)),
    };
    let mut session = Session::default();

    while let Some(request) = reader.read_request().await? {
        let done = handle_request(&request, &outbox, &mut session).await;
        if done {
            break;
        }
    }

    session.shutdown().await;
    drop(outbox);
    let _ = writer_task.await;
    Ok(())
}

/// Dispatch a single request. Returns true when the session is over.
async fn handle_request(request: &Request, outbox: &Outbox, session: &mut Session) -> bool {
    match request.command.as_str() {
        "initialize" => {
            outbox.respond(request, true, Some(capabilities()), None);
            outbox.event("initialized", None);
        }
        "launch" => match handle_launch(request, outbox, session).await {
            Ok(()) => outbox.respond(request, true, None, None),
            Err(err) => {
                warn!(target: "ember.dap", error = %err, "launch failed");
                session.shutdown().await;
                outbox.respond(request, false, None, Some(err.to_string()));
                outbox.event("terminated", None);
            }
        },
        "attach" => match handle_attach(request, outbox, session).await {
            Ok(()) => outbox.respond(request, true, None, None),
            Err(err) => {
                warn!(target: "ember.dap", error = %err, "attach failed");
                session.shutdown().await;
                outbox.respond(request, false, None, Some(err.to_string()));
                outbox.event("terminated", None);
            }
        },
        "configurationDone" => {
            outbox.respond(request, true, None, None);
        }
        "threads" => {
            let body = json!({
                "threads": [{ "id": 1, "name": "WebView Thread" }]
            });
            outbox.respond(request, true, Some(body), None);
        }
        "disconnect" | "terminate" => {
            session.shutdown().await;
            outbox.respond(request, true, None, None);
            outbox.event("terminated", None);
            return true;
        }
        other => {
            outbox.respond(
                request,
                false,
                None,
                Some(format!("unsupported command {other:?}")),
            );
        }
    }
    false
}

fn capabilities() -> Value {
    json!({
        "supportsConfigurationDoneRequest": true,
        "supportsTerminateRequest": true,
    })
}

async fn handle_launch(
    request: &Request,
    outbox: &Outbox,
    session: &mut Session,
) -> Result<(), SessionError> {
    let config: LaunchConfig = request
        .arguments_as()
        .map_err(|err| SessionError::Arguments(err.to_string()))?;

    let mut launched = launch(&config).await?;

    if !launched.attach {
        // noDebug: the host runs, nothing attaches and nothing waits.
        session.launched = Some(launched);
        return Ok(());
    }

    let port = match launched.wait_for_port(config.attach_timeout()).await {
        Ok(port) => port,
        Err(err) => {
            launched.close_channel().await;
            launched.host.terminate();
            return Err(err.into());
        }
    };
    // Already closed by the correlator when a winner was found; harmless
    // again here.
    launched.close_channel().await;

    info!(target: "ember.dap", port, "WebView target resolved, attaching");
    session.launched = Some(launched);

    let filter = TargetFilter::new(config.target_url().as_deref());
    let cdp = attach(config.address(), port, &filter, config.attach_timeout()).await?;

    finish_attach(cdp, outbox, session).await
}

async fn handle_attach(
    request: &Request,
    outbox: &Outbox,
    session: &mut Session,
) -> Result<(), SessionError> {
    let config: LaunchConfig = request
        .arguments_as()
        .map_err(|err| SessionError::Arguments(err.to_string()))?;

    let port = if config.port == 0 {
        DEFAULT_DEBUG_PORT
    } else {
        config.port
    };

    let filter = TargetFilter::new(config.target_url().as_deref());
    let cdp = attach(config.address(), port, &filter, config.attach_timeout()).await?;

    finish_attach(cdp, outbox, session).await
}

/// Shared tail of launch and attach: enable the baseline domains on the
/// confirmed connection, release the target, and watch for disconnects.
async fn finish_attach(
    cdp: CdpClient,
    outbox: &Outbox,
    session: &mut Session,
) -> Result<(), SessionError> {
    enable_baseline_domains(&cdp).await?;

    if !session.resumed {
        // At most once per session; a failure means the target was already
        // running, which is not worth unwinding the attach for.
        if let Err(err) = cdp.runtime_run_if_waiting_for_debugger().await {
            warn!(target: "ember.dap", error = %err, "runIfWaitingForDebugger failed");
        }
        session.resumed = true;
    }

    // When the browser side drops the connection the IDE must learn the
    // session is over instead of sitting on a dead adapter.
    let token = cdp.shutdown_token();
    let watcher_outbox = outbox.clone();
    tokio::spawn(async move {
        token.cancelled().await;
        watcher_outbox.event("terminated", None);
    });

    session.cdp = Some(cdp);
    Ok(())
}

/// Enable the domains every debug session relies on. `Console` and `Log` are
/// pass-through domains some targets reject; those failures are logged and
/// tolerated.
async fn enable_baseline_domains(cdp: &CdpClient) -> Result<(), ember_cdp::CdpError> {
    cdp.debugger_enable().await?;
    cdp.runtime_enable().await?;
    cdp.page_enable().await?;
    cdp.network_enable().await?;

    if let Err(err) = cdp.console_enable().await {
        warn!(target: "ember.dap", error = %err, "Console.enable rejected, continuing");
    }
    if let Err(err) = cdp.log_enable().await {
        warn!(target: "ember.dap", error = %err, "Log.enable rejected, continuing");
    }
    Ok(())
}
