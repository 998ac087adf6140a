//! The target correlator: races candidate WebViews against the launch's
//! target filter and resolves the pending launch with the winner's port.
//!
//! One correlator task owns all per-session state (candidate list, resolved
//! flag); the notification channel and the per-probe event watchers only
//! talk to it over channels. That keeps the exactly-once winner guarantee a
//! single `resolved` check inside one task instead of shared mutable fields.

use ember_cdp::{CdpClient, CdpEvent};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    channel::ViewNotification, matcher::TargetFilter, session::SessionResolver, DEFAULT_DEBUG_PORT,
};

/// Effective debug port for one candidate.
///
/// The `DevToolsActivePort` descriptor (first line, decimal) takes precedence
/// over the requested port; an absent or unparsable descriptor falls back to
/// the requested port, and 2015 when neither yields anything.
pub fn resolve_debug_port(record: &ViewNotification, requested: u16) -> u16 {
    let descriptor_port = record
        .devtools_active_port
        .as_deref()
        .and_then(|blob| blob.lines().next())
        .and_then(|line| line.trim().parse::<u16>().ok())
        .filter(|port| *port != 0);

    match descriptor_port {
        Some(port) => port,
        None if requested != 0 => requested,
        None => DEFAULT_DEBUG_PORT,
    }
}

struct Candidate {
    connection: CdpClient,
    watcher: JoinHandle<()>,
}

/// One navigation observed on a probe. Carries the candidate's port so the
/// match can be decided even while the candidate's registration message is
/// still queued behind it.
struct Navigation {
    candidate_id: String,
    port: u16,
    url: String,
}

pub(crate) struct CorrelatorParams {
    pub filter: TargetFilter,
    pub requested_port: u16,
    pub address: String,
    pub resolver: SessionResolver,
    /// The notification channel's shutdown token; cancelled on resolution so
    /// the channel does not outlive the race.
    pub channel_shutdown: CancellationToken,
}

pub(crate) fn spawn(
    records: mpsc::Receiver<ViewNotification>,
    params: CorrelatorParams,
) -> JoinHandle<()> {
    tokio::spawn(run(records, params))
}

async fn run(mut records: mpsc::Receiver<ViewNotification>, params: CorrelatorParams) {
    let CorrelatorParams {
        filter,
        requested_port,
        address,
        resolver,
        channel_shutdown,
    } = params;

    let mut candidates: Vec<Candidate> = Vec::new();
    // Navigation observations from all live probes.
    let (nav_tx, mut nav_rx) = mpsc::unbounded_channel::<Navigation>();
    // Probes that finished opening. Each open runs as its own task so a
    // slow or hung endpoint cannot stall record processing or the match.
    let (candidate_tx, mut candidate_rx) = mpsc::unbounded_channel::<Candidate>();

    let winner_port = loop {
        tokio::select! {
            record = records.recv() => {
                match record {
                    Some(record) => {
                        let address = address.clone();
                        let nav_tx = nav_tx.clone();
                        let candidate_tx = candidate_tx.clone();
                        tokio::spawn(async move {
                            let Some(candidate) =
                                open_probe(record, requested_port, &address, &nav_tx).await
                            else {
                                return;
                            };
                            // The race may have resolved while this open was
                            // in flight; nobody else will close the probe.
                            if let Err(rejected) = candidate_tx.send(candidate) {
                                let candidate = rejected.0;
                                candidate.watcher.abort();
                                candidate.connection.close().await;
                            }
                        });
                    }
                    // Channel closed with no winner: resolve the no-target
                    // sentinel so the launch sequencer does not hang.
                    None => break 0,
                }
            }
            Some(candidate) = candidate_rx.recv() => {
                candidates.push(candidate);
            }
            observed = nav_rx.recv() => {
                let Some(navigation) = observed else { break 0 };
                if !filter.matches(&navigation.url) {
                    tracing::debug!(
                        target: "ember.discovery",
                        candidate = %navigation.candidate_id,
                        url = %navigation.url,
                        "navigation did not match target filter"
                    );
                    continue;
                }
                tracing::debug!(
                    target: "ember.discovery",
                    candidate = %navigation.candidate_id,
                    url = %navigation.url,
                    port = navigation.port,
                    "found WebView target matching filter"
                );
                break navigation.port;
            }
        }
    };

    // Resolution (or give-up) is a single point: report exactly once, then
    // tear down every probe and the channel itself. The winner's probe is
    // closed too; the session adapter performs its own full attach.
    resolver.resolve(winner_port);
    candidate_rx.close();
    while let Ok(candidate) = candidate_rx.try_recv() {
        candidates.push(candidate);
    }
    for candidate in candidates.drain(..) {
        candidate.watcher.abort();
        candidate.connection.close().await;
    }
    channel_shutdown.cancel();
}

async fn open_probe(
    record: ViewNotification,
    requested_port: u16,
    address: &str,
    nav_tx: &mpsc::UnboundedSender<Navigation>,
) -> Option<Candidate> {
    let port = resolve_debug_port(&record, requested_port);
    let url = format!(
        "ws://{}:{}/devtools/{}/{}",
        address, port, record.target_type, record.id
    );

    let connection = match CdpClient::connect(&url).await {
        Ok(connection) => connection,
        Err(err) => {
            // Per-candidate failure: the view may already be gone. Drop it
            // and keep waiting for the others.
            tracing::warn!(
                target: "ember.discovery",
                candidate = %record.id,
                url = %url,
                error = %err,
                "failed to open probe connection; dropping candidate"
            );
            return None;
        }
    };

    let events = connection.subscribe_events();

    // Navigation events are only emitted once the Page domain is enabled.
    if let Err(err) = connection.page_enable().await {
        tracing::warn!(
            target: "ember.discovery",
            candidate = %record.id,
            error = %err,
            "probe Page.enable failed; dropping candidate"
        );
        connection.close().await;
        return None;
    }

    // Unblock the candidate right away: wait-for-debugger only gates the very
    // first script, and a view under evaluation must not stay frozen.
    if let Err(err) = connection.runtime_run_if_waiting_for_debugger().await {
        tracing::warn!(
            target: "ember.discovery",
            candidate = %record.id,
            error = %err,
            "probe runIfWaitingForDebugger failed"
        );
    }

    let watcher = tokio::spawn(forward_navigations(
        record.id.clone(),
        port,
        events,
        nav_tx.clone(),
    ));

    Some(Candidate {
        connection,
        watcher,
    })
}

async fn forward_navigations(
    candidate_id: String,
    port: u16,
    mut events: broadcast::Receiver<CdpEvent>,
    nav_tx: mpsc::UnboundedSender<Navigation>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Closed) => return,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
        };

        if event.method != "Page.frameNavigated" {
            continue;
        }

        let Some(url) = event.params["frame"]["url"].as_str() else {
            continue;
        };
        let navigation = Navigation {
            candidate_id: candidate_id.clone(),
            port,
            url: url.to_string(),
        };
        if nav_tx.send(navigation).is_err() {
            return;
        }
    }
}
