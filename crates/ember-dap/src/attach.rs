//! Confirmed attach: once discovery resolved a debug port, look up the
//! matching page target on the DevTools HTTP endpoint and open a fresh CDP
//! connection to it.

use std::time::{Duration, Instant};

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use ember_cdp::CdpClient;
use ember_discovery::TargetFilter;

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("failed to query the target list: {0}")]
    TargetList(#[from] reqwest::Error),

    #[error("no debuggable page matched the requested URL")]
    NoMatchingTarget,

    #[error("matched target advertises no webSocketDebuggerUrl")]
    MissingDebuggerUrl,

    #[error(transparent)]
    Cdp(#[from] ember_cdp::CdpError),
}

/// One entry of the DevTools `/json/list` response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetDescriptor {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub target_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub web_socket_debugger_url: Option<String>,
}

/// Connect to the page target behind `address:port` that matches `filter`.
///
/// The endpoint may not be serving yet right after resolution (the browser
/// binds the DevTools server asynchronously), so the target list is polled
/// until `deadline` elapses.
pub async fn attach(
    address: &str,
    port: u16,
    filter: &TargetFilter,
    timeout: Duration,
) -> Result<CdpClient, AttachError> {
    let deadline = Instant::now() + timeout;
    let list_url = format!("http://{address}:{port}/json/list");
    let http = reqwest::Client::new();

    loop {
        match fetch_targets(&http, &list_url).await {
            Ok(targets) => {
                if let Some(target) = select_target(&targets, filter) {
                    let Some(ws_url) = target.web_socket_debugger_url.clone() else {
                        return Err(AttachError::MissingDebuggerUrl);
                    };
                    debug!(
                        target: "ember.dap",
                        id = %target.id,
                        url = %target.url,
                        "attaching to resolved page target"
                    );
                    return Ok(CdpClient::connect(&ws_url).await?);
                }
            }
            Err(err) if Instant::now() >= deadline => return Err(err.into()),
            Err(err) => {
                debug!(target: "ember.dap", error = %err, "target list not ready, retrying");
            }
        }

        if Instant::now() >= deadline {
            return Err(AttachError::NoMatchingTarget);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn fetch_targets(
    http: &reqwest::Client,
    url: &str,
) -> Result<Vec<TargetDescriptor>, reqwest::Error> {
    http.get(url)
        .send()
        .await?
        .error_for_status()?
        .json::<Vec<TargetDescriptor>>()
        .await
}

fn select_target<'a>(
    targets: &'a [TargetDescriptor],
    filter: &TargetFilter,
) -> Option<&'a TargetDescriptor> {
    targets
        .iter()
        .filter(|target| target.target_type == "page")
        .find(|target| filter.matches(&target.url))
}
