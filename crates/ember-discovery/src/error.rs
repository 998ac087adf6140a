use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Configuration error: reported before anything is spawned.
    #[error("'{0}' must be set when using 'useWebView'")]
    MissingField(&'static str),

    #[error("only WebView launches are supported here (set 'useWebView' in the launch config)")]
    NotWebView,

    #[error("failed to bind WebView notification channel at {endpoint}: {source}")]
    ChannelBind {
        endpoint: String,
        source: io::Error,
    },

    #[error("failed to spawn host process {executable:?}: {source}")]
    Spawn {
        executable: String,
        source: io::Error,
    },

    /// The host process exited while the launch was still waiting for a
    /// debuggable WebView.
    #[error("the host process exited before a debuggable WebView was found")]
    HostExited,

    /// The notification channel closed (or every candidate was exhausted)
    /// without any target matching the requested URL.
    #[error("no WebView target matched the requested URL")]
    NoTarget,

    #[error("timed out waiting for a debuggable WebView target")]
    AttachTimeout,

    /// The pending launch was consumed twice. Indicates a caller bug, not a
    /// discovery failure.
    #[error("the launch session was already awaited")]
    AlreadyAwaited,

    #[error(transparent)]
    Io(#[from] io::Error),
}
