//! WebView2 target discovery and attach sequencing.
//!
//! An Edge/WebView2 host application may spawn any number of WebView
//! instances, each one asynchronously and each a potential debug target.
//! This crate owns the out-of-band machinery that finds the right one:
//!
//! - the [`NotificationChannel`] the host's debug bootstrap writes a JSON
//!   record to for every debuggable view it creates;
//! - the target correlator, which opens a probe CDP connection per
//!   candidate, watches for `Page.frameNavigated`, and races the candidates
//!   against the launch's [`TargetFilter`] — first match wins, exactly once;
//! - the launch sequencer ([`launch`]), which injects the `WEBVIEW2_*`
//!   environment the host needs to cooperate, spawns it, and gates the
//!   IDE-facing attach on the correlator's resolution.
//!
//! Breakpoints, stacks and the DAP surface itself live elsewhere; this crate
//! only answers "which port do I attach to, and when".

mod channel;
mod config;
mod correlator;
mod error;
mod launch;
mod matcher;
mod poison;
mod session;

pub use channel::{ChannelName, NotificationChannel, ViewNotification};
pub use config::{LaunchConfig, UseWebView};
pub use correlator::resolve_debug_port;
pub use error::DiscoveryError;
pub use launch::{launch, HostProcess, LaunchedSession};
pub use matcher::TargetFilter;

pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Port WebView2 hosts listen on when remote debugging is enabled without an
/// explicit port.
pub const DEFAULT_DEBUG_PORT: u16 = 2015;
