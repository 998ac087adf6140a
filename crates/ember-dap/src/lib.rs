//! Ember Debug Adapter Protocol implementation.
//!
//! This crate provides:
//! - A DAP server that speaks the VS Code Debug Adapter Protocol over stdio.
//! - The session adapter around WebView2 target discovery: launch the host,
//!   wait for the correlator's winner, attach over CDP, release the target.
//!
//! Breakpoint/stack/variable translation is delegated to the IDE-side debug
//! core; this adapter owns the launch/attach sequencing only.

pub mod dap;
pub mod server;

mod attach;
