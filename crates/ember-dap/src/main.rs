use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Ember WebView2 debug adapter.
///
/// Speaks DAP over stdio: launches (or attaches to) a WebView2 host
/// application, discovers the debuggable page target and bridges the IDE to
/// it over CDP.
#[derive(Debug, Parser)]
#[command(name = "ember-dap", version, about)]
struct Cli {
    /// Log filter, e.g. `ember=debug`. Falls back to `EMBER_LOG`, then to
    /// warnings only.
    #[arg(long)]
    log: Option<String>,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // stdout carries the DAP stream, so logs go to stderr.
    let filter = match cli.log {
        Some(spec) => EnvFilter::try_new(spec)?,
        None => EnvFilter::try_from_env("EMBER_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    ember_dap::server::serve(tokio::io::stdin(), tokio::io::stdout()).await?;
    Ok(())
}
