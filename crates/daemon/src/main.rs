// workloopd: standalone daemon entry point.

use anyhow::Context;
use tracing::info;
use workloop_daemon::config::DaemonConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = DaemonConfig::load().context("failed to load ~/.workloop/config.toml")?;
    let data_dir = config.resolve_data_dir(None).context("failed to resolve data directory")?;

    info!(data_dir = %data_dir.display(), "starting workloop daemon");
    workloop_daemon::runtime::run_standalone(config, data_dir)
        .await
        .context("workloop daemon terminated unexpectedly")
}
