use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use tree_service::{cli::ServiceArgs, server::TreeServer};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = ServiceArgs::parse();
    let config = args.config();
    let server = TreeServer::bind(&config).await?;
    let addr = server.local_addr()?;
    info!(
        traverse_timeout = ?config.traverse_timeout,
        "treeservice listening on {}", addr
    );
    if let Err(err) = server.run_until_ctrl_c().await {
        warn!("treeservice exited with error: {err:?}");
        return Err(err);
    }

    Ok(())
}
