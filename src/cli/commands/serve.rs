//! Serve command - run an instance until Ctrl-C

use crate::cli::args::ServeArgs;
use crate::config::Config;
use crate::error::{CommuneError, CommuneResult};
use crate::instance::Instance;
use console::style;
use tracing::warn;

/// Execute the serve command
pub async fn execute(args: ServeArgs, config: &Config) -> CommuneResult<()> {
    let mut config = config.clone();
    args.node.apply(&mut config);

    let instance = Instance::start(&config).await?;
    match instance.listen_addr() {
        Some(addr) => eprintln!(
            "  {} Instance {} listening on {}",
            style("[OK]").green(),
            style(instance.id()).bold(),
            addr
        ),
        None => warn!("No listen port configured, only dialing out"),
    }
    for peer in instance.server().peers() {
        eprintln!("  {} Linked to {}", style("[OK]").green(), peer);
    }

    let stopped = tokio::signal::ctrl_c()
        .await
        .map_err(|e| CommuneError::io("waiting for Ctrl-C", e));
    instance.shutdown();
    stopped
}
