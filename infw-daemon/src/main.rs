use anyhow::{Context, Result};
use clap::Parser;

use infw_daemon::cli::DaemonCli;
use infw_daemon::logging;
use infw_daemon::orchestrator::Orchestrator;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = DaemonCli::parse();
    let config = cli.load_config().await?;

    if cli.validate {
        let rules = infw_engine::load_rules(&config.firewall.rules_path)
            .await
            .with_context(|| format!("invalid rules file {}", config.firewall.rules_path))?;
        infw_engine::codec::validate(&rules).context("rules do not fit the rule table")?;
        println!(
            "configuration OK ({} backend, {} interface(s) in {})",
            config.firewall.backend,
            rules.len(),
            config.firewall.rules_path
        );
        return Ok(());
    }

    logging::init_tracing(&config.general)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "infw-daemon starting"
    );

    let mut orchestrator = Orchestrator::build(config)?;
    orchestrator.run().await?;

    tracing::info!("infw-daemon shut down");
    Ok(())
}
