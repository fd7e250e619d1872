use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use collective_core::{init_tracing, load_config};
use tracing::{info, warn};

mod federation;

use federation::FederationModule;

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config("coordinator")?;
    init_tracing(&config.service_name, &config.log_level)?;
    let sweep_every = Duration::from_secs(config.rounds.sweep_interval_secs.max(1));
    info!(target: "coordinator", service = %config.service_name, sweep_secs = sweep_every.as_secs(), "Starting coordinator service");

    let module = Arc::new(FederationModule::new(config)?);
    let sweeper_module = module.clone();
    let sweeper = tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_every);
        loop {
            interval.tick().await;
            let m = sweeper_module.clone();
            match tokio::task::spawn_blocking(move || m.sweep()).await {
                Ok(expired) if !expired.is_empty() => {
                    let stats = sweeper_module.service().get_statistics();
                    info!(completed = stats.completed_rounds, aborted = stats.aborted_rounds, active_nodes = stats.active_nodes, "round_statistics");
                }
                Ok(_) => {}
                Err(e) => warn!(error = ?e, "sweep_task_failed"),
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown_signal_received");
    sweeper.abort();
    module.shutdown()?;
    Ok(())
}
