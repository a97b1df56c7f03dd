use anyhow::Result;
use kiln_core::{Config, ModelRegistry};

use crate::daemon::DaemonClient;

pub async fn execute() -> Result<()> {
    let config = Config::load()?;
    let client = DaemonClient::from_config(&config)?;

    println!("kiln status\n");

    let daemon_running = client.check_health().await;
    println!(
        "Daemon: {} ({})",
        if daemon_running { "running" } else { "not running" },
        client.url()
    );

    let registry = ModelRegistry::load()?;
    println!("Registered models: {}", registry.list().len());
    println!("Default keep-alive: {}", config.cache.keep_alive);

    if !daemon_running {
        println!("\nRun `kiln serve` to start the daemon.");
        return Ok(());
    }

    let running = client.running_models().await?;
    if running.is_empty() {
        println!("\nNo models resident.");
        return Ok(());
    }

    println!("\n{:<40} {:<10} {}", "RESIDENT", "ACTIVE", "EXPIRES");
    println!("{}", "-".repeat(80));
    for model in running {
        println!(
            "{:<40} {:<10} {}",
            model.name, model.active_requests, model.expires_at
        );
    }

    Ok(())
}
