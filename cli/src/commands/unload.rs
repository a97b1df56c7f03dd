use anyhow::Result;
use kiln_core::Config;

use crate::daemon::DaemonClient;

pub async fn execute(model: &str) -> Result<()> {
    let client = DaemonClient::from_config(&Config::load()?)?;

    if !client.check_health().await {
        println!("Daemon is not running at {}.", client.url());
        return Ok(());
    }

    client.unload(model).await?;
    println!("Model '{}' unloaded.", model);
    Ok(())
}
