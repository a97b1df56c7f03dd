use anyhow::Result;
use kiln_core::Config;
use std::net::SocketAddr;

pub async fn execute(port: Option<u16>) -> Result<()> {
    let config = Config::load()?;
    config.validate()?;

    let port = port.unwrap_or(config.daemon.port);
    let addr: SocketAddr = format!("{}:{}", config.daemon.host, port).parse()?;

    println!("Starting kiln daemon...");
    println!("Listening on http://{}", addr);
    println!("\nAPI endpoints:");
    println!("  GET  /health              - Health check");
    println!("  GET  /v1/models           - List models");
    println!("  POST /v1/chat/completions - Chat completion (OpenAI-compatible)");
    println!("  POST /api/generate        - Generate (Ollama-compatible)");
    println!("  POST /api/chat            - Chat (Ollama-compatible)");
    println!("  GET  /api/ps              - Resident models");
    println!("\nPress Ctrl+C to stop.\n");

    kiln_daemon::run_server(addr, config).await?;

    Ok(())
}
