mod commands;
mod daemon;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(author, version, about = "Serve local language models over OpenAI and Ollama APIs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon server
    Serve {
        /// Port to listen on (defaults to daemon.port)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// List registered models
    #[command(alias = "ls")]
    Models,

    /// Register a local model directory under a name
    Register {
        /// Name clients will use, e.g. "Qwen/Qwen2.5-0.5B-Instruct"
        name: String,

        /// Directory holding config.json, tokenizer.json and safetensors weights
        path: PathBuf,
    },

    /// Ask the daemon to unload a resident model
    Unload {
        /// Model name
        model: String,
    },

    /// Show daemon status and resident models
    Status,

    /// View or set configuration
    Config {
        /// Config key (e.g., "daemon.port", "cache.keep_alive")
        key: Option<String>,

        /// Value to set (if omitted, shows current value)
        value: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port } => {
            commands::serve::execute(port).await?;
        }
        Commands::Models => {
            commands::models::execute().await?;
        }
        Commands::Register { name, path } => {
            commands::models::register(&name, &path).await?;
        }
        Commands::Unload { model } => {
            commands::unload::execute(&model).await?;
        }
        Commands::Status => {
            commands::status::execute().await?;
        }
        Commands::Config { key, value } => {
            commands::config::execute(key.as_deref(), value.as_deref()).await?;
        }
    }

    Ok(())
}
