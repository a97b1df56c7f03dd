//! HTTP client for a running daemon

use anyhow::{Context, Result};
use kiln_core::Config;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

pub struct DaemonClient {
    client: reqwest::Client,
    url: String,
}

/// An entry of `/api/ps`.
#[derive(Debug, Deserialize)]
pub struct RunningModel {
    pub name: String,
    pub expires_at: String,
    #[serde(default)]
    pub active_requests: usize,
}

#[derive(Deserialize)]
struct RunningModels {
    models: Vec<RunningModel>,
}

impl DaemonClient {
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            url: format!("http://{}:{}", config.daemon.host, config.daemon.port),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Check daemon health via HTTP
    pub async fn check_health(&self) -> bool {
        match self.client.get(format!("{}/health", self.url)).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    pub async fn running_models(&self) -> Result<Vec<RunningModel>> {
        let response = self
            .client
            .get(format!("{}/api/ps", self.url))
            .send()
            .await
            .context("daemon is not reachable")?
            .error_for_status()?;
        Ok(response.json::<RunningModels>().await?.models)
    }

    /// Unload through a zero keep-alive, the way Ollama clients do it.
    pub async fn unload(&self, model: &str) -> Result<()> {
        self.client
            .post(format!("{}/api/generate", self.url))
            .json(&json!({ "model": model, "keep_alive": 0, "stream": false }))
            .send()
            .await
            .context("daemon is not reachable")?
            .error_for_status()?;
        Ok(())
    }
}
