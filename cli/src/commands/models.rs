use anyhow::{Context, Result};
use kiln_core::{ModelFormat, ModelInfo, ModelRegistry};
use std::path::Path;

pub async fn execute() -> Result<()> {
    let registry = ModelRegistry::load()?;
    let models = registry.list();

    if models.is_empty() {
        println!("No models registered.");
        println!("\nRun `kiln register <name> <path>` to add a local model.");
        return Ok(());
    }

    println!("{:<40} {:<12} {:<10} {}", "NAME", "FORMAT", "SIZE", "ADDED");
    println!("{}", "-".repeat(80));

    for model in models {
        let size = format!("{:.2} GB", model.size_bytes as f64 / 1_073_741_824.0);
        let date = model.added_at.format("%Y-%m-%d").to_string();
        println!(
            "{:<40} {:<12} {:<10} {}",
            model.name,
            model.format.as_str(),
            size,
            date
        );
    }

    Ok(())
}

pub async fn register(name: &str, path: &Path) -> Result<()> {
    let path = path
        .canonicalize()
        .with_context(|| format!("{} does not exist", path.display()))?;
    if !path.join("config.json").exists() {
        anyhow::bail!("{} has no config.json", path.display());
    }

    let info = ModelInfo::from_dir(name, &path);
    if info.format != ModelFormat::Safetensors {
        println!(
            "Warning: no safetensors weights found in {}; the candle engine will not load it.",
            path.display()
        );
    }

    let mut registry = ModelRegistry::load()?;
    registry.add(info)?;
    println!("Registered '{}' -> {}", name, path.display());
    Ok(())
}
