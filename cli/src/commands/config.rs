use anyhow::Result;
use kiln_core::{Config, KeepAlive};

const KEYS: &[&str] = &[
    "daemon.host",
    "daemon.port",
    "models.storage_path",
    "inference.max_tokens",
    "inference.temperature",
    "inference.top_p",
    "inference.repetition_penalty",
    "inference.repetition_context_size",
    "inference.use_gpu",
    "cache.keep_alive",
    "cache.sweep_interval_secs",
];

pub async fn execute(key: Option<&str>, value: Option<&str>) -> Result<()> {
    let mut config = Config::load()?;

    match (key, value) {
        (None, _) => {
            println!("Configuration file: {:?}\n", Config::config_path()?);
            for key in KEYS {
                println!("{} = {}", key, get_config_value(&config, key)?);
            }
        }
        (Some(key), None) => {
            println!("{}", get_config_value(&config, key)?);
        }
        (Some(key), Some(value)) => {
            set_config_value(&mut config, key, value)?;
            config.validate()?;
            config.save()?;
            println!("Set {} = {}", key, value);
        }
    }

    Ok(())
}

fn get_config_value(config: &Config, key: &str) -> Result<String> {
    match key {
        "daemon.host" => Ok(config.daemon.host.clone()),
        "daemon.port" => Ok(config.daemon.port.to_string()),
        "models.storage_path" => Ok(config.models.storage_path.display().to_string()),
        "inference.max_tokens" => Ok(config.inference.max_tokens.to_string()),
        "inference.temperature" => Ok(config.inference.temperature.to_string()),
        "inference.top_p" => Ok(config.inference.top_p.to_string()),
        "inference.repetition_penalty" => Ok(config.inference.repetition_penalty.to_string()),
        "inference.repetition_context_size" => {
            Ok(config.inference.repetition_context_size.to_string())
        }
        "inference.use_gpu" => Ok(config.inference.use_gpu.to_string()),
        "cache.keep_alive" => Ok(config.cache.keep_alive.clone()),
        "cache.sweep_interval_secs" => Ok(config.cache.sweep_interval_secs.to_string()),
        _ => anyhow::bail!("Unknown config key: {}", key),
    }
}

fn set_config_value(config: &mut Config, key: &str, value: &str) -> Result<()> {
    match key {
        "daemon.host" => config.daemon.host = value.to_string(),
        "daemon.port" => config.daemon.port = value.parse()?,
        "models.storage_path" => config.models.storage_path = value.into(),
        "inference.max_tokens" => config.inference.max_tokens = value.parse()?,
        "inference.temperature" => config.inference.temperature = value.parse()?,
        "inference.top_p" => config.inference.top_p = value.parse()?,
        "inference.repetition_penalty" => config.inference.repetition_penalty = value.parse()?,
        "inference.repetition_context_size" => {
            config.inference.repetition_context_size = value.parse()?
        }
        "inference.use_gpu" => config.inference.use_gpu = value.parse()?,
        "cache.keep_alive" => {
            // Normalised, so "30m" and " 30m " store the same
            config.cache.keep_alive = KeepAlive::parse(value)?.to_string();
        }
        "cache.sweep_interval_secs" => config.cache.sweep_interval_secs = value.parse()?,
        _ => anyhow::bail!("Unknown config key: {}", key),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_listed_key_can_be_read() {
        let config = Config::default();
        for key in KEYS {
            assert!(get_config_value(&config, key).is_ok(), "{key}");
        }
    }

    #[test]
    fn keep_alive_is_checked_on_set() {
        let mut config = Config::default();
        set_config_value(&mut config, "cache.keep_alive", " 30m").unwrap();
        assert_eq!(config.cache.keep_alive, "30m");
        assert!(set_config_value(&mut config, "cache.keep_alive", "forever").is_err());
        assert!(set_config_value(&mut config, "nope", "1").is_err());
    }
}
