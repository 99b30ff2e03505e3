use std::path::Path;

use anyhow::{Context, Result};
use relay_protocol::RelayConfig;

/// Load a [`RelayConfig`] from a TOML file at `path`. A missing file is not
/// an error -- it just means "use the defaults", matching §6's enumerated
/// defaults for every field.
pub fn load_config(path: &Path) -> Result<RelayConfig> {
    if !path.exists() {
        tracing::warn!(
            "Config file not found at {}, using defaults",
            path.display()
        );
        return Ok(RelayConfig::default());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: RelayConfig =
        toml::from_str(&contents).with_context(|| "Failed to parse config TOML")?;

    tracing::info!("Loaded config from {}", path.display());
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = load_config(Path::new("/nonexistent/relay.toml")).unwrap();
        assert_eq!(config.endpoint_port, RelayConfig::default().endpoint_port);
    }

    #[test]
    fn loads_and_parses_a_real_file() {
        let dir = std::env::temp_dir().join(format!("relay-config-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("relay.toml");
        std::fs::write(&path, "endpoint_port = 9999\nstun_server = \"stun.example.com:3478\"\n")
            .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.endpoint_port, 9999);
        assert_eq!(config.stun_server, "stun.example.com:3478");

        std::fs::remove_dir_all(&dir).ok();
    }
}
