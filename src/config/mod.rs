mod bridge;

pub use bridge::*;

use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_type")]
    pub r#type: String,
    pub uri: String,
    #[serde(default = "default_max_open_conns")]
    pub max_open_conns: u32,
    #[serde(default = "default_max_idle_conns")]
    pub max_idle_conns: u32,
}

fn default_db_type() -> String {
    "postgres".to_string()
}

fn default_max_open_conns() -> u32 {
    20
}

fn default_max_idle_conns() -> u32 {
    2
}

/// Identity of the bridged network, used in bridge-info state events.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkInfoConfig {
    pub id: String,
    pub displayname: String,
    #[serde(default)]
    pub avatar_url: String,
    #[serde(default)]
    pub external_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub network: NetworkInfoConfig,
    pub database: DatabaseConfig,
    pub bridge: BridgeConfig,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_bytes(bytes: &[u8]) -> Result<Self> {
        let config: Config = serde_yaml::from_slice(bytes)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.network.id.is_empty() {
            anyhow::bail!("network.id not configured");
        }
        if self.database.uri.is_empty() {
            anyhow::bail!("database.uri not configured");
        }
        if self.bridge.relay.enabled && !self.bridge.relay.message_format.contains("{message}") {
            anyhow::bail!("relay message format is missing the {{message}} placeholder");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
network:
    id: telegram
    displayname: Telegram
database:
    type: sqlite
    uri: sqlite:bridge.db
bridge:
    relay:
        enabled: true
"#;

    #[test]
    fn test_load_sample() {
        let config = Config::load_from_bytes(SAMPLE.as_bytes()).unwrap();
        assert_eq!(config.network.id, "telegram");
        assert_eq!(config.database.r#type, "sqlite");
        assert!(config.bridge.relay.enabled);
        assert!(config.bridge.bridge_matrix_leave);
        assert!(!config.bridge.backfill.enabled);
    }

    #[test]
    fn test_missing_network_id() {
        let broken = SAMPLE.replace("id: telegram", "id: \"\"");
        assert!(Config::load_from_bytes(broken.as_bytes()).is_err());
    }
}
