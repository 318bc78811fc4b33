use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_displayname_format")]
    pub displayname_format: String,
    #[serde(default = "default_message_format")]
    pub message_format: String,
}

fn default_displayname_format() -> String {
    "{displayname}".to_string()
}

fn default_message_format() -> String {
    "{displayname}: {message}".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            displayname_format: default_displayname_format(),
            message_format: default_message_format(),
        }
    }
}

impl RelayConfig {
    pub fn format_name(&self, displayname: &str) -> String {
        self.displayname_format.replace("{displayname}", displayname)
    }

    pub fn format_message(&self, displayname: &str, body: &str) -> String {
        self.message_format
            .replace("{displayname}", displayname)
            .replace("{message}", body)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackfillConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub relay: RelayConfig,

    /// Whether Matrix-side leave events are forwarded to the network.
    #[serde(default = "default_true")]
    pub bridge_matrix_leave: bool,

    /// Whether DM portals adopt the remote user's name and avatar.
    #[serde(default = "default_true")]
    pub private_chat_portal_meta: bool,

    #[serde(default)]
    pub backfill: BackfillConfig,
}

fn default_true() -> bool {
    true
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            relay: RelayConfig::default(),
            bridge_matrix_leave: true,
            private_chat_portal_meta: true,
            backfill: BackfillConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_formatting() {
        let relay = RelayConfig::default();
        assert_eq!(relay.format_name("Alice"), "Alice");
        assert_eq!(relay.format_message("Alice", "hi"), "Alice: hi");
    }
}
