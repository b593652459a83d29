use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tether::ServerConfig;

/// `server.toml` layout. Keys that are left out keep their defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub server: ServerConfig,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let file: FileConfig = toml::from_str(
            r#"
            port = 27500

            [server]
            max_peers = 4

            [server.net]
            disconnect_threshold_secs = 3.0
            "#,
        )
        .unwrap();

        assert_eq!(file.port, Some(27500));
        assert_eq!(file.bind, None);
        assert_eq!(file.server.max_peers, 4);
        assert_eq!(file.server.net.disconnect_threshold_secs, 3.0);
        assert_eq!(file.server.net.ping_interval_secs, 1.0);
        assert_eq!(file.server.tick_rate, tether::DEFAULT_TICK_RATE);
    }
}
