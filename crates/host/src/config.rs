//! Player configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable that overrides [`PlayerConfig::decoder_path`].
pub const DECODER_PATH_ENV: &str = "MB_DECODER_PATH";

/// Settings shared by every session a host opens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Decoder executable launched once per opened media item.
    pub decoder_path: PathBuf,
    /// Parent directory for the per-session namespace (system temp dir if unset).
    pub namespace_root: Option<PathBuf>,
    /// How long `open` waits for the decoder to register.
    pub handshake_timeout_ms: u64,
    /// How long a blocking command send may wait on a full decoder queue.
    pub command_timeout_ms: u64,
    /// `--log-level` handed to the decoder process.
    pub decoder_log_level: String,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        let decoder_path = std::env::var_os(DECODER_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./mb-decoder"));

        Self {
            decoder_path,
            namespace_root: None,
            handshake_timeout_ms: 10_000,
            command_timeout_ms: 5_000,
            decoder_log_level: "info".to_string(),
        }
    }
}

impl PlayerConfig {
    /// Config for a specific decoder executable, everything else default.
    pub fn with_decoder(path: impl Into<PathBuf>) -> Self {
        Self {
            decoder_path: path.into(),
            ..Self::default()
        }
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn namespace_root(&self) -> PathBuf {
        self.namespace_root
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = PlayerConfig::from_json(
            r#"{ "decoder_path": "/opt/mb/mb-decoder", "command_timeout_ms": 250 }"#,
        )
        .unwrap();

        assert_eq!(config.decoder_path, PathBuf::from("/opt/mb/mb-decoder"));
        assert_eq!(config.command_timeout(), Duration::from_millis(250));
        assert_eq!(config.handshake_timeout(), Duration::from_secs(10));
        assert_eq!(config.decoder_log_level, "info");
        assert_eq!(config.namespace_root(), std::env::temp_dir());
    }
}
