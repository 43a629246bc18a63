use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::core::bluetooth::constants::{
    DEFAULT_HANDSHAKE_DELAY_MS, DEFAULT_SCAN_TIMEOUT_SECS, DEFAULT_SETTLE_DELAY_MS,
    UUID_CUP_SERVICE, UUID_CUP_WRITE_CHAR,
};
use crate::core::protocol::Variant;
use crate::utils::ensure_directory_exists;

const CONFIG_DIR_NAME: &str = "cuplight-bridge";
const CONFIG_FILE_NAME: &str = "bridge_config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Wire format assumed for newly connected cups.
    pub variant: Variant,

    pub service_uuid: Uuid,
    pub write_characteristic_uuid: Uuid,

    /// Scans stop on their own after this many seconds.
    pub scan_timeout_secs: u64,

    /// Pause after every write before the next queued frame goes out.
    pub settle_delay_ms: u64,

    /// Use the first advertised service when nothing matches the cup service.
    pub allow_service_fallback: bool,

    /// Advertisements weaker than this are ignored.
    pub min_rssi: Option<i16>,

    /// Case-insensitive substring the advertised name must contain.
    pub name_filter: Option<String>,

    pub handshake_delay_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            variant: Variant::default(),
            service_uuid: UUID_CUP_SERVICE,
            write_characteristic_uuid: UUID_CUP_WRITE_CHAR,
            scan_timeout_secs: DEFAULT_SCAN_TIMEOUT_SECS,
            settle_delay_ms: DEFAULT_SETTLE_DELAY_MS,
            allow_service_fallback: true,
            min_rssi: None,
            name_filter: None,
            handshake_delay_ms: DEFAULT_HANDSHAKE_DELAY_MS,
        }
    }
}

impl BridgeConfig {
    /// `<config dir>/cuplight-bridge/bridge_config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn handshake_delay(&self) -> Duration {
        Duration::from_millis(self.handshake_delay_ms)
    }

    /// Loads the config from a configuration file.
    pub async fn load_config(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("Config file not found at {:?}, using default.", path);
            return Ok(Self::default());
        }

        let config_json = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self = serde_json::from_str(&config_json)
            .with_context(|| format!("parsing {}", path.display()))?;

        info!("Config loaded from {:?}", path);
        Ok(config)
    }

    /// Saves the current config to a configuration file.
    pub async fn save_config(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            ensure_directory_exists(parent).await?;
        }

        let config_json = match serde_json::to_string_pretty(&self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize bridge config to JSON: {}", e);
                return Err(e.into());
            }
        };

        fs::write(path, config_json).await?;

        info!("Bridge config saved to {:?}.", path);
        Ok(())
    }
}
