//! Application state management
//! Built once at startup and handed to every command handler.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use log::info;

use crate::config::BridgeConfig;
use crate::core::bluetooth::{BluestTransport, BluetoothManager};

/// Application state
pub struct AppState {
    pub config: BridgeConfig,
    pub config_path: Option<PathBuf>,
    /// The Bluetooth manager instance
    pub bluetooth_manager: Arc<BluetoothManager<BluestTransport>>,
}

impl AppState {
    /// Loads the configuration and probes the Bluetooth adapter. Fails with
    /// `BluetoothUnavailable` when there is no usable adapter.
    pub async fn new(config_path: Option<PathBuf>) -> Result<Self> {
        let config = match &config_path {
            Some(path) => BridgeConfig::load_config(path).await?,
            None => BridgeConfig::default(),
        };

        info!("Initializing BluetoothManager...");
        let transport = BluestTransport::probe().await.into_result()?;
        let manager = BluetoothManager::new(Arc::new(transport), &config);

        Ok(Self {
            config,
            config_path,
            bluetooth_manager: Arc::new(manager),
        })
    }

    /// Gets a reference to the Bluetooth manager
    pub fn get_bluetooth_manager_arc(&self) -> Arc<BluetoothManager<BluestTransport>> {
        self.bluetooth_manager.clone()
    }
}
