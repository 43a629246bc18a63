use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{error, info, LevelFilter};

use cuplight_bridge_lib::config::BridgeConfig;
use cuplight_bridge_lib::core::protocol::{Mode, Variant};
use cuplight_bridge_lib::{commands, logging, state::AppState};

/// Cup Light Bridge
///
/// Scans for and controls SP105E-based illuminated golf cups over
/// Bluetooth Low Energy.
#[derive(Parser, Debug)]
#[command(name = "cuplight-bridge")]
#[command(version)]
pub struct Args {
    /// Configuration file (defaults to the user config directory)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: LevelFilter,

    #[command(subcommand)]
    pub command: CupCommand,
}

#[derive(Subcommand, Debug)]
pub enum CupCommand {
    /// List nearby devices until the scan times out
    Scan,
    /// Set a static color, e.g. `#ff0000`
    Color {
        device_id: String,
        hex: String,
        #[arg(long)]
        variant: Option<Variant>,
    },
    /// Set brightness in percent
    Brightness {
        device_id: String,
        #[arg(allow_negative_numbers = true)]
        percent: i32,
        #[arg(long)]
        variant: Option<Variant>,
    },
    /// Set the lighting mode (static, pulse, strobe, rainbow)
    Mode {
        device_id: String,
        mode: Mode,
        /// Animation speed in percent
        #[arg(long)]
        speed: Option<i32>,
        #[arg(long)]
        variant: Option<Variant>,
    },
    /// Turn the cup on or off (on/off)
    Power {
        device_id: String,
        #[arg(
            action = clap::ArgAction::Set,
            value_parser = clap::builder::BoolishValueParser::new()
        )]
        on: bool,
        #[arg(long)]
        variant: Option<Variant>,
    },
    /// Write bytes unchanged, e.g. "38 FF 00 00 22 83"
    Raw { device_id: String, bytes: String },
    /// Find out which wire format a cup speaks
    Probe {
        device_id: String,
        #[arg(long, default_value = "#00ff00")]
        hex: String,
    },
    /// Step through pattern codes while you watch the cup
    Sweep {
        device_id: String,
        #[arg(long, default_value_t = 0)]
        start: u8,
        #[arg(long, default_value_t = 255)]
        end: u8,
        /// Milliseconds each code stays on
        #[arg(long, default_value_t = 2000)]
        dwell_ms: u64,
        #[arg(long)]
        variant: Option<Variant>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::setup_logging(args.log_level);

    let config_path = args.config.clone().or_else(BridgeConfig::default_path);
    let app_state = AppState::new(config_path).await.map_err(|e| {
        error!("Failed to initialize AppState with BluetoothManager: {}", e);
        e
    })?;
    info!("Using {} as the default variant", app_state.config.variant);

    let result = match args.command {
        CupCommand::Scan => commands::scan_devices(&app_state).await,
        CupCommand::Color { device_id, hex, variant } => {
            commands::set_color(&app_state, &device_id, &hex, variant).await
        }
        CupCommand::Brightness { device_id, percent, variant } => {
            commands::set_brightness(&app_state, &device_id, percent, variant).await
        }
        CupCommand::Mode { device_id, mode, speed, variant } => {
            commands::set_mode(&app_state, &device_id, mode, speed, variant).await
        }
        CupCommand::Power { device_id, on, variant } => {
            commands::set_power(&app_state, &device_id, on, variant).await
        }
        CupCommand::Raw { device_id, bytes } => {
            commands::send_raw(&app_state, &device_id, &bytes).await
        }
        CupCommand::Probe { device_id, hex } => {
            commands::probe_variant(&app_state, &device_id, &hex).await.map(|_| ())
        }
        CupCommand::Sweep { device_id, start, end, dwell_ms, variant } => {
            commands::sweep_patterns(&app_state, &device_id, start, end, dwell_ms, variant).await
        }
    };

    app_state.bluetooth_manager.shutdown().await;
    result
}
