//! Command handlers for the bridge CLI
//! Each handler opens a session with one cup, does its work and closes the
//! session again. Bluetooth errors reach the user as short messages; the raw
//! detail goes to the log.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures_util::StreamExt;
use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;

use crate::core::bluetooth::{
    BleError, BluestTransport, BluetoothManager, ModeRequest, CUP_NAME_PREFIX,
};
use crate::core::diagnostics::PatternSweep;
use crate::core::protocol::{Mode, Rgb, Variant, ALL_VARIANTS};
use crate::state::AppState;

type Manager = Arc<BluetoothManager<BluestTransport>>;

/// Logs the raw error and keeps only the user-facing text.
fn report(e: BleError) -> anyhow::Error {
    error!("Bluetooth error: {:?}", e);
    anyhow!("{}", e.user_message())
}

/// Lists cups until the scan times out.
pub async fn scan_devices(app_state: &AppState) -> Result<()> {
    let manager = app_state.get_bluetooth_manager_arc();
    let mut results = manager.scan().await.map_err(report)?;

    while let Some(device) = results.next().await {
        let marker = if device.name.starts_with(CUP_NAME_PREFIX) { "*" } else { " " };
        println!(
            "{} {:<40} {:<20} {:>4} dBm {}",
            marker,
            device.id,
            device.name,
            device.rssi,
            device.address.as_deref().unwrap_or("")
        );
    }
    info!("Scan complete, {} device(s) seen", manager.discovered_devices().len());
    Ok(())
}

/// Scans until `device_id` shows up, then connects. Cups already connected
/// at system level are found without advertising.
async fn open_session(
    app_state: &AppState,
    device_id: &str,
    variant: Option<Variant>,
) -> Result<Manager> {
    let manager = app_state.get_bluetooth_manager_arc();

    let mut results = manager.scan().await.map_err(report)?;
    let mut seen = false;
    while let Some(device) = results.next().await {
        if device.id == device_id {
            seen = true;
            break;
        }
    }
    manager.stop_scan().await;
    if !seen {
        warn!("Device {} not seen during scan, trying to connect anyway", device_id);
    }

    let state = manager.connect(device_id).await.map_err(report)?;
    info!("Connected to {} ({})", state.device_id, state.variant);
    if let Some(variant) = variant {
        manager
            .set_variant(device_id, variant)
            .await
            .map_err(report)?;
    }
    Ok(manager)
}

async fn close_session(manager: &Manager, device_id: &str) -> Result<()> {
    manager.disconnect(device_id).await.map_err(report)
}

pub async fn set_color(
    app_state: &AppState,
    device_id: &str,
    hex: &str,
    variant: Option<Variant>,
) -> Result<()> {
    let rgb: Rgb = hex.parse().map_err(|e| report(BleError::Validation(e)))?;
    let manager = open_session(app_state, device_id, variant).await?;
    let result = manager.send_rgb(device_id, rgb).await.map_err(report);
    close_session(&manager, device_id).await?;
    result
}

pub async fn set_brightness(
    app_state: &AppState,
    device_id: &str,
    percent: i32,
    variant: Option<Variant>,
) -> Result<()> {
    let manager = open_session(app_state, device_id, variant).await?;
    let result = manager.send_brightness(device_id, percent).await.map_err(report);
    close_session(&manager, device_id).await?;
    result
}

pub async fn set_mode(
    app_state: &AppState,
    device_id: &str,
    mode: Mode,
    speed: Option<i32>,
    variant: Option<Variant>,
) -> Result<()> {
    let manager = open_session(app_state, device_id, variant).await?;
    let result = manager
        .send_mode(device_id, ModeRequest { mode, speed })
        .await
        .map_err(report);
    close_session(&manager, device_id).await?;
    result
}

pub async fn set_power(
    app_state: &AppState,
    device_id: &str,
    on: bool,
    variant: Option<Variant>,
) -> Result<()> {
    let manager = open_session(app_state, device_id, variant).await?;
    let result = manager.send_power(device_id, on).await.map_err(report);
    close_session(&manager, device_id).await?;
    result
}

/// Parses "38 FF 00 00 22 83", "38ff00002283" or "0x38,0xff,..." into bytes.
pub fn parse_hex_bytes(input: &str) -> Result<Vec<u8>> {
    let cleaned: String = input
        .split(|c: char| c.is_whitespace() || c == ',')
        .map(|part| part.trim_start_matches("0x").trim_start_matches("0X"))
        .collect();
    if cleaned.is_empty() || !cleaned.is_ascii() || cleaned.len() % 2 != 0 {
        return Err(anyhow!("expected an even number of hex digits, got {:?}", input));
    }
    (0..cleaned.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&cleaned[i..i + 2], 16)
                .with_context(|| format!("invalid hex byte {:?}", &cleaned[i..i + 2]))
        })
        .collect()
}

pub async fn send_raw(app_state: &AppState, device_id: &str, bytes: &str) -> Result<()> {
    let bytes = parse_hex_bytes(bytes)?;
    let manager = open_session(app_state, device_id, None).await?;
    let result = manager.send_raw_command(device_id, bytes).await.map_err(report);
    close_session(&manager, device_id).await?;
    result
}

/// Flashes a test color in every variant and asks on stdin which one lit
/// the cup. The confirmed variant is saved as the configured default.
pub async fn probe_variant(
    app_state: &AppState,
    device_id: &str,
    hex: &str,
) -> Result<Option<Variant>> {
    let rgb: Rgb = hex.parse().map_err(|e| report(BleError::Validation(e)))?;
    let manager = open_session(app_state, device_id, None).await?;

    let stdin: Arc<Mutex<Lines<BufReader<Stdin>>>> =
        Arc::new(Mutex::new(BufReader::new(tokio::io::stdin()).lines()));
    let result = manager
        .try_variants(device_id, rgb, &ALL_VARIANTS, |variant| {
            let stdin = stdin.clone();
            async move {
                println!("Did the cup show {} using {}? [y/N]", rgb, variant);
                match stdin.lock().await.next_line().await {
                    Ok(Some(answer)) => answer.trim().eq_ignore_ascii_case("y"),
                    _ => false,
                }
            }
        })
        .await
        .map_err(report);
    close_session(&manager, device_id).await?;

    let adopted = result?;
    match (adopted, &app_state.config_path) {
        (Some(variant), Some(path)) => {
            let mut config = app_state.config.clone();
            config.variant = variant;
            config.save_config(path).await?;
            println!("Saved {} as the default variant", variant);
        }
        (Some(variant), None) => println!("Cup speaks {}", variant),
        (None, _) => println!("No variant confirmed"),
    }
    Ok(adopted)
}

pub async fn sweep_patterns(
    app_state: &AppState,
    device_id: &str,
    start: u8,
    end: u8,
    dwell_ms: u64,
    variant: Option<Variant>,
) -> Result<()> {
    if start > end {
        return Err(anyhow!("sweep start {} is after end {}", start, end));
    }
    let manager = open_session(app_state, device_id, variant).await?;
    let sweep = PatternSweep {
        codes: start..=end,
        dwell: Duration::from_millis(dwell_ms),
        ..PatternSweep::default()
    };
    let result = sweep
        .run(&manager, device_id, |code| println!("pattern code {} (0x{:02X})", code, code))
        .await
        .map_err(report);
    close_session(&manager, device_id).await?;

    let summary = result?;
    println!("{} code(s) sent, failed: {:?}", summary.sent, summary.failed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_bytes_accept_common_spellings() {
        let expected = vec![0x38, 0xFF, 0x00, 0x00, 0x22, 0x83];
        assert_eq!(parse_hex_bytes("38 FF 00 00 22 83").unwrap(), expected);
        assert_eq!(parse_hex_bytes("38ff00002283").unwrap(), expected);
        assert_eq!(parse_hex_bytes("0x38,0xff,0x00,0x00,0x22,0x83").unwrap(), expected);
    }

    #[test]
    fn raw_bytes_reject_garbage() {
        assert!(parse_hex_bytes("").is_err());
        assert!(parse_hex_bytes("3").is_err());
        assert!(parse_hex_bytes("zz").is_err());
    }

    #[test]
    fn actionable_errors_hide_detail() {
        let message = report(BleError::BluetoothUnavailable("hci0 down".into())).to_string();
        assert_eq!(message, "Turn on Bluetooth to control your cups.");

        let message = report(BleError::Transport("gatt 133".into())).to_string();
        assert_eq!(message, "Could not reach the cup.");
    }
}
