//! Protocol probing for unidentified controller firmware
//! Walks a range of pattern codes against one cup so a person watching it
//! can note which codes do what. Not used by the normal command path.

use std::ops::RangeInclusive;
use std::time::Duration;

use log::{info, warn};
use tokio::time::sleep;

use crate::core::bluetooth::{BleError, BleTransport, BluetoothManager};
use crate::core::protocol::visible_brightness;

#[derive(Debug, Clone)]
pub struct PatternSweep {
    pub codes: RangeInclusive<u8>,
    /// How long each code stays on the cup before the next one goes out
    pub dwell: Duration,
    /// Brightness set before the sweep, floored so the cup stays visible
    pub brightness: Option<i32>,
}

impl Default for PatternSweep {
    fn default() -> Self {
        Self {
            codes: 0..=255,
            dwell: Duration::from_secs(2),
            brightness: Some(100),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub sent: usize,
    pub failed: Vec<u8>,
}

impl PatternSweep {
    /// Runs the sweep. `on_code` is called right before each code is written.
    /// Write failures are collected; losing the session aborts the sweep.
    pub async fn run<T, F>(
        &self,
        manager: &BluetoothManager<T>,
        device_id: &str,
        mut on_code: F,
    ) -> Result<SweepReport, BleError>
    where
        T: BleTransport,
        F: FnMut(u8),
    {
        if let Some(percent) = self.brightness {
            manager
                .send_brightness(device_id, i32::from(visible_brightness(percent)))
                .await?;
        }

        let mut report = SweepReport::default();
        for code in self.codes.clone() {
            on_code(code);
            match manager.send_pattern_code(device_id, code).await {
                Ok(()) => report.sent += 1,
                Err(BleError::Transport(detail)) => {
                    warn!("Pattern code {} failed on {}: {}", code, device_id, detail);
                    report.failed.push(code);
                }
                Err(e) => return Err(e),
            }
            sleep(self.dwell).await;
        }

        info!(
            "Pattern sweep on {} finished: {} sent, {} failed",
            device_id,
            report.sent,
            report.failed.len()
        );
        Ok(report)
    }
}
