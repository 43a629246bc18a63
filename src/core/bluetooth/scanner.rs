use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use log::{debug, error, info};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::commands::lock;
use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::notification::Subscribers;
use crate::core::bluetooth::transport::BleTransport;
use crate::core::bluetooth::types::BluetoothDevice;

/// Which advertisements make it into the discovery cache
#[derive(Debug, Clone, Default)]
pub struct ScanFilter {
    pub min_rssi: Option<i16>,
    /// Case-insensitive substring of the advertised name
    pub name_filter: Option<String>,
}

impl ScanFilter {
    pub fn accepts(&self, device: &BluetoothDevice) -> bool {
        if let Some(min_rssi) = self.min_rssi {
            if device.rssi < min_rssi {
                return false;
            }
        }
        match &self.name_filter {
            Some(needle) => device
                .name
                .to_lowercase()
                .contains(&needle.to_lowercase()),
            None => true,
        }
    }
}

/// Discovered devices, in discovery order. Ends when the scan stops.
pub struct ScanStream {
    receiver: mpsc::UnboundedReceiver<BluetoothDevice>,
}

impl Stream for ScanStream {
    type Item = BluetoothDevice;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

struct ActiveScan {
    cancel_token: CancellationToken,
    handle: JoinHandle<()>,
}

/// A scan is claimed as `Starting` before the first await, so a concurrent
/// `start_scan` sees it and fails with `ScanInProgress`.
enum ScanSlot {
    Idle,
    Starting,
    Running(ActiveScan),
}

impl ScanSlot {
    fn is_active(&self) -> bool {
        match self {
            ScanSlot::Idle => false,
            ScanSlot::Starting => true,
            ScanSlot::Running(scan) => !scan.handle.is_finished(),
        }
    }
}

/// Releases a `Starting` claim when start_scan fails or is dropped midway.
struct StartClaim<'a> {
    slot: &'a Mutex<ScanSlot>,
}

impl Drop for StartClaim<'_> {
    fn drop(&mut self) {
        let mut slot = lock(self.slot);
        if matches!(*slot, ScanSlot::Starting) {
            *slot = ScanSlot::Idle;
        }
    }
}

pub struct BluetoothScanner<T: BleTransport> {
    transport: Arc<T>,
    /// Discovery cache keyed by device id, last advertisement wins
    devices: Arc<Mutex<HashMap<String, BluetoothDevice>>>,
    scan_results: Subscribers<BluetoothDevice>,
    filter: ScanFilter,
    timeout: Duration,
    active: Mutex<ScanSlot>,
}

impl<T: BleTransport> BluetoothScanner<T> {
    pub fn new(
        transport: Arc<T>,
        scan_results: Subscribers<BluetoothDevice>,
        filter: ScanFilter,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            devices: Arc::new(Mutex::new(HashMap::new())),
            scan_results,
            filter,
            timeout,
            active: Mutex::new(ScanSlot::Idle),
        }
    }

    pub fn is_scanning(&self) -> bool {
        lock(&self.active).is_active()
    }

    pub async fn start_scan(&self) -> Result<ScanStream, BleError> {
        let claim = {
            let mut slot = lock(&self.active);
            if slot.is_active() {
                return Err(BleError::ScanInProgress);
            }
            *slot = ScanSlot::Starting;
            StartClaim { slot: &self.active }
        };

        // Clear existing devices
        lock(&self.devices).clear();
        self.transport.prune_discovered().await;

        let (tx, receiver) = mpsc::unbounded_channel();

        // Cups already connected at system level never advertise, so report
        // them up front.
        info!("Checking for connected devices");
        match self.transport.connected_devices().await {
            Ok(connected) => {
                for device in connected.into_iter().filter(|d| self.name_matches(d)) {
                    Self::record(&self.devices, &self.scan_results, &tx, device);
                }
            }
            Err(e) => error!("Failed to list connected devices: {}", e),
        }

        let stream = self.transport.scan().await?;
        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(Self::internal_scan_task(
            stream,
            self.devices.clone(),
            self.scan_results.clone(),
            tx,
            self.filter.clone(),
            cancel_token.clone(),
            Instant::now() + self.timeout,
        ));

        {
            let mut slot = lock(&self.active);
            if matches!(*slot, ScanSlot::Starting) {
                *slot = ScanSlot::Running(ActiveScan {
                    cancel_token,
                    handle,
                });
                info!("Device scan task started.");
            } else {
                info!("Scan stopped while starting.");
                cancel_token.cancel();
            }
        }
        drop(claim);

        Ok(ScanStream { receiver })
    }

    async fn internal_scan_task(
        mut stream: futures_util::stream::BoxStream<'static, BluetoothDevice>,
        devices: Arc<Mutex<HashMap<String, BluetoothDevice>>>,
        scan_results: Subscribers<BluetoothDevice>,
        tx: mpsc::UnboundedSender<BluetoothDevice>,
        filter: ScanFilter,
        cancel_token: CancellationToken,
        deadline: Instant,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => {
                    info!("Scan cancelled.");
                    break;
                }
                _ = sleep_until(deadline) => {
                    info!("Scan timed out.");
                    break;
                }
                result = stream.next() => {
                    match result {
                        Some(device) => {
                            debug!("Found device - ID: {}, RSSI: {}", device.id, device.rssi);
                            if filter.accepts(&device) {
                                Self::record(&devices, &scan_results, &tx, device);
                            }
                        }
                        None => {
                            info!("Bluetooth scan stream has ended.");
                            break;
                        }
                    }
                }
            }
        }
    }

    fn name_matches(&self, device: &BluetoothDevice) -> bool {
        ScanFilter {
            min_rssi: None,
            name_filter: self.filter.name_filter.clone(),
        }
        .accepts(device)
    }

    fn record(
        devices: &Mutex<HashMap<String, BluetoothDevice>>,
        scan_results: &Subscribers<BluetoothDevice>,
        tx: &mpsc::UnboundedSender<BluetoothDevice>,
        device: BluetoothDevice,
    ) {
        let previous = lock(devices).insert(device.id.clone(), device.clone());
        if previous.is_none() {
            info!(
                "Found cup: ID: {}, Name: {}, Address: {:?}, RSSI: {}",
                device.id, device.name, device.address, device.rssi
            );
        }
        scan_results.emit(&device);
        // The caller may have dropped its stream; events still flow.
        let _ = tx.send(device);
    }

    pub async fn stop_scan(&self) {
        info!("Stopping Bluetooth scan.");
        let active = std::mem::replace(&mut *lock(&self.active), ScanSlot::Idle);

        match active {
            ScanSlot::Running(ActiveScan {
                cancel_token,
                handle,
            }) => {
                cancel_token.cancel();
                info!("Waiting for scan task to finish...");
                match handle.await {
                    Ok(()) => info!("Scan task finished after cancellation."),
                    Err(e) if e.is_cancelled() => info!("Scan task was cancelled successfully."),
                    Err(e) => error!("Scan task finished with an unexpected join error: {:?}", e),
                }
            }
            ScanSlot::Starting => info!("Scan was still starting; it will not run."),
            ScanSlot::Idle => info!("No active scan task handle found to wait for."),
        }

        lock(&self.devices).clear();
    }

    /// Snapshot of the discovery cache
    pub fn discovered_devices(&self) -> Vec<BluetoothDevice> {
        lock(&self.devices).values().cloned().collect()
    }

    pub fn discovered(&self, device_id: &str) -> Option<BluetoothDevice> {
        lock(&self.devices).get(device_id).cloned()
    }
}
