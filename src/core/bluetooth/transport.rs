//! Transport adapter
//! The `BleTransport` trait is the seam between the control layer and the
//! platform BLE central. `BluestTransport` implements it on top of bluest;
//! tests use an in-memory fake.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bluest::{Adapter, Characteristic, ConnectionEvent, Device, Service};
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use regex::Regex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use uuid::Uuid;

use crate::core::bluetooth::commands::lock;
use crate::core::bluetooth::constants::{ADAPTER_READY_CHECK_MS, BLUETOOTH_OPERATION_TIMEOUT_SECS};
use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::types::{
    BluetoothDevice, DiscoveredCharacteristic, DiscoveredService, LinkEvent, PermissionStatus,
    WriteKind,
};

static MAC_ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})").expect("MAC pattern is valid")
});

/// Platform BLE central operations the control layer relies on.
///
/// Transport failures are reported, never retried here.
#[async_trait]
pub trait BleTransport: Send + Sync + 'static {
    type Service: Clone + Send + Sync + 'static;
    type Characteristic: Clone + Send + Sync + 'static;

    /// Desktop platforms grant Bluetooth access implicitly.
    async fn request_permissions(&self) -> Result<PermissionStatus, BleError> {
        Ok(PermissionStatus::Granted)
    }

    async fn is_bluetooth_enabled(&self) -> bool;

    /// Devices that already hold a system-level connection.
    async fn connected_devices(&self) -> Result<Vec<BluetoothDevice>, BleError>;

    /// Advertisements as they arrive. Dropping the stream stops the scan.
    async fn scan(&self) -> Result<BoxStream<'static, BluetoothDevice>, BleError>;

    /// Connects, reusing an existing system-level connection when there is one.
    async fn connect(&self, device_id: &str) -> Result<(), BleError>;

    async fn disconnect(&self, device_id: &str) -> Result<(), BleError>;

    async fn discover_services(
        &self,
        device_id: &str,
    ) -> Result<Vec<DiscoveredService<Self::Service>>, BleError>;

    async fn discover_characteristics(
        &self,
        service: &Self::Service,
    ) -> Result<Vec<DiscoveredCharacteristic<Self::Characteristic>>, BleError>;

    async fn write(
        &self,
        characteristic: &Self::Characteristic,
        data: &[u8],
        kind: WriteKind,
    ) -> Result<(), BleError>;

    /// Drops cached platform handles of devices that are not connected.
    /// Called when a new scan starts.
    async fn prune_discovered(&self) {}

    /// Link state changes for a connected device. Transports that cannot
    /// report them return a stream that never yields.
    async fn link_events(
        &self,
        _device_id: &str,
    ) -> Result<BoxStream<'static, LinkEvent>, BleError> {
        Ok(stream::pending().boxed())
    }
}

/// Result of the startup capability check
pub enum TransportAvailability<T> {
    Available(T),
    Unavailable { reason: String },
}

impl<T> TransportAvailability<T> {
    pub fn into_result(self) -> Result<T, BleError> {
        match self {
            TransportAvailability::Available(transport) => Ok(transport),
            TransportAvailability::Unavailable { reason } => {
                Err(BleError::BluetoothUnavailable(reason))
            }
        }
    }
}

/// Lowercase 4-digit form for SIG base UUIDs, full string otherwise.
fn short_form(uuid: Uuid) -> String {
    let full = uuid.to_string();
    if full.ends_with("-0000-1000-8000-00805f9b34fb") && full.starts_with("0000") {
        full[4..8].to_string()
    } else {
        full
    }
}

fn partial_match(candidate: Uuid, target: Uuid) -> bool {
    candidate.to_string().contains(&short_form(target))
}

/// Picks the cup service: exact UUID, then a partial match, then (when
/// allowed) whatever service came first.
pub fn select_service<S>(
    services: &[DiscoveredService<S>],
    target: Uuid,
    allow_fallback: bool,
) -> Option<&DiscoveredService<S>> {
    if let Some(service) = services.iter().find(|s| s.uuid == target) {
        return Some(service);
    }
    if let Some(service) = services.iter().find(|s| partial_match(s.uuid, target)) {
        info!("Using partially matching service {} for {}", service.uuid, target);
        return Some(service);
    }
    if allow_fallback {
        if let Some(service) = services.first() {
            warn!(
                "Service {} not found, falling back to first service {}",
                target, service.uuid
            );
            return Some(service);
        }
    }
    None
}

/// Picks the write characteristic: exact UUID, then a partial match, then
/// the first characteristic supporting either write mode.
pub fn find_write_characteristic<C>(
    characteristics: &[DiscoveredCharacteristic<C>],
    target: Uuid,
) -> Option<&DiscoveredCharacteristic<C>> {
    let writable = || characteristics.iter().filter(|c| c.is_writable());
    writable()
        .find(|c| c.uuid == target)
        .or_else(|| writable().find(|c| partial_match(c.uuid, target)))
        .or_else(|| {
            let first = writable().next();
            if let Some(c) = first {
                warn!(
                    "Characteristic {} not found, falling back to writable {}",
                    target, c.uuid
                );
            }
            first
        })
}

/// True when `ready` completes successfully within `wait`.
async fn ready_within<F, E>(ready: F, wait: Duration) -> bool
where
    F: Future<Output = Result<(), E>>,
    E: Display,
{
    match timeout(wait, ready).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!("Bluetooth adapter not available: {}", e);
            false
        }
        Err(_) => {
            debug!("Bluetooth adapter not available after {:?}", wait);
            false
        }
    }
}

/// Extracts a MAC address from a platform device identifier, if it has one.
pub fn extract_mac_address(device_id: &str) -> Option<String> {
    MAC_ADDRESS
        .find_iter(device_id)
        .last()
        .map(|m| m.as_str().to_uppercase())
}

/// bluest-backed transport
#[derive(Clone)]
pub struct BluestTransport {
    adapter: Adapter,
    /// Discovery cache of platform handles, keyed by device id
    devices: Arc<Mutex<HashMap<String, Device>>>,
}

impl BluestTransport {
    /// Checks for a usable adapter. Callers branch on the result instead of
    /// handling construction errors.
    pub async fn probe() -> TransportAvailability<Self> {
        let Some(adapter) = Adapter::default().await else {
            return TransportAvailability::Unavailable {
                reason: "No Bluetooth adapter found".to_string(),
            };
        };

        let wait = Duration::from_secs(BLUETOOTH_OPERATION_TIMEOUT_SECS);
        match timeout(wait, adapter.wait_available()).await {
            Ok(Ok(())) => {
                info!("Bluetooth adapter is available.");
                TransportAvailability::Available(Self {
                    adapter,
                    devices: Arc::new(Mutex::new(HashMap::new())),
                })
            }
            Ok(Err(e)) => TransportAvailability::Unavailable {
                reason: e.to_string(),
            },
            Err(_) => TransportAvailability::Unavailable {
                reason: "Bluetooth adapter did not become available".to_string(),
            },
        }
    }

    fn cache(&self, device: &Device) {
        lock(&self.devices).insert(device.id().to_string(), device.clone());
    }

    fn cached(&self, device_id: &str) -> Option<Device> {
        lock(&self.devices).get(device_id).cloned()
    }

    async fn find_device(&self, device_id: &str) -> Result<Device, BleError> {
        if let Some(device) = self.cached(device_id) {
            return Ok(device);
        }
        // Paired cups may be connected at system level without being seen in a scan.
        for device in self.adapter.connected_devices().await? {
            if device.id().to_string() == device_id {
                self.cache(&device);
                return Ok(device);
            }
        }
        Err(BleError::DeviceNotFound(device_id.to_string()))
    }

    async fn describe(
        device: &Device,
        local_name: Option<String>,
        rssi: Option<i16>,
        connectable: bool,
    ) -> BluetoothDevice {
        let name = local_name
            .or_else(|| device.name().ok())
            .unwrap_or_else(|| "Unknown".to_string());
        let id = device.id().to_string();
        let rssi = match rssi {
            Some(rssi) => rssi,
            None => device.rssi().await.unwrap_or(0),
        };
        let address = extract_mac_address(&id);
        BluetoothDevice::new(id, name, address, rssi, connectable)
    }

    fn operation_timeout() -> Duration {
        Duration::from_secs(BLUETOOTH_OPERATION_TIMEOUT_SECS)
    }
}

#[async_trait]
impl BleTransport for BluestTransport {
    type Service = Service;
    type Characteristic = Characteristic;

    async fn is_bluetooth_enabled(&self) -> bool {
        // wait_available never returns while the adapter is off
        ready_within(
            self.adapter.wait_available(),
            Duration::from_millis(ADAPTER_READY_CHECK_MS),
        )
        .await
    }

    async fn connected_devices(&self) -> Result<Vec<BluetoothDevice>, BleError> {
        let mut found = Vec::new();
        for device in self.adapter.connected_devices().await? {
            self.cache(&device);
            found.push(Self::describe(&device, None, None, true).await);
        }
        Ok(found)
    }

    async fn scan(&self) -> Result<BoxStream<'static, BluetoothDevice>, BleError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let adapter = self.adapter.clone();
        let transport = self.clone();

        // bluest's scan stream borrows the adapter, so it is driven from a
        // task that owns a clone and forwards into a channel.
        tokio::spawn(async move {
            let mut scan = match adapter.scan(&[]).await {
                Ok(scan) => {
                    let _ = ready_tx.send(Ok(()));
                    scan
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(BleError::from(e)));
                    return;
                }
            };
            info!("Starting bluetooth scan");

            loop {
                tokio::select! {
                    result = scan.next() => {
                        let Some(discovered) = result else {
                            info!("Bluetooth scan stream has ended.");
                            break;
                        };
                        transport.cache(&discovered.device);
                        let device = Self::describe(
                            &discovered.device,
                            discovered.adv_data.local_name.clone(),
                            discovered.rssi,
                            discovered.adv_data.is_connectable,
                        )
                        .await;
                        debug!(
                            "Found device - ID: {}, Name: {}, RSSI: {}",
                            device.id, device.name, device.rssi
                        );
                        if tx.send(device).is_err() {
                            break;
                        }
                    }
                    _ = tx.closed() => break,
                }
            }
            debug!("Scan forwarder stopped");
        });

        ready_rx
            .await
            .map_err(|_| BleError::Transport("scan task ended before starting".to_string()))??;

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|device| (device, rx))
        })
        .boxed())
    }

    async fn connect(&self, device_id: &str) -> Result<(), BleError> {
        let device = self.find_device(device_id).await?;
        if device.is_connected().await {
            info!("Reusing existing system connection to {}", device_id);
            return Ok(());
        }

        info!("Initiating connection to {}...", device_id);
        timeout(Self::operation_timeout(), self.adapter.connect_device(&device))
            .await
            .map_err(|_| BleError::Transport(format!("connection to {device_id} timed out")))??;
        Ok(())
    }

    async fn prune_discovered(&self) {
        let cached: Vec<Device> = lock(&self.devices).values().cloned().collect();
        let mut stale = Vec::new();
        for device in cached {
            if !device.is_connected().await {
                stale.push(device.id().to_string());
            }
        }

        let mut devices = lock(&self.devices);
        for device_id in &stale {
            devices.remove(device_id);
        }
        debug!("Dropped {} stale device handle(s), {} kept", stale.len(), devices.len());
    }

    async fn disconnect(&self, device_id: &str) -> Result<(), BleError> {
        let device = self.find_device(device_id).await?;
        if device.is_connected().await {
            info!("Disconnecting from device {}", device_id);
            self.adapter.disconnect_device(&device).await?;
        } else {
            info!("Device {} not connected", device_id);
        }
        Ok(())
    }

    async fn discover_services(
        &self,
        device_id: &str,
    ) -> Result<Vec<DiscoveredService<Service>>, BleError> {
        let device = self.find_device(device_id).await?;
        let services = timeout(Self::operation_timeout(), device.services())
            .await
            .map_err(|_| BleError::Transport("service discovery timed out".to_string()))??;

        Ok(services
            .into_iter()
            .map(|service| DiscoveredService {
                uuid: service.uuid(),
                handle: service,
            })
            .collect())
    }

    async fn discover_characteristics(
        &self,
        service: &Service,
    ) -> Result<Vec<DiscoveredCharacteristic<Characteristic>>, BleError> {
        let mut found = Vec::new();
        for characteristic in service.characteristics().await? {
            let properties = characteristic.properties().await?;
            found.push(DiscoveredCharacteristic {
                uuid: characteristic.uuid(),
                write: properties.write,
                write_without_response: properties.write_without_response,
                handle: characteristic,
            });
        }
        Ok(found)
    }

    async fn write(
        &self,
        characteristic: &Characteristic,
        data: &[u8],
        kind: WriteKind,
    ) -> Result<(), BleError> {
        let result = match kind {
            WriteKind::WithoutResponse => characteristic.write_without_response(data).await,
            WriteKind::WithResponse => characteristic.write(data).await,
        };
        result.map_err(|e| {
            error!("Write to {} failed: {}", characteristic.uuid(), e);
            BleError::from(e)
        })
    }

    async fn link_events(
        &self,
        device_id: &str,
    ) -> Result<BoxStream<'static, LinkEvent>, BleError> {
        let device = self.find_device(device_id).await?;
        let adapter = self.adapter.clone();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut events = match adapter.device_connection_events(&device).await {
                Ok(events) => events,
                Err(e) => {
                    warn!("Connection events unavailable for {}: {}", device.id(), e);
                    return;
                }
            };
            loop {
                tokio::select! {
                    event = events.next() => {
                        let Some(event) = event else { break };
                        let event = match event {
                            ConnectionEvent::Connected => LinkEvent::Connected,
                            ConnectionEvent::Disconnected => LinkEvent::Disconnected,
                        };
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                    _ = tx.closed() => break,
                }
            }
        });

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed())
    }
}
