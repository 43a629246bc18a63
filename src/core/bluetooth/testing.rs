//! In-memory transport for tests

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::core::bluetooth::commands::lock;
use crate::core::bluetooth::constants::{UUID_CUP_SERVICE, UUID_CUP_WRITE_CHAR};
use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::transport::BleTransport;
use crate::core::bluetooth::types::{
    BluetoothDevice, DiscoveredCharacteristic, DiscoveredService, LinkEvent, PermissionStatus,
    WriteKind,
};

pub fn device(id: &str, name: &str, rssi: i16) -> BluetoothDevice {
    BluetoothDevice::new(id.to_string(), name.to_string(), None, rssi, true)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeService {
    pub device_id: String,
    pub uuid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeCharacteristic {
    pub device_id: String,
    pub uuid: Uuid,
}

#[derive(Debug, Clone)]
pub struct RecordedWrite {
    pub device_id: String,
    pub bytes: Vec<u8>,
    pub kind: WriteKind,
    pub at: Instant,
}

/// (characteristic uuid, write, write without response)
pub type CharacteristicSpec = (Uuid, bool, bool);

struct FakeState {
    enabled: bool,
    permission: PermissionStatus,
    system_connected: Vec<BluetoothDevice>,
    known: HashSet<String>,
    connected: HashSet<String>,
    gatt: HashMap<String, Vec<(Uuid, Vec<CharacteristicSpec>)>>,
    scan_tx: Option<mpsc::UnboundedSender<BluetoothDevice>>,
    link_tx: HashMap<String, mpsc::UnboundedSender<LinkEvent>>,
    fail_connect: Option<BleError>,
    fail_scan: Option<BleError>,
    failing_writes: HashSet<String>,
    writes: Vec<RecordedWrite>,
    connect_calls: usize,
    scan_calls: usize,
    prune_calls: usize,
}

pub struct FakeTransport {
    state: Mutex<FakeState>,
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                enabled: true,
                permission: PermissionStatus::Granted,
                system_connected: Vec::new(),
                known: HashSet::new(),
                connected: HashSet::new(),
                gatt: HashMap::new(),
                scan_tx: None,
                link_tx: HashMap::new(),
                fail_connect: None,
                fail_scan: None,
                failing_writes: HashSet::new(),
                writes: Vec::new(),
                connect_calls: 0,
                scan_calls: 0,
                prune_calls: 0,
            }),
        }
    }

    /// A connectable device exposing the standard FFE0/FFE1 cup service.
    pub fn with_cup(self, device_id: &str) -> Self {
        self.with_device(
            device_id,
            vec![(UUID_CUP_SERVICE, vec![(UUID_CUP_WRITE_CHAR, true, true)])],
        )
    }

    pub fn with_device(
        self,
        device_id: &str,
        gatt: Vec<(Uuid, Vec<CharacteristicSpec>)>,
    ) -> Self {
        {
            let mut state = lock(&self.state);
            state.known.insert(device_id.to_string());
            state.gatt.insert(device_id.to_string(), gatt);
        }
        self
    }

    pub fn advertise(&self, device: BluetoothDevice) {
        let mut state = lock(&self.state);
        state.known.insert(device.id.clone());
        if let Some(tx) = &state.scan_tx {
            let _ = tx.send(device);
        }
    }

    pub fn set_system_connected(&self, device: BluetoothDevice) {
        let mut state = lock(&self.state);
        state.known.insert(device.id.clone());
        state.system_connected.push(device);
    }

    pub fn set_enabled(&self, enabled: bool) {
        lock(&self.state).enabled = enabled;
    }

    pub fn set_permission(&self, permission: PermissionStatus) {
        lock(&self.state).permission = permission;
    }

    pub fn fail_next_connect(&self, error: BleError) {
        lock(&self.state).fail_connect = Some(error);
    }

    pub fn fail_next_scan(&self, error: BleError) {
        lock(&self.state).fail_scan = Some(error);
    }

    pub fn fail_writes_for(&self, device_id: &str) {
        lock(&self.state).failing_writes.insert(device_id.to_string());
    }

    /// Simulates the peripheral dropping the link.
    pub fn drop_link(&self, device_id: &str) {
        let mut state = lock(&self.state);
        state.connected.remove(device_id);
        if let Some(tx) = state.link_tx.get(device_id) {
            let _ = tx.send(LinkEvent::Disconnected);
        }
    }

    pub fn writes(&self) -> Vec<RecordedWrite> {
        lock(&self.state).writes.clone()
    }

    pub fn writes_for(&self, device_id: &str) -> Vec<Vec<u8>> {
        lock(&self.state)
            .writes
            .iter()
            .filter(|w| w.device_id == device_id)
            .map(|w| w.bytes.clone())
            .collect()
    }

    pub fn connect_calls(&self) -> usize {
        lock(&self.state).connect_calls
    }

    pub fn scan_calls(&self) -> usize {
        lock(&self.state).scan_calls
    }

    pub fn prune_calls(&self) -> usize {
        lock(&self.state).prune_calls
    }

    pub fn is_linked(&self, device_id: &str) -> bool {
        lock(&self.state).connected.contains(device_id)
    }
}

fn channel_stream<T: Send + 'static>(rx: mpsc::UnboundedReceiver<T>) -> BoxStream<'static, T> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

#[async_trait]
impl BleTransport for FakeTransport {
    type Service = FakeService;
    type Characteristic = FakeCharacteristic;

    async fn request_permissions(&self) -> Result<PermissionStatus, BleError> {
        Ok(lock(&self.state).permission)
    }

    async fn is_bluetooth_enabled(&self) -> bool {
        lock(&self.state).enabled
    }

    async fn connected_devices(&self) -> Result<Vec<BluetoothDevice>, BleError> {
        // A real adapter query suspends; let other tasks interleave here.
        tokio::task::yield_now().await;
        Ok(lock(&self.state).system_connected.clone())
    }

    async fn prune_discovered(&self) {
        lock(&self.state).prune_calls += 1;
    }

    async fn scan(&self) -> Result<BoxStream<'static, BluetoothDevice>, BleError> {
        let mut state = lock(&self.state);
        state.scan_calls += 1;
        if let Some(error) = state.fail_scan.take() {
            return Err(error);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.scan_tx = Some(tx);
        Ok(channel_stream(rx))
    }

    async fn connect(&self, device_id: &str) -> Result<(), BleError> {
        let mut state = lock(&self.state);
        state.connect_calls += 1;
        if let Some(error) = state.fail_connect.take() {
            return Err(error);
        }
        if !state.known.contains(device_id) {
            return Err(BleError::DeviceNotFound(device_id.to_string()));
        }
        state.connected.insert(device_id.to_string());
        Ok(())
    }

    async fn disconnect(&self, device_id: &str) -> Result<(), BleError> {
        let mut state = lock(&self.state);
        state.connected.remove(device_id);
        state.link_tx.remove(device_id);
        Ok(())
    }

    async fn discover_services(
        &self,
        device_id: &str,
    ) -> Result<Vec<DiscoveredService<FakeService>>, BleError> {
        let state = lock(&self.state);
        Ok(state
            .gatt
            .get(device_id)
            .map(|services| {
                services
                    .iter()
                    .map(|(uuid, _)| DiscoveredService {
                        uuid: *uuid,
                        handle: FakeService {
                            device_id: device_id.to_string(),
                            uuid: *uuid,
                        },
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn discover_characteristics(
        &self,
        service: &FakeService,
    ) -> Result<Vec<DiscoveredCharacteristic<FakeCharacteristic>>, BleError> {
        let state = lock(&self.state);
        let specs = state
            .gatt
            .get(&service.device_id)
            .and_then(|services| services.iter().find(|(uuid, _)| *uuid == service.uuid))
            .map(|(_, specs)| specs.clone())
            .unwrap_or_default();

        Ok(specs
            .into_iter()
            .map(|(uuid, write, write_without_response)| DiscoveredCharacteristic {
                uuid,
                write,
                write_without_response,
                handle: FakeCharacteristic {
                    device_id: service.device_id.clone(),
                    uuid,
                },
            })
            .collect())
    }

    async fn write(
        &self,
        characteristic: &FakeCharacteristic,
        data: &[u8],
        kind: WriteKind,
    ) -> Result<(), BleError> {
        let mut state = lock(&self.state);
        state.writes.push(RecordedWrite {
            device_id: characteristic.device_id.clone(),
            bytes: data.to_vec(),
            kind,
            at: Instant::now(),
        });
        if state.failing_writes.contains(&characteristic.device_id) {
            return Err(BleError::Transport("GATT write failed".to_string()));
        }
        Ok(())
    }

    async fn link_events(
        &self,
        device_id: &str,
    ) -> Result<BoxStream<'static, LinkEvent>, BleError> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.state).link_tx.insert(device_id.to_string(), tx);
        Ok(channel_stream(rx))
    }
}
