//! Defines shared data structures for the Bluetooth module.

use serde::Serialize;
use uuid::Uuid;

use crate::core::protocol::Variant;

/// Represents a discovered Bluetooth device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BluetoothDevice {
    /// Platform-specific unique identifier for the device (stable per pairing)
    pub id: String,
    /// The name of the device, "Unknown" if not advertised
    pub name: String,
    /// MAC address when the platform exposes one in the identifier
    pub address: Option<String>,
    /// The signal strength (RSSI) of the device, more negative is weaker
    pub rssi: i16,
    /// Whether the device advertised itself as connectable
    pub connectable: bool,
}

impl BluetoothDevice {
    /// Creates a new BluetoothDevice instance
    pub fn new(
        id: String,
        name: String,
        address: Option<String>,
        rssi: i16,
        connectable: bool,
    ) -> Self {
        Self {
            id,
            name,
            address,
            rssi,
            connectable,
        }
    }
}

/// The live session with one connected cup
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    pub device_id: String,
    pub connected: bool,
    /// The SP105E chip does not report battery, so this stays `None`
    pub battery_level: Option<u8>,
    /// Informational only
    pub firmware: Option<String>,
    /// Wire format this connection speaks
    pub variant: Variant,
}

impl ConnectionState {
    pub fn new(device_id: String, variant: Variant) -> Self {
        Self {
            device_id,
            connected: true,
            battery_level: None,
            firmware: None,
            variant,
        }
    }
}

/// Connection state machine phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    Discovered,
    Connecting,
    ServiceResolving,
    CharacteristicResolving,
    Initializing,
    Ready,
    Disconnecting,
    Disconnected,
}

impl ConnectionPhase {
    /// Phases in which `connect` is already under way or complete
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            ConnectionPhase::Connecting
                | ConnectionPhase::ServiceResolving
                | ConnectionPhase::CharacteristicResolving
                | ConnectionPhase::Initializing
                | ConnectionPhase::Ready
                | ConnectionPhase::Disconnecting
        )
    }
}

/// Emitted on every connection phase transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStateChange {
    pub device_id: String,
    pub phase: ConnectionPhase,
    /// Raw failure detail when the transition was caused by an error
    pub error: Option<String>,
}

/// Outcome of a permission request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionStatus {
    Granted,
    Denied,
}

/// A GATT service found during discovery
#[derive(Debug, Clone)]
pub struct DiscoveredService<S> {
    pub uuid: Uuid,
    pub handle: S,
}

/// A GATT characteristic found during discovery
#[derive(Debug, Clone)]
pub struct DiscoveredCharacteristic<C> {
    pub uuid: Uuid,
    pub write: bool,
    pub write_without_response: bool,
    pub handle: C,
}

impl<C> DiscoveredCharacteristic<C> {
    pub fn is_writable(&self) -> bool {
        self.write || self.write_without_response
    }

    /// Write-without-response is preferred; the chip expects it and it is faster.
    pub fn preferred_write(&self) -> Option<WriteKind> {
        if self.write_without_response {
            Some(WriteKind::WithoutResponse)
        } else if self.write {
            Some(WriteKind::WithResponse)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    WithResponse,
    WithoutResponse,
}

/// Link-level events reported by the transport for a connected device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Disconnected,
}
