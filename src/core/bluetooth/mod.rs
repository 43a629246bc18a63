//! Bluetooth functionality for the cup bridge
//! This module handles all bluetooth operations including scanning,
//! connecting, and writing command frames to the cup controllers.

mod commands;
mod connection;
pub mod constants;
mod error;
mod manager;
mod notification;
mod scanner;
#[cfg(test)]
pub(crate) mod testing;
mod transport;
mod types;

// Re-export types that should be publicly accessible
pub use commands::{CommandExecutor, CommandQueue, CommandSender, PendingCommand};
pub use connection::{ConnectionManager, ConnectionSettings};
pub use constants::*; // Re-export all constants
pub use error::BleError;
pub use manager::{BluetoothManager, ModeRequest};
pub use notification::{NotificationHub, Subscribers, Subscription};
pub use scanner::{BluetoothScanner, ScanFilter, ScanStream};
pub use transport::{
    extract_mac_address, find_write_characteristic, select_service, BleTransport,
    BluestTransport, TransportAvailability,
};
pub use types::{
    BluetoothDevice, ConnectionPhase, ConnectionState, ConnectionStateChange,
    DiscoveredCharacteristic, DiscoveredService, LinkEvent, PermissionStatus, WriteKind,
};
