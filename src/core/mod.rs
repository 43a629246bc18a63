//! Core functionality for the cup bridge
//! Wire protocol, Bluetooth control layer and diagnostics.

pub mod bluetooth;
pub mod diagnostics;
pub mod protocol;

// Re-export commonly used types
pub use bluetooth::{BleError, BluetoothManager};
pub use protocol::{Command, Mode, Rgb, Variant};
