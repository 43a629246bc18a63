//! Constants used throughout the Bluetooth layer
//! UUIDs, timeouts and delays for the SP105E cup controllers.

use uuid::Uuid;

/// Advertised name prefix of the cup controllers
pub const CUP_NAME_PREFIX: &str = "SP105E";

/// Expands a 16-bit SIG short UUID onto the Bluetooth base UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_00805f9b34fb)
}

/// The UUID of the cup control service (`FFE0`)
pub const UUID_CUP_SERVICE: Uuid = uuid_from_u16(0xFFE0);

/// The UUID of the cup write characteristic (`FFE1`)
pub const UUID_CUP_WRITE_CHAR: Uuid = uuid_from_u16(0xFFE1);

/// Scanning stops on its own after this many seconds
pub const DEFAULT_SCAN_TIMEOUT_SECS: u64 = 10;

/// Pause between two writes to the same controller, in milliseconds
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 50;

/// Pause after each handshake frame, in milliseconds
pub const DEFAULT_HANDSHAKE_DELAY_MS: u64 = 100;

/// How long `is_bluetooth_enabled` waits for the adapter, in milliseconds
pub const ADAPTER_READY_CHECK_MS: u64 = 500;

/// Timeout for a single connect or discovery step in seconds
pub const BLUETOOTH_OPERATION_TIMEOUT_SECS: u64 = 10;
