//! Error taxonomy for the Bluetooth layer

use thiserror::Error;

use crate::core::protocol::ValidationError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BleError {
    #[error("Bluetooth permission denied")]
    PermissionDenied,

    #[error("Bluetooth unavailable: {0}")]
    BluetoothUnavailable(String),

    #[error("A scan is already in progress")]
    ScanInProgress,

    #[error("Device not found with ID: {0}")]
    DeviceNotFound(String),

    #[error("Cup service not found on device {0}")]
    ServiceNotFound(String),

    #[error("No writable characteristic found on device {0}")]
    CharacteristicNotFound(String),

    #[error("Device {0} is not connected")]
    NotConnected(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Bluetooth transport error: {0}")]
    Transport(String),

    #[error("Connection to device {0} was lost")]
    ConnectionLost(String),

    #[error("Command cancelled before it was written")]
    Cancelled,
}

impl BleError {
    /// True when the user can fix this themselves (turn Bluetooth on, grant a
    /// permission) and should be prompted rather than shown an error.
    pub fn is_actionable(&self) -> bool {
        matches!(
            self,
            BleError::PermissionDenied | BleError::BluetoothUnavailable(_)
        )
    }

    /// Short text for the user. Raw detail stays in the log.
    pub fn user_message(&self) -> &'static str {
        match self {
            BleError::PermissionDenied => "Grant Bluetooth permission to control your cups.",
            BleError::BluetoothUnavailable(_) => "Turn on Bluetooth to control your cups.",
            BleError::ScanInProgress => "Already searching for cups.",
            BleError::Validation(_) => "That setting is out of range.",
            BleError::Cancelled => "The command was cancelled.",
            BleError::DeviceNotFound(_)
            | BleError::ServiceNotFound(_)
            | BleError::CharacteristicNotFound(_)
            | BleError::NotConnected(_)
            | BleError::Transport(_)
            | BleError::ConnectionLost(_) => "Could not reach the cup.",
        }
    }
}

impl From<bluest::Error> for BleError {
    fn from(err: bluest::Error) -> Self {
        BleError::Transport(err.to_string())
    }
}
