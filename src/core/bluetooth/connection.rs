//! Bluetooth connection handling for the cups
//! Drives each device through the connection state machine and owns the
//! per-device write path (characteristic writer and command queue).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use log::{debug, info, warn};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::commands::{
    lock, CharacteristicWriter, CommandExecutor, CommandQueue, CommandSender, PendingCommand,
};
use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::notification::Subscribers;
use crate::core::bluetooth::transport::{find_write_characteristic, select_service, BleTransport};
use crate::core::bluetooth::types::{
    ConnectionPhase, ConnectionState, ConnectionStateChange, LinkEvent,
};
use crate::core::protocol::{handshake_frames, Frame, Variant};

/// What the connection manager looks for on a cup
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub service_uuid: Uuid,
    pub write_characteristic_uuid: Uuid,
    /// Last-resort use of the first service when nothing matches
    pub allow_service_fallback: bool,
    pub default_variant: Variant,
    pub handshake_delay: Duration,
}

struct ActiveConnection {
    state: ConnectionState,
    link_watch: CancellationToken,
}

/// Connection manager for the cups
pub struct ConnectionManager<T: BleTransport> {
    transport: Arc<T>,
    queue: CommandQueue,
    connection_changes: Subscribers<ConnectionStateChange>,
    settings: ConnectionSettings,
    phases: Arc<Mutex<HashMap<String, ConnectionPhase>>>,
    connections: Arc<Mutex<HashMap<String, ActiveConnection>>>,
}

impl<T: BleTransport> Clone for ConnectionManager<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            queue: self.queue.clone(),
            connection_changes: self.connection_changes.clone(),
            settings: self.settings.clone(),
            phases: self.phases.clone(),
            connections: self.connections.clone(),
        }
    }
}

impl<T: BleTransport> ConnectionManager<T> {
    pub fn new(
        transport: Arc<T>,
        queue: CommandQueue,
        connection_changes: Subscribers<ConnectionStateChange>,
        settings: ConnectionSettings,
    ) -> Self {
        Self {
            transport,
            queue,
            connection_changes,
            settings,
            phases: Arc::new(Mutex::new(HashMap::new())),
            connections: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Connects and resolves the write characteristic. On any failure the
    /// device ends up `Disconnected` and the typed error is returned.
    pub async fn connect(&self, device_id: &str) -> Result<ConnectionState, BleError> {
        if let Some(state) = self.connection(device_id) {
            info!("Device {} already connected.", device_id);
            return Ok(state);
        }
        if self.phase(device_id).is_some_and(ConnectionPhase::is_busy) {
            return Err(BleError::Transport(format!(
                "connection to {device_id} already in progress"
            )));
        }

        self.transition(device_id, ConnectionPhase::Connecting, None);
        match self.establish(device_id).await {
            Ok(state) => {
                info!("Connection and setup process completed for {}", device_id);
                Ok(state)
            }
            Err(e) => {
                warn!("Connection to {} failed: {}", device_id, e);
                self.queue.discard(device_id);
                if let Err(cleanup) = self.transport.disconnect(device_id).await {
                    debug!("Cleanup disconnect of {} failed: {}", device_id, cleanup);
                }
                self.transition(device_id, ConnectionPhase::Disconnected, Some(e.to_string()));
                Err(e)
            }
        }
    }

    async fn establish(&self, device_id: &str) -> Result<ConnectionState, BleError> {
        self.transport.connect(device_id).await?;

        info!("Connection successful, discovering services...");
        self.transition(device_id, ConnectionPhase::ServiceResolving, None);
        let services = self.transport.discover_services(device_id).await?;
        let service = select_service(
            &services,
            self.settings.service_uuid,
            self.settings.allow_service_fallback,
        )
        .ok_or_else(|| {
            for service in &services {
                info!("Available service: {}", service.uuid);
            }
            BleError::ServiceNotFound(device_id.to_string())
        })?;
        info!("Found cup service: {}", service.uuid);

        self.transition(device_id, ConnectionPhase::CharacteristicResolving, None);
        let characteristics = self.transport.discover_characteristics(&service.handle).await?;
        let characteristic =
            find_write_characteristic(&characteristics, self.settings.write_characteristic_uuid)
                .ok_or_else(|| BleError::CharacteristicNotFound(device_id.to_string()))?;
        let kind = characteristic
            .preferred_write()
            .ok_or_else(|| BleError::CharacteristicNotFound(device_id.to_string()))?;
        info!("Found write characteristic: {} ({:?})", characteristic.uuid, kind);

        let writer: Arc<dyn CommandSender> = Arc::new(CharacteristicWriter::new(
            self.transport.clone(),
            characteristic.handle.clone(),
            kind,
        ));

        let variant = self.settings.default_variant;
        if variant.layout().handshake {
            self.transition(device_id, ConnectionPhase::Initializing, None);
            CommandExecutor::new(writer.as_ref())
                .initialize_controller(variant, self.settings.handshake_delay)
                .await?;
        }

        self.queue.register(device_id, writer);
        let state = ConnectionState::new(device_id.to_string(), variant);
        let link_watch = CancellationToken::new();
        lock(&self.connections).insert(
            device_id.to_string(),
            ActiveConnection {
                state: state.clone(),
                link_watch: link_watch.clone(),
            },
        );
        self.watch_link(device_id, link_watch).await;

        self.transition(device_id, ConnectionPhase::Ready, None);
        Ok(state)
    }

    async fn watch_link(&self, device_id: &str, cancel_token: CancellationToken) {
        let mut events = match self.transport.link_events(device_id).await {
            Ok(events) => events,
            Err(e) => {
                warn!("Cannot watch link state of {}: {}", device_id, e);
                return;
            }
        };

        let manager = self.clone();
        let device_id = device_id.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    event = events.next() => match event {
                        Some(LinkEvent::Disconnected) => {
                            manager.handle_connection_lost(&device_id);
                            break;
                        }
                        Some(LinkEvent::Connected) => {}
                        None => break,
                    },
                }
            }
        });
    }

    /// Drops the session after the peripheral went away on its own.
    pub fn handle_connection_lost(&self, device_id: &str) {
        let removed = lock(&self.connections).remove(device_id);
        if removed.is_none() {
            return;
        }
        warn!("Lost connection to {}", device_id);
        self.queue.discard(device_id);
        self.transition(
            device_id,
            ConnectionPhase::Disconnected,
            Some(BleError::ConnectionLost(device_id.to_string()).to_string()),
        );
    }

    /// Ends the session. Commands still queued for the device are rejected
    /// with `Cancelled`.
    pub async fn disconnect(&self, device_id: &str) -> Result<(), BleError> {
        let active = lock(&self.connections).remove(device_id);
        let Some(active) = active else {
            return Err(BleError::NotConnected(device_id.to_string()));
        };

        self.transition(device_id, ConnectionPhase::Disconnecting, None);
        active.link_watch.cancel();
        self.queue.discard(device_id);

        let result = self.transport.disconnect(device_id).await;
        if let Err(e) = &result {
            warn!("Disconnect of {} reported: {}", device_id, e);
        }
        info!("Connected state cleared for {}", device_id);
        self.transition(
            device_id,
            ConnectionPhase::Disconnected,
            result.as_ref().err().map(ToString::to_string),
        );
        result
    }

    pub async fn disconnect_all(&self) {
        let ids: Vec<String> = lock(&self.connections).keys().cloned().collect();
        for device_id in ids {
            if let Err(e) = self.disconnect(&device_id).await {
                warn!("Failed to disconnect {}: {}", device_id, e);
            }
        }
    }

    /// Records a scan sighting. Known sessions keep their phase.
    pub fn mark_discovered(&self, device_id: &str) {
        let mut phases = lock(&self.phases);
        let phase = phases
            .entry(device_id.to_string())
            .or_insert(ConnectionPhase::Discovered);
        if *phase == ConnectionPhase::Disconnected {
            *phase = ConnectionPhase::Discovered;
        }
    }

    /// Drops sightings that never led to a session.
    pub fn forget_discovered(&self) -> usize {
        let mut phases = lock(&self.phases);
        let before = phases.len();
        phases.retain(|_, phase| *phase != ConnectionPhase::Discovered);
        before - phases.len()
    }

    pub fn phase(&self, device_id: &str) -> Option<ConnectionPhase> {
        lock(&self.phases).get(device_id).copied()
    }

    pub fn is_connected(&self, device_id: &str) -> bool {
        lock(&self.connections).contains_key(device_id)
    }

    pub fn connection(&self, device_id: &str) -> Option<ConnectionState> {
        lock(&self.connections)
            .get(device_id)
            .map(|active| active.state.clone())
    }

    pub fn list_connected_devices(&self) -> Vec<ConnectionState> {
        let mut states: Vec<ConnectionState> = lock(&self.connections)
            .values()
            .map(|active| active.state.clone())
            .collect();
        states.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        states
    }

    pub fn variant(&self, device_id: &str) -> Result<Variant, BleError> {
        lock(&self.connections)
            .get(device_id)
            .map(|active| active.state.variant)
            .ok_or_else(|| BleError::NotConnected(device_id.to_string()))
    }

    /// Switches a connected device to `variant`, sending its power-on
    /// sequence first when the variant needs one.
    pub async fn set_variant(&self, device_id: &str, variant: Variant) -> Result<(), BleError> {
        if self.variant(device_id)? != variant {
            self.initialize_variant(device_id, variant).await?;
        }
        self.adopt_variant(device_id, variant)
    }

    /// Sends the handshake of `variant` through the device's queue.
    pub async fn initialize_variant(
        &self,
        device_id: &str,
        variant: Variant,
    ) -> Result<(), BleError> {
        for frame in handshake_frames(variant) {
            info!("Sending handshake frame [{}] for {}", frame, variant);
            self.enqueue(device_id, frame)?.await?;
            sleep(self.settings.handshake_delay).await;
        }
        Ok(())
    }

    /// Records `variant` for the device without writing anything.
    pub fn adopt_variant(&self, device_id: &str, variant: Variant) -> Result<(), BleError> {
        let mut connections = lock(&self.connections);
        let active = connections
            .get_mut(device_id)
            .ok_or_else(|| BleError::NotConnected(device_id.to_string()))?;
        if active.state.variant != variant {
            info!("Device {} now speaks {}", device_id, variant);
            active.state.variant = variant;
        }
        Ok(())
    }

    /// Queues a frame for a connected device.
    pub fn enqueue(&self, device_id: &str, frame: Frame) -> Result<PendingCommand, BleError> {
        if !self.is_connected(device_id) {
            return Err(BleError::NotConnected(device_id.to_string()));
        }
        self.queue.enqueue(device_id, frame)
    }

    pub fn pending_commands(&self, device_id: &str) -> usize {
        self.queue.pending(device_id)
    }

    fn transition(&self, device_id: &str, phase: ConnectionPhase, error: Option<String>) {
        let previous = lock(&self.phases).insert(device_id.to_string(), phase);
        info!("Device {}: {:?} -> {:?}", device_id, previous, phase);
        self.connection_changes.emit(&ConnectionStateChange {
            device_id: device_id.to_string(),
            phase,
            error,
        });
    }
}
