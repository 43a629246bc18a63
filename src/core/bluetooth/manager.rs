//! Bluetooth manager for the cup bridge
//! This module provides the main interface for bluetooth operations

use std::future::Future;
use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::config::BridgeConfig;
use crate::core::bluetooth::commands::CommandQueue;
use crate::core::bluetooth::connection::{ConnectionManager, ConnectionSettings};
use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::notification::{NotificationHub, Subscription};
use crate::core::bluetooth::scanner::{BluetoothScanner, ScanFilter, ScanStream};
use crate::core::bluetooth::transport::BleTransport;
use crate::core::bluetooth::types::{
    BluetoothDevice, ConnectionPhase, ConnectionState, ConnectionStateChange, PermissionStatus,
};
use crate::core::protocol::{encode_pattern_code, encode_rgb, Command, Frame, Mode, Rgb, Variant};

/// A mode change, optionally with an animation speed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ModeRequest {
    pub mode: Mode,
    pub speed: Option<i32>,
}

/// Manages Bluetooth operations
pub struct BluetoothManager<T: BleTransport> {
    transport: Arc<T>,
    hub: NotificationHub,
    scanner: BluetoothScanner<T>,
    connection_manager: ConnectionManager<T>,
    /// Feeds scan results into the connection state machine
    discovery_link: Subscription,
}

impl<T: BleTransport> BluetoothManager<T> {
    /// Creates a new BluetoothManager
    pub fn new(transport: Arc<T>, config: &BridgeConfig) -> Self {
        let hub = NotificationHub::new();
        let scanner = BluetoothScanner::new(
            transport.clone(),
            hub.scan_results.clone(),
            ScanFilter {
                min_rssi: config.min_rssi,
                name_filter: config.name_filter.clone(),
            },
            config.scan_timeout(),
        );
        let connection_manager = ConnectionManager::new(
            transport.clone(),
            CommandQueue::new(config.settle_delay()),
            hub.connection_changes.clone(),
            ConnectionSettings {
                service_uuid: config.service_uuid,
                write_characteristic_uuid: config.write_characteristic_uuid,
                allow_service_fallback: config.allow_service_fallback,
                default_variant: config.variant,
                handshake_delay: config.handshake_delay(),
            },
        );

        let discovery_link = {
            let connection_manager = connection_manager.clone();
            hub.on_scan_result(move |device| connection_manager.mark_discovered(&device.id))
        };

        Self {
            transport,
            hub,
            scanner,
            connection_manager,
            discovery_link,
        }
    }

    pub async fn request_permissions(&self) -> Result<PermissionStatus, BleError> {
        let status = self.transport.request_permissions().await?;
        info!("Bluetooth permission status: {:?}", status);
        Ok(status)
    }

    pub async fn is_bluetooth_enabled(&self) -> bool {
        self.transport.is_bluetooth_enabled().await
    }

    async fn ensure_enabled(&self) -> Result<(), BleError> {
        if self.is_bluetooth_enabled().await {
            Ok(())
        } else {
            Err(BleError::BluetoothUnavailable(
                "Bluetooth adapter is turned off".to_string(),
            ))
        }
    }

    /// Starts discovery. Results arrive on the returned stream and on every
    /// `on_scan_result` subscriber.
    pub async fn scan(&self) -> Result<ScanStream, BleError> {
        if self.request_permissions().await? == PermissionStatus::Denied {
            return Err(BleError::PermissionDenied);
        }
        self.ensure_enabled().await?;
        self.scanner.start_scan().await
    }

    /// Stops discovery and forgets devices that were only seen.
    pub async fn stop_scan(&self) {
        self.scanner.stop_scan().await;
        let forgotten = self.connection_manager.forget_discovered();
        if forgotten > 0 {
            info!("Forgot {} discovered device(s)", forgotten);
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    pub fn discovered_devices(&self) -> Vec<BluetoothDevice> {
        self.scanner.discovered_devices()
    }

    /// Connects to a device with the given ID
    pub async fn connect(&self, device_id: &str) -> Result<ConnectionState, BleError> {
        self.ensure_enabled().await?;
        self.connection_manager.connect(device_id).await
    }

    pub async fn disconnect(&self, device_id: &str) -> Result<(), BleError> {
        self.connection_manager.disconnect(device_id).await
    }

    pub fn is_connected(&self, device_id: &str) -> bool {
        self.connection_manager.is_connected(device_id)
    }

    pub fn list_connected_devices(&self) -> Vec<ConnectionState> {
        self.connection_manager.list_connected_devices()
    }

    pub fn phase(&self, device_id: &str) -> Option<ConnectionPhase> {
        self.connection_manager.phase(device_id)
    }

    pub fn variant(&self, device_id: &str) -> Result<Variant, BleError> {
        self.connection_manager.variant(device_id)
    }

    pub async fn set_variant(&self, device_id: &str, variant: Variant) -> Result<(), BleError> {
        self.connection_manager.set_variant(device_id, variant).await
    }

    pub async fn send_color(
        &self,
        device_id: &str,
        r: i32,
        g: i32,
        b: i32,
    ) -> Result<(), BleError> {
        self.send(device_id, Command::color(r, g, b)?).await
    }

    pub async fn send_rgb(&self, device_id: &str, rgb: Rgb) -> Result<(), BleError> {
        self.send(device_id, Command::Color(rgb)).await
    }

    pub async fn send_brightness(&self, device_id: &str, percent: i32) -> Result<(), BleError> {
        self.send(device_id, Command::brightness(percent)?).await
    }

    pub async fn send_speed(&self, device_id: &str, percent: i32) -> Result<(), BleError> {
        self.send(device_id, Command::speed(percent)?).await
    }

    /// Sends the mode frame (none for `Static`) followed by the speed frame
    /// when a speed is given.
    pub async fn send_mode(&self, device_id: &str, request: ModeRequest) -> Result<(), BleError> {
        let speed = request.speed.map(Command::speed).transpose()?;
        self.send(device_id, Command::Mode(request.mode)).await?;
        if let Some(speed) = speed {
            self.send(device_id, speed).await?;
        }
        Ok(())
    }

    pub async fn send_power(&self, device_id: &str, on: bool) -> Result<(), BleError> {
        self.send(device_id, Command::Power(on)).await
    }

    /// Writes caller-supplied bytes unchanged.
    pub async fn send_raw_command(&self, device_id: &str, bytes: Vec<u8>) -> Result<(), BleError> {
        let frame = Frame::raw(bytes)?;
        self.send_frame(device_id, frame).await
    }

    /// Mode frame for an arbitrary pattern code in the device's variant.
    pub async fn send_pattern_code(&self, device_id: &str, code: u8) -> Result<(), BleError> {
        let variant = self.connection_manager.variant(device_id)?;
        self.send_frame(device_id, encode_pattern_code(code, variant))
            .await
    }

    pub async fn send_frame(&self, device_id: &str, frame: Frame) -> Result<(), BleError> {
        self.connection_manager.enqueue(device_id, frame)?.await
    }

    async fn send(&self, device_id: &str, command: Command) -> Result<(), BleError> {
        let variant = self.connection_manager.variant(device_id)?;
        match command.encode(variant)? {
            Some(frame) => self.send_frame(device_id, frame).await,
            None => {
                info!("{:?} needs no frame on {}", command, device_id);
                Ok(())
            }
        }
    }

    /// Writes `rgb` in each variant in turn, after that variant's handshake,
    /// and adopts the first one `confirm` accepts. A failed write moves on
    /// to the next variant.
    pub async fn try_variants<F, Fut>(
        &self,
        device_id: &str,
        rgb: Rgb,
        variants: &[Variant],
        mut confirm: F,
    ) -> Result<Option<Variant>, BleError>
    where
        F: FnMut(Variant) -> Fut,
        Fut: Future<Output = bool>,
    {
        for &variant in variants {
            info!("Trying {} on {}", variant, device_id);
            let attempt = async {
                self.connection_manager
                    .initialize_variant(device_id, variant)
                    .await?;
                self.send_frame(device_id, encode_rgb(rgb, variant)).await
            };
            match attempt.await {
                Ok(()) => {}
                Err(BleError::Transport(detail)) => {
                    warn!("{} write failed on {}: {}", variant, device_id, detail);
                    continue;
                }
                Err(e) => return Err(e),
            }
            if confirm(variant).await {
                self.connection_manager.adopt_variant(device_id, variant)?;
                return Ok(Some(variant));
            }
        }
        warn!("No variant confirmed for {}", device_id);
        Ok(None)
    }

    pub fn on_scan_result<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&BluetoothDevice) + Send + Sync + 'static,
    {
        self.hub.on_scan_result(callback)
    }

    pub fn on_connection_state_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ConnectionStateChange) + Send + Sync + 'static,
    {
        self.hub.on_connection_state_change(callback)
    }

    /// Stops scanning and disconnects every cup.
    pub async fn shutdown(&self) {
        if self.scanner.is_scanning() {
            self.scanner.stop_scan().await;
        }
        self.connection_manager.disconnect_all().await;
        self.discovery_link.unsubscribe();
        info!("Bluetooth manager shut down.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use futures_util::StreamExt;

    use crate::core::bluetooth::testing::{device, FakeTransport};
    use crate::core::bluetooth::types::WriteKind;
    use crate::core::protocol::{encode_power, encode_speed, ValidationError, ALL_VARIANTS};

    type Harness = (Arc<BluetoothManager<FakeTransport>>, Arc<FakeTransport>);

    fn manager(transport: FakeTransport) -> Harness {
        manager_with(transport, &BridgeConfig::default())
    }

    fn manager_with(
        transport: FakeTransport,
        config: &BridgeConfig,
    ) -> Harness {
        let transport = Arc::new(transport);
        (
            Arc::new(BluetoothManager::new(transport.clone(), config)),
            transport,
        )
    }

    async fn connected(id: &str) -> Harness {
        let (manager, transport) = manager(FakeTransport::new().with_cup(id));
        manager.connect(id).await.unwrap();
        (manager, transport)
    }

    #[tokio::test(start_paused = true)]
    async fn discovered_cup_receives_red_color_frame() {
        let (manager, transport) = manager(FakeTransport::new().with_cup("abc123"));

        let mut results = manager.scan().await.unwrap();
        transport.advertise(device("abc123", "SP105E", -55));
        assert_eq!(results.next().await.unwrap().id, "abc123");
        assert_eq!(manager.phase("abc123"), Some(ConnectionPhase::Discovered));
        manager.stop_scan().await;

        manager.connect("abc123").await.unwrap();
        assert!(manager.is_connected("abc123"));
        manager.send_color("abc123", 255, 0, 0).await.unwrap();

        assert_eq!(
            transport.writes_for("abc123"),
            vec![vec![0x38, 255, 0, 0, 0x22, 0x83]]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn brightness_is_rescaled_to_controller_range() {
        let (manager, transport) = connected("abc123").await;

        manager.send_brightness("abc123", 50).await.unwrap();
        assert_eq!(
            transport.writes_for("abc123"),
            vec![vec![0x38, 128, 128, 128, 0x2A, 0x83]]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_input_fails_before_any_write() {
        let (manager, transport) = connected("abc123").await;

        assert!(matches!(
            manager.send_color("abc123", 256, 0, 0).await,
            Err(BleError::Validation(ValidationError::OutOfRange { field: "r", .. }))
        ));
        assert!(matches!(
            manager.send_brightness("abc123", 101).await,
            Err(BleError::Validation(_))
        ));
        assert!(matches!(
            manager
                .send_mode("abc123", ModeRequest { mode: Mode::Pulse, speed: Some(-1) })
                .await,
            Err(BleError::Validation(_))
        ));
        assert_eq!(
            manager.send_raw_command("abc123", Vec::new()).await,
            Err(BleError::Validation(ValidationError::EmptyFrame))
        );
        // Validation wins over the missing session too.
        assert!(matches!(
            manager.send_color("nobody", -1, 0, 0).await,
            Err(BleError::Validation(_))
        ));
        assert!(transport.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn commands_to_unknown_device_are_not_connected() {
        let (manager, _transport) = manager(FakeTransport::new());
        assert_eq!(
            manager.send_color("ghost", 1, 2, 3).await,
            Err(BleError::NotConnected("ghost".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn static_mode_with_speed_sends_only_speed() {
        let (manager, transport) = connected("abc123").await;

        manager
            .send_mode("abc123", ModeRequest { mode: Mode::Static, speed: Some(40) })
            .await
            .unwrap();
        assert_eq!(
            transport.writes_for("abc123"),
            vec![encode_speed(40, Variant::Classic6).unwrap().into_bytes()]
        );

        manager
            .send_mode("abc123", ModeRequest { mode: Mode::Rainbow, speed: None })
            .await
            .unwrap();
        assert_eq!(
            transport.writes_for("abc123")[1],
            vec![0x38, 1, 0x00, 0x00, 0x2C, 0x83]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_updates_are_serialized_and_spaced() {
        let (manager, transport) = connected("abc123").await;

        let (a, b, c) = tokio::join!(
            manager.send_color("abc123", 10, 0, 0),
            manager.send_color("abc123", 20, 0, 0),
            manager.send_color("abc123", 30, 0, 0),
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());

        let writes = transport.writes();
        let reds: Vec<u8> = writes.iter().map(|w| w.bytes[1]).collect();
        assert_eq!(reds, vec![10, 20, 30]);
        for pair in writes.windows(2) {
            assert!(pair[1].at - pair[0].at >= BridgeConfig::default().settle_delay());
        }
        assert!(writes.iter().all(|w| w.kind == WriteKind::WithoutResponse));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_with_pending_commands_cancels_them() {
        let (manager, transport) = connected("abc123").await;

        let tasks: Vec<_> = (0..4)
            .map(|i| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.send_color("abc123", i, 0, 0).await })
            })
            .collect();
        for _ in 0..50 {
            if transport.writes_for("abc123").len() == 1
                && manager.connection_manager.pending_commands("abc123") == 3
            {
                break;
            }
            tokio::task::yield_now().await;
        }

        manager.disconnect("abc123").await.unwrap();

        let mut cancelled = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(()) => {}
                Err(BleError::Cancelled) => cancelled += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(cancelled, 3);
        assert_eq!(transport.writes_for("abc123").len(), 1);
        assert!(!manager.is_connected("abc123"));
    }

    #[tokio::test(start_paused = true)]
    async fn try_variants_adopts_first_confirmed() {
        let (manager, transport) = connected("abc123").await;
        let asked = Arc::new(Mutex::new(Vec::new()));

        let adopted = {
            let asked = asked.clone();
            manager
                .try_variants(
                    "abc123",
                    Rgb::new(0, 255, 0),
                    &[Variant::Classic6, Variant::Extended7, Variant::Framed9],
                    move |variant| {
                        asked.lock().unwrap().push(variant);
                        async move { variant == Variant::Extended7 }
                    },
                )
                .await
                .unwrap()
        };

        assert_eq!(adopted, Some(Variant::Extended7));
        assert_eq!(
            *asked.lock().unwrap(),
            vec![Variant::Classic6, Variant::Extended7]
        );
        assert_eq!(manager.variant("abc123"), Ok(Variant::Extended7));
        let writes = transport.writes_for("abc123");
        assert_eq!(writes.len(), 3);
        assert_eq!(writes[1], encode_power(true, Variant::Extended7).into_bytes());
    }

    #[tokio::test(start_paused = true)]
    async fn framed_fallback_gets_its_power_on_before_the_test_color() {
        let (manager, transport) = connected("abc123").await;
        let green = Rgb::new(0, 255, 0);

        let adopted = manager
            .try_variants(
                "abc123",
                green,
                &[Variant::Classic6, Variant::Framed9],
                |variant| async move { variant == Variant::Framed9 },
            )
            .await
            .unwrap();

        assert_eq!(adopted, Some(Variant::Framed9));
        assert_eq!(
            transport.writes_for("abc123"),
            vec![
                encode_rgb(green, Variant::Classic6).into_bytes(),
                encode_power(true, Variant::Framed9).into_bytes(),
                encode_rgb(green, Variant::Framed9).into_bytes(),
            ]
        );

        // Adopting did not repeat the handshake.
        manager.send_power("abc123", false).await.unwrap();
        assert_eq!(transport.writes_for("abc123").len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn stopping_scan_forgets_unconnected_sightings() {
        let (manager, transport) = manager(FakeTransport::new().with_cup("abc123"));
        manager.connect("abc123").await.unwrap();

        let mut results = manager.scan().await.unwrap();
        transport.advertise(device("passerby", "SP105E", -60));
        assert_eq!(results.next().await.unwrap().id, "passerby");
        assert_eq!(manager.phase("passerby"), Some(ConnectionPhase::Discovered));

        manager.stop_scan().await;
        assert_eq!(manager.phase("passerby"), None);
        assert_eq!(manager.phase("abc123"), Some(ConnectionPhase::Ready));
    }

    #[tokio::test(start_paused = true)]
    async fn try_variants_reports_none_when_nothing_confirms() {
        let (manager, _transport) = connected("abc123").await;
        let adopted = manager
            .try_variants("abc123", Rgb::new(1, 2, 3), &ALL_VARIANTS, |_| async { false })
            .await
            .unwrap();
        assert_eq!(adopted, None);
        assert_eq!(manager.variant("abc123"), Ok(Variant::Classic6));
    }

    #[tokio::test]
    async fn scan_requires_permission_and_adapter() {
        let transport = FakeTransport::new();
        transport.set_permission(PermissionStatus::Denied);
        let (manager, transport) = manager(transport);
        assert!(matches!(manager.scan().await, Err(BleError::PermissionDenied)));

        transport.set_permission(PermissionStatus::Granted);
        transport.set_enabled(false);
        let err = manager.scan().await.err().unwrap();
        assert!(matches!(err, BleError::BluetoothUnavailable(_)));
        assert!(err.is_actionable());
        assert!(matches!(
            manager.connect("abc123").await,
            Err(BleError::BluetoothUnavailable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn state_change_subscribers_see_lifecycle() {
        let (manager, _transport) = manager(FakeTransport::new().with_cup("abc123"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let subscription = {
            let seen = seen.clone();
            manager.on_connection_state_change(move |change| {
                seen.lock().unwrap().push(change.phase)
            })
        };

        manager.connect("abc123").await.unwrap();
        subscription.unsubscribe();
        subscription.unsubscribe();
        manager.disconnect("abc123").await.unwrap();

        assert_eq!(seen.lock().unwrap().last(), Some(&ConnectionPhase::Ready));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_disconnects_everything() {
        let (manager, transport) = manager(FakeTransport::new().with_cup("a").with_cup("b"));
        manager.connect("a").await.unwrap();
        manager.connect("b").await.unwrap();
        assert_eq!(manager.list_connected_devices().len(), 2);

        manager.shutdown().await;
        assert!(manager.list_connected_devices().is_empty());
        assert!(!transport.is_linked("a"));
        assert!(!transport.is_linked("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn power_and_raw_frames_reach_the_cup() {
        let (manager, transport) = connected("abc123").await;
        manager.send_power("abc123", false).await.unwrap();
        manager
            .send_raw_command("abc123", vec![0x38, 0, 0, 0, 0xAB, 0x83])
            .await
            .unwrap();
        let writes = transport.writes_for("abc123");
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[1], vec![0x38, 0, 0, 0, 0xAB, 0x83]);
    }
}
