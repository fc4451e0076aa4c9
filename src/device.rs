//! One wearable device: a [`ConnectionManager`] plus the decoders that turn
//! its inbound packets into typed [`DeviceEvent`]s.
//!
//! Construction spawns a driver task that owns the connection's receive
//! channels: raw inbound bytes are parsed into typed packets, `sensorData`
//! payloads run through the stateful [`SensorDataDecoder`], device-meta
//! replies update the cached identity, and the liveness interval ticks the
//! manager. The public async methods lock the shared manager, so a `Device`
//! can be used from any task.

use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::connection::{
    ConnectionConfig, ConnectionEvents, ConnectionManager, ConnectionStatus, RxPacket, Transport,
};
use crate::error::DeviceError;
use crate::events::EventHub;
use crate::haptics::{encode_vibration_commands, VibrationCommand};
use crate::message::TxMessage;
use crate::registry::MessageRegistry;
use crate::sensor_data::{
    decode_sensor_configuration, encode_sensor_configuration, DeviceType, SensorDataDecoder,
    SensorDataType, SensorEvent,
};

// ── Events ────────────────────────────────────────────────────────────────────

/// Everything a device reports, fanned out through [`Device::events`].
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// Every connection state transition, including liveness-forced drops.
    ConnectionStatus(ConnectionStatus),
    /// Collapsed connected/not-connected edge (the usual thing UIs want).
    Connected(bool),
    /// One decoded sensor reading.
    Sensor(SensorEvent),
    /// The device's current sensor streaming configuration.
    SensorConfiguration(Vec<(SensorDataType, u16)>),
    /// Battery charge, 0–100.
    BatteryLevel(u8),
    Name(String),
    DeviceType(DeviceType),
    FirmwareVersion(String),
    /// Any typed message the device layer has no decoder for
    /// (file-transfer data, vendor extensions).
    Message(RxPacket),
}

#[derive(Debug, Clone, Default)]
pub struct DeviceConfig {
    pub connection: ConnectionConfig,
}

// ── Device ────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct DeviceState {
    name: Option<String>,
    device_type: Option<DeviceType>,
    battery_level: Option<u8>,
    firmware_version: Option<String>,
    decoder: SensorDataDecoder,
}

struct Shared {
    manager: tokio::sync::Mutex<ConnectionManager>,
    hub: EventHub<DeviceEvent>,
    state: Mutex<DeviceState>,
    registry: Arc<MessageRegistry>,
}

/// Handle to one device. Dropping it aborts the driver task and closes the
/// transport with it.
pub struct Device {
    shared: Arc<Shared>,
    driver: JoinHandle<()>,
}

impl Device {
    pub fn new(
        transport: Box<dyn Transport>,
        registry: Arc<MessageRegistry>,
        config: DeviceConfig,
    ) -> Self {
        let liveness = config.connection.liveness_interval;
        let (manager, events) = ConnectionManager::new(transport, registry.clone(), config.connection);
        let shared = Arc::new(Shared {
            manager: tokio::sync::Mutex::new(manager),
            hub: EventHub::new(),
            state: Mutex::new(DeviceState::default()),
            registry,
        });
        let driver = tokio::spawn(driver_task(shared.clone(), events, liveness));
        Self { shared, driver }
    }

    /// Subscribe to this device's events.
    pub fn events(&self) -> mpsc::UnboundedReceiver<DeviceEvent> {
        self.shared.hub.subscribe()
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Open the connection and request the device's identity (battery, name,
    /// type, firmware, sensor configuration) as one batched flush.
    pub async fn connect(&self) -> Result<(), DeviceError> {
        self.shared.manager.lock().await.connect().await?;
        info!("connected; requesting device information");
        self.request_device_information().await
    }

    pub async fn disconnect(&self) -> Result<(), DeviceError> {
        self.shared.manager.lock().await.disconnect().await
    }

    pub async fn reconnect(&self) -> Result<(), DeviceError> {
        self.shared.manager.lock().await.reconnect().await?;
        self.request_device_information().await
    }

    pub async fn connection_status(&self) -> ConnectionStatus {
        self.shared.manager.lock().await.status()
    }

    /// Resolve once the device reports connected (immediately if it already
    /// is). Returns `false` if the device is dropped first.
    pub async fn wait_until_connected(&self) -> bool {
        if self.connection_status().await == ConnectionStatus::Connected {
            return true;
        }
        self.shared
            .hub
            .wait_for(|e| matches!(e, DeviceEvent::Connected(true)))
            .await
            .is_some()
    }

    // ── Cached identity ──────────────────────────────────────────────────────

    pub fn name(&self) -> Option<String> {
        self.shared.state.lock().unwrap().name.clone()
    }

    pub fn device_type(&self) -> Option<DeviceType> {
        self.shared.state.lock().unwrap().device_type
    }

    pub fn battery_level(&self) -> Option<u8> {
        self.shared.state.lock().unwrap().battery_level
    }

    pub fn firmware_version(&self) -> Option<String> {
        self.shared.state.lock().unwrap().firmware_version.clone()
    }

    // ── Requests ─────────────────────────────────────────────────────────────

    /// Queue the identity round-trips and flush them as one batch.
    pub async fn request_device_information(&self) -> Result<(), DeviceError> {
        let requests = vec![
            TxMessage::new("batteryLevel"),
            TxMessage::new("getName"),
            TxMessage::new("getDeviceType"),
            TxMessage::new("getFirmwareVersion"),
            TxMessage::new("getSensorDataConfigurations"),
        ];
        self.send_messages(requests, true).await
    }

    pub async fn set_name(&self, name: &str) -> Result<(), DeviceError> {
        let message = TxMessage::with_payload("setName", name.as_bytes().to_vec());
        self.send_messages(vec![message], true).await
    }

    pub async fn set_device_type(&self, device_type: DeviceType) -> Result<(), DeviceError> {
        let message = TxMessage::with_payload("setDeviceType", vec![device_type.code()]);
        self.send_messages(vec![message], true).await
    }

    /// Set the streaming rate per sensor stream; a rate of `0` disables a
    /// stream. The device echoes the resulting configuration, which arrives
    /// as [`DeviceEvent::SensorConfiguration`].
    pub async fn set_sensor_configuration(
        &self,
        entries: &[(SensorDataType, u16)],
    ) -> Result<(), DeviceError> {
        let payload = encode_sensor_configuration(entries);
        let message = TxMessage::with_payload("setSensorDataConfigurations", payload);
        self.send_messages(vec![message], true).await
    }

    /// Encode and send a batch of vibration commands as one message.
    pub async fn trigger_vibration(
        &self,
        commands: &[VibrationCommand],
    ) -> Result<(), DeviceError> {
        let payload = encode_vibration_commands(commands)?;
        let message = TxMessage::with_payload("triggerVibration", payload);
        self.send_messages(vec![message], true).await
    }

    /// Kick off a firmware-side file transfer. Only the initiation is
    /// modeled here; transfer chunks arrive as [`DeviceEvent::Message`]
    /// packets for the caller to reassemble.
    pub async fn begin_file_transfer(&self, info: Vec<u8>) -> Result<(), DeviceError> {
        let message = TxMessage::with_payload("fileTransferInfo", info);
        self.send_messages(vec![message], true).await
    }

    /// Escape hatch: send any registry-typed message, optionally deferring
    /// the flush to batch with later messages.
    pub async fn send_messages(
        &self,
        messages: Vec<TxMessage>,
        flush_now: bool,
    ) -> Result<(), DeviceError> {
        self.shared
            .manager
            .lock()
            .await
            .send_messages(messages, flush_now)
            .await
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

// ── Driver task ───────────────────────────────────────────────────────────────

async fn driver_task(
    shared: Arc<Shared>,
    mut events: ConnectionEvents,
    liveness: std::time::Duration,
) {
    let mut ticker = tokio::time::interval(liveness);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            raw = events.inbound.recv() => {
                let Some(raw) = raw else { break };
                let manager = shared.manager.lock().await;
                if let Err(e) = manager.parse_incoming(&raw) {
                    warn!("dropping inbound buffer: {e}");
                }
            }
            packet = events.messages.recv() => {
                let Some(packet) = packet else { break };
                shared.handle_data(packet);
            }
            packet = events.meta.recv() => {
                let Some(packet) = packet else { break };
                shared.handle_meta(packet);
            }
            changed = events.status.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = *events.status.borrow_and_update();
                shared.on_status(status);
            }
            _ = ticker.tick() => {
                shared.manager.lock().await.check_liveness();
            }
        }
    }
    debug!("device driver task finished");
}

impl Shared {
    fn on_status(&self, status: ConnectionStatus) {
        self.hub.emit(DeviceEvent::ConnectionStatus(status));
        match status {
            ConnectionStatus::Connected => self.hub.emit(DeviceEvent::Connected(true)),
            ConnectionStatus::NotConnected => {
                // Device-clock timestamps restart on the next session.
                self.state.lock().unwrap().decoder.reset();
                self.hub.emit(DeviceEvent::Connected(false));
            }
            _ => {}
        }
    }

    fn handle_data(&self, packet: RxPacket) {
        match packet.name.as_str() {
            "sensorData" => {
                let decoded = {
                    let mut state = self.state.lock().unwrap();
                    let device_type = state.device_type;
                    state.decoder.decode(device_type, &packet.payload)
                };
                match decoded {
                    Ok(readings) => {
                        for event in readings {
                            self.hub.emit(DeviceEvent::Sensor(event));
                        }
                    }
                    Err(e) => warn!("bad sensorData payload: {e}"),
                }
            }
            "getSensorDataConfigurations" | "setSensorDataConfigurations" => {
                match decode_sensor_configuration(&packet.payload) {
                    Ok(entries) => self.hub.emit(DeviceEvent::SensorConfiguration(entries)),
                    Err(e) => warn!("bad sensor configuration payload: {e}"),
                }
            }
            // Replies to the set requests are not on the meta channel but
            // update the same cached identity.
            "setName" => {
                let name = String::from_utf8_lossy(&packet.payload).into_owned();
                self.state.lock().unwrap().name = Some(name.clone());
                self.hub.emit(DeviceEvent::Name(name));
            }
            "setDeviceType" => self.cache_device_type(&packet.payload),
            _ => self.hub.emit(DeviceEvent::Message(packet)),
        }
    }

    fn handle_meta(&self, packet: RxPacket) {
        match packet.name.as_str() {
            "batteryLevel" => {
                let Some(&level) = packet.payload.first() else {
                    warn!("empty batteryLevel payload");
                    return;
                };
                self.state.lock().unwrap().battery_level = Some(level);
                self.hub.emit(DeviceEvent::BatteryLevel(level));
            }
            "getName" => {
                let name = String::from_utf8_lossy(&packet.payload).into_owned();
                self.state.lock().unwrap().name = Some(name.clone());
                self.hub.emit(DeviceEvent::Name(name));
            }
            "getDeviceType" => self.cache_device_type(&packet.payload),
            "getFirmwareVersion" => {
                let version = String::from_utf8_lossy(&packet.payload).into_owned();
                self.state.lock().unwrap().firmware_version = Some(version.clone());
                self.hub.emit(DeviceEvent::FirmwareVersion(version));
            }
            other => {
                // Registry customization can widen the meta set past what we
                // decode here.
                debug!("unhandled meta message {other}");
                self.hub.emit(DeviceEvent::Message(packet));
            }
        }
    }

    fn cache_device_type(&self, payload: &[u8]) {
        let Some(device_type) = payload.first().and_then(|&c| DeviceType::from_code(c)) else {
            warn!("unrecognized device type payload {payload:?}");
            return;
        };
        self.state.lock().unwrap().device_type = Some(device_type);
        self.hub.emit(DeviceEvent::DeviceType(device_type));
    }
}

// Registry handle is carried for constructors that derive new connections
// (pair assignment, tests); the manager holds its own clone.
impl Device {
    pub fn registry(&self) -> Arc<MessageRegistry> {
        self.shared.registry.clone()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
