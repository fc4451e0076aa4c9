//! BLE adapters: a [`Transport`] over the vendor GATT service and a
//! [`ScannerBackend`] over the platform adapter's advertisement stream.
//!
//! The insole firmware exposes one service with two characteristics: `rx`
//! (device → host, notify) and `tx` (host → device, write without response).
//! Everything protocol-level stays in the core; these adapters only move
//! bytes and advertisements.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::connection::Transport;
use crate::error::TransportError;
use crate::scanner::{Advertisement, ScannerBackend};
use crate::sensor_data::DeviceType;

// ── GATT layout ───────────────────────────────────────────────────────────────

pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x534b_0001_8d98_4b35_a4f7_46c9_7cbd_d3f0);
/// Device → host notifications (framed messages).
pub const RX_CHARACTERISTIC: Uuid = Uuid::from_u128(0x534b_0002_8d98_4b35_a4f7_46c9_7cbd_d3f0);
/// Host → device writes (framed messages, chunked to the MTU).
pub const TX_CHARACTERISTIC: Uuid = Uuid::from_u128(0x534b_0003_8d98_4b35_a4f7_46c9_7cbd_d3f0);

/// Pre-negotiation BLE default. The connection manager raises this when the
/// platform reports a larger negotiated value.
pub const DEFAULT_BLE_MTU: usize = 23;

fn backend_err(e: impl std::fmt::Display) -> TransportError {
    TransportError::Backend(e.to_string())
}

// ── Transport ─────────────────────────────────────────────────────────────────

/// One BLE link to one peripheral.
pub struct BleTransport {
    peripheral: Peripheral,
    adapter: Adapter,
    tx_char: Option<Characteristic>,
    open: Arc<AtomicBool>,
    inbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    inbound_rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    pump: Option<JoinHandle<()>>,
    watcher: Option<JoinHandle<()>>,
}

impl BleTransport {
    pub fn new(peripheral: Peripheral, adapter: Adapter) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            peripheral,
            adapter,
            tx_char: None,
            open: Arc::new(AtomicBool::new(false)),
            inbound_tx,
            inbound_rx: Some(inbound_rx),
            pump: None,
            watcher: None,
        }
    }

    fn abort_tasks(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        // BlueZ's Connect can block forever when the device is out of range
        // or the stack is wedged; a BLE connect normally takes under 2 s.
        tokio::time::timeout(Duration::from_secs(10), self.peripheral.connect())
            .await
            .map_err(|_| TransportError::Backend("connect timed out after 10 s".into()))?
            .map_err(backend_err)?;

        // On Linux the stack signals connection completion before the GATT
        // cache is populated; discovering too early yields an empty set.
        #[cfg(target_os = "linux")]
        tokio::time::sleep(Duration::from_millis(600)).await;

        tokio::time::timeout(Duration::from_secs(15), self.peripheral.discover_services())
            .await
            .map_err(|_| TransportError::Backend("service discovery timed out after 15 s".into()))?
            .map_err(backend_err)?;

        let chars = self.peripheral.characteristics();
        let find_char = |uuid: Uuid| -> Result<Characteristic, TransportError> {
            chars
                .iter()
                .find(|c| c.uuid == uuid)
                .cloned()
                .ok_or_else(|| TransportError::Backend(format!("characteristic {uuid} not found")))
        };
        let rx_char = find_char(RX_CHARACTERISTIC)?;
        self.tx_char = Some(find_char(TX_CHARACTERISTIC)?);

        self.peripheral.subscribe(&rx_char).await.map_err(backend_err)?;
        info!("connected and subscribed: {:?}", self.peripheral.id());

        // Notification pump: raw framed bytes straight onto the inbound
        // channel; the connection manager decodes them.
        let mut notifications = self.peripheral.notifications().await.map_err(backend_err)?;
        let inbound = self.inbound_tx.clone();
        let open = self.open.clone();
        self.pump = Some(tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != RX_CHARACTERISTIC {
                    debug!("ignoring notification from {}", notification.uuid);
                    continue;
                }
                if inbound.send(notification.value).is_err() {
                    break;
                }
            }
            info!("notification stream ended");
            open.store(false, Ordering::SeqCst);
        }));

        // Disconnect watcher: the adapter's event stream reports a dropped
        // link faster than the notification stream closes.
        let peripheral_id = self.peripheral.id();
        let adapter = self.adapter.clone();
        let open = self.open.clone();
        self.watcher = Some(tokio::spawn(async move {
            match adapter.events().await {
                Ok(mut events) => {
                    while let Some(event) = events.next().await {
                        if let CentralEvent::DeviceDisconnected(id) = event {
                            if id == peripheral_id {
                                info!("link to {id:?} dropped");
                                open.store(false, Ordering::SeqCst);
                                break;
                            }
                        }
                    }
                }
                Err(e) => warn!("could not watch adapter events: {e}"),
            }
        }));

        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.abort_tasks();
        self.open.store(false, Ordering::SeqCst);
        self.peripheral.disconnect().await.map_err(backend_err)
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<(), TransportError> {
        let tx_char = self.tx_char.as_ref().ok_or(TransportError::NotOpen)?;
        self.peripheral
            .write(tx_char, chunk, WriteType::WithoutResponse)
            .await
            .map_err(backend_err)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn mtu(&self) -> usize {
        DEFAULT_BLE_MTU
    }

    fn supports_reconnect(&self) -> bool {
        true
    }

    fn take_inbound(&mut self) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.inbound_rx.take()
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

// ── Scanner backend ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BleScanConfig {
    /// Only advertisements whose local name starts with this prefix are
    /// reported. Default `"Sole"`.
    pub name_prefix: String,
}

impl Default for BleScanConfig {
    fn default() -> Self {
        Self {
            name_prefix: "Sole".into(),
        }
    }
}

/// Advertisement source over the first platform Bluetooth adapter.
pub struct BleScannerBackend {
    config: BleScanConfig,
    adapter: Option<Adapter>,
    relay: Option<JoinHandle<()>>,
}

impl BleScannerBackend {
    pub fn new(config: BleScanConfig) -> Self {
        Self {
            config,
            adapter: None,
            relay: None,
        }
    }

    async fn ensure_adapter(&mut self) -> Result<Adapter, TransportError> {
        if let Some(adapter) = &self.adapter {
            return Ok(adapter.clone());
        }
        let manager = Manager::new().await.map_err(backend_err)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(backend_err)?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::Backend("no Bluetooth adapter found".into()))?;
        wait_for_powered_on(&adapter).await;
        self.adapter = Some(adapter.clone());
        Ok(adapter)
    }
}

#[async_trait]
impl ScannerBackend for BleScannerBackend {
    async fn is_available(&mut self) -> bool {
        self.ensure_adapter().await.is_ok()
    }

    async fn start(&mut self) -> Result<mpsc::UnboundedReceiver<Advertisement>, TransportError> {
        let adapter = self.ensure_adapter().await?;
        let mut events = adapter.events().await.map_err(backend_err)?;
        adapter
            .start_scan(ScanFilter {
                services: vec![SERVICE_UUID],
            })
            .await
            .map_err(backend_err)?;
        info!("BLE scan started");

        let (tx, rx) = mpsc::unbounded_channel();
        let prefix = self.config.name_prefix.clone();
        let relay_adapter = adapter.clone();
        self.relay = Some(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };
                let Ok(peripheral) = relay_adapter.peripheral(&id).await else {
                    continue;
                };
                let Ok(Some(props)) = peripheral.properties().await else {
                    continue;
                };
                let Some(name) = props.local_name else {
                    continue;
                };
                if !name.starts_with(&prefix) {
                    continue;
                }
                let advertisement = Advertisement {
                    id: id.to_string(),
                    device_type: device_type_from_name(&name),
                    name,
                    rssi: props.rssi.unwrap_or(i16::MIN),
                };
                if tx.send(advertisement).is_err() {
                    break;
                }
            }
        }));
        Ok(rx)
    }

    async fn stop(&mut self) -> Result<(), TransportError> {
        if let Some(relay) = self.relay.take() {
            relay.abort();
        }
        if let Some(adapter) = &self.adapter {
            adapter.stop_scan().await.map_err(backend_err)?;
        }
        info!("BLE scan stopped");
        Ok(())
    }

    async fn open_transport(&mut self, id: &str) -> Result<Box<dyn Transport>, TransportError> {
        let adapter = self.ensure_adapter().await?;
        for peripheral in adapter.peripherals().await.map_err(backend_err)? {
            if peripheral.id().to_string() == id {
                return Ok(Box::new(BleTransport::new(peripheral, adapter)));
            }
        }
        Err(TransportError::Backend(format!("peripheral {id} not known to the adapter")))
    }
}

/// The firmware advertises its role in the local name (`"Sole Left"`,
/// `"Sole Right"`); bare `"Sole"` modules are motion-only.
fn device_type_from_name(name: &str) -> Option<DeviceType> {
    let lower = name.to_ascii_lowercase();
    if lower.contains("left") {
        Some(DeviceType::LeftInsole)
    } else if lower.contains("right") {
        Some(DeviceType::RightInsole)
    } else {
        None
    }
}

/// On macOS, CBCentralManager starts in an "unknown" state after launch;
/// scanning before it reports PoweredOn is a silent no-op.
#[cfg(target_os = "macos")]
async fn wait_for_powered_on(adapter: &Adapter) {
    use btleplug::api::CentralState;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        match adapter.adapter_state().await {
            Ok(CentralState::PoweredOn) => break,
            Ok(state) => {
                if tokio::time::Instant::now() >= deadline {
                    warn!("adapter still in state {state:?} after 3 s; proceeding anyway");
                    break;
                }
                debug!("adapter state {state:?}, waiting");
            }
            Err(e) => {
                warn!("adapter_state() error: {e}");
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    // Let the delegate settle.
    tokio::time::sleep(Duration::from_millis(300)).await;
}

#[cfg(not(target_os = "macos"))]
async fn wait_for_powered_on(_adapter: &Adapter) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advertised_name_maps_to_a_role() {
        assert_eq!(device_type_from_name("Sole Left"), Some(DeviceType::LeftInsole));
        assert_eq!(device_type_from_name("Sole right #2"), Some(DeviceType::RightInsole));
        assert_eq!(device_type_from_name("Sole"), None);
    }
}
