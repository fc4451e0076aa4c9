//! Discovery of advertisable, unconnected devices.
//!
//! A [`Scanner`] drives a [`ScannerBackend`] (the transport-specific side:
//! radio power state, advertisement stream, transport construction) and
//! owns the session state: the registry of sighted devices, the parallel
//! last-seen map, and the expiration timer. The registry logic lives in the
//! pure [`DiscoveryRegistry`] so expiry is testable without timers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
// Follows the runtime's clock, so expiry is testable under paused time.
use tokio::time::Instant;

use crate::connection::Transport;
use crate::device::{Device, DeviceConfig};
use crate::error::{DeviceError, StateError, TransportError};
use crate::events::EventHub;
use crate::registry::MessageRegistry;
use crate::sensor_data::DeviceType;

// ── Discovery data model ──────────────────────────────────────────────────────

/// One advertisement sighting, as reported by a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    /// Transport-level identifier (platform BLE id, socket address, …).
    /// Unique per scan session.
    pub id: String,
    pub name: String,
    /// Hardware flavor when the advertisement carries it.
    pub device_type: Option<DeviceType>,
    /// Signal strength in dBm (or a backend-specific proxy).
    pub rssi: i16,
}

/// A device currently present in the discovery registry.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredDevice {
    pub id: String,
    pub name: String,
    pub device_type: Option<DeviceType>,
    pub rssi: i16,
}

impl From<Advertisement> for DiscoveredDevice {
    fn from(adv: Advertisement) -> Self {
        Self {
            id: adv.id,
            name: adv.name,
            device_type: adv.device_type,
            rssi: adv.rssi,
        }
    }
}

/// The registry of advertised-but-unconnected devices with per-entry
/// expiry. Pure state; the `Scanner` supplies the clock and timers.
#[derive(Debug, Default)]
pub struct DiscoveryRegistry {
    devices: HashMap<String, DiscoveredDevice>,
    last_seen: HashMap<String, Instant>,
}

impl DiscoveryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a sighting; returns the stored entry for event
    /// emission.
    pub fn upsert(&mut self, adv: Advertisement, now: Instant) -> DiscoveredDevice {
        let device = DiscoveredDevice::from(adv);
        self.last_seen.insert(device.id.clone(), now);
        self.devices.insert(device.id.clone(), device.clone());
        device
    }

    /// Remove every entry unseen for longer than `timeout`, returning the
    /// removed entries.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<DiscoveredDevice> {
        let expired_ids: Vec<String> = self
            .last_seen
            .iter()
            .filter(|(_, &seen)| now.duration_since(seen) > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        expired_ids
            .into_iter()
            .filter_map(|id| {
                self.last_seen.remove(&id);
                self.devices.remove(&id)
            })
            .collect()
    }

    /// Drop everything without emitting expirations (a stopped scan is not
    /// "all devices vanished").
    pub fn clear(&mut self) {
        self.devices.clear();
        self.last_seen.clear();
    }

    pub fn get(&self, id: &str) -> Option<&DiscoveredDevice> {
        self.devices.get(id)
    }

    pub fn devices(&self) -> Vec<DiscoveredDevice> {
        self.devices.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

// ── Backend contract ──────────────────────────────────────────────────────────

/// Transport-specific half of scanning: radio availability, the raw
/// advertisement stream, and transport construction for a chosen device.
#[async_trait]
pub trait ScannerBackend: Send {
    /// Whether the underlying radio/socket is powered and ready to scan.
    async fn is_available(&mut self) -> bool;

    /// Begin advertising sightings on the returned channel. The channel
    /// closes when the backend stops on its own.
    async fn start(&mut self) -> Result<mpsc::UnboundedReceiver<Advertisement>, TransportError>;

    /// Stop producing sightings.
    async fn stop(&mut self) -> Result<(), TransportError>;

    /// Build a transport for a previously advertised device id.
    async fn open_transport(&mut self, id: &str) -> Result<Box<dyn Transport>, TransportError>;
}

// ── Scanner ───────────────────────────────────────────────────────────────────

/// Events emitted by a [`Scanner`].
#[derive(Debug, Clone, PartialEq)]
pub enum ScannerEvent {
    ScanningAvailable(bool),
    Scanning(bool),
    Discovered(DiscoveredDevice),
    Expired(DiscoveredDevice),
}

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// How long a device may go unseen before it expires from the registry.
    pub expiration_timeout: Duration,
    /// How often the expiration check runs while the registry is non-empty.
    pub expiration_check_interval: Duration,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            expiration_timeout: Duration::from_millis(5000),
            expiration_check_interval: Duration::from_millis(1000),
        }
    }
}

/// A time-bounded view of nearby unpaired devices, independent of any
/// connection.
pub struct Scanner {
    backend: Box<dyn ScannerBackend>,
    config: ScannerConfig,
    message_registry: Arc<MessageRegistry>,
    registry: Arc<Mutex<DiscoveryRegistry>>,
    hub: Arc<EventHub<ScannerEvent>>,
    scanning: bool,
    pump: Option<JoinHandle<()>>,
}

impl Scanner {
    pub fn new(
        backend: Box<dyn ScannerBackend>,
        message_registry: Arc<MessageRegistry>,
        config: ScannerConfig,
    ) -> Self {
        Self {
            backend,
            config,
            message_registry,
            registry: Arc::new(Mutex::new(DiscoveryRegistry::new())),
            hub: Arc::new(EventHub::new()),
            scanning: false,
            pump: None,
        }
    }

    /// Subscribe to scanner events.
    pub fn events(&self) -> mpsc::UnboundedReceiver<ScannerEvent> {
        self.hub.subscribe()
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    pub async fn is_scanning_available(&mut self) -> bool {
        let available = self.backend.is_available().await;
        self.hub.emit(ScannerEvent::ScanningAvailable(available));
        available
    }

    /// Snapshot of the current registry.
    pub fn discovered_devices(&self) -> Vec<DiscoveredDevice> {
        self.registry.lock().unwrap().devices()
    }

    /// Begin a scan session: clears the registry and starts the pump task
    /// that ingests sightings and expires stale entries.
    pub async fn start_scan(&mut self) -> Result<(), DeviceError> {
        if !self.backend.is_available().await {
            return Err(StateError::NotAvailable.into());
        }
        if self.scanning {
            return Err(StateError::AlreadyScanning.into());
        }
        self.registry.lock().unwrap().clear();
        let adverts = self.backend.start().await?;
        self.scanning = true;
        self.hub.emit(ScannerEvent::Scanning(true));
        info!("scan session started");

        self.pump = Some(tokio::spawn(pump_task(
            adverts,
            self.registry.clone(),
            self.hub.clone(),
            self.config.clone(),
        )));
        Ok(())
    }

    /// End the scan session: stops the backend and the expiration timer and
    /// clears the registry without emitting expiration events.
    pub async fn stop_scan(&mut self) -> Result<(), DeviceError> {
        if !self.scanning {
            return Err(StateError::NotScanning.into());
        }
        self.scanning = false;
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        let result = self.backend.stop().await;
        self.registry.lock().unwrap().clear();
        self.hub.emit(ScannerEvent::Scanning(false));
        info!("scan session stopped");
        result.map_err(Into::into)
    }

    /// Construct a [`Device`] over a fresh transport for a discovered id and
    /// begin its connect sequence.
    pub async fn connect_to_device(&mut self, id: &str) -> Result<Device, DeviceError> {
        if !self.backend.is_available().await {
            return Err(StateError::NotAvailable.into());
        }
        let known = self.registry.lock().unwrap().get(id).cloned();
        let discovered = known.ok_or(StateError::UnknownDeviceId)?;
        info!("connecting to {} ({})", discovered.name, discovered.id);
        let transport = self.backend.open_transport(id).await?;
        let device = Device::new(transport, self.message_registry.clone(), DeviceConfig::default());
        device.connect().await?;
        Ok(device)
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// Ingests advertisement sightings and runs the expiration check. The
/// check interval only exists while the registry is non-empty, so an idle
/// scanner does not tick forever on nothing.
async fn pump_task(
    mut adverts: mpsc::UnboundedReceiver<Advertisement>,
    registry: Arc<Mutex<DiscoveryRegistry>>,
    hub: Arc<EventHub<ScannerEvent>>,
    config: ScannerConfig,
) {
    let mut check: Option<tokio::time::Interval> = None;
    loop {
        tokio::select! {
            sighting = adverts.recv() => {
                let Some(adv) = sighting else { break };
                debug!("advertisement from {} ({} dBm)", adv.id, adv.rssi);
                let device = registry.lock().unwrap().upsert(adv, Instant::now());
                hub.emit(ScannerEvent::Discovered(device));
                if check.is_none() {
                    let mut interval = tokio::time::interval(config.expiration_check_interval);
                    // The first tick of a tokio interval fires immediately;
                    // skip it so a fresh sighting is not examined at age 0.
                    interval.reset();
                    check = Some(interval);
                }
            }
            _ = async { check.as_mut().unwrap().tick().await }, if check.is_some() => {
                let expired = registry
                    .lock()
                    .unwrap()
                    .expire(Instant::now(), config.expiration_timeout);
                for device in expired {
                    debug!("expired {}", device.id);
                    hub.emit(ScannerEvent::Expired(device));
                }
                if registry.lock().unwrap().is_empty() {
                    check = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adv(id: &str) -> Advertisement {
        Advertisement {
            id: id.into(),
            name: format!("Sole-{id}"),
            device_type: Some(DeviceType::LeftInsole),
            rssi: -60,
        }
    }

    #[test]
    fn upsert_refreshes_without_duplicating() {
        let mut r = DiscoveryRegistry::new();
        let t0 = Instant::now();
        r.upsert(adv("a"), t0);
        r.upsert(adv("a"), t0 + Duration::from_millis(100));
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn stale_entries_expire_exactly_once() {
        let mut r = DiscoveryRegistry::new();
        let t0 = Instant::now();
        r.upsert(adv("a"), t0);
        r.upsert(adv("b"), t0 + Duration::from_secs(4));

        let timeout = Duration::from_secs(5);
        let expired = r.expire(t0 + Duration::from_secs(6), timeout);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, "a");
        assert_eq!(r.len(), 1);

        // A second sweep finds nothing new.
        assert!(r.expire(t0 + Duration::from_secs(6), timeout).is_empty());
    }

    #[test]
    fn refreshed_entry_survives_the_sweep() {
        let mut r = DiscoveryRegistry::new();
        let t0 = Instant::now();
        r.upsert(adv("a"), t0);
        r.upsert(adv("a"), t0 + Duration::from_secs(4));
        let expired = r.expire(t0 + Duration::from_secs(6), Duration::from_secs(5));
        assert!(expired.is_empty());
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn clear_removes_everything_silently() {
        let mut r = DiscoveryRegistry::new();
        r.upsert(adv("a"), Instant::now());
        r.clear();
        assert!(r.is_empty());
    }

    // ── Scanner session state machine, over a scripted backend ─────────────

    struct MockBackend {
        available: bool,
        // Shared with the test body so it can inject sightings mid-session.
        adverts: Arc<Mutex<Option<mpsc::UnboundedSender<Advertisement>>>>,
    }

    impl MockBackend {
        fn new(available: bool) -> (Self, Arc<Mutex<Option<mpsc::UnboundedSender<Advertisement>>>>) {
            let adverts = Arc::new(Mutex::new(None));
            (
                Self {
                    available,
                    adverts: adverts.clone(),
                },
                adverts,
            )
        }
    }

    #[async_trait]
    impl ScannerBackend for MockBackend {
        async fn is_available(&mut self) -> bool {
            self.available
        }

        async fn start(
            &mut self,
        ) -> Result<mpsc::UnboundedReceiver<Advertisement>, TransportError> {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.adverts.lock().unwrap() = Some(tx);
            Ok(rx)
        }

        async fn stop(&mut self) -> Result<(), TransportError> {
            *self.adverts.lock().unwrap() = None;
            Ok(())
        }

        async fn open_transport(&mut self, _id: &str) -> Result<Box<dyn Transport>, TransportError> {
            Ok(Box::new(crate::connection::tests::MockTransport::new(64)))
        }
    }

    type AdvertHandle = Arc<Mutex<Option<mpsc::UnboundedSender<Advertisement>>>>;

    fn scanner(available: bool) -> (Scanner, AdvertHandle) {
        let (backend, adverts) = MockBackend::new(available);
        let scanner = Scanner::new(
            Box::new(backend),
            Arc::new(MessageRegistry::default()),
            ScannerConfig {
                expiration_timeout: Duration::from_millis(50),
                expiration_check_interval: Duration::from_millis(10),
            },
        );
        (scanner, adverts)
    }

    #[tokio::test]
    async fn scan_requires_availability() {
        let (mut s, _) = scanner(false);
        assert!(matches!(
            s.start_scan().await,
            Err(DeviceError::State(StateError::NotAvailable))
        ));
    }

    #[tokio::test]
    async fn double_start_and_idle_stop_are_state_errors() {
        let (mut s, _) = scanner(true);
        assert!(matches!(
            s.stop_scan().await,
            Err(DeviceError::State(StateError::NotScanning))
        ));
        s.start_scan().await.unwrap();
        assert!(matches!(
            s.start_scan().await,
            Err(DeviceError::State(StateError::AlreadyScanning))
        ));
        s.stop_scan().await.unwrap();
        assert!(!s.is_scanning());
    }

    #[tokio::test]
    async fn connect_to_unknown_id_fails() {
        let (mut s, _) = scanner(true);
        s.start_scan().await.unwrap();
        assert!(matches!(
            s.connect_to_device("ghost").await,
            Err(DeviceError::State(StateError::UnknownDeviceId))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn sightings_discover_then_expire() {
        let (mut s, adverts) = scanner(true);
        let mut events = s.events();
        s.start_scan().await.unwrap();

        let tx = adverts.lock().unwrap().clone().unwrap();
        tx.send(adv("a")).unwrap();

        // Discovery is immediate.
        let discovered = loop {
            match events.recv().await.unwrap() {
                ScannerEvent::Discovered(d) => break d,
                _ => continue,
            }
        };
        assert_eq!(discovered.id, "a");
        assert_eq!(s.discovered_devices().len(), 1);

        // With no re-advertisement, the entry expires exactly once.
        tokio::time::advance(Duration::from_millis(120)).await;
        let expired = loop {
            match events.recv().await.unwrap() {
                ScannerEvent::Expired(d) => break d,
                _ => continue,
            }
        };
        assert_eq!(expired.id, "a");
        assert!(s.discovered_devices().is_empty());
    }
}
