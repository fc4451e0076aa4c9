//! A left/right device pair and the pressure-fusion math that treats the two
//! insoles as one surface.
//!
//! The pair owns at most one [`Device`] per [`Side`]. Each assigned device
//! gets a forwarding task that re-emits its events tagged with the side and
//! feeds pressure readings into the [`PressureFuser`], which recomputes the
//! combined center of pressure whenever both sides have reported. The fusion
//! math lives in pure types (`RangeTracker`, `PressureFuser`) so it is
//! testable without devices or tasks.

use std::sync::{Arc, Mutex};

use log::{debug, info};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::connection::ConnectionStatus;
use crate::device::{Device, DeviceEvent};
use crate::error::DeviceError;
use crate::events::EventHub;
use crate::haptics::VibrationCommand;
use crate::sensor_data::{PressureData, SensorDataType, SensorReading, Vector2};

// ── Sides ─────────────────────────────────────────────────────────────────────

/// Which insole a device plays in the pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub const BOTH: [Side; 2] = [Side::Left, Side::Right];

    fn index(self) -> usize {
        match self {
            Side::Left => 0,
            Side::Right => 1,
        }
    }

    /// Horizontal offset of this side's half of the combined surface.
    fn x_offset(self) -> f64 {
        match self {
            Side::Left => 0.0,
            Side::Right => 0.5,
        }
    }
}

// ── Auto-calibration ──────────────────────────────────────────────────────────

/// Tracks the observed range of a scalar and maps values into `0..=1` of
/// that range. The range only ever grows until [`RangeTracker::reset`].
#[derive(Debug, Clone)]
pub struct RangeTracker {
    min: f64,
    max: f64,
}

impl RangeTracker {
    pub fn new() -> Self {
        Self {
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    /// Widen the range to include `value` and return `value`'s position in
    /// the widened range. A degenerate range (single observed value) maps
    /// to `0.0`.
    pub fn update(&mut self, value: f64) -> f64 {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        let span = self.max - self.min;
        if span > 0.0 {
            (value - self.min) / span
        } else {
            0.0
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for RangeTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ── Fusion ────────────────────────────────────────────────────────────────────

/// One pressure cell of the combined surface, with its position remapped
/// into pair space.
#[derive(Debug, Clone, PartialEq)]
pub struct PairPressureSensor {
    pub side: Side,
    pub position: Vector2,
    pub raw: u16,
    pub scaled: f64,
}

/// The combined pressure picture across both insoles.
///
/// Synchronization is best-effort: the newest reading from each side is
/// fused regardless of clock skew, and both device-clock timestamps are
/// carried so consumers can judge the staleness themselves.
#[derive(Debug, Clone, PartialEq)]
pub struct PairPressure {
    pub left_timestamp: u64,
    pub right_timestamp: u64,
    pub sensors: Vec<PairPressureSensor>,
    /// Sum of both sides' scaled readings.
    pub scaled_sum: f64,
    /// `scaled_sum` within the range observed since the last calibration
    /// reset.
    pub normalized_sum: f64,
    /// Weighted centroid over the combined surface; `None` while nothing
    /// presses down (an all-zero frame carries no position information).
    pub center: Option<Vector2>,
    /// `center` auto-calibrated per axis against the observed range.
    pub normalized_center: Option<Vector2>,
}

/// Pure fusion state: the latest pressure snapshot per side plus the
/// calibration trackers.
#[derive(Debug, Default)]
pub struct PressureFuser {
    latest: [Option<(u64, PressureData)>; 2],
    sum_range: RangeTracker,
    center_x_range: RangeTracker,
    center_y_range: RangeTracker,
}

impl PressureFuser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one side's reading. Returns the recomputed combined picture
    /// once both sides have reported at least once.
    pub fn feed(&mut self, side: Side, timestamp: u64, data: PressureData) -> Option<PairPressure> {
        self.latest[side.index()] = Some((timestamp, data));
        let (left_timestamp, left) = self.latest[Side::Left.index()].as_ref()?;
        let (right_timestamp, right) = self.latest[Side::Right.index()].as_ref()?;
        let (left_timestamp, right_timestamp) = (*left_timestamp, *right_timestamp);

        let mut sensors = Vec::with_capacity(left.sensors.len() + right.sensors.len());
        for (side, data) in [(Side::Left, left), (Side::Right, right)] {
            for cell in &data.sensors {
                sensors.push(PairPressureSensor {
                    side,
                    position: remap(side, cell.position),
                    raw: cell.raw,
                    scaled: cell.scaled,
                });
            }
        }

        let scaled_sum = left.scaled_sum + right.scaled_sum;
        let center = if scaled_sum > 0.0 {
            let mut center = Vector2::default();
            for cell in &sensors {
                let weight = cell.scaled / scaled_sum;
                center.x += cell.position.x * weight;
                center.y += cell.position.y * weight;
            }
            Some(center)
        } else {
            None
        };

        let normalized_sum = self.sum_range.update(scaled_sum);
        let normalized_center = center.map(|c| Vector2 {
            x: self.center_x_range.update(c.x),
            y: self.center_y_range.update(c.y),
        });

        Some(PairPressure {
            left_timestamp,
            right_timestamp,
            sensors,
            scaled_sum,
            normalized_sum,
            center,
            normalized_center,
        })
    }

    /// Forget one side's snapshot (the side's device was replaced).
    pub fn clear_side(&mut self, side: Side) {
        self.latest[side.index()] = None;
    }

    /// Restart auto-calibration from nothing.
    pub fn reset_range(&mut self) {
        self.sum_range.reset();
        self.center_x_range.reset();
        self.center_y_range.reset();
    }
}

/// Each insole's `0..=1` coordinate space covers half the pair surface.
fn remap(side: Side, position: Vector2) -> Vector2 {
    Vector2 {
        x: position.x / 2.0 + side.x_offset(),
        y: position.y,
    }
}

// ── Pair ──────────────────────────────────────────────────────────────────────

/// Events emitted by a [`DevicePair`].
#[derive(Debug, Clone, PartialEq)]
pub enum PairEvent {
    /// A device event, re-emitted with its side.
    Device { side: Side, event: DeviceEvent },
    /// Recomputed combined pressure (requires data from both sides).
    Pressure(PairPressure),
}

struct PairShared {
    hub: EventHub<PairEvent>,
    fuser: Mutex<PressureFuser>,
    connected: Mutex<[bool; 2]>,
}

struct Slot {
    device: Arc<Device>,
    forward: JoinHandle<()>,
}

/// Two devices acting as one logical unit.
///
/// The pair holds shared handles, not the devices themselves: assigning a
/// device never transfers its lifetime, and dropping the pair only stops the
/// forwarding tasks. A device a caller still holds keeps running.
pub struct DevicePair {
    shared: Arc<PairShared>,
    slots: [Option<Slot>; 2],
}

impl DevicePair {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(PairShared {
                hub: EventHub::new(),
                fuser: Mutex::new(PressureFuser::new()),
                connected: Mutex::new([false; 2]),
            }),
            slots: [None, None],
        }
    }

    /// Subscribe to pair events.
    pub fn events(&self) -> mpsc::UnboundedReceiver<PairEvent> {
        self.shared.hub.subscribe()
    }

    /// Give `device` the `side` role, returning whichever device held it
    /// before. Replacing a side forgets its snapshot and restarts pressure
    /// calibration, since the combined range is meaningless across hardware.
    ///
    /// A device connected before assignment counts immediately: its current
    /// status seeds the side's flag, and the forwarding task tracks changes
    /// from there. The subscription is taken before the snapshot, so no
    /// transition slips between the two.
    pub async fn assign(&mut self, side: Side, device: Arc<Device>) -> Option<Arc<Device>> {
        let displaced = self.slots[side.index()].take().map(|slot| {
            slot.forward.abort();
            slot.device
        });
        {
            let mut fuser = self.shared.fuser.lock().unwrap();
            fuser.clear_side(side);
            fuser.reset_range();
        }

        info!("assigning device to {side:?} side");
        let events = device.events();
        let connected = device.connection_status().await == ConnectionStatus::Connected;
        self.shared.connected.lock().unwrap()[side.index()] = connected;
        let forward = tokio::spawn(forward_task(side, events, self.shared.clone()));
        self.slots[side.index()] = Some(Slot { device, forward });
        displaced
    }

    /// Release `side`, returning its device handle, if any.
    pub fn take(&mut self, side: Side) -> Option<Arc<Device>> {
        let slot = self.slots[side.index()].take()?;
        slot.forward.abort();
        let mut fuser = self.shared.fuser.lock().unwrap();
        fuser.clear_side(side);
        fuser.reset_range();
        self.shared.connected.lock().unwrap()[side.index()] = false;
        Some(slot.device)
    }

    pub fn device(&self, side: Side) -> Option<&Device> {
        self.slots[side.index()].as_ref().map(|s| s.device.as_ref())
    }

    /// Both sides assigned and connected.
    pub fn is_connected(&self) -> bool {
        let connected = self.shared.connected.lock().unwrap();
        connected[0] && connected[1]
    }

    /// At least one side connected.
    pub fn is_partially_connected(&self) -> bool {
        let connected = self.shared.connected.lock().unwrap();
        connected[0] || connected[1]
    }

    /// Restart center-of-pressure auto-calibration (e.g. after the wearer
    /// changes or the insoles are re-seated).
    pub fn reset_pressure_range(&self) {
        self.shared.fuser.lock().unwrap().reset_range();
    }

    // ── Convenience fan-out ──────────────────────────────────────────────────

    /// Apply one sensor configuration to every assigned device.
    pub async fn set_sensor_configuration(
        &self,
        entries: &[(SensorDataType, u16)],
    ) -> Result<(), DeviceError> {
        for slot in self.slots.iter().flatten() {
            slot.device.set_sensor_configuration(entries).await?;
        }
        Ok(())
    }

    /// Send the same vibration to every assigned device.
    pub async fn trigger_vibration(
        &self,
        commands: &[VibrationCommand],
    ) -> Result<(), DeviceError> {
        for slot in self.slots.iter().flatten() {
            slot.device.trigger_vibration(commands).await?;
        }
        Ok(())
    }
}

impl Default for DevicePair {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DevicePair {
    fn drop(&mut self) {
        for slot in self.slots.iter().flatten() {
            slot.forward.abort();
        }
    }
}

/// Forwards one device's events into the pair hub and routes pressure
/// readings through the fuser.
async fn forward_task(
    side: Side,
    mut events: mpsc::UnboundedReceiver<DeviceEvent>,
    shared: Arc<PairShared>,
) {
    while let Some(event) = events.recv().await {
        if let DeviceEvent::Connected(connected) = event {
            shared.connected.lock().unwrap()[side.index()] = connected;
        }
        if let DeviceEvent::Sensor(sensor) = &event {
            if let SensorReading::Pressure(data) = &sensor.reading {
                let combined = shared
                    .fuser
                    .lock()
                    .unwrap()
                    .feed(side, sensor.timestamp, data.clone());
                if let Some(combined) = combined {
                    shared.hub.emit(PairEvent::Pressure(combined));
                }
            }
        }
        shared.hub.emit(PairEvent::Device { side, event });
    }
    debug!("{side:?} forwarding task finished");
}

// ── Tests ─────────────────────────────────────────────────────────────────────
