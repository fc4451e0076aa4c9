//! Binary decoders for `sensorData` payloads and the encoder for
//! `setSensorDataConfigurations`.
//!
//! All decoding here is pure except for the per-device timestamp widener,
//! which carries the wraparound offset between calls.
//!
//! # Payload layout
//!
//! ```text
//! [timestamp: u16 LE]                      device-clock milliseconds, wraps
//! then repeated:
//!   [sensorType: u8][blockLen: u8][block]
//! ```
//!
//! Motion blocks are a run of `[motionDataType: u8][values]` entries where
//! `values` is three little-endian `i16`s for vectors or four for
//! quaternions. Pressure blocks are `[pressureDataType: u8][16 readings]`.
//!
//! | Quantity | Raw | Scale | Unit |
//! |---|---|---|---|
//! | acceleration / gravity / linear acceleration | `i16` LE | 1/8192 | g |
//! | rotation rate | `i16` LE | 1/16 | °/s |
//! | magnetometer | `i16` LE | 1/16 | µT |
//! | quaternion | `i16` LE ×4 (w,x,y,z) | 1/16384 | unit |
//! | pressure (single byte) | `u8` ×16 | 1/255 | of full scale |
//! | pressure (double byte) | `u16` LE ×16 | 1/4095 | of full scale |

use std::collections::BTreeMap;

use crate::error::ProtocolError;

// ── Scale factors ─────────────────────────────────────────────────────────────

const ACCELERATION_SCALE: f64 = 1.0 / 8192.0;
const ROTATION_SCALE: f64 = 1.0 / 16.0;
const MAGNETOMETER_SCALE: f64 = 1.0 / 16.0;
const QUATERNION_SCALE: f64 = 1.0 / 16384.0;
const PRESSURE_SINGLE_SCALE: f64 = 1.0 / 255.0;
const PRESSURE_DOUBLE_SCALE: f64 = 1.0 / 4095.0;

/// Number of pressure cells in one insole.
pub const PRESSURE_SENSOR_COUNT: usize = 16;

/// Per-cell positions in the unit square, for the **right** insole, with
/// `x` growing toward the outer edge and `y` from toe (0) to heel (1).
/// The left insole mirrors `x`.
///
/// Rows, toe to heel: 4 toe cells, 4 ball cells, 2 + 2 arch cells, 4 heel
/// cells.
pub const PRESSURE_POSITIONS: [(f64, f64); PRESSURE_SENSOR_COUNT] = [
    (0.84, 0.05),
    (0.61, 0.03),
    (0.38, 0.04),
    (0.16, 0.07),
    (0.82, 0.20),
    (0.60, 0.18),
    (0.38, 0.19),
    (0.17, 0.22),
    (0.78, 0.41),
    (0.55, 0.40),
    (0.75, 0.60),
    (0.52, 0.59),
    (0.70, 0.81),
    (0.48, 0.80),
    (0.68, 0.94),
    (0.47, 0.93),
];

// ── Identity types ────────────────────────────────────────────────────────────

/// Hardware flavor reported in the `getDeviceType` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    MotionModule,
    LeftInsole,
    RightInsole,
}

impl DeviceType {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(DeviceType::MotionModule),
            1 => Some(DeviceType::LeftInsole),
            2 => Some(DeviceType::RightInsole),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            DeviceType::MotionModule => 0,
            DeviceType::LeftInsole => 1,
            DeviceType::RightInsole => 2,
        }
    }

    pub fn is_insole(self) -> bool {
        !matches!(self, DeviceType::MotionModule)
    }
}

// ── Sensor taxonomy ───────────────────────────────────────────────────────────

/// Top-level sensor families, as they appear in payload block headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SensorKind {
    Motion,
    Pressure,
}

impl SensorKind {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(SensorKind::Motion),
            1 => Some(SensorKind::Pressure),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            SensorKind::Motion => 0,
            SensorKind::Pressure => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MotionDataKind {
    Acceleration,
    Gravity,
    LinearAcceleration,
    RotationRate,
    Magnetometer,
    Quaternion,
}

impl MotionDataKind {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(MotionDataKind::Acceleration),
            1 => Some(MotionDataKind::Gravity),
            2 => Some(MotionDataKind::LinearAcceleration),
            3 => Some(MotionDataKind::RotationRate),
            4 => Some(MotionDataKind::Magnetometer),
            5 => Some(MotionDataKind::Quaternion),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            MotionDataKind::Acceleration => 0,
            MotionDataKind::Gravity => 1,
            MotionDataKind::LinearAcceleration => 2,
            MotionDataKind::RotationRate => 3,
            MotionDataKind::Magnetometer => 4,
            MotionDataKind::Quaternion => 5,
        }
    }

    /// Payload bytes following the data-type byte.
    fn value_len(self) -> usize {
        match self {
            MotionDataKind::Quaternion => 8,
            _ => 6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PressureDataKind {
    /// 16 × `u8`, coarse but cheap on the radio.
    SingleByte,
    /// 16 × `u16` LE.
    DoubleByte,
}

impl PressureDataKind {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(PressureDataKind::SingleByte),
            1 => Some(PressureDataKind::DoubleByte),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            PressureDataKind::SingleByte => 0,
            PressureDataKind::DoubleByte => 1,
        }
    }

    fn value_len(self) -> usize {
        match self {
            PressureDataKind::SingleByte => PRESSURE_SENSOR_COUNT,
            PressureDataKind::DoubleByte => PRESSURE_SENSOR_COUNT * 2,
        }
    }
}

/// One configurable data stream: a motion quantity or a pressure encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SensorDataType {
    Motion(MotionDataKind),
    Pressure(PressureDataKind),
}

impl SensorDataType {
    pub fn sensor_kind(self) -> SensorKind {
        match self {
            SensorDataType::Motion(_) => SensorKind::Motion,
            SensorDataType::Pressure(_) => SensorKind::Pressure,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            SensorDataType::Motion(k) => k.code(),
            SensorDataType::Pressure(k) => k.code(),
        }
    }
}

// ── Value types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vector2 {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quaternion {
    pub w: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// One pressure cell: its position in the device-local unit square (already
/// mirrored for left insoles) and its reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PressureSensorValue {
    pub position: Vector2,
    pub raw: u16,
    /// Reading scaled into `0.0..=1.0` of full scale.
    pub scaled: f64,
}

/// A decoded pressure frame for one device.
#[derive(Debug, Clone, PartialEq)]
pub struct PressureData {
    pub sensors: Vec<PressureSensorValue>,
    /// Sum of the scaled readings.
    pub scaled_sum: f64,
    /// Weighted centroid of the cell positions, or `None` when every cell
    /// reads zero (no division by zero, no fake origin).
    pub center: Option<Vector2>,
}

impl PressureData {
    pub(crate) fn from_sensors(sensors: Vec<PressureSensorValue>) -> Self {
        let scaled_sum: f64 = sensors.iter().map(|s| s.scaled).sum();
        let center = if scaled_sum > 0.0 {
            let mut c = Vector2::default();
            for s in &sensors {
                let weight = s.scaled / scaled_sum;
                c.x += s.position.x * weight;
                c.y += s.position.y * weight;
            }
            Some(c)
        } else {
            None
        };
        Self {
            sensors,
            scaled_sum,
            center,
        }
    }
}

/// A decoded physical reading.
#[derive(Debug, Clone, PartialEq)]
pub enum SensorReading {
    Acceleration(Vector3),
    Gravity(Vector3),
    LinearAcceleration(Vector3),
    RotationRate(Vector3),
    Magnetometer(Vector3),
    Quaternion(Quaternion),
    Pressure(PressureData),
}

impl SensorReading {
    pub fn sensor_kind(&self) -> SensorKind {
        match self {
            SensorReading::Pressure(_) => SensorKind::Pressure,
            _ => SensorKind::Motion,
        }
    }
}

/// One decoded sample: which sensor, when (device clock, widened
/// milliseconds), and the physical value.
///
/// The timestamp is device-clock relative — useful for same-device ordering
/// and cross-device alignment inside a pair, never for wall-clock math.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorEvent {
    pub timestamp: u64,
    pub reading: SensorReading,
}

// ── Timestamp widening ────────────────────────────────────────────────────────

/// Widens the wire's `u16` millisecond clock into a monotone `u64`.
///
/// The device clock wraps every 65.536 s; a raw value smaller than its
/// predecessor means one wrap elapsed. Payloads arrive in order per device,
/// so single-wrap detection is sufficient.
#[derive(Debug, Default)]
pub struct TimestampWidener {
    last_raw: Option<u16>,
    offset: u64,
}

impl TimestampWidener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn widen(&mut self, raw: u16) -> u64 {
        if let Some(last) = self.last_raw {
            if raw < last {
                self.offset += u64::from(u16::MAX) + 1;
            }
        }
        self.last_raw = Some(raw);
        self.offset + u64::from(raw)
    }

    /// Forget the anchor, e.g. across a reconnect where the device clock
    /// restarted.
    pub fn reset(&mut self) {
        self.last_raw = None;
        self.offset = 0;
    }
}

// ── Decoder ───────────────────────────────────────────────────────────────────

fn read_i16_le(data: &[u8], offset: usize) -> i16 {
    i16::from_le_bytes([data[offset], data[offset + 1]])
}

fn read_vector3(data: &[u8], scale: f64) -> Vector3 {
    Vector3 {
        x: f64::from(read_i16_le(data, 0)) * scale,
        y: f64::from(read_i16_le(data, 2)) * scale,
        z: f64::from(read_i16_le(data, 4)) * scale,
    }
}

fn malformed(declared: usize, remaining: usize) -> ProtocolError {
    ProtocolError::MalformedMessage {
        declared,
        remaining,
    }
}

/// Stateful decoder for one device's `sensorData` payloads. Holds only the
/// timestamp widener; everything else is recomputed per payload.
#[derive(Debug, Default)]
pub struct SensorDataDecoder {
    timestamps: TimestampWidener,
}

impl SensorDataDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget timestamp state (call on reconnect).
    pub fn reset(&mut self) {
        self.timestamps.reset();
    }

    /// Decode one payload into the sensor events it carries, in payload
    /// order. `device_type` selects pressure-cell mirroring for left
    /// insoles; `None` is treated as un-mirrored.
    pub fn decode(
        &mut self,
        device_type: Option<DeviceType>,
        payload: &[u8],
    ) -> Result<Vec<SensorEvent>, ProtocolError> {
        if payload.len() < 2 {
            return Err(malformed(2, payload.len()));
        }
        let raw_ts = u16::from_le_bytes([payload[0], payload[1]]);
        let timestamp = self.timestamps.widen(raw_ts);
        let mirror = device_type == Some(DeviceType::LeftInsole);

        let mut events = Vec::new();
        let mut pos = 2;
        while pos < payload.len() {
            if pos + 2 > payload.len() {
                return Err(malformed(2, payload.len() - pos));
            }
            let kind_code = payload[pos];
            let block_len = payload[pos + 1] as usize;
            let block_start = pos + 2;
            if block_start + block_len > payload.len() {
                return Err(malformed(block_len, payload.len() - block_start));
            }
            let block = &payload[block_start..block_start + block_len];
            let kind = SensorKind::from_code(kind_code)
                .ok_or_else(|| ProtocolError::UnknownMessageType(format!("sensor type {kind_code}")))?;
            match kind {
                SensorKind::Motion => decode_motion_block(block, timestamp, &mut events)?,
                SensorKind::Pressure => decode_pressure_block(block, timestamp, mirror, &mut events)?,
            }
            pos = block_start + block_len;
        }
        Ok(events)
    }
}

fn decode_motion_block(
    block: &[u8],
    timestamp: u64,
    events: &mut Vec<SensorEvent>,
) -> Result<(), ProtocolError> {
    let mut pos = 0;
    while pos < block.len() {
        let code = block[pos];
        let kind = MotionDataKind::from_code(code)
            .ok_or_else(|| ProtocolError::UnknownMessageType(format!("motion data type {code}")))?;
        let len = kind.value_len();
        let start = pos + 1;
        if start + len > block.len() {
            return Err(malformed(len, block.len() - start));
        }
        let values = &block[start..start + len];
        let reading = match kind {
            MotionDataKind::Acceleration => {
                SensorReading::Acceleration(read_vector3(values, ACCELERATION_SCALE))
            }
            MotionDataKind::Gravity => {
                SensorReading::Gravity(read_vector3(values, ACCELERATION_SCALE))
            }
            MotionDataKind::LinearAcceleration => {
                SensorReading::LinearAcceleration(read_vector3(values, ACCELERATION_SCALE))
            }
            MotionDataKind::RotationRate => {
                SensorReading::RotationRate(read_vector3(values, ROTATION_SCALE))
            }
            MotionDataKind::Magnetometer => {
                SensorReading::Magnetometer(read_vector3(values, MAGNETOMETER_SCALE))
            }
            MotionDataKind::Quaternion => SensorReading::Quaternion(Quaternion {
                w: f64::from(read_i16_le(values, 0)) * QUATERNION_SCALE,
                x: f64::from(read_i16_le(values, 2)) * QUATERNION_SCALE,
                y: f64::from(read_i16_le(values, 4)) * QUATERNION_SCALE,
                z: f64::from(read_i16_le(values, 6)) * QUATERNION_SCALE,
            }),
        };
        events.push(SensorEvent { timestamp, reading });
        pos = start + len;
    }
    Ok(())
}

fn decode_pressure_block(
    block: &[u8],
    timestamp: u64,
    mirror: bool,
    events: &mut Vec<SensorEvent>,
) -> Result<(), ProtocolError> {
    if block.is_empty() {
        return Err(malformed(1, 0));
    }
    let code = block[0];
    let kind = PressureDataKind::from_code(code)
        .ok_or_else(|| ProtocolError::UnknownMessageType(format!("pressure data type {code}")))?;
    let values = &block[1..];
    if values.len() < kind.value_len() {
        return Err(malformed(kind.value_len(), values.len()));
    }

    let mut sensors = Vec::with_capacity(PRESSURE_SENSOR_COUNT);
    for i in 0..PRESSURE_SENSOR_COUNT {
        let (raw, scaled) = match kind {
            PressureDataKind::SingleByte => {
                let raw = u16::from(values[i]);
                (raw, f64::from(raw) * PRESSURE_SINGLE_SCALE)
            }
            PressureDataKind::DoubleByte => {
                let raw = u16::from_le_bytes([values[i * 2], values[i * 2 + 1]]);
                (raw, f64::from(raw) * PRESSURE_DOUBLE_SCALE)
            }
        };
        let (px, py) = PRESSURE_POSITIONS[i];
        let position = Vector2 {
            x: if mirror { 1.0 - px } else { px },
            y: py,
        };
        sensors.push(PressureSensorValue {
            position,
            raw,
            scaled,
        });
    }
    events.push(SensorEvent {
        timestamp,
        reading: SensorReading::Pressure(PressureData::from_sensors(sensors)),
    });
    Ok(())
}

// ── Configuration encoding ────────────────────────────────────────────────────

/// Encode a `setSensorDataConfigurations` payload from `(stream, rate ms)`
/// pairs. A rate of `0` disables the stream. Entries are grouped by sensor
/// family:
///
/// ```text
/// [sensorType: u8][count: u8]([dataType: u8][rate: u16 LE]) × count   …
/// ```
pub fn encode_sensor_configuration(entries: &[(SensorDataType, u16)]) -> Vec<u8> {
    let mut grouped: BTreeMap<SensorKind, Vec<(u8, u16)>> = BTreeMap::new();
    for &(data_type, rate) in entries {
        grouped
            .entry(data_type.sensor_kind())
            .or_default()
            .push((data_type.code(), rate));
    }

    let mut out = Vec::new();
    for (kind, streams) in grouped {
        out.push(kind.code());
        out.push(streams.len() as u8);
        for (code, rate) in streams {
            out.push(code);
            out.extend_from_slice(&rate.to_le_bytes());
        }
    }
    out
}

/// Decode a sensor-configuration payload (the `getSensorDataConfigurations`
/// reply uses the same layout as the set request).
pub fn decode_sensor_configuration(
    payload: &[u8],
) -> Result<Vec<(SensorDataType, u16)>, ProtocolError> {
    let mut entries = Vec::new();
    let mut pos = 0;
    while pos < payload.len() {
        if pos + 2 > payload.len() {
            return Err(malformed(2, payload.len() - pos));
        }
        let kind = SensorKind::from_code(payload[pos]).ok_or_else(|| {
            ProtocolError::UnknownMessageType(format!("sensor type {}", payload[pos]))
        })?;
        let count = payload[pos + 1] as usize;
        pos += 2;
        for _ in 0..count {
            if pos + 3 > payload.len() {
                return Err(malformed(3, payload.len() - pos));
            }
            let code = payload[pos];
            let rate = u16::from_le_bytes([payload[pos + 1], payload[pos + 2]]);
            let data_type = match kind {
                SensorKind::Motion => MotionDataKind::from_code(code).map(SensorDataType::Motion),
                SensorKind::Pressure => {
                    PressureDataKind::from_code(code).map(SensorDataType::Pressure)
                }
            }
            .ok_or_else(|| {
                ProtocolError::UnknownMessageType(format!("data type {code} for {kind:?}"))
            })?;
            entries.push((data_type, rate));
            pos += 3;
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn motion_payload(ts: u16) -> Vec<u8> {
        // One motion block holding a quaternion of (1, 0, 0, 0).
        let mut p = ts.to_le_bytes().to_vec();
        p.push(SensorKind::Motion.code());
        p.push(9); // 1 type byte + 8 value bytes
        p.push(MotionDataKind::Quaternion.code());
        p.extend_from_slice(&16384i16.to_le_bytes());
        p.extend_from_slice(&0i16.to_le_bytes());
        p.extend_from_slice(&0i16.to_le_bytes());
        p.extend_from_slice(&0i16.to_le_bytes());
        p
    }

    #[test]
    fn decodes_quaternion_with_scale() {
        let mut decoder = SensorDataDecoder::new();
        let events = decoder
            .decode(Some(DeviceType::MotionModule), &motion_payload(100))
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].timestamp, 100);
        match &events[0].reading {
            SensorReading::Quaternion(q) => {
                assert!((q.w - 1.0).abs() < 1e-9);
                assert_eq!(q.x, 0.0);
            }
            other => panic!("expected quaternion, got {other:?}"),
        }
    }

    #[test]
    fn timestamps_widen_across_wraparound() {
        let mut w = TimestampWidener::new();
        assert_eq!(w.widen(65000), 65000);
        assert_eq!(w.widen(200), 65536 + 200);
        assert_eq!(w.widen(300), 65536 + 300);
    }

    #[test]
    fn pressure_single_byte_scales_and_centers() {
        let mut decoder = SensorDataDecoder::new();
        let mut payload = 0u16.to_le_bytes().to_vec();
        payload.push(SensorKind::Pressure.code());
        payload.push(1 + 16);
        payload.push(PressureDataKind::SingleByte.code());
        let mut cells = [0u8; 16];
        cells[0] = 255; // all weight on the first toe cell
        payload.extend_from_slice(&cells);

        let events = decoder
            .decode(Some(DeviceType::RightInsole), &payload)
            .unwrap();
        match &events[0].reading {
            SensorReading::Pressure(p) => {
                assert!((p.scaled_sum - 1.0).abs() < 1e-9);
                let c = p.center.expect("center for nonzero pressure");
                assert!((c.x - PRESSURE_POSITIONS[0].0).abs() < 1e-9);
                assert!((c.y - PRESSURE_POSITIONS[0].1).abs() < 1e-9);
            }
            other => panic!("expected pressure, got {other:?}"),
        }
    }

    #[test]
    fn zero_pressure_has_no_center() {
        let mut decoder = SensorDataDecoder::new();
        let mut payload = 0u16.to_le_bytes().to_vec();
        payload.push(SensorKind::Pressure.code());
        payload.push(1 + 16);
        payload.push(PressureDataKind::SingleByte.code());
        payload.extend_from_slice(&[0u8; 16]);
        let events = decoder.decode(None, &payload).unwrap();
        match &events[0].reading {
            SensorReading::Pressure(p) => {
                assert_eq!(p.scaled_sum, 0.0);
                assert_eq!(p.center, None);
            }
            other => panic!("expected pressure, got {other:?}"),
        }
    }

    #[test]
    fn left_insole_mirrors_cell_positions() {
        let mut payload = 0u16.to_le_bytes().to_vec();
        payload.push(SensorKind::Pressure.code());
        payload.push(1 + 16);
        payload.push(PressureDataKind::SingleByte.code());
        payload.extend_from_slice(&[1u8; 16]);

        let mut left = SensorDataDecoder::new();
        let mut right = SensorDataDecoder::new();
        let left_events = left.decode(Some(DeviceType::LeftInsole), &payload).unwrap();
        let right_events = right
            .decode(Some(DeviceType::RightInsole), &payload)
            .unwrap();
        let (l, r) = match (&left_events[0].reading, &right_events[0].reading) {
            (SensorReading::Pressure(l), SensorReading::Pressure(r)) => (l, r),
            _ => panic!("expected pressure on both"),
        };
        for (ls, rs) in l.sensors.iter().zip(&r.sensors) {
            assert!((ls.position.x - (1.0 - rs.position.x)).abs() < 1e-9);
            assert_eq!(ls.position.y, rs.position.y);
        }
    }

    #[test]
    fn truncated_block_is_malformed() {
        let mut decoder = SensorDataDecoder::new();
        let payload = [0u8, 0, /* motion */ 0, /* claims 9 bytes */ 9, 5];
        assert!(matches!(
            decoder.decode(None, &payload),
            Err(ProtocolError::MalformedMessage { .. })
        ));
    }

    #[test]
    fn configuration_round_trip() {
        let entries = vec![
            (SensorDataType::Motion(MotionDataKind::Quaternion), 20),
            (SensorDataType::Motion(MotionDataKind::Acceleration), 40),
            (SensorDataType::Pressure(PressureDataKind::DoubleByte), 60),
        ];
        let payload = encode_sensor_configuration(&entries);
        // Motion group: header (2) + 2 entries × 3; pressure group: 2 + 3.
        assert_eq!(payload.len(), 2 + 6 + 2 + 3);
        let mut decoded = decode_sensor_configuration(&payload).unwrap();
        decoded.sort();
        let mut expected = entries;
        expected.sort();
        assert_eq!(decoded, expected);
    }
}
