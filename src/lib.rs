//! # solekit
//!
//! Async Rust SDK for wearable motion/pressure sensor modules and smart
//! insoles, streamed over Bluetooth Low Energy or UDP.
//!
//! ## Supported hardware
//!
//! | Device type | Motion | Pressure | Notes |
//! |---|---|---|---|
//! | Motion module | ✓ | ✗ | clip-on 9-DoF IMU |
//! | Left insole | ✓ | ✓ (16 cells) | pressure grid mirrored in firmware coordinates |
//! | Right insole | ✓ | ✓ (16 cells) | |
//!
//! A left/right insole pair can be driven as one logical unit through
//! [`pair::DevicePair`], which fuses both pressure grids into a single
//! center-of-pressure metric with on-line range calibration.
//!
//! ## Quick start
//!
//! ```no_run
//! use solekit::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = BleScannerBackend::new(BleScanConfig::default());
//!     let mut scanner = Scanner::new(
//!         Box::new(backend),
//!         Arc::new(MessageRegistry::default()),
//!         ScannerConfig::default(),
//!     );
//!     let mut discoveries = scanner.events();
//!     scanner.start_scan().await?;
//!
//!     while let Some(event) = discoveries.recv().await {
//!         if let ScannerEvent::Discovered(found) = event {
//!             let device = scanner.connect_to_device(&found.id).await?;
//!             let mut events = device.events();
//!             device
//!                 .set_sensor_configuration(&[(
//!                     SensorDataType::Pressure(PressureDataKind::DoubleByte),
//!                     40,
//!                 )])
//!                 .await?;
//!             while let Some(event) = events.recv().await {
//!                 if let DeviceEvent::Sensor(reading) = event {
//!                     println!("{reading:?}");
//!                 }
//!             }
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the most commonly needed types |
//! | [`registry`] | The append-only message-type table shared by both directions |
//! | [`message`] | Frame encode/decode and MTU-aware chunking |
//! | [`connection`] | The [`connection::Transport`] seam and the per-device state machine |
//! | [`scanner`] | Discovery sessions with sighting expiry |
//! | [`device`] | One device: driver task, typed events, request API |
//! | [`pair`] | Left/right pairing and pressure fusion |
//! | [`sensor_data`] | Payload decoders for motion and pressure streams |
//! | [`haptics`] | Vibration command validation and encoding |
//! | [`events`] | The pub/sub hub every stateful component composes |
//! | [`ble`] / [`udp`] | The two bundled transport adapters |

pub mod ble;
pub mod connection;
pub mod device;
pub mod error;
pub mod events;
pub mod haptics;
pub mod message;
pub mod pair;
pub mod registry;
pub mod scanner;
pub mod sensor_data;
pub mod udp;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
///
/// A single glob import covers scanning, connecting, configuring sensor
/// streams, and consuming decoded events.
pub mod prelude {
    // ── Discovery and connection ──────────────────────────────────────────────
    pub use crate::ble::{BleScanConfig, BleScannerBackend, BleTransport};
    pub use crate::connection::{ConnectionConfig, ConnectionStatus, Transport};
    pub use crate::scanner::{
        Advertisement, DiscoveredDevice, Scanner, ScannerBackend, ScannerConfig, ScannerEvent,
    };
    pub use crate::udp::UdpTransport;

    // ── Devices and pairs ─────────────────────────────────────────────────────
    pub use crate::device::{Device, DeviceConfig, DeviceEvent};
    pub use crate::pair::{DevicePair, PairEvent, PairPressure, Side};

    // ── Protocol ──────────────────────────────────────────────────────────────
    pub use crate::error::{DeviceError, HapticError, ProtocolError, StateError, TransportError};
    pub use crate::message::TxMessage;
    pub use crate::registry::MessageRegistry;

    // ── Sensor data ───────────────────────────────────────────────────────────
    pub use crate::sensor_data::{
        DeviceType, MotionDataKind, PressureData, PressureDataKind, SensorDataType, SensorEvent,
        SensorReading,
    };

    // ── Haptics ───────────────────────────────────────────────────────────────
    pub use crate::haptics::{
        VibrationCommand, VibrationLocation, VibrationRequest, VibrationSegment, WaveformSegment,
    };
}
