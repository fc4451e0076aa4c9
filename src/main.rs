use std::io::{self, BufRead};
use std::sync::Arc;

use anyhow::Result;
use log::{error, info};

use solekit::ble::{BleScanConfig, BleScannerBackend};
use solekit::device::DeviceEvent;
use solekit::haptics::{VibrationCommand, VibrationLocation, VibrationRequest, VibrationSegment};
use solekit::registry::MessageRegistry;
use solekit::scanner::{Scanner, ScannerConfig, ScannerEvent};
use solekit::sensor_data::{MotionDataKind, PressureDataKind, SensorDataType, SensorReading};

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // Set RUST_LOG=debug for verbose output, e.g.:
    //   RUST_LOG=solekit=debug cargo run
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // ── Scan ──────────────────────────────────────────────────────────────────
    let backend = BleScannerBackend::new(BleScanConfig::default());
    let mut scanner = Scanner::new(
        Box::new(backend),
        Arc::new(MessageRegistry::default()),
        ScannerConfig::default(),
    );
    let mut discoveries = scanner.events();
    info!("Scanning for devices …");
    scanner.start_scan().await?;

    let found = loop {
        match discoveries.recv().await {
            Some(ScannerEvent::Discovered(found)) => break found,
            Some(_) => continue,
            None => anyhow::bail!("scanner closed before finding a device"),
        }
    };
    info!("Found {} ({} dBm) — connecting …", found.name, found.rssi);

    // ── Connect ───────────────────────────────────────────────────────────────
    let device = Arc::new(scanner.connect_to_device(&found.id).await?);
    scanner.stop_scan().await.ok();
    let mut events = device.events();
    device.wait_until_connected().await;

    info!("Connected. Press Ctrl-C or type 'q' + Enter to quit.\n");
    info!("Commands (type + Enter):");
    info!("  q  – quit");
    info!("  v  – trigger a vibration pulse");
    info!("  m  – stream motion data (acceleration @ 20 ms)");
    info!("  p  – stream pressure data (16 cells @ 40 ms)");
    info!("  s  – stop all sensor streams");
    info!("  i  – request device info\n");

    // ── Stdin command loop ────────────────────────────────────────────────────
    // We read lines on a dedicated OS thread (to avoid holding a non-Send
    // StdinLock across await points), then relay them to an async task.
    let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel::<String>();

    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(l) => {
                    if line_tx.send(l.trim().to_owned()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    // Process lines in an async task so we can await device methods.
    let device_cmd = Arc::clone(&device);
    tokio::spawn(async move {
        while let Some(line) = line_rx.recv().await {
            match line.as_str() {
                "" => continue,
                "q" => {
                    info!("Quit requested.");
                    device_cmd.disconnect().await.ok();
                    std::process::exit(0);
                }
                "v" => {
                    info!("Vibrating …");
                    let command = VibrationCommand {
                        locations: vec![VibrationLocation::Front, VibrationLocation::Rear],
                        request: VibrationRequest::EffectSequence {
                            segments: vec![VibrationSegment::effect("strongClick100")],
                            sequence_loop_count: 0,
                        },
                    };
                    if let Err(e) = device_cmd.trigger_vibration(&[command]).await {
                        error!("Vibration error: {e}");
                    }
                }
                "m" => {
                    info!("Enabling acceleration stream …");
                    let config = [(SensorDataType::Motion(MotionDataKind::Acceleration), 20)];
                    if let Err(e) = device_cmd.set_sensor_configuration(&config).await {
                        error!("Configuration error: {e}");
                    }
                }
                "p" => {
                    info!("Enabling pressure stream …");
                    let config = [(SensorDataType::Pressure(PressureDataKind::DoubleByte), 40)];
                    if let Err(e) = device_cmd.set_sensor_configuration(&config).await {
                        error!("Configuration error: {e}");
                    }
                }
                "s" => {
                    info!("Disabling all sensor streams …");
                    let config = [
                        (SensorDataType::Motion(MotionDataKind::Acceleration), 0),
                        (SensorDataType::Motion(MotionDataKind::RotationRate), 0),
                        (SensorDataType::Motion(MotionDataKind::Quaternion), 0),
                        (SensorDataType::Pressure(PressureDataKind::SingleByte), 0),
                        (SensorDataType::Pressure(PressureDataKind::DoubleByte), 0),
                    ];
                    if let Err(e) = device_cmd.set_sensor_configuration(&config).await {
                        error!("Configuration error: {e}");
                    }
                }
                "i" => {
                    info!("Requesting device info …");
                    if let Err(e) = device_cmd.request_device_information().await {
                        error!("Device info error: {e}");
                    }
                }
                other => info!("Unknown command '{other}'"),
            }
        }
    });

    // ── Main event loop ───────────────────────────────────────────────────────
    while let Some(event) = events.recv().await {
        match event {
            DeviceEvent::Connected(true) => info!("✅  Connected"),
            DeviceEvent::Connected(false) => {
                info!("❌  Disconnected from device.");
                break;
            }
            DeviceEvent::ConnectionStatus(_) => {}

            DeviceEvent::BatteryLevel(level) => println!("[BATTERY] {level}%"),
            DeviceEvent::Name(name) => println!("[NAME] {name}"),
            DeviceEvent::DeviceType(device_type) => println!("[TYPE] {device_type:?}"),
            DeviceEvent::FirmwareVersion(version) => println!("[FIRMWARE] {version}"),
            DeviceEvent::SensorConfiguration(entries) => {
                println!("[CONFIG] {entries:?}");
            }

            DeviceEvent::Sensor(sensor) => match sensor.reading {
                SensorReading::Acceleration(v) => println!(
                    "[ACCEL] ts={:6}  x={:+.3}g  y={:+.3}g  z={:+.3}g",
                    sensor.timestamp, v.x, v.y, v.z
                ),
                SensorReading::RotationRate(v) => println!(
                    "[GYRO]  ts={:6}  x={:+.2}°/s  y={:+.2}°/s  z={:+.2}°/s",
                    sensor.timestamp, v.x, v.y, v.z
                ),
                SensorReading::Quaternion(q) => println!(
                    "[QUAT]  ts={:6}  w={:+.4} x={:+.4} y={:+.4} z={:+.4}",
                    sensor.timestamp, q.w, q.x, q.y, q.z
                ),
                SensorReading::Pressure(p) => {
                    let center = p
                        .center
                        .map(|c| format!("({:.2}, {:.2})", c.x, c.y))
                        .unwrap_or_else(|| "—".into());
                    println!(
                        "[PRESSURE] ts={:6}  sum={:.3}  center={center}",
                        sensor.timestamp, p.scaled_sum
                    );
                }
                other => println!("[SENSOR] ts={}  {other:?}", sensor.timestamp),
            },

            DeviceEvent::Message(packet) => {
                println!("[RAW] {} ({} bytes)", packet.name, packet.payload.len());
            }
        }
    }

    info!("Event loop finished – exiting.");
    Ok(())
}
