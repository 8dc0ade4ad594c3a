//! Application-wide constants and compile-time configuration.
//!
//! The roster, GATT contract, scan timing and responder parameters live
//! here so they can be tuned in one place. Nothing is hot-reloadable.

use crate::ble::{DisconnectPolicy, Uuid16};
use crate::sensor::SensorKind;

// BLE

/// Maximum number of profiles (and therefore peripherals) in a roster.
pub const MAX_PROFILES: usize = 8;

/// Duration of a single BLE scan window (seconds).
pub const BLE_SCAN_DURATION_SECS: u32 = 3;

/// Scan interval (in 0.625 ms units). 0x50 = 50 ms.
pub const BLE_SCAN_INTERVAL: u16 = 0x50;

/// Scan window (in 0.625 ms units). 0x30 = 30 ms.
pub const BLE_SCAN_WINDOW: u16 = 0x30;

/// ATT MTU requested after every successful open.
///
/// The S140 SoftDevice caps ATT MTU at 247 bytes.
pub const BLE_ATT_MTU: u16 = 247;

/// Maximum advertised name length we match against (bytes).
pub const BLE_NAME_MAX_LEN: usize = 32;

/// Largest characteristic value we accept from a read.
pub const BLE_READ_MAX_LEN: usize = 20;

/// Primary service exposed by every sensor peripheral.
pub const SENSOR_SERVICE_UUID: Uuid16 = Uuid16(0x00FF);

/// Sensor value characteristic inside [`SENSOR_SERVICE_UUID`].
pub const SENSOR_CHAR_UUID: Uuid16 = Uuid16(0xFF01);

/// Give up on a connection attempt after this long (seconds).
pub const BLE_CONNECT_TIMEOUT_SECS: u32 = 5;

/// Pause inserted before a fallback rescan (milliseconds). 0 = rescan at once.
pub const BLE_RESCAN_BACKOFF_MS: u32 = 0;

/// Pause before retrying a scan the radio refused to start (milliseconds).
pub const BLE_SCAN_RETRY_MS: u32 = 1_000;

/// Disconnect classification used by the orchestrator.
pub const BLE_DISCONNECT_POLICY: DisconnectPolicy = DisconnectPolicy::Strict;

/// Static roster: advertised name and the sensor it carries.
///
/// Profile ids are the indices into this table.
pub const SENSOR_ROSTER: [(&str, SensorKind); 4] = [
    ("ESP32-TEST-0", SensorKind::MagneticField),
    ("ESP32-TEST-1", SensorKind::Photocell),
    ("ESP32-TEST-2", SensorKind::TempDetector),
    ("ESP32-TEST-3", SensorKind::IrDetector),
];

// Responder

/// UDP port the responder listens on.
pub const UDP_SERVER_PORT: u16 = 3333;

/// How long each serving window stays open (milliseconds).
pub const UDP_SERVE_PERIOD_MS: u32 = 10_000;

/// Per-receive timeout inside a serving window (milliseconds).
pub const UDP_RECV_TIMEOUT_MS: u32 = 300;

/// Every response is exactly this many bytes, zero padded.
pub const UDP_RESPONSE_LEN: usize = 32;

/// Consecutive socket errors after which a serving window is abandoned.
pub const UDP_MAX_SOCKET_FAILURES: u8 = 3;

// Network (USB CDC-NCM gadget)

/// Static IPv4 address of the hub on the USB Ethernet link.
pub const NET_IPV4_ADDR: [u8; 4] = [10, 42, 0, 2];

/// Prefix length of [`NET_IPV4_ADDR`].
pub const NET_IPV4_PREFIX: u8 = 24;

/// USB VID/PID - use the "pid.codes" open-source test VID.
/// Replace with your own allocated VID/PID for production.
pub const USB_VID: u16 = 0x1209;
pub const USB_PID: u16 = 0x0002;

/// USB device strings.
pub const USB_MANUFACTURER: &str = "ble-sensor-hub";
pub const USB_PRODUCT: &str = "BLE Sensor Hub";
pub const USB_SERIAL_NUMBER: &str = "000001";

/// Locally administered MAC the host side of the CDC-NCM link gets.
pub const NET_HOST_MAC: [u8; 6] = [0x02, 0x42, 0x00, 0x00, 0x00, 0x01];

/// Locally administered MAC of the hub's own interface.
pub const NET_DEVICE_MAC: [u8; 6] = [0x02, 0x42, 0x00, 0x00, 0x00, 0x02];
