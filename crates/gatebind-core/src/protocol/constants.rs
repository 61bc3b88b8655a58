//! Protocol constants for the gateway provisioning service.
//!
//! Command codes are not listed here: they differ between firmware
//! revisions and live in [`super::commands::CommandSet`].

use uuid::Uuid;

// ============================================================================
// Advertisement
// ============================================================================

/// Vendor service-data UUID carried in advertisements (16-bit 0xFDCD).
pub const ADVERTISEMENT_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000FDCD_0000_1000_8000_00805F9B34FB);

/// Minimum service-data length for a candidate advertisement.
pub const MIN_SERVICE_DATA_LEN: usize = 8;

/// Frame-control bit set when the device is already bound.
pub const FRAME_CONTROL_BOUND: u8 = 0b1000_0000;

/// Length of a MAC address.
pub const MAC_LEN: usize = 6;

/// Marker byte opening the battery event block (`[marker][len][battery]`).
pub const BATTERY_EVENT_MARKER: u8 = 0x02;

/// Battery level reported when the advertisement has no battery block.
pub const DEFAULT_BATTERY_PERCENT: u8 = 100;

// ============================================================================
// Products
// ============================================================================

/// Sparrow gateway product id.
pub const PRODUCT_GATEWAY_SPARROW: u8 = 0x0D;

/// Pheasant S9118 product id.
pub const PRODUCT_PHEASANT_S9118: u8 = 0x5C;

// ============================================================================
// GATT profile defaults
// ============================================================================

/// Shared GATT service of both characteristic pairs.
pub const DEVICE_SERVICE_UUID: Uuid = Uuid::from_u128(0x22210000_554A_4546_5542_46534450464D);

/// Base pair, write side (token, MQTT).
pub const BASE_WRITE_UUID: Uuid = Uuid::from_u128(0x00000001_0000_1000_8000_00805F9B34FB);

/// Base pair, notify side.
pub const BASE_NOTIFY_UUID: Uuid = Uuid::from_u128(0x00000002_0000_1000_8000_00805F9B34FB);

/// Gateway pair, write side (Wi-Fi list / set).
pub const DEVICE_WRITE_UUID: Uuid = Uuid::from_u128(0x00000015_0000_1000_8000_00805F9B34FB);

/// Gateway pair, notify side.
pub const DEVICE_NOTIFY_UUID: Uuid = Uuid::from_u128(0x00000016_0000_1000_8000_00805F9B34FB);

// ============================================================================
// Framing
// ============================================================================

/// Maximum bytes per characteristic write on the reference link.
pub const MAX_WRITE_LEN: usize = 20;

/// Bytes of envelope in an outbound frame (`[length][command]`).
pub const FRAME_HEADER_LEN: usize = 2;

/// Largest payload whose length still fits the one-byte length field.
pub const MAX_PAYLOAD_LEN: usize = u8::MAX as usize - 1;

/// Fragment header length (`[total][index]`).
pub const FRAGMENT_HEADER_LEN: usize = 2;

/// Exec-result status byte meaning success.
pub const STATUS_OK: u8 = 0x00;

/// Session token length.
pub const TOKEN_LEN: usize = 16;

// ============================================================================
// Timing (milliseconds)
// ============================================================================

pub const DEFAULT_SCAN_TIMEOUT_MS: u64 = 20_000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 20_000;
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 20_000;
pub const WIFI_LIST_TIMEOUT_MS: u64 = 40_000;
pub const SET_WIFI_TIMEOUT_MS: u64 = 60_000;
pub const MQTT_TIMEOUT_MS: u64 = 30_000;

/// Settle delay before a fire-and-forget write reports success.
pub const NO_RESPONSE_DELAY_MS: u64 = 100;

/// Discovery reporting interval hint.
pub const DISCOVERY_INTERVAL_MS: u64 = 500;
