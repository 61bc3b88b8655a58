//! Advertisement filtering and parsing.
//!
//! Vendor service data layout:
//!
//! ```text
//! [0]     frame control (bit 7: already bound)
//! [1]     product id
//! [2..8]  MAC address, least significant byte first
//! [8..]   optional event blocks; `02 <len> <battery%>` carries the battery
//! ```

use std::fmt;
use std::io::{Cursor, Read};
use std::str::FromStr;

use byteorder::ReadBytesExt;
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::constants::*;
use crate::protocol::frame::to_hex;
use crate::radio::{ChannelId, RawAdvertisement};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MacParseError {
    #[error("Invalid MAC address: {0}")]
    Invalid(String),
}

/// 48-bit device address in canonical (most significant first) order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; MAC_LEN]);

impl MacAddress {
    pub const fn new(bytes: [u8; MAC_LEN]) -> Self {
        Self(bytes)
    }

    /// Build from the little-endian byte order used on the air.
    pub fn from_reversed(bytes: [u8; MAC_LEN]) -> Self {
        let mut canonical = bytes;
        canonical.reverse();
        Self(canonical)
    }

    pub fn bytes(&self) -> [u8; MAC_LEN] {
        self.0
    }

    /// Bytes in on-air order.
    pub fn reversed(&self) -> [u8; MAC_LEN] {
        let mut bytes = self.0;
        bytes.reverse();
        bytes
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl FromStr for MacAddress {
    type Err = MacParseError;

    /// Accepts `AA:BB:CC:DD:EE:FF`, `aa-bb-...` or bare hex.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex: String = s.chars().filter(|c| !matches!(c, ':' | '-')).collect();
        if hex.len() != MAC_LEN * 2 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(MacParseError::Invalid(s.to_string()));
        }
        let mut bytes = [0u8; MAC_LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| MacParseError::Invalid(s.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

/// A gateway seen during discovery.
///
/// Immutable; a later sighting of the same MAC produces a new record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub channel: ChannelId,
    pub name: String,
    pub mac: MacAddress,
    pub product_id: u8,
    pub is_bound: bool,
    pub rssi: i16,
    pub battery_percent: u8,
    /// Vendor service data as advertised.
    pub raw_advertisement: Vec<u8>,
}

impl DeviceRecord {
    /// Service data as upper-case hex.
    pub fn broadcast_hex(&self) -> String {
        to_hex(&self.raw_advertisement)
    }
}

/// Vendor service data of a record, if present.
fn vendor_data<'a>(adv: &'a RawAdvertisement, vendor_uuid: &Uuid) -> Option<&'a [u8]> {
    adv.service_data.get(vendor_uuid).map(Vec::as_slice)
}

/// Whether a raw record looks like a provisionable gateway.
pub fn is_candidate(adv: &RawAdvertisement, vendor_uuid: &Uuid) -> bool {
    adv.connectable
        && adv.display_name().is_some()
        && vendor_data(adv, vendor_uuid).is_some_and(|d| d.len() >= MIN_SERVICE_DATA_LEN)
}

/// Battery level from the event blocks following the MAC.
fn battery_percent(tail: &[u8]) -> u8 {
    match tail {
        [BATTERY_EVENT_MARKER, _, battery, ..] => *battery,
        _ => DEFAULT_BATTERY_PERCENT,
    }
}

/// Filter and decode one raw record.
///
/// Returns `None` for anything that is not a candidate, including records
/// without a radio channel.
pub fn parse(adv: &RawAdvertisement, vendor_uuid: &Uuid) -> Option<DeviceRecord> {
    if !is_candidate(adv, vendor_uuid) {
        return None;
    }
    let data = vendor_data(adv, vendor_uuid)?;
    let channel = adv.channel.clone()?;

    let mut cursor = Cursor::new(data);
    let frame_control = cursor.read_u8().ok()?;
    let product_id = cursor.read_u8().ok()?;
    let mut mac = [0u8; MAC_LEN];
    cursor.read_exact(&mut mac).ok()?;
    let tail = &data[cursor.position() as usize..];

    Some(DeviceRecord {
        channel,
        name: adv.display_name().unwrap_or_default().to_string(),
        mac: MacAddress::from_reversed(mac),
        product_id,
        is_bound: frame_control & FRAME_CONTROL_BOUND != 0,
        rssi: adv.rssi,
        battery_percent: battery_percent(tail),
        raw_advertisement: data.to_vec(),
    })
}

/// Build vendor service data as a gateway advertises it.
pub fn encode_service_data(
    frame_control: u8,
    product_id: u8,
    mac: &MacAddress,
    battery: Option<u8>,
) -> Vec<u8> {
    let mut data = Vec::with_capacity(MIN_SERVICE_DATA_LEN + 3);
    data.push(frame_control);
    data.push(product_id);
    data.extend_from_slice(&mac.reversed());
    if let Some(battery) = battery {
        data.extend_from_slice(&[BATTERY_EVENT_MARKER, 0x01, battery]);
    }
    data
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn record(data: Vec<u8>) -> RawAdvertisement {
        RawAdvertisement {
            channel: Some(ChannelId::new("dev-1")),
            name: Some("Gateway".into()),
            local_name: None,
            rssi: -60,
            connectable: true,
            service_data: HashMap::from([(ADVERTISEMENT_SERVICE_UUID, data)]),
        }
    }

    #[test]
    fn test_mac_reversal() {
        let data = vec![0x00, 0x0D, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF];
        let device = parse(&record(data), &ADVERTISEMENT_SERVICE_UUID).unwrap();
        assert_eq!(device.mac.to_string(), "FF:EE:DD:CC:BB:AA");
        assert_eq!(device.product_id, 0x0D);
        assert!(!device.is_bound);
    }

    #[test]
    fn test_service_data_length_boundary() {
        let seven = record(vec![0; 7]);
        let eight = record(vec![0; 8]);
        assert!(!is_candidate(&seven, &ADVERTISEMENT_SERVICE_UUID));
        assert!(is_candidate(&eight, &ADVERTISEMENT_SERVICE_UUID));
    }

    #[test]
    fn test_non_connectable_rejected() {
        let mut adv = record(vec![0; 8]);
        adv.connectable = false;
        assert!(parse(&adv, &ADVERTISEMENT_SERVICE_UUID).is_none());
    }

    #[test]
    fn test_name_required() {
        let mut adv = record(vec![0; 8]);
        adv.name = Some(String::new());
        assert!(!is_candidate(&adv, &ADVERTISEMENT_SERVICE_UUID));

        adv.local_name = Some("qp-gw".into());
        assert!(is_candidate(&adv, &ADVERTISEMENT_SERVICE_UUID));
        let device = parse(&adv, &ADVERTISEMENT_SERVICE_UUID).unwrap();
        assert_eq!(device.name, "qp-gw");
    }

    #[test]
    fn test_uuid_case_variants_match() {
        let upper = Uuid::parse_str("0000FDCD-0000-1000-8000-00805F9B34FB").unwrap();
        let lower = Uuid::parse_str("0000fdcd-0000-1000-8000-00805f9b34fb").unwrap();
        let mut adv = record(vec![]);
        adv.service_data = HashMap::from([(lower, vec![0; 8])]);
        assert!(is_candidate(&adv, &upper));
    }

    #[test]
    fn test_bound_flag_and_battery() {
        let mac = MacAddress::new([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        let data = encode_service_data(FRAME_CONTROL_BOUND, PRODUCT_PHEASANT_S9118, &mac, Some(42));
        let device = parse(&record(data), &ADVERTISEMENT_SERVICE_UUID).unwrap();
        assert!(device.is_bound);
        assert_eq!(device.battery_percent, 42);
        assert_eq!(device.mac, mac);
        assert_eq!(device.broadcast_hex(), "805C66554433221102012A");
    }

    #[test]
    fn test_battery_defaults_without_marker() {
        let mut data = vec![0x00, 0x0D, 1, 2, 3, 4, 5, 6];
        let device = parse(&record(data.clone()), &ADVERTISEMENT_SERVICE_UUID).unwrap();
        assert_eq!(device.battery_percent, DEFAULT_BATTERY_PERCENT);

        data.extend_from_slice(&[0x01, 0x01, 0x05]);
        let device = parse(&record(data), &ADVERTISEMENT_SERVICE_UUID).unwrap();
        assert_eq!(device.battery_percent, DEFAULT_BATTERY_PERCENT);
    }

    #[test]
    fn test_mac_from_str() {
        let mac: MacAddress = "ff:ee:dd:cc:bb:aa".parse().unwrap();
        assert_eq!(mac.to_string(), "FF:EE:DD:CC:BB:AA");
        assert_eq!("FFEEDDCCBBAA".parse::<MacAddress>().unwrap(), mac);
        assert!("FF:EE".parse::<MacAddress>().is_err());
    }
}
