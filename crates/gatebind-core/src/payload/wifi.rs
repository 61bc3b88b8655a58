//! Wi-Fi payloads.
//!
//! Set Wi-Fi sends `"ssid","password"` as UTF-8. The Wi-Fi list reply is a
//! packed sequence of entries:
//!
//! ```text
//! [ssid_len u8][ssid utf-8 ...][auth u8][rssi i8]
//! ```
//!
//! `auth` is non-zero when the network needs a password.

use std::io::{Cursor, Read};

use byteorder::{ReadBytesExt, WriteBytesExt};
use tracing::warn;

use super::PayloadError;

/// One network reported by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WiFiItem {
    pub ssid: String,
    pub auth_required: bool,
    /// Signal strength in dBm.
    pub rssi: i8,
}

impl WiFiItem {
    pub fn new(ssid: impl Into<String>, auth_required: bool, rssi: i8) -> Self {
        Self {
            ssid: ssid.into(),
            auth_required,
            rssi,
        }
    }
}

/// Encode the Set Wi-Fi payload. An open network takes an empty password.
pub fn encode_set_wifi(ssid: &str, password: &str) -> Result<Vec<u8>, PayloadError> {
    if ssid.is_empty() {
        return Err(PayloadError::EmptyField("ssid"));
    }
    for (field, value) in [("ssid", ssid), ("password", password)] {
        if value.contains('"') {
            return Err(PayloadError::ForbiddenChar { field, ch: '"' });
        }
    }
    Ok(format!("\"{ssid}\",\"{password}\"").into_bytes())
}

/// Decode a reassembled Wi-Fi list reply, in transmission order.
///
/// A truncated trailing entry ends decoding; entries before it are kept.
pub fn decode_wifi_list(data: &[u8]) -> Vec<WiFiItem> {
    let mut cursor = Cursor::new(data);
    let mut items = Vec::new();

    while (cursor.position() as usize) < data.len() {
        match read_entry(&mut cursor) {
            Some(item) => items.push(item),
            None => {
                warn!(
                    offset = cursor.position(),
                    len = data.len(),
                    "Truncated Wi-Fi list entry"
                );
                break;
            }
        }
    }
    items
}

fn read_entry(cursor: &mut Cursor<&[u8]>) -> Option<WiFiItem> {
    let len = cursor.read_u8().ok()? as usize;
    let mut ssid = vec![0u8; len];
    cursor.read_exact(&mut ssid).ok()?;
    let auth = cursor.read_u8().ok()?;
    let rssi = cursor.read_i8().ok()?;
    Some(WiFiItem {
        ssid: String::from_utf8_lossy(&ssid).into_owned(),
        auth_required: auth != 0,
        rssi,
    })
}

/// Encode a Wi-Fi list the way the gateway sends it.
pub fn encode_wifi_list(items: &[WiFiItem]) -> Result<Vec<u8>, PayloadError> {
    let mut out = Vec::new();
    for item in items {
        let ssid = item.ssid.as_bytes();
        let len = u8::try_from(ssid.len()).map_err(|_| PayloadError::FieldTooLong {
            field: "ssid",
            len: ssid.len(),
            max: u8::MAX as usize,
        })?;
        out.push(len);
        out.extend_from_slice(ssid);
        out.push(u8::from(item.auth_required));
        // Writing to a Vec cannot fail.
        let _ = out.write_i8(item.rssi);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_wifi_payload() {
        assert_eq!(
            encode_set_wifi("HomeNet", "s3cret").unwrap(),
            b"\"HomeNet\",\"s3cret\"".to_vec()
        );
    }

    #[test]
    fn test_open_network_has_empty_password() {
        assert_eq!(encode_set_wifi("Cafe", "").unwrap(), b"\"Cafe\",\"\"".to_vec());
    }

    #[test]
    fn test_set_wifi_rejects_bad_input() {
        assert_eq!(encode_set_wifi("", "x"), Err(PayloadError::EmptyField("ssid")));
        assert!(matches!(
            encode_set_wifi("a\"b", "x"),
            Err(PayloadError::ForbiddenChar { field: "ssid", .. })
        ));
    }

    #[test]
    fn test_decode_captured_list() {
        // Two entries: "Lab" secured at -45 dBm, "Open" open at -81 dBm.
        let data = [
            0x03, b'L', b'a', b'b', 0x01, 0xD3, //
            0x04, b'O', b'p', b'e', b'n', 0x00, 0xAF,
        ];
        let items = decode_wifi_list(&data);
        assert_eq!(
            items,
            vec![WiFiItem::new("Lab", true, -45), WiFiItem::new("Open", false, -81)]
        );
    }

    #[test]
    fn test_truncated_tail_keeps_prefix() {
        let mut data = encode_wifi_list(&[WiFiItem::new("Lab", true, -45)]).unwrap();
        data.extend_from_slice(&[0x08, b'c', b'u']);
        let items = decode_wifi_list(&data);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].ssid, "Lab");
    }

    #[test]
    fn test_empty_list() {
        assert!(decode_wifi_list(&[]).is_empty());
    }

    #[test]
    fn test_utf8_ssid() {
        let items = vec![WiFiItem::new("咖啡馆", true, -60)];
        let data = encode_wifi_list(&items).unwrap();
        assert_eq!(data[0] as usize, "咖啡馆".len());
        assert_eq!(decode_wifi_list(&data), items);
    }
}
