//! Payload encodings of the feature commands.
//!
//! Wi-Fi credentials, the Wi-Fi list reply and the two-part MQTT
//! configuration.

pub mod mqtt;
pub mod wifi;

use thiserror::Error;

pub use mqtt::MqttConfig;
pub use wifi::{WiFiItem, decode_wifi_list, encode_set_wifi, encode_wifi_list};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("Field `{0}` must not be empty")]
    EmptyField(&'static str),
    #[error("Field `{field}` contains a forbidden character {ch:?}")]
    ForbiddenChar { field: &'static str, ch: char },
    #[error("Field `{field}` is {len} bytes, limit is {max}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
}
