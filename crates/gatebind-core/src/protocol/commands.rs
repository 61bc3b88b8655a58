//! Firmware command numbering.
//!
//! Gateway firmware revisions disagree on command codes, so the codes are
//! configuration rather than constants. The default is the latest numbering.

use serde::{Deserialize, Serialize};

/// Command codes understood by one firmware revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandSet {
    /// Marker of exec-result notifications.
    pub exec_result: u8,
    pub set_token: u8,
    pub verify_token: u8,
    pub get_wifi_list: u8,
    pub set_wifi: u8,
    pub set_mqtt_part1: u8,
    pub set_mqtt_part2: u8,
}

impl CommandSet {
    /// Numbering of current gateway firmware.
    pub const fn current() -> Self {
        Self {
            exec_result: 0xFF,
            set_token: 0x01,
            verify_token: 0x02,
            get_wifi_list: 0x2F,
            set_wifi: 0x09,
            set_mqtt_part1: 0x17,
            set_mqtt_part2: 0x18,
        }
    }

    /// Numbering of early Sparrow firmware.
    ///
    /// `set_wifi` shares its code with `set_token`; they never collide
    /// because they travel on different characteristic pairs.
    pub const fn legacy() -> Self {
        Self {
            get_wifi_list: 0x07,
            set_wifi: 0x01,
            ..Self::current()
        }
    }

    /// Look up a preset by name (`current` or `legacy`).
    pub fn preset(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "current" | "latest" => Some(Self::current()),
            "legacy" => Some(Self::legacy()),
            _ => None,
        }
    }
}

impl Default for CommandSet {
    fn default() -> Self {
        Self::current()
    }
}
