//! Radio layer module.

#[cfg(feature = "ble")]
pub mod btle;
pub mod mock;
pub mod traits;

#[cfg(feature = "ble")]
pub use btle::BtleRadio;
pub use mock::{MockRadio, WriteRecord};
pub use traits::{
    AdapterState, ChannelId, CharacteristicInfo, DiscoveryOptions, Radio, RadioError, RadioEvent,
    RawAdvertisement,
};
