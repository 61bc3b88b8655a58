//! Radio layer abstraction.
//!
//! Defines the `Radio` trait: the minimal capability surface the
//! provisioning engine needs from a host Bluetooth stack. Implementations:
//! - `MockRadio` for unit testing and the simulated gateway
//! - `BtleRadio` (feature `ble`) on top of btleplug

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::protocol::constants::DISCOVERY_INTERVAL_MS;

#[derive(Error, Debug, Clone)]
pub enum RadioError {
    #[error("Adapter unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    #[error("Peripheral not connected")]
    NotConnected,

    #[error("Service not found: {0}")]
    ServiceNotFound(Uuid),

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Backend error: {0}")]
    Backend(String),
}

/// Opaque handle to one peripheral link.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Adapter availability snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterState {
    pub available: bool,
    pub discovering: bool,
}

/// Discovery parameters handed to the radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryOptions {
    /// Report every sighting, not just the first per device.
    pub allow_duplicates: bool,
    /// Reporting interval hint.
    pub interval: Duration,
    pub high_power: bool,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            allow_duplicates: true,
            interval: Duration::from_millis(DISCOVERY_INTERVAL_MS),
            high_power: true,
        }
    }
}

/// One GATT characteristic of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub notify: bool,
    pub write: bool,
}

/// Raw advertisement record as reported by the radio.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawAdvertisement {
    pub channel: Option<ChannelId>,
    pub name: Option<String>,
    pub local_name: Option<String>,
    pub rssi: i16,
    pub connectable: bool,
    pub service_data: HashMap<Uuid, Vec<u8>>,
}

impl RawAdvertisement {
    /// Advertised name, falling back to the local name.
    pub fn display_name(&self) -> Option<&str> {
        self.name
            .as_deref()
            .filter(|n| !n.is_empty())
            .or_else(|| self.local_name.as_deref().filter(|n| !n.is_empty()))
    }
}

/// Events pushed by the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    /// A batch of advertisements seen during discovery.
    DevicesFound(Vec<RawAdvertisement>),
    /// Link state of a peripheral changed.
    ConnectionChanged { channel: ChannelId, connected: bool },
    /// A subscribed characteristic notified a value.
    ValueChanged {
        channel: ChannelId,
        characteristic: Uuid,
        value: Vec<u8>,
    },
}

/// Host radio capabilities used by the provisioning engine.
///
/// Event delivery is a broadcast channel: every component that cares about
/// radio events holds its own receiver and drops it on teardown.
pub trait Radio: Send + Sync {
    /// Bring the adapter up.
    fn power_on(&self) -> impl Future<Output = Result<(), RadioError>> + Send;

    fn adapter_state(&self) -> impl Future<Output = Result<AdapterState, RadioError>> + Send;

    fn start_discovery(
        &self,
        options: &DiscoveryOptions,
    ) -> impl Future<Output = Result<(), RadioError>> + Send;

    fn stop_discovery(&self) -> impl Future<Output = Result<(), RadioError>> + Send;

    fn connect(
        &self,
        channel: &ChannelId,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), RadioError>> + Send;

    fn disconnect(&self, channel: &ChannelId)
    -> impl Future<Output = Result<(), RadioError>> + Send;

    fn list_services(
        &self,
        channel: &ChannelId,
    ) -> impl Future<Output = Result<Vec<Uuid>, RadioError>> + Send;

    fn list_characteristics(
        &self,
        channel: &ChannelId,
        service: Uuid,
    ) -> impl Future<Output = Result<Vec<CharacteristicInfo>, RadioError>> + Send;

    fn subscribe_notify(
        &self,
        channel: &ChannelId,
        service: Uuid,
        characteristic: Uuid,
    ) -> impl Future<Output = Result<(), RadioError>> + Send;

    /// Write one chunk. Chunks longer than `max_write_len` are rejected.
    fn write_characteristic(
        &self,
        channel: &ChannelId,
        service: Uuid,
        characteristic: Uuid,
        bytes: &[u8],
    ) -> impl Future<Output = Result<(), RadioError>> + Send;

    /// Subscribe to radio events.
    fn events(&self) -> broadcast::Receiver<RadioEvent>;

    /// Keep the host awake while provisioning. Best-effort, never blocks.
    fn set_keep_awake(&self, on: bool);

    /// Largest chunk accepted by `write_characteristic`.
    fn max_write_len(&self) -> usize;
}
