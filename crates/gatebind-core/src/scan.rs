//! Scan coordinator: discovery and target selection.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::advertisement::{self, DeviceRecord, MacAddress};
use crate::error::ProvisionError;
use crate::radio::{DiscoveryOptions, Radio, RadioError, RadioEvent};

/// Scan lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanState {
    #[default]
    Idle,
    Scanning,
    Found,
    TimedOut,
    AdapterUnavailable,
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanState::Idle => write!(f, "IDLE"),
            ScanState::Scanning => write!(f, "SCANNING"),
            ScanState::Found => write!(f, "FOUND"),
            ScanState::TimedOut => write!(f, "TIMED_OUT"),
            ScanState::AdapterUnavailable => write!(f, "ADAPTER_UNAVAILABLE"),
        }
    }
}

/// Which device a scan is looking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanTarget {
    /// A specific device, bound or not.
    Mac(MacAddress),
    /// Any unbound device of this product.
    UnboundProduct(u8),
}

impl ScanTarget {
    pub fn new(mac: Option<MacAddress>, product_id: u8) -> Self {
        match mac {
            Some(mac) => ScanTarget::Mac(mac),
            None => ScanTarget::UnboundProduct(product_id),
        }
    }

    pub fn matches(&self, device: &DeviceRecord) -> bool {
        match self {
            ScanTarget::Mac(mac) => device.mac == *mac,
            ScanTarget::UnboundProduct(id) => device.product_id == *id && !device.is_bound,
        }
    }
}

impl fmt::Display for ScanTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanTarget::Mac(mac) => write!(f, "mac {mac}"),
            ScanTarget::UnboundProduct(id) => write!(f, "unbound product 0x{id:02X}"),
        }
    }
}

/// Runs discovery and resolves the first advertisement matching a target.
pub struct ScanCoordinator<R: Radio> {
    radio: Arc<R>,
    vendor_uuid: Uuid,
    options: DiscoveryOptions,
    state: ScanState,
}

impl<R: Radio> ScanCoordinator<R> {
    pub fn new(radio: Arc<R>, vendor_uuid: Uuid, options: DiscoveryOptions) -> Self {
        Self {
            radio,
            vendor_uuid,
            options,
            state: ScanState::Idle,
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    fn goto_state(&mut self, next: ScanState) {
        debug!(from = %self.state, to = %next, "Scan state");
        self.state = next;
    }

    /// Power the adapter and start discovery unless it is already running.
    ///
    /// The event receiver is taken before discovery starts so no early
    /// batch is missed.
    async fn begin(&mut self) -> Result<broadcast::Receiver<RadioEvent>, ProvisionError> {
        let events = self.radio.events();
        self.goto_state(ScanState::Scanning);

        let adapter = match self.radio.power_on().await {
            Ok(()) => self.radio.adapter_state().await,
            Err(e) => Err(e),
        };
        let adapter = match adapter {
            Ok(a) if a.available => a,
            Ok(_) => return Err(self.unavailable(RadioError::AdapterUnavailable("adapter off".into()))),
            Err(e) => return Err(self.unavailable(e)),
        };

        if adapter.discovering {
            debug!("Discovery already running");
        } else if let Err(e) = self.radio.start_discovery(&self.options).await {
            return Err(self.unavailable(e));
        }
        Ok(events)
    }

    fn unavailable(&mut self, e: RadioError) -> ProvisionError {
        warn!(error = %e, "Bluetooth adapter unavailable");
        self.goto_state(ScanState::AdapterUnavailable);
        ProvisionError::NotAvailable(e.to_string())
    }

    async fn halt(&self) {
        if let Err(e) = self.radio.stop_discovery().await {
            warn!(error = %e, "Failed to stop discovery");
        }
    }

    /// Scan until a device matches `target` or `timeout` elapses.
    #[instrument(skip(self), fields(target = %target))]
    pub async fn find(&mut self, target: ScanTarget, timeout: Duration) -> Result<DeviceRecord, ProvisionError> {
        let mut events = self.begin().await?;
        let deadline = Instant::now() + timeout;

        loop {
            let event = match timeout_at(deadline, events.recv()).await {
                Ok(event) => event,
                Err(_) => {
                    self.halt().await;
                    self.goto_state(ScanState::TimedOut);
                    let timeout_ms = timeout.as_millis() as u64;
                    warn!(timeout_ms, "No matching device");
                    return Err(ProvisionError::DeviceNotFound { timeout_ms });
                }
            };
            match event {
                Ok(RadioEvent::DevicesFound(batch)) => {
                    let found = batch
                        .iter()
                        .filter_map(|adv| advertisement::parse(adv, &self.vendor_uuid))
                        .find(|device| target.matches(device));
                    if let Some(device) = found {
                        self.halt().await;
                        self.goto_state(ScanState::Found);
                        info!(mac = %device.mac, name = %device.name, rssi = device.rssi, "Device found");
                        return Ok(device);
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Scan receiver lagged"),
                Err(RecvError::Closed) => {
                    self.halt().await;
                    return Err(self.unavailable(RadioError::Backend("event stream closed".into())));
                }
            }
        }
    }

    /// Collect every candidate seen within `duration`, strongest first.
    ///
    /// A later sighting of a MAC replaces the earlier record.
    #[instrument(skip(self))]
    pub async fn survey(&mut self, duration: Duration) -> Result<Vec<DeviceRecord>, ProvisionError> {
        let mut events = self.begin().await?;
        let deadline = Instant::now() + duration;
        let mut seen: HashMap<MacAddress, DeviceRecord> = HashMap::new();

        while let Ok(event) = timeout_at(deadline, events.recv()).await {
            match event {
                Ok(RadioEvent::DevicesFound(batch)) => {
                    for device in batch
                        .iter()
                        .filter_map(|adv| advertisement::parse(adv, &self.vendor_uuid))
                    {
                        seen.insert(device.mac, device);
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Scan receiver lagged"),
                Err(RecvError::Closed) => break,
            }
        }

        self.halt().await;
        self.goto_state(ScanState::Idle);
        let mut devices: Vec<DeviceRecord> = seen.into_values().collect();
        devices.sort_by(|a, b| b.rssi.cmp(&a.rssi));
        info!(count = devices.len(), "Survey finished");
        Ok(devices)
    }
}
