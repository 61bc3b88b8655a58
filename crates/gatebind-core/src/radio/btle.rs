//! btleplug-based radio implementation.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::traits::{
    AdapterState, ChannelId, CharacteristicInfo, DiscoveryOptions, Radio, RadioError,
    RadioEvent, RawAdvertisement,
};
use crate::protocol::constants::MAX_WRITE_LEN;

const EVENT_CAPACITY: usize = 256;

fn backend(e: btleplug::Error) -> RadioError {
    RadioError::Backend(e.to_string())
}

fn channel_of(id: &PeripheralId) -> ChannelId {
    ChannelId::new(id.to_string())
}

struct Shared {
    adapter: Adapter,
    peripherals: Mutex<HashMap<ChannelId, Peripheral>>,
    /// Channels whose notification stream is already forwarded.
    forwarding: Mutex<HashSet<ChannelId>>,
    discovering: AtomicBool,
    events: broadcast::Sender<RadioEvent>,
}

impl Shared {
    fn peripherals(&self) -> MutexGuard<'_, HashMap<ChannelId, Peripheral>> {
        self.peripherals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn peripheral(&self, channel: &ChannelId) -> Result<Peripheral, RadioError> {
        self.peripherals()
            .get(channel)
            .cloned()
            .ok_or(RadioError::NotConnected)
    }

    fn emit(&self, event: RadioEvent) {
        let _ = self.events.send(event);
    }

    async fn advertisement(&self, id: &PeripheralId) -> Option<RawAdvertisement> {
        let peripheral = self.adapter.peripheral(id).await.ok()?;
        let props = peripheral.properties().await.ok().flatten()?;
        let channel = channel_of(id);
        self.peripherals().insert(channel.clone(), peripheral);
        Some(RawAdvertisement {
            channel: Some(channel),
            name: props.local_name.clone(),
            local_name: props.local_name,
            rssi: props.rssi.unwrap_or_default(),
            // Host stacks do not report connectability; assume connectable.
            connectable: true,
            service_data: props.service_data,
        })
    }

    /// Pump central events into radio events until the adapter stream ends.
    async fn pump_central(self: Arc<Self>) {
        let mut stream = match self.adapter.events().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Adapter event stream unavailable");
                return;
            }
        };
        while let Some(event) = stream.next().await {
            match event {
                CentralEvent::DeviceDiscovered(id)
                | CentralEvent::DeviceUpdated(id)
                | CentralEvent::ServiceDataAdvertisement { id, .. } => {
                    if !self.discovering.load(Ordering::SeqCst) {
                        continue;
                    }
                    if let Some(adv) = self.advertisement(&id).await {
                        self.emit(RadioEvent::DevicesFound(vec![adv]));
                    }
                }
                CentralEvent::DeviceConnected(id) => {
                    self.emit(RadioEvent::ConnectionChanged {
                        channel: channel_of(&id),
                        connected: true,
                    });
                }
                CentralEvent::DeviceDisconnected(id) => {
                    let channel = channel_of(&id);
                    self.forwarding
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&channel);
                    self.emit(RadioEvent::ConnectionChanged {
                        channel,
                        connected: false,
                    });
                }
                _ => {}
            }
        }
        debug!("Adapter event stream closed");
    }

    async fn forward_notifications(self: Arc<Self>, channel: ChannelId, peripheral: Peripheral) {
        let mut stream = match peripheral.notifications().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(channel = %channel, error = %e, "Notification stream unavailable");
                return;
            }
        };
        while let Some(n) = stream.next().await {
            self.emit(RadioEvent::ValueChanged {
                channel: channel.clone(),
                characteristic: n.uuid,
                value: n.value,
            });
        }
        debug!(channel = %channel, "Notification stream closed");
    }
}

/// Radio backed by the host Bluetooth stack through btleplug.
pub struct BtleRadio {
    shared: Arc<Shared>,
}

impl BtleRadio {
    /// Open the first Bluetooth adapter of the host.
    ///
    /// Must be called inside a tokio runtime: it spawns the event pump.
    #[instrument(level = "info")]
    pub async fn open() -> Result<Self, RadioError> {
        let manager = Manager::new()
            .await
            .map_err(|e| RadioError::AdapterUnavailable(e.to_string()))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| RadioError::AdapterUnavailable(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| RadioError::AdapterUnavailable("no Bluetooth adapter found".into()))?;

        if let Ok(info) = adapter.adapter_info().await {
            info!(adapter = %info, "Opened Bluetooth adapter");
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            adapter,
            peripherals: Mutex::new(HashMap::new()),
            forwarding: Mutex::new(HashSet::new()),
            discovering: AtomicBool::new(false),
            events,
        });
        tokio::spawn(Arc::clone(&shared).pump_central());
        Ok(Self { shared })
    }

    fn characteristic(
        peripheral: &Peripheral,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Characteristic, RadioError> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic && c.service_uuid == service)
            .ok_or(RadioError::CharacteristicNotFound(characteristic))
    }
}

impl Radio for BtleRadio {
    async fn power_on(&self) -> Result<(), RadioError> {
        // btleplug cannot power the adapter; a responding adapter counts as on.
        self.shared
            .adapter
            .adapter_info()
            .await
            .map(|_| ())
            .map_err(|e| RadioError::AdapterUnavailable(e.to_string()))
    }

    async fn adapter_state(&self) -> Result<AdapterState, RadioError> {
        let available = self.shared.adapter.adapter_info().await.is_ok();
        Ok(AdapterState {
            available,
            discovering: self.shared.discovering.load(Ordering::SeqCst),
        })
    }

    async fn start_discovery(&self, options: &DiscoveryOptions) -> Result<(), RadioError> {
        debug!(
            allow_duplicates = options.allow_duplicates,
            interval_ms = options.interval.as_millis() as u64,
            "Starting discovery"
        );
        self.shared
            .adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(backend)?;
        self.shared.discovering.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_discovery(&self) -> Result<(), RadioError> {
        self.shared.discovering.store(false, Ordering::SeqCst);
        self.shared.adapter.stop_scan().await.map_err(backend)
    }

    async fn connect(&self, channel: &ChannelId, timeout: Duration) -> Result<(), RadioError> {
        let peripheral = self.shared.peripheral(channel)?;
        match tokio::time::timeout(timeout, peripheral.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(RadioError::ConnectFailed(e.to_string())),
            Err(_) => {
                return Err(RadioError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        }
        peripheral.discover_services().await.map_err(backend)
    }

    async fn disconnect(&self, channel: &ChannelId) -> Result<(), RadioError> {
        let peripheral = self.shared.peripheral(channel)?;
        if peripheral.is_connected().await.map_err(backend)? {
            peripheral.disconnect().await.map_err(backend)?;
        }
        Ok(())
    }

    async fn list_services(&self, channel: &ChannelId) -> Result<Vec<Uuid>, RadioError> {
        let peripheral = self.shared.peripheral(channel)?;
        Ok(peripheral.services().into_iter().map(|s| s.uuid).collect())
    }

    async fn list_characteristics(
        &self,
        channel: &ChannelId,
        service: Uuid,
    ) -> Result<Vec<CharacteristicInfo>, RadioError> {
        let peripheral = self.shared.peripheral(channel)?;
        let service = peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == service)
            .ok_or(RadioError::ServiceNotFound(service))?;
        Ok(service
            .characteristics
            .iter()
            .map(|c| CharacteristicInfo {
                uuid: c.uuid,
                notify: c.properties.contains(CharPropFlags::NOTIFY),
                write: c.properties.intersects(
                    CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE,
                ),
            })
            .collect())
    }

    async fn subscribe_notify(
        &self,
        channel: &ChannelId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), RadioError> {
        let peripheral = self.shared.peripheral(channel)?;
        let target = Self::characteristic(&peripheral, service, characteristic)?;
        peripheral.subscribe(&target).await.map_err(backend)?;

        let first = self
            .shared
            .forwarding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel.clone());
        if first {
            tokio::spawn(
                Arc::clone(&self.shared).forward_notifications(channel.clone(), peripheral),
            );
        }
        Ok(())
    }

    async fn write_characteristic(
        &self,
        channel: &ChannelId,
        service: Uuid,
        characteristic: Uuid,
        bytes: &[u8],
    ) -> Result<(), RadioError> {
        if bytes.len() > MAX_WRITE_LEN {
            return Err(RadioError::WriteFailed(format!(
                "{} bytes exceeds the {MAX_WRITE_LEN}-byte limit",
                bytes.len()
            )));
        }
        let peripheral = self.shared.peripheral(channel)?;
        let target = Self::characteristic(&peripheral, service, characteristic)?;
        peripheral
            .write(&target, bytes, WriteType::WithResponse)
            .await
            .map_err(|e| RadioError::WriteFailed(e.to_string()))
    }

    fn events(&self) -> broadcast::Receiver<RadioEvent> {
        self.shared.events.subscribe()
    }

    fn set_keep_awake(&self, on: bool) {
        // Desktop hosts have no screen-on hint to give.
        debug!(on, "Keep-awake hint");
    }

    fn max_write_len(&self) -> usize {
        MAX_WRITE_LEN
    }
}
