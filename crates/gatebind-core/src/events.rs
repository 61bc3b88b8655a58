//! Event system for UI decoupling.
//!
//! Front ends subscribe to provisioning progress through
//! [`ProvisionObserver`] without reaching into the session.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use crate::advertisement::DeviceRecord;
use crate::state::ConnectionState;

/// Caller-visible provisioning steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectStep {
    Scan,
    Connect,
    Subscribe,
    SetToken,
    VerifyToken,
    SetWifi,
    SetMqtt,
    GetWifiList,
    /// The link dropped or was closed.
    Disconnected,
}

impl ConnectStep {
    /// Numeric step code shared with the companion apps.
    pub fn code(&self) -> u8 {
        match self {
            ConnectStep::Scan => 0x01,
            ConnectStep::Connect => 0x02,
            ConnectStep::Subscribe => 0x04,
            ConnectStep::SetToken => 0x05,
            ConnectStep::VerifyToken => 0x06,
            ConnectStep::SetWifi => 0x08,
            ConnectStep::SetMqtt => 0x09,
            ConnectStep::GetWifiList => 0x0A,
            ConnectStep::Disconnected => 0x0B,
        }
    }
}

impl fmt::Display for ConnectStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectStep::Scan => write!(f, "Scan"),
            ConnectStep::Connect => write!(f, "Connect"),
            ConnectStep::Subscribe => write!(f, "Subscribe"),
            ConnectStep::SetToken => write!(f, "Set Token"),
            ConnectStep::VerifyToken => write!(f, "Verify Token"),
            ConnectStep::SetWifi => write!(f, "Set Wi-Fi"),
            ConnectStep::SetMqtt => write!(f, "Set MQTT"),
            ConnectStep::GetWifiList => write!(f, "Get Wi-Fi List"),
            ConnectStep::Disconnected => write!(f, "Disconnected"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    InProgress,
    Success,
    Failed,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::InProgress => write!(f, "in progress"),
            StepStatus::Success => write!(f, "success"),
            StepStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Events emitted by a provisioning session.
#[derive(Debug, Clone)]
pub enum ProvisionEvent {
    /// A step changed status.
    Step {
        step: ConnectStep,
        status: StepStatus,
        device: Option<DeviceRecord>,
    },
    /// Connection state changed.
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
}

/// Observer trait for receiving provisioning events.
///
/// Implement this trait in your UI layer to receive updates. Called from
/// the session's tasks; keep it quick.
pub trait ProvisionObserver: Send + Sync {
    fn on_event(&self, event: &ProvisionEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl ProvisionObserver for NullObserver {
    fn on_event(&self, _event: &ProvisionEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl ProvisionObserver for TracingObserver {
    fn on_event(&self, event: &ProvisionEvent) {
        match event {
            ProvisionEvent::Step {
                step,
                status,
                device,
            } => {
                let mac = device.as_ref().map(|d| d.mac.to_string()).unwrap_or_default();
                match status {
                    StepStatus::Failed => tracing::warn!(step = %step, mac = %mac, "Step failed"),
                    StepStatus::InProgress => tracing::debug!(step = %step, "Step started"),
                    StepStatus::Success => tracing::info!(step = %step, mac = %mac, "Step done"),
                }
            }
            ProvisionEvent::StateChanged { from, to } => {
                tracing::debug!(from = %from, to = %to, "Connection state");
            }
        }
    }
}

/// Observer that keeps every event, for tests and scripted front ends.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ProvisionEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProvisionEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Step events only, as `(step, status)` pairs.
    pub fn steps(&self) -> Vec<(ConnectStep, StepStatus)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ProvisionEvent::Step { step, status, .. } => Some((step, status)),
                ProvisionEvent::StateChanged { .. } => None,
            })
            .collect()
    }
}

impl ProvisionObserver for RecordingObserver {
    fn on_event(&self, event: &ProvisionEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}
