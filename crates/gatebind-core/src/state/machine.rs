//! Connection state machine.

use std::fmt;

use crate::advertisement::DeviceRecord;
use crate::events::ConnectStep;

/// Connection state of a provisioning session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Scanning,
    Connecting,
    SubscribingNotifications,
    SettingToken,
    VerifyingToken,
    /// Token accepted; feature operations may run.
    Ready,
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "IDLE"),
            ConnectionState::Scanning => write!(f, "SCANNING"),
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::SubscribingNotifications => write!(f, "SUBSCRIBING"),
            ConnectionState::SettingToken => write!(f, "SETTING_TOKEN"),
            ConnectionState::VerifyingToken => write!(f, "VERIFYING_TOKEN"),
            ConnectionState::Ready => write!(f, "READY"),
            ConnectionState::Disconnected => write!(f, "DISCONNECTED"),
        }
    }
}

impl ConnectionState {
    /// Step performed while in this state, if any.
    pub fn step(&self) -> Option<ConnectStep> {
        match self {
            ConnectionState::Scanning => Some(ConnectStep::Scan),
            ConnectionState::Connecting => Some(ConnectStep::Connect),
            ConnectionState::SubscribingNotifications => Some(ConnectStep::Subscribe),
            ConnectionState::SettingToken => Some(ConnectStep::SetToken),
            ConnectionState::VerifyingToken => Some(ConnectStep::VerifyToken),
            ConnectionState::Idle | ConnectionState::Ready | ConnectionState::Disconnected => None,
        }
    }

    /// Forward transitions of the connect chain, plus teardown.
    ///
    /// The chain only moves forward; any state may fall back to `Idle` or
    /// `Disconnected` when an attempt ends.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (_, Idle) | (_, Disconnected) => true,
            (Idle | Disconnected | Ready, Scanning) => true,
            (Scanning, Connecting) => true,
            (Connecting, SubscribingNotifications) => true,
            (SubscribingNotifications, SettingToken) => true,
            (SettingToken, VerifyingToken) => true,
            (VerifyingToken, Ready) => true,
            _ => false,
        }
    }
}

/// State machine context holding all runtime state of a session.
#[derive(Debug, Default)]
pub struct StateMachineContext {
    pub state: ConnectionState,
    /// Device of the current attempt or link.
    pub device: Option<DeviceRecord>,
}

impl StateMachineContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transition to a new state, returning the previous one.
    pub fn goto_state(&mut self, new_state: ConnectionState) -> ConnectionState {
        if !self.state.can_transition_to(new_state) {
            tracing::warn!(from = %self.state, to = %new_state, "Unexpected state transition");
        }
        if self.state != new_state {
            tracing::info!(from = %self.state, to = %new_state, "State transition");
        }
        std::mem::replace(&mut self.state, new_state)
    }

    /// Forget the device and return to a resting state.
    pub fn reset(&mut self, resting: ConnectionState) -> ConnectionState {
        self.device = None;
        self.goto_state(resting)
    }
}
