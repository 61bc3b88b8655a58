//! Gatebind-Core: provisioning engine for BLE IoT gateways.
//!
//! Finds a gateway by its vendor advertisement, opens a link, authorizes
//! it with a set/verify token handshake and then pushes Wi-Fi and MQTT
//! configuration over a small framed command protocol.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Constants, command numbering, frame codec
//! - **Radio**: BLE collaborator abstraction (btleplug, mock)
//! - **Transport**: Command/notification correlation on one link
//! - **Scan**: Advertisement filtering and target matching
//! - **State**: Connection state machine and step handlers
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: High-level orchestrator and feature operations
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use gatebind_core::protocol::{CommandSet, PRODUCT_GATEWAY_SPARROW};
//! use gatebind_core::radio::MockRadio;
//! use gatebind_core::session::{ConnectOptions, ProvisionSession, SessionConfig};
//!
//! # async fn run() -> Result<(), gatebind_core::ProvisionError> {
//! let radio = Arc::new(MockRadio::simulated_gateway(CommandSet::default()));
//! let mut session = ProvisionSession::new(radio, SessionConfig::default());
//!
//! session
//!     .start_connect(ConnectOptions::product(PRODUCT_GATEWAY_SPARROW))
//!     .await?;
//! session.set_wifi("HomeNet", "hunter22").await?;
//! session.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod advertisement;
pub mod error;
pub mod events;
pub mod features;
pub mod payload;
pub mod protocol;
pub mod radio;
pub mod scan;
pub mod session;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use advertisement::{DeviceRecord, MacAddress};
pub use error::{ErrorKind, ProvisionError};
pub use events::{
    ConnectStep, NullObserver, ProvisionEvent, ProvisionObserver, StepStatus, TracingObserver,
};
pub use payload::{MqttConfig, WiFiItem};
pub use protocol::CommandSet;
pub use radio::{MockRadio, Radio, RadioError};
#[cfg(feature = "ble")]
pub use radio::BtleRadio;
pub use scan::{ScanCoordinator, ScanTarget};
pub use session::{ConnectOptions, GattProfile, ProvisionSession, SessionConfig, SessionToken};
pub use state::ConnectionState;
