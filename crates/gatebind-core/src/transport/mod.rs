//! Command transport module.
//!
//! Frames outbound commands, writes them in link-sized chunks and routes
//! notifications back to the command that is waiting for them.

pub mod command;
pub mod table;

pub use command::{CommandTransport, InvokeOptions, TransportConfig};
pub use table::{CommandResponse, CorrelationKey, CorrelationTable, Dispatch, PendingCommand};
