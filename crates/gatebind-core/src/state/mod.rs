//! State machine module.

pub mod handlers;
pub mod machine;

pub use handlers::{HandlerContext, TokenStep};
pub use machine::{ConnectionState, StateMachineContext};
