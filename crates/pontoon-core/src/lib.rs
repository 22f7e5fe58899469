//! pontoon-core: wire types and shared policy for the pontoon bridge.
//!
//! This crate defines everything both endpoints must agree on without
//! touching shared memory itself:
//! - the command enumeration and 16-byte wire header (`commands`)
//! - error codes and failure categories (`error`)
//! - the per-process bridge state machine (`state`)
//! - the configuration surface and runtime retry flags (`options`)
//! - session identity: GUID, version string, shared object names (`session`)
//! - the recent-command diagnostic ring (`history`)

#![forbid(unsafe_op_in_unsafe_fn)]

pub mod commands;
pub mod error;
pub mod history;
pub mod options;
pub mod session;
pub mod state;

pub use commands::{Command, CommandHeader, Flags, COMMAND_HEADER_SIZE};
pub use error::{BridgeError, Result};
pub use history::CommandHistory;
pub use options::{BridgeOptions, RetryFlags};
pub use session::{SessionGuid, BRIDGE_VERSION};
pub use state::ProcessState;
