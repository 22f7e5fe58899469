//! pontoon-server: the renderer-side half of the bridge.
//!
//! Runs in the 64-bit host process. Attaches to the arenas the client
//! created, answers the handshake, pumps the command queues, resolves
//! client handles through the shadow map, and hands transported-API
//! commands to the dispatcher (which owns the actual renderer and is not
//! part of this crate).

#![forbid(unsafe_op_in_unsafe_fn)]

pub mod dispatch;
pub mod runtime;
pub mod shadow;

pub use dispatch::{Dispatcher, ReplyWriter, ServerServices};
pub use runtime::ServerRuntime;
pub use shadow::{RefCounted, ShadowMap};
