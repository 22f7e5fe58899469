//! pontoon-client: the game-side half of the bridge.
//!
//! Lives inside the 32-bit client process. Owns the shared arenas (created
//! before the server is spawned), the scoped command transaction, the
//! server process controller, and the client ends of the shadow-handle and
//! shared-heap machinery.

#![forbid(unsafe_op_in_unsafe_fn)]

pub mod command;
pub mod context;
pub mod handles;
pub mod lockable;
pub mod nesting;
pub mod process;

pub use command::CommandWriter;
pub use context::{BridgeContext, ResponseGuard};
pub use handles::{HandleAllocator, LockInfo, LockTracker, LOCK_DISCARD, LOCK_READONLY};
pub use lockable::LockableBuffer;
pub use process::ServerProcess;
