//! pontoon-shm: the shared-memory substrate of the bridge.
//!
//! Everything here is mapped into both processes at (generally) different
//! base addresses, so shared structures are reached through explicit offset
//! arithmetic over an [`Arena`] and never contain pointers. Cross-process
//! synchronization is done with atomics resident in the mapping plus named
//! counting semaphores.
//!
//! Layout rules, in force everywhere:
//! - shared headers are `#[repr(C)]` with compile-time size asserts
//! - structures placed at 64-byte offsets so nothing straddles cache lines
//! - every mapping starts with magic bytes and a layout version that are
//!   validated on attach

#![forbid(unsafe_op_in_unsafe_fn)]

pub mod arena;
pub mod channel;
pub mod cmd_ring;
pub mod data_queue;
pub mod heap;
pub mod msg_channel;
pub mod semaphore;

#[cfg(unix)]
#[path = "mmap.rs"]
mod mmap_impl;
#[cfg(windows)]
#[path = "mmap_windows.rs"]
mod mmap_impl;

pub use arena::Arena;
pub use channel::{ChannelGeometry, ChannelHeader, ChannelSide, IpcChannel, SyncOutcome};
pub use cmd_ring::{CmdRing, PushOutcome};
pub use data_queue::DataQueue;
pub use heap::{AllocId, AllocRun, SharedHeap, INVALID_ALLOC_ID};
pub use mmap_impl::ShmFile;
pub use msg_channel::{MessageEndpoint, WM_KILLFOCUS, WM_SETFOCUS};
pub use semaphore::NamedSemaphore;
