//! Per-process bridge lifecycle state.
//!
//! Both endpoints publish their own state into the channel header so the
//! other side can make policy decisions without a round trip. Most
//! importantly, a producer must stop emitting commands once the consumer
//! has reached `DoneProcessing`.

use std::sync::atomic::{AtomicU32, Ordering};

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProcessState {
    Uninit = 0,
    Init = 1,
    Handshaking = 2,
    Running = 3,
    DoneProcessing = 4,
    Exited = 5,
}

impl ProcessState {
    pub fn from_u32(value: u32) -> ProcessState {
        match value {
            1 => ProcessState::Init,
            2 => ProcessState::Handshaking,
            3 => ProcessState::Running,
            4 => ProcessState::DoneProcessing,
            5 => ProcessState::Exited,
            _ => ProcessState::Uninit,
        }
    }

    /// The peer is winding down or gone; no further commands may be sent
    /// to it.
    pub fn is_shutting_down(self) -> bool {
        self >= ProcessState::DoneProcessing
    }
}

/// A state cell living in shared memory.
#[repr(transparent)]
pub struct StateCell(AtomicU32);

impl StateCell {
    pub fn store(&self, state: ProcessState) {
        self.0.store(state as u32, Ordering::Release);
    }

    pub fn load(&self) -> ProcessState {
        ProcessState::from_u32(self.0.load(Ordering::Acquire))
    }
}

const _: () = assert!(core::mem::size_of::<StateCell>() == 4);
