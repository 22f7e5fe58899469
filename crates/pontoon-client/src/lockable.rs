//! Lock/unlock plumbing for buffer-like resources.
//!
//! A lockable buffer hands the game a writable pointer on `lock` and ships
//! the written range to the server on `unlock`. Two routes exist for the
//! bytes: a process-local shadow copy pushed through the data queue, or a
//! shared-heap block the server reads in place (`Flags::DATA_IN_HEAP`).
//! The route is fixed per buffer at creation from the heap policy.
//!
//! DISCARD relocks get a fresh heap block immediately (the old one may
//! still be in flight server-side); the displaced block is deallocated
//! right after the unlock command referencing it was sent.

use pontoon_core::{BridgeError, Command, Flags, Result};
use pontoon_shm::INVALID_ALLOC_ID;

use crate::context::BridgeContext;
use crate::handles::{LockInfo, LockTracker, LOCK_DISCARD};

/// Client-side state for one lockable buffer resource.
pub struct LockableBuffer {
    handle: u32,
    size: u32,
    unlock_command: Command,
    uses_heap: bool,
    /// Current heap block backing the buffer contents, when heap-routed.
    heap_alloc: pontoon_shm::AllocId,
    /// Shadow copy of the buffer, when queue-routed.
    shadow: Vec<u8>,
    locks: LockTracker,
    /// Send the whole buffer on every unlock regardless of the lock range.
    send_whole: bool,
}

impl LockableBuffer {
    pub fn new(
        ctx: &BridgeContext,
        handle: u32,
        size: u32,
        unlock_command: Command,
        dynamic: bool,
    ) -> Self {
        let options = ctx.options();
        let policy = options.shared_heap_policy;
        let uses_heap = options.use_shared_heap
            && if dynamic {
                policy.contains(pontoon_core::options::SharedHeapPolicy::DYNAMIC_BUFFERS)
            } else {
                policy.contains(pontoon_core::options::SharedHeapPolicy::STATIC_BUFFERS)
            };
        let send_whole = !dynamic && options.always_copy_entire_static_buffer;

        Self {
            handle,
            size,
            unlock_command,
            uses_heap,
            heap_alloc: INVALID_ALLOC_ID,
            shadow: if uses_heap { Vec::new() } else { vec![0; size as usize] },
            locks: LockTracker::new(),
            send_whole,
        }
    }

    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn uses_heap(&self) -> bool {
        self.uses_heap
    }

    /// Lock a range for CPU access. Returns the offset the caller writes
    /// at; the actual bytes live either in the shadow copy or the heap
    /// block.
    pub fn lock(&mut self, ctx: &BridgeContext, offset: u32, size: u32, flags: u32) -> Result<()> {
        if offset.saturating_add(size) > self.size {
            return Err(BridgeError::protocol(format!(
                "lock range {offset}+{size} exceeds buffer size {}",
                self.size
            )));
        }

        if self.uses_heap {
            let discard = flags & LOCK_DISCARD != 0;
            let mut discarded = INVALID_ALLOC_ID;
            if discard && self.heap_alloc != INVALID_ALLOC_ID {
                discarded = self.heap_alloc;
                self.heap_alloc = INVALID_ALLOC_ID;
            }
            if self.heap_alloc == INVALID_ALLOC_ID {
                self.heap_alloc = ctx.heap_allocate(self.size)?;
            }
            self.locks
                .push_lock(LockInfo::in_heap(offset, size, flags, self.heap_alloc, discarded));
        } else {
            self.locks.push_lock(LockInfo::queued(offset, size, flags));
        }
        Ok(())
    }

    /// Write bytes into the locked region (what the game does through the
    /// returned pointer in the C ABI shim).
    pub fn write_locked(&mut self, ctx: &BridgeContext, offset: u32, bytes: &[u8]) -> Result<()> {
        if self.uses_heap {
            let heap = ctx
                .heap()
                .ok_or_else(|| BridgeError::protocol("heap-routed buffer without a heap"))?;
            heap.lock().write(self.heap_alloc, offset as usize, bytes)
        } else {
            let start = offset as usize;
            self.shadow[start..start + bytes.len()].copy_from_slice(bytes);
            Ok(())
        }
    }

    /// Unlock: ship the oldest outstanding lock to the server. Read-only
    /// locks ship nothing.
    pub fn unlock(&mut self, ctx: &BridgeContext) -> Result<()> {
        // Some engines unlock resources they never locked.
        let Some(lock) = self.locks.pop_unlock() else {
            return Ok(());
        };

        if lock.is_read_only() {
            return Ok(());
        }

        let (offset, size) = if self.send_whole || lock.size == 0 {
            (0, self.size)
        } else {
            (lock.offset, lock.size)
        };

        if lock.uses_heap() {
            let mut cmd = ctx.command(self.unlock_command, self.handle, Flags::DATA_IN_HEAP);
            cmd.send_many(&[offset, size, lock.flags]);
            cmd.send_token(lock.heap_alloc);
            drop(cmd);
            if lock.discarded_alloc != INVALID_ALLOC_ID {
                ctx.heap_deallocate(lock.discarded_alloc);
            }
        } else {
            let start = offset as usize;
            let end = start + size as usize;
            let mut cmd = ctx.command(self.unlock_command, self.handle, Flags::empty());
            cmd.send_many(&[offset, size, lock.flags]);
            cmd.send_bytes(&self.shadow[start..end]);
        }
        Ok(())
    }

    /// Resource teardown: return any heap block still held.
    pub fn destroy(&mut self, ctx: &BridgeContext) {
        if self.heap_alloc != INVALID_ALLOC_ID {
            ctx.heap_deallocate(self.heap_alloc);
            self.heap_alloc = INVALID_ALLOC_ID;
        }
    }
}
