//! The data queue: a word-granular payload ring.
//!
//! Unlike the command ring, the two sides do not share head/tail indices.
//! Each process keeps its own cursor and the cursors stay in lockstep
//! because both sides apply identical advance rules; the command header's
//! `data_offset` (the producer cursor after the batch) lets the consumer
//! resynchronize by fast-forwarding over any tokens it did not consume.
//!
//! Tokens are `u32`. A blob is framed as `[byte_len][payload]` with the
//! payload rounded up to whole words and, so that a blob is always
//! contiguous in memory, placed entirely past the wrap point: when it
//! does not fit before the end of the ring, both sides reset their cursor
//! to zero before touching the payload ("reset on last index").
//!
//! Overrun protection is NOT handled here; the producer runs the channel
//! sync protocol (see `channel::IpcChannel::producer_sync`) before every
//! write.

use core::mem::size_of;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use crate::arena::Arena;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// Blob larger than the whole ring; cannot ever be transmitted.
    BlobTooLarge { words: u32, capacity: u32 },
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::BlobTooLarge { words, capacity } => write!(
                f,
                "payload of {words} words cannot fit a {capacity}-word data queue"
            ),
        }
    }
}

impl std::error::Error for QueueError {}

/// One side's view of the data queue. `pos` is this process's cursor:
/// the write cursor on the producer, the read cursor on the consumer.
pub struct DataQueue {
    data: *mut u32,
    capacity: u32,
    pos: AtomicU32,
    /// Cursor value when the open batch started; -1 outside a batch.
    batch_start: AtomicI64,
}

unsafe impl Send for DataQueue {}
unsafe impl Sync for DataQueue {}

impl DataQueue {
    /// View `capacity` words of payload ring at `offset` inside the arena.
    ///
    /// # Safety
    ///
    /// The range must be word-aligned and dedicated to this queue.
    pub unsafe fn attach(arena: Arena<'_>, offset: usize, capacity: u32) -> Self {
        assert!(offset % size_of::<u32>() == 0, "data queue misaligned");
        assert!(capacity > 0, "data queue capacity must be > 0");
        let data = arena.bytes(offset, capacity as usize * size_of::<u32>()) as *mut u32;
        Self {
            data,
            capacity,
            pos: AtomicU32::new(0),
            batch_start: AtomicI64::new(-1),
        }
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// This side's cursor, in words.
    #[inline]
    pub fn pos(&self) -> u32 {
        self.pos.load(Ordering::Relaxed)
    }

    #[inline]
    fn set_pos(&self, pos: u32) {
        debug_assert!(pos < self.capacity);
        self.pos.store(pos, Ordering::Relaxed);
    }

    /// Words a blob of `byte_len` occupies, length token included.
    pub fn blob_words(&self, byte_len: u32) -> u32 {
        1 + byte_len.div_ceil(4)
    }

    /// Open a batch: remember where this command's payload starts.
    pub fn begin_batch(&self) {
        self.batch_start.store(self.pos() as i64, Ordering::Relaxed);
    }

    /// Close the batch and return the final cursor (the header's
    /// `data_offset`). An empty batch yields the unchanged cursor and the
    /// consumer will skip zero words.
    pub fn end_batch(&self) -> u32 {
        self.batch_start.store(-1, Ordering::Relaxed);
        self.pos()
    }

    /// Cursor at batch open, or -1 when no batch is open.
    pub fn batch_start(&self) -> i64 {
        self.batch_start.load(Ordering::Relaxed)
    }

    /// Abandon the open batch, rolling the cursor back to its start. Used
    /// when the bridge is disabled mid-command: the partial payload must
    /// never be published.
    pub fn abandon_batch(&self) {
        let start = self.batch_start.swap(-1, Ordering::Relaxed);
        if start >= 0 {
            self.set_pos(start as u32);
        }
    }

    /// Producer: append one token.
    pub fn push_token(&self, value: u32) {
        let pos = self.pos();
        unsafe {
            std::ptr::write(self.data.add(pos as usize), value);
        }
        self.set_pos(if pos + 1 == self.capacity { 0 } else { pos + 1 });
    }

    /// Producer: append a length-framed blob, payload contiguous.
    pub fn push_bytes(&self, bytes: &[u8]) -> Result<(), QueueError> {
        let byte_len = bytes.len() as u32;
        let words = byte_len.div_ceil(4);
        if self.blob_words(byte_len) > self.capacity {
            return Err(QueueError::BlobTooLarge {
                words: self.blob_words(byte_len),
                capacity: self.capacity,
            });
        }
        self.push_token(byte_len);
        if words == 0 {
            return Ok(());
        }
        let mut pos = self.pos();
        if words > self.capacity - pos {
            // Reset on last index: payload goes entirely past the wrap.
            pos = 0;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.data.add(pos as usize) as *mut u8,
                bytes.len(),
            );
        }
        let next = pos + words;
        self.set_pos(if next >= self.capacity { 0 } else { next });
        Ok(())
    }

    /// Consumer: read one token.
    pub fn pull_token(&self) -> u32 {
        let pos = self.pos();
        let value = unsafe { std::ptr::read(self.data.add(pos as usize)) };
        self.set_pos(if pos + 1 == self.capacity { 0 } else { pos + 1 });
        value
    }

    /// Consumer: read a length-framed blob (copied out of the ring).
    pub fn pull_bytes(&self) -> Vec<u8> {
        let byte_len = self.pull_token();
        let words = byte_len.div_ceil(4);
        if words == 0 {
            return Vec::new();
        }
        let mut pos = self.pos();
        if words > self.capacity - pos {
            // Mirror the producer's reset-on-wrap placement.
            pos = 0;
        }
        let mut out = vec![0u8; byte_len as usize];
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.data.add(pos as usize) as *const u8,
                out.as_mut_ptr(),
                byte_len as usize,
            );
        }
        let next = pos + words;
        self.set_pos(if next >= self.capacity { 0 } else { next });
        out
    }

    /// Consumer: jump the cursor to the producer-stamped end-of-payload
    /// offset, skipping tokens this consumer did not understand. Returns
    /// the number of words skipped (modulo the ring size).
    pub fn skip_to(&self, data_offset: u32) -> u32 {
        let pos = self.pos();
        let target = data_offset % self.capacity;
        let skipped = if target >= pos {
            target - pos
        } else {
            self.capacity - pos + target
        };
        if skipped > 0 {
            tracing::trace!(skipped, "data queue fast-forward");
        }
        self.set_pos(target);
        skipped
    }
}
