//! The command queue: a single-producer single-consumer ring of 16-byte
//! command headers in shared memory.
//!
//! The wire contract reserves command id 0 (`Invalid`): no real command
//! ever encodes to it. The ring leans on that instead of shared head and
//! tail indices. A slot whose command word is zero is free; anything else
//! is a published command. The producer claims the slot under its private
//! cursor by writing the three payload words and then the command word
//! (Release); the consumer reads the command word (Acquire), takes the
//! header, and hands the slot back by zeroing the command word again. The
//! cursors are process-local, the same discipline the data queue uses, so
//! the slots themselves are the only cross-process traffic and the ring
//! needs no shared header at all: its capacity is part of the channel
//! geometry both sides derive from configuration.
//!
//! Blocking is layered on top of the wait-free core: `push_wait`,
//! `peek_wait` and `pop_wait` spin briefly and then sleep in growing
//! slices until the deadline. A zero timeout means "no deadline".

use core::mem::size_of;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use pontoon_core::{Command, CommandHeader};

use crate::arena::Arena;

const SLOT_WORDS: usize = 4;

/// Bytes one slot occupies: exactly the wire header.
pub const SLOT_SIZE: usize = SLOT_WORDS * size_of::<u32>();

/// Bytes a ring of `capacity` slots occupies.
pub fn ring_bytes(capacity: u32) -> usize {
    capacity as usize * SLOT_SIZE
}

/// Outcome of a timed push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed,
    TimedOut,
}

/// Error returned by a non-blocking push when the consumer has not freed
/// the slot under the producer's cursor yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingFull;

/// One side's view of the command ring. The producer's instance uses the
/// cursor as its write position, the consumer's as its read position;
/// they advance in lockstep because every slot is filled and freed
/// exactly once, in order.
pub struct CmdRing {
    words: *const AtomicU32,
    capacity: u32,
    /// This side's cursor: the next slot to publish or to take.
    cursor: AtomicU32,
}

unsafe impl Send for CmdRing {}
unsafe impl Sync for CmdRing {}

impl CmdRing {
    /// View `capacity` slots at `offset` inside the arena. A freshly
    /// created (zeroed) mapping is already the initialized state: every
    /// slot reads as free.
    ///
    /// # Safety
    ///
    /// The range must be dedicated to this ring, and at most one producer
    /// instance and one consumer instance may exist per session.
    pub unsafe fn attach(arena: Arena<'_>, offset: usize, capacity: u32) -> Self {
        assert!(capacity >= 2, "command ring needs at least 2 slots");
        assert!(offset % 64 == 0, "command ring must start on a cache line");
        let words = arena.bytes(offset, ring_bytes(capacity)) as *const AtomicU32;
        Self {
            words,
            capacity,
            cursor: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[inline]
    fn word(&self, slot: u32, word: usize) -> &AtomicU32 {
        debug_assert!(slot < self.capacity && word < SLOT_WORDS);
        unsafe { &*self.words.add(slot as usize * SLOT_WORDS + word) }
    }

    #[inline]
    fn advance(&self, slot: u32) -> u32 {
        if slot + 1 == self.capacity {
            0
        } else {
            slot + 1
        }
    }

    /// Producer: publish one header. Fails when the slot under the cursor
    /// is still occupied, meaning the consumer is a full ring behind.
    pub fn try_push(&self, cmd: CommandHeader) -> Result<(), RingFull> {
        assert!(
            cmd.command != Command::Invalid,
            "Invalid is not a wire command; the zero id marks free slots"
        );
        let slot = self.cursor.load(Ordering::Relaxed);
        // Pairs with the consumer's zeroing store: only once we observe
        // the zero are the payload words ours to overwrite.
        if self.word(slot, 0).load(Ordering::Acquire) != 0 {
            return Err(RingFull);
        }
        let words = cmd.to_words();
        self.word(slot, 1).store(words[1], Ordering::Relaxed);
        self.word(slot, 2).store(words[2], Ordering::Relaxed);
        self.word(slot, 3).store(words[3], Ordering::Relaxed);
        // The nonzero command word is the publication.
        self.word(slot, 0).store(words[0], Ordering::Release);
        self.cursor.store(self.advance(slot), Ordering::Relaxed);
        Ok(())
    }

    /// Consumer: read the header under the cursor without taking it.
    pub fn peek(&self) -> Option<CommandHeader> {
        let slot = self.cursor.load(Ordering::Relaxed);
        let command = self.word(slot, 0).load(Ordering::Acquire);
        if command == 0 {
            return None;
        }
        Some(CommandHeader::from_words([
            command,
            self.word(slot, 1).load(Ordering::Relaxed),
            self.word(slot, 2).load(Ordering::Relaxed),
            self.word(slot, 3).load(Ordering::Relaxed),
        ]))
    }

    /// Consumer: take the header under the cursor and free its slot.
    pub fn try_pop(&self) -> Option<CommandHeader> {
        let slot = self.cursor.load(Ordering::Relaxed);
        let command = self.word(slot, 0).load(Ordering::Acquire);
        if command == 0 {
            return None;
        }
        let header = CommandHeader::from_words([
            command,
            self.word(slot, 1).load(Ordering::Relaxed),
            self.word(slot, 2).load(Ordering::Relaxed),
            self.word(slot, 3).load(Ordering::Relaxed),
        ]);
        // Hand the slot back; the release orders our payload reads before
        // the producer's next claim of this slot.
        self.word(slot, 0).store(0, Ordering::Release);
        self.cursor.store(self.advance(slot), Ordering::Relaxed);
        Some(header)
    }

    /// Published-but-unconsumed commands, counted by scanning the slots.
    /// Diagnostics and teardown draining only; the hot paths never need a
    /// count.
    pub fn len(&self) -> usize {
        (0..self.capacity)
            .filter(|&slot| self.word(slot, 0).load(Ordering::Acquire) != 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Producer: push with a deadline. Zero timeout = no deadline.
    pub fn push_wait(&self, cmd: CommandHeader, timeout: Duration) -> PushOutcome {
        let mut backoff = Backoff::new(timeout);
        loop {
            if self.try_push(cmd).is_ok() {
                return PushOutcome::Pushed;
            }
            if !backoff.wait() {
                return PushOutcome::TimedOut;
            }
        }
    }

    /// Consumer: peek with a deadline. `None` = timed out.
    pub fn peek_wait(&self, timeout: Duration) -> Option<CommandHeader> {
        let mut backoff = Backoff::new(timeout);
        loop {
            if let Some(cmd) = self.peek() {
                return Some(cmd);
            }
            if !backoff.wait() {
                return None;
            }
        }
    }

    /// Consumer: pop with a deadline. `None` = timed out.
    pub fn pop_wait(&self, timeout: Duration) -> Option<CommandHeader> {
        let mut backoff = Backoff::new(timeout);
        loop {
            if let Some(cmd) = self.try_pop() {
                return Some(cmd);
            }
            if !backoff.wait() {
                return None;
            }
        }
    }
}

/// Spin-then-sleep backoff with an optional deadline.
struct Backoff {
    deadline: Option<Instant>,
    spins: u32,
    sleep: Duration,
}

impl Backoff {
    fn new(timeout: Duration) -> Self {
        Self {
            deadline: (!timeout.is_zero()).then(|| Instant::now() + timeout),
            spins: 0,
            sleep: Duration::from_micros(50),
        }
    }

    /// One backoff step. Returns false once the deadline has passed.
    fn wait(&mut self) -> bool {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return false;
            }
        }
        if self.spins < 64 {
            self.spins += 1;
            std::hint::spin_loop();
            std::thread::yield_now();
        } else {
            std::thread::sleep(self.sleep);
            self.sleep = (self.sleep * 2).min(Duration::from_millis(1));
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::AnonArena;
    use pontoon_core::Flags;

    /// Producer and consumer endpoints over one shared backing, the way
    /// the two processes each attach their own instance.
    fn ring_pair(capacity: u32) -> (AnonArena, CmdRing, CmdRing) {
        let backing = AnonArena::new(ring_bytes(capacity));
        let producer = unsafe { CmdRing::attach(backing.arena(), 0, capacity) };
        let consumer = unsafe { CmdRing::attach(backing.arena(), 0, capacity) };
        (backing, producer, consumer)
    }

    fn header(handle: u32) -> CommandHeader {
        CommandHeader::new(Command::Api(0x100), Flags::empty(), 0, handle)
    }

    #[test]
    fn slot_is_exactly_the_wire_header() {
        assert_eq!(SLOT_SIZE, pontoon_core::COMMAND_HEADER_SIZE);
        assert_eq!(ring_bytes(8), 8 * 16);
    }

    #[test]
    fn fifo_order() {
        let (_backing, producer, consumer) = ring_pair(8);
        for i in 0..5 {
            producer.try_push(header(i)).unwrap();
        }
        for i in 0..5 {
            assert_eq!(consumer.try_pop().unwrap().handle, i);
        }
        assert!(consumer.try_pop().is_none());
    }

    #[test]
    fn peek_does_not_consume() {
        let (_backing, producer, consumer) = ring_pair(4);
        producer.try_push(header(7)).unwrap();
        assert_eq!(consumer.peek().unwrap().handle, 7);
        assert_eq!(consumer.peek().unwrap().handle, 7);
        assert_eq!(consumer.try_pop().unwrap().handle, 7);
        assert!(consumer.peek().is_none());
    }

    #[test]
    fn full_ring_rejects_push_until_a_slot_frees() {
        let (_backing, producer, consumer) = ring_pair(4);
        for i in 0..4 {
            producer.try_push(header(i)).unwrap();
        }
        assert_eq!(producer.try_push(header(99)), Err(RingFull));
        assert_eq!(producer.len(), 4);

        // Freeing the oldest slot admits exactly one more.
        consumer.try_pop().unwrap();
        producer.try_push(header(99)).unwrap();
        assert_eq!(producer.try_push(header(100)), Err(RingFull));
    }

    #[test]
    #[should_panic(expected = "Invalid is not a wire command")]
    fn pushing_the_reserved_id_panics() {
        let (_backing, producer, _consumer) = ring_pair(4);
        let _ = producer.try_push(CommandHeader::default());
    }

    #[test]
    fn push_wait_times_out_when_full() {
        let (_backing, producer, _consumer) = ring_pair(2);
        producer.try_push(header(0)).unwrap();
        producer.try_push(header(1)).unwrap();
        let started = Instant::now();
        let outcome = producer.push_wait(header(2), Duration::from_millis(20));
        assert_eq!(outcome, PushOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn push_wait_succeeds_after_drain() {
        let (_backing, producer, consumer) = ring_pair(2);
        producer.try_push(header(0)).unwrap();
        producer.try_push(header(1)).unwrap();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                std::thread::sleep(Duration::from_millis(10));
                consumer.try_pop().unwrap();
            });
            let outcome = producer.push_wait(header(2), Duration::from_secs(2));
            assert_eq!(outcome, PushOutcome::Pushed);
        });
    }

    #[test]
    fn pop_wait_times_out_when_empty() {
        let (_backing, _producer, consumer) = ring_pair(2);
        assert!(consumer.pop_wait(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn wraparound_many_rounds() {
        // Capacity 4 (no power-of-two requirement; try an odd size too).
        for capacity in [4u32, 5] {
            let (_backing, producer, consumer) = ring_pair(capacity);
            for round in 0..10u32 {
                for i in 0..3 {
                    producer.try_push(header(round * 10 + i)).unwrap();
                }
                for i in 0..3 {
                    assert_eq!(consumer.try_pop().unwrap().handle, round * 10 + i);
                }
            }
        }
    }

    #[test]
    fn all_header_fields_cross_intact() {
        let (_backing, producer, consumer) = ring_pair(4);
        let sent = CommandHeader::new(
            Command::Terminate,
            Flags::DATA_IN_HEAP.union(Flags::DATA_RESERVED),
            0xDEAD_BEEF,
            0x1234,
        );
        producer.try_push(sent).unwrap();
        assert_eq!(consumer.try_pop().unwrap(), sent);
    }

    #[test]
    fn late_attaching_consumer_sees_pending_commands() {
        let backing = AnonArena::new(ring_bytes(8));
        let producer = unsafe { CmdRing::attach(backing.arena(), 0, 8) };
        producer.try_push(header(3)).unwrap();

        // The server attaches after the client already queued commands.
        let consumer = unsafe { CmdRing::attach(backing.arena(), 0, 8) };
        assert_eq!(consumer.capacity(), 8);
        assert_eq!(consumer.try_pop().unwrap().handle, 3);
        assert!(consumer.is_empty());
    }
}
