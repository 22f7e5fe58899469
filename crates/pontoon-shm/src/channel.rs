//! The IPC channel: one shared arena binding a command ring, a data queue,
//! the sync scalars, and a named data semaphore.
//!
//! Arena layout (all offsets 64-byte aligned):
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ ChannelHeader (128 bytes)                                │
//! │   magic, layout version, geometry                        │
//! │   client/server process states                           │
//! │   sync scalars (consumer pos, expected pos, wrap flag)   │
//! ├──────────────────────────────────────────────────────────┤
//! │ Command slots (cap × 16, no ring header)                 │
//! ├──────────────────────────────────────────────────────────┤
//! │ Data queue words (cap × 4)                               │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! A session uses three of these: control and device (client → server) and
//! response (server → client). The client creates all three before the
//! server is spawned; the server attaches during handshake.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::Duration;

use pontoon_core::session::{object_name, ObjectRole, SessionGuid};
use pontoon_core::state::StateCell;
use pontoon_core::{BridgeError, ProcessState, Result};

use crate::cmd_ring::{ring_bytes, CmdRing};
use crate::data_queue::DataQueue;
use crate::mmap_impl::ShmFile;
use crate::semaphore::NamedSemaphore;

pub const CHANNEL_MAGIC: [u8; 8] = *b"PONTOON\x01";
pub const CHANNEL_LAYOUT_VERSION: u32 = 1;
pub const CHANNEL_HEADER_SIZE: usize = 128;

/// Data-queue synchronization scalars (one cache line).
///
/// `consumer_pos` is the consumer's cursor as of its last completed
/// command, -1 before the first publish. `producer_expected` is the
/// position the producer is waiting for the consumer to pass, -1 when no
/// overrun is pending. `wrap_pending` is set when the consumer must wrap
/// around the ring before the comparison against `producer_expected` is
/// meaningful.
#[repr(C)]
pub struct ChannelSync {
    pub consumer_pos: AtomicI64,
    pub producer_expected: AtomicI64,
    pub wrap_pending: AtomicU32,
    _pad: [u8; 44],
}

const _: () = assert!(core::mem::size_of::<ChannelSync>() == 64);

impl ChannelSync {
    fn init(&mut self) {
        self.consumer_pos = AtomicI64::new(-1);
        self.producer_expected = AtomicI64::new(-1);
        self.wrap_pending = AtomicU32::new(0);
        self._pad = [0; 44];
    }
}

/// Arena header at offset 0.
#[repr(C)]
pub struct ChannelHeader {
    pub magic: [u8; 8],
    pub layout_version: u32,
    pub header_size: u32,
    pub cmd_capacity: u32,
    pub data_capacity: u32,
    pub client_state: StateCell,
    pub server_state: StateCell,
    _pad0: [u8; 32],
    pub sync: ChannelSync,
}

const _: () = assert!(core::mem::size_of::<ChannelHeader>() == CHANNEL_HEADER_SIZE);

impl ChannelHeader {
    fn validate(&self, geometry: ChannelGeometry) -> Result<()> {
        if self.magic != CHANNEL_MAGIC {
            return Err(BridgeError::handshake("bad channel magic"));
        }
        if self.layout_version != CHANNEL_LAYOUT_VERSION {
            return Err(BridgeError::handshake(format!(
                "channel layout version {} != {}",
                self.layout_version, CHANNEL_LAYOUT_VERSION
            )));
        }
        if self.cmd_capacity != geometry.cmd_capacity
            || self.data_capacity != geometry.data_words
        {
            return Err(BridgeError::handshake(format!(
                "channel geometry mismatch: peer {}x{}, ours {}x{}",
                self.cmd_capacity, self.data_capacity, geometry.cmd_capacity, geometry.data_words
            )));
        }
        Ok(())
    }
}

/// Which end of a (unidirectional) channel this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelSide {
    Producer,
    Consumer,
}

/// Ring and queue sizing, normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelGeometry {
    pub cmd_capacity: u32,
    pub data_words: u32,
}

impl ChannelGeometry {
    /// Normalize a configured geometry: command capacity is rounded up to
    /// a power of two, the data queue to whole words with a small floor.
    pub fn new(cmd_capacity: u32, data_bytes: u32) -> Self {
        Self {
            cmd_capacity: cmd_capacity.max(2).next_power_of_two(),
            data_words: (data_bytes / 4).max(64),
        }
    }

    /// Like [`ChannelGeometry::new`], additionally clamped so the whole
    /// arena fits the configured channel memory budget. Both endpoints
    /// derive geometry from the same options, so the clamp is
    /// deterministic across the process boundary.
    pub fn with_budget(cmd_capacity: u32, data_bytes: u32, mem_bytes: u32) -> Self {
        let mut geometry = Self::new(cmd_capacity, data_bytes);
        let fixed = geometry.data_offset();
        let budget = mem_bytes as usize;
        if geometry.arena_size() > budget {
            let available_words = budget.saturating_sub(fixed) / 4;
            let clamped = (available_words as u32).max(64);
            tracing::warn!(
                requested = geometry.data_words,
                clamped,
                "data queue does not fit the channel memory budget"
            );
            geometry.data_words = clamped;
        }
        geometry
    }

    fn cmd_slots_offset(self) -> usize {
        CHANNEL_HEADER_SIZE
    }

    fn data_offset(self) -> usize {
        let end = self.cmd_slots_offset() + ring_bytes(self.cmd_capacity);
        end.next_multiple_of(64)
    }

    /// Total arena size in bytes.
    pub fn arena_size(self) -> usize {
        self.data_offset() + self.data_words as usize * 4
    }
}

/// Outcome of the producer-side data sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// No overrun possible; write may proceed.
    Clear,
    /// An overrun was pending and the consumer released us.
    Resolved,
    /// The consumer did not release us within the budget.
    TimedOut,
    /// The command's own batch is larger than the consumer's reachable
    /// headroom; the bridge cannot transmit it. Fatal.
    BatchTooLarge,
}

/// One direction of the bridge: command ring + data queue + sync + data
/// semaphore over a single named arena.
pub struct IpcChannel {
    shm: ShmFile,
    ring: CmdRing,
    data: DataQueue,
    sem: NamedSemaphore,
    side: ChannelSide,
    purpose: &'static str,
}

impl IpcChannel {
    /// Create the arena and its semaphore. Client-side; runs before the
    /// server is spawned.
    pub fn create(
        guid: SessionGuid,
        purpose: &'static str,
        geometry: ChannelGeometry,
        side: ChannelSide,
    ) -> Result<Self> {
        let shm = ShmFile::create(&object_name(guid, ObjectRole::Command, purpose), geometry.arena_size())?;
        let arena = shm.arena();

        let header = unsafe { arena.init_at::<ChannelHeader>(0) };
        header.magic = CHANNEL_MAGIC;
        header.layout_version = CHANNEL_LAYOUT_VERSION;
        header.header_size = CHANNEL_HEADER_SIZE as u32;
        header.cmd_capacity = geometry.cmd_capacity;
        header.data_capacity = geometry.data_words;
        header.sync.init();

        let ring = unsafe { CmdRing::attach(arena, geometry.cmd_slots_offset(), geometry.cmd_capacity) };
        let data = unsafe { DataQueue::attach(arena, geometry.data_offset(), geometry.data_words) };
        let sem = NamedSemaphore::create(&object_name(guid, ObjectRole::Semaphore, purpose), 0, 1)?;

        tracing::debug!(
            purpose,
            cmd_capacity = geometry.cmd_capacity,
            data_words = geometry.data_words,
            "created ipc channel"
        );
        Ok(Self {
            shm,
            ring,
            data,
            sem,
            side,
            purpose,
        })
    }

    /// Attach to an arena created by the peer and validate its layout.
    pub fn open(
        guid: SessionGuid,
        purpose: &'static str,
        geometry: ChannelGeometry,
        side: ChannelSide,
    ) -> Result<Self> {
        let shm = ShmFile::open(&object_name(guid, ObjectRole::Command, purpose), geometry.arena_size())?;
        let arena = shm.arena();

        let header = unsafe { arena.shared::<ChannelHeader>(0) };
        header.validate(geometry)?;

        let ring = unsafe { CmdRing::attach(arena, geometry.cmd_slots_offset(), geometry.cmd_capacity) };
        let data = unsafe { DataQueue::attach(arena, geometry.data_offset(), geometry.data_words) };
        let sem = NamedSemaphore::open(&object_name(guid, ObjectRole::Semaphore, purpose))?;

        tracing::debug!(purpose, "opened ipc channel");
        Ok(Self {
            shm,
            ring,
            data,
            sem,
            side,
            purpose,
        })
    }

    #[inline]
    pub fn header(&self) -> &ChannelHeader {
        unsafe { self.shm.arena().shared::<ChannelHeader>(0) }
    }

    #[inline]
    pub fn ring(&self) -> &CmdRing {
        &self.ring
    }

    #[inline]
    pub fn data(&self) -> &DataQueue {
        &self.data
    }

    #[inline]
    pub fn semaphore(&self) -> &NamedSemaphore {
        &self.sem
    }

    #[inline]
    pub fn side(&self) -> ChannelSide {
        self.side
    }

    #[inline]
    pub fn purpose(&self) -> &'static str {
        self.purpose
    }

    pub fn set_client_state(&self, state: ProcessState) {
        self.header().client_state.store(state);
    }

    pub fn set_server_state(&self, state: ProcessState) {
        self.header().server_state.store(state);
    }

    pub fn client_state(&self) -> ProcessState {
        self.header().client_state.load()
    }

    pub fn server_state(&self) -> ProcessState {
        self.header().server_state.load()
    }

    /// Producer-side overrun avoidance, run before every payload write.
    ///
    /// `words` is the projected size of the write (at least 1 is assumed),
    /// `reset_on_wrap` whether the write relocates to index 0 when it
    /// cannot fit before the end (blob placement).
    ///
    /// When the projected write would run into the region the consumer has
    /// not yet passed, the expected position is published and we block on
    /// the data semaphore until the consumer signals it (or the budget is
    /// exhausted).
    pub fn producer_sync(
        &self,
        words: u32,
        reset_on_wrap: bool,
        wait_timeout: Duration,
        retries: u32,
    ) -> SyncOutcome {
        debug_assert_eq!(self.side, ChannelSide::Producer);
        let sync = &self.header().sync;
        let total = self.data.capacity() as i64;
        let consumer = sync.consumer_pos.load(Ordering::Acquire);
        let cur = self.data.pos() as i64;
        let words = words.max(1) as i64;

        let mut expected = cur + words - 1;
        if expected >= total {
            expected = if reset_on_wrap { words - 1 } else { expected - total };
        }

        // Two ways the projected write can reach into unconsumed territory:
        // (1) the producer has already wrapped past the consumer's cursor
        //     (cur < consumer) and this write would reach it;
        // (2) both cursors are in order (cur > consumer) but the write wraps
        //     far enough to land back between the consumer and us.
        let overrun = if cur < consumer && expected >= consumer {
            // Consumer must come around the ring and pass everything up to
            // the word before our write cursor.
            let target = if cur == 0 { total - 1 } else { cur - 1 };
            sync.producer_expected.store(target, Ordering::Release);
            sync.wrap_pending.store(1, Ordering::Release);
            true
        } else if cur > consumer && expected >= consumer && expected < cur {
            // Consumer reaches the target without wrapping.
            sync.producer_expected.store(expected, Ordering::Release);
            sync.wrap_pending.store(0, Ordering::Release);
            true
        } else {
            false
        };

        if !overrun {
            return SyncOutcome::Clear;
        }

        tracing::warn!(channel = self.purpose, "data queue overrun condition triggered");

        let batch_start = self.data.batch_start();
        if batch_start >= 0 && batch_start <= sync.producer_expected.load(Ordering::Acquire) {
            tracing::error!(
                channel = self.purpose,
                "command batch larger than consumer headroom; overrun cannot be prevented"
            );
            sync.producer_expected.store(-1, Ordering::Release);
            sync.wrap_pending.store(0, Ordering::Release);
            return SyncOutcome::BatchTooLarge;
        }

        let mut attempts = 0u32;
        let resolved = loop {
            match self.sem.wait(wait_timeout) {
                Ok(true) => break true,
                Ok(false) => {
                    attempts += 1;
                    if attempts > retries {
                        break false;
                    }
                    tracing::warn!(
                        channel = self.purpose,
                        attempts,
                        "waiting on consumer to drain the data queue"
                    );
                }
                Err(err) => {
                    tracing::error!(channel = self.purpose, %err, "data semaphore wait failed");
                    break false;
                }
            }
        };

        sync.producer_expected.store(-1, Ordering::Release);
        sync.wrap_pending.store(0, Ordering::Release);

        if resolved {
            tracing::debug!(channel = self.purpose, "data queue overrun condition resolved");
            SyncOutcome::Resolved
        } else {
            tracing::error!(
                channel = self.purpose,
                "budget exhausted waiting for the consumer to free data queue space"
            );
            SyncOutcome::TimedOut
        }
    }

    /// Consumer-side position publication, run after each processed
    /// command. Signals the data semaphore exactly once when a pending
    /// overrun target has been passed.
    pub fn consumer_publish(&self) {
        debug_assert_eq!(self.side, ChannelSide::Consumer);
        let sync = &self.header().sync;
        let pos = self.data.pos() as i64;
        let prev = sync.consumer_pos.swap(pos, Ordering::AcqRel);

        // A cursor that moved backwards means we completed a loop.
        if prev >= 0 && pos < prev {
            sync.wrap_pending.store(0, Ordering::Release);
        }

        let expected = sync.producer_expected.load(Ordering::Acquire);
        if expected != -1
            && pos > expected
            && sync.wrap_pending.load(Ordering::Acquire) == 0
        {
            if let Err(err) = self.sem.release(1) {
                tracing::error!(channel = self.purpose, %err, "data semaphore release failed");
            }
            sync.producer_expected.store(-1, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32 as StdAtomicU32;

    fn test_guid() -> SessionGuid {
        static COUNTER: StdAtomicU32 = StdAtomicU32::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        SessionGuid::parse(&format!("{:016x}-{:016x}", std::process::id(), n)).unwrap()
    }

    fn channel_pair(geometry: ChannelGeometry) -> (IpcChannel, IpcChannel) {
        let guid = test_guid();
        let producer =
            IpcChannel::create(guid, "device", geometry, ChannelSide::Producer).unwrap();
        let consumer = IpcChannel::open(guid, "device", geometry, ChannelSide::Consumer).unwrap();
        (producer, consumer)
    }

    #[test]
    fn header_sizes() {
        assert_eq!(core::mem::size_of::<ChannelHeader>(), 128);
        assert_eq!(core::mem::size_of::<ChannelSync>(), 64);
    }

    #[test]
    fn geometry_normalization() {
        let g = ChannelGeometry::new(5, 1000);
        assert_eq!(g.cmd_capacity, 8);
        assert_eq!(g.data_words, 250);
        assert!(g.arena_size() > CHANNEL_HEADER_SIZE);
    }

    #[test]
    fn geometry_budget_clamps_data_queue() {
        let unclamped = ChannelGeometry::with_budget(8, 1 << 20, 8 << 20);
        assert_eq!(unclamped.data_words, (1 << 20) / 4);

        let clamped = ChannelGeometry::with_budget(8, 1 << 20, 64 << 10);
        assert!(clamped.arena_size() <= 64 << 10);
        assert!(clamped.data_words < (1 << 20) / 4);
        // Deterministic: both endpoints compute the identical clamp.
        assert_eq!(clamped, ChannelGeometry::with_budget(8, 1 << 20, 64 << 10));
    }

    #[test]
    fn create_open_and_share_commands() {
        use pontoon_core::{Command, CommandHeader, Flags};
        let (producer, consumer) = channel_pair(ChannelGeometry::new(8, 4096));

        producer
            .ring()
            .try_push(CommandHeader::new(Command::Syn, Flags::empty(), 0, 0x1234))
            .unwrap();
        let received = consumer.ring().try_pop().unwrap();
        assert_eq!(received.command, Command::Syn);
        assert_eq!(received.handle, 0x1234);
    }

    #[test]
    fn open_rejects_geometry_mismatch() {
        let guid = test_guid();
        let geometry = ChannelGeometry::new(8, 4096);
        let _producer =
            IpcChannel::create(guid, "device", geometry, ChannelSide::Producer).unwrap();
        let wrong = ChannelGeometry::new(16, 4096);
        // Arena sizes differ, so the mapping itself refuses to open; a
        // matching size with different ring split is caught by validate.
        assert!(IpcChannel::open(guid, "device", wrong, ChannelSide::Consumer).is_err());
    }

    #[test]
    fn states_are_visible_to_peer() {
        let (producer, consumer) = channel_pair(ChannelGeometry::new(4, 1024));
        producer.set_client_state(ProcessState::Handshaking);
        assert_eq!(consumer.client_state(), ProcessState::Handshaking);
        consumer.set_server_state(ProcessState::Running);
        assert_eq!(producer.server_state(), ProcessState::Running);
    }

    #[test]
    fn sync_clear_when_no_overlap() {
        let (producer, _consumer) = channel_pair(ChannelGeometry::new(4, 1024));
        // Consumer never published; producer far from wrapping.
        let outcome = producer.producer_sync(4, false, Duration::from_millis(5), 1);
        assert_eq!(outcome, SyncOutcome::Clear);
    }

    #[test]
    fn sync_wraps_and_waits_for_consumer() {
        // Capacity 256, consumer published at 0, producer at 225 about to
        // write 50 words. The write wraps to word 18; the producer
        // publishes expected=18 and blocks until the consumer passes it,
        // which releases exactly once.
        let geometry = ChannelGeometry::new(4, 1024);
        let (producer, consumer) = channel_pair(geometry);
        assert_eq!(producer.data().capacity(), 256);

        // Consumer publishes position 0.
        consumer.consumer_publish();
        assert_eq!(consumer.header().sync.consumer_pos.load(Ordering::Acquire), 0);

        // Move producer cursor to 225.
        for i in 0..225u32 {
            producer.data().push_token(i);
        }

        // Consumer drains 50 words then publishes, from another thread
        // while the producer blocks.
        std::thread::scope(|scope| {
            scope.spawn(|| {
                std::thread::sleep(Duration::from_millis(30));
                for _ in 0..50 {
                    consumer.data().pull_token();
                }
                consumer.consumer_publish();
            });

            let outcome = producer.producer_sync(50, false, Duration::from_millis(200), 5);
            assert_eq!(outcome, SyncOutcome::Resolved);
        });

        // The pending-overrun slot is cleared; no second release happened.
        let sync = &producer.header().sync;
        assert_eq!(sync.producer_expected.load(Ordering::Acquire), -1);
        assert!(!producer.semaphore().wait(Duration::from_millis(10)).unwrap());
    }

    #[test]
    fn sync_fatal_when_batch_cannot_fit() {
        let geometry = ChannelGeometry::new(4, 1024);
        let (producer, consumer) = channel_pair(geometry);

        consumer.consumer_publish(); // consumer at 0

        // Producer at 225, inside an open batch that started at 0: the
        // whole batch spans the region the consumer would have to pass.
        producer.data().begin_batch();
        for i in 0..225u32 {
            producer.data().push_token(i);
        }
        let outcome = producer.producer_sync(50, false, Duration::from_millis(5), 0);
        assert_eq!(outcome, SyncOutcome::BatchTooLarge);
    }

    #[test]
    fn sync_times_out_without_consumer() {
        let geometry = ChannelGeometry::new(4, 1024);
        let (producer, consumer) = channel_pair(geometry);

        consumer.consumer_publish();
        for i in 0..225u32 {
            producer.data().push_token(i);
        }
        // Batch starts at 225, so it is not the batch-too-large case.
        producer.data().begin_batch();
        let outcome = producer.producer_sync(50, false, Duration::from_millis(10), 1);
        assert_eq!(outcome, SyncOutcome::TimedOut);
    }
}
