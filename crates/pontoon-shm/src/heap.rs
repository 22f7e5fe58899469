//! The shared heap: out-of-band storage for large resource payloads.
//!
//! Bulk data (vertex/index buffers, texture uploads) would swamp the data
//! queue, so it goes into dedicated shared segments instead and only an
//! allocation id rides the queue (`Flags::DATA_IN_HEAP`).
//!
//! Geometry: the heap is a growable list of equal-sized segments, each its
//! own named mapping, subdivided into fixed-size chunks. An allocation is
//! a contiguous chunk run inside one segment, named by a client-minted
//! `AllocId` that is never reused.
//!
//! Synchronization: the free-chunk bitmap at the head of each segment is
//! shared; the client sets bits when allocating, the server clears them
//! when it processes the matching `SharedHeapDealloc` command. Command
//! ordering does the rest: an id is used only between its Alloc and
//! Dealloc commands, so no locking beyond the atomic bitmap is needed.
//! The id → run table is process-local on both sides.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use pontoon_core::session::{object_name, ObjectRole, SessionGuid};
use pontoon_core::{BridgeError, Result};

use crate::mmap_impl::ShmFile;

pub type AllocId = u32;

/// Id 0 is never allocated.
pub const INVALID_ALLOC_ID: AllocId = 0;

const SEGMENT_MAGIC: [u8; 8] = *b"PONTOHP\x01";
const SEGMENT_META_HEADER: usize = 64;

/// Location of an allocation: a chunk run inside one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocRun {
    pub segment: u32,
    pub first_chunk: u32,
    pub chunk_count: u32,
}

#[repr(C)]
struct SegmentMeta {
    magic: [u8; 8],
    chunk_size: u32,
    chunk_count: u32,
    _pad: [u8; 48],
}

const _: () = assert!(core::mem::size_of::<SegmentMeta>() == SEGMENT_META_HEADER);

/// One mapped heap segment: metadata page(s) with the chunk bitmap,
/// followed by the chunk data.
struct HeapSegment {
    shm: ShmFile,
    chunk_size: u32,
    chunk_count: u32,
    data_offset: usize,
}

fn meta_size(chunk_count: u32) -> usize {
    let bitmap_bytes = (chunk_count as usize).div_ceil(64) * 8;
    (SEGMENT_META_HEADER + bitmap_bytes).next_multiple_of(4096)
}

fn mapping_size(segment_bytes: u32, chunk_size: u32) -> usize {
    let chunk_count = segment_bytes / chunk_size;
    meta_size(chunk_count) + chunk_count as usize * chunk_size as usize
}

impl HeapSegment {
    fn create(name: &str, segment_bytes: u32, chunk_size: u32) -> Result<Self> {
        let chunk_count = segment_bytes / chunk_size;
        let data_offset = meta_size(chunk_count);
        let shm = ShmFile::create(name, mapping_size(segment_bytes, chunk_size))?;

        let meta = unsafe { shm.arena().init_at::<SegmentMeta>(0) };
        meta.magic = SEGMENT_MAGIC;
        meta.chunk_size = chunk_size;
        meta.chunk_count = chunk_count;
        meta._pad = [0; 48];

        Ok(Self {
            shm,
            chunk_size,
            chunk_count,
            data_offset,
        })
    }

    fn open(name: &str, segment_bytes: u32, chunk_size: u32) -> Result<Self> {
        let chunk_count = segment_bytes / chunk_size;
        let data_offset = meta_size(chunk_count);
        let shm = ShmFile::open(name, mapping_size(segment_bytes, chunk_size))?;

        let meta = unsafe { shm.arena().shared::<SegmentMeta>(0) };
        if meta.magic != SEGMENT_MAGIC {
            return Err(BridgeError::protocol(format!("bad heap segment magic in {name}")));
        }
        if meta.chunk_size != chunk_size || meta.chunk_count != chunk_count {
            return Err(BridgeError::protocol(format!(
                "heap segment geometry mismatch in {name}: {}x{} vs {}x{}",
                meta.chunk_count, meta.chunk_size, chunk_count, chunk_size
            )));
        }

        Ok(Self {
            shm,
            chunk_size,
            chunk_count,
            data_offset,
        })
    }

    fn bitmap_word(&self, word: usize) -> &AtomicU64 {
        unsafe {
            self.shm
                .arena()
                .shared::<AtomicU64>(SEGMENT_META_HEADER + word * 8)
        }
    }

    fn chunk_used(&self, chunk: u32) -> bool {
        let word = self.bitmap_word(chunk as usize / 64);
        word.load(Ordering::Acquire) & (1u64 << (chunk % 64)) != 0
    }

    fn mark_run(&self, first: u32, count: u32, used: bool) {
        for chunk in first..first + count {
            let word = self.bitmap_word(chunk as usize / 64);
            let bit = 1u64 << (chunk % 64);
            if used {
                word.fetch_or(bit, Ordering::AcqRel);
            } else {
                word.fetch_and(!bit, Ordering::AcqRel);
            }
        }
    }

    /// Find a contiguous free run, first-fit. The caller is the single
    /// allocating process, so scan-then-set does not race another setter.
    fn find_free_run(&self, count: u32) -> Option<u32> {
        let mut run_start = 0u32;
        let mut run_len = 0u32;
        for chunk in 0..self.chunk_count {
            if self.chunk_used(chunk) {
                run_len = 0;
                run_start = chunk + 1;
            } else {
                run_len += 1;
                if run_len == count {
                    return Some(run_start);
                }
            }
        }
        None
    }

    /// Pointer to a chunk run, with the entire run validated against the
    /// mapping.
    fn run_ptr(&self, first_chunk: u32, run_bytes: usize) -> *mut u8 {
        self.shm.arena().bytes(
            self.data_offset + first_chunk as usize * self.chunk_size as usize,
            run_bytes,
        )
    }

    fn free_chunks(&self) -> u32 {
        (0..self.chunk_count).filter(|&c| !self.chunk_used(c)).count() as u32
    }
}

/// Whether this endpoint creates segments (client) or attaches to them
/// (server).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeapRole {
    Allocator,
    Mirror,
}

struct SegmentSlot {
    size: u32,
    mapped: Option<HeapSegment>,
}

/// One process's view of the shared heap.
pub struct SharedHeap {
    guid: SessionGuid,
    chunk_size: u32,
    default_segment_size: u32,
    role: HeapRole,
    segments: Vec<SegmentSlot>,
    allocs: HashMap<AllocId, AllocRun>,
    next_id: AllocId,
}

impl SharedHeap {
    /// Client side: create the heap with its first segment.
    pub fn create(guid: SessionGuid, chunk_size: u32, default_segment_size: u32) -> Result<Self> {
        let mut heap = Self {
            guid,
            chunk_size,
            default_segment_size,
            role: HeapRole::Allocator,
            segments: Vec::new(),
            allocs: HashMap::new(),
            next_id: 1,
        };
        heap.add_segment()?;
        Ok(heap)
    }

    /// Server side: register the first segment; mappings attach on first
    /// use.
    pub fn open(guid: SessionGuid, chunk_size: u32, default_segment_size: u32) -> Self {
        Self {
            guid,
            chunk_size,
            default_segment_size,
            role: HeapRole::Mirror,
            segments: vec![SegmentSlot {
                size: default_segment_size,
                mapped: None,
            }],
            allocs: HashMap::new(),
            next_id: 1,
        }
    }

    fn segment_name(guid: SessionGuid, index: usize) -> String {
        object_name(guid, ObjectRole::Heap, &format!("seg{index}"))
    }

    /// Chunks needed for `nbytes`.
    pub fn chunks_for(&self, nbytes: u32) -> u32 {
        nbytes.div_ceil(self.chunk_size).max(1)
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    fn ensure_mapped(&mut self, index: usize) -> Result<&HeapSegment> {
        if index >= self.segments.len() {
            return Err(BridgeError::protocol(format!(
                "heap segment {index} referenced before registration"
            )));
        }
        let slot = &mut self.segments[index];
        if slot.mapped.is_none() {
            let name = Self::segment_name(self.guid, index);
            let segment = match self.role {
                HeapRole::Allocator => HeapSegment::create(&name, slot.size, self.chunk_size)?,
                HeapRole::Mirror => HeapSegment::open(&name, slot.size, self.chunk_size)?,
            };
            slot.mapped = Some(segment);
        }
        Ok(self.segments[index]
            .mapped
            .as_ref()
            .expect("segment mapped just above"))
    }

    /// Client: grow the heap by one default-sized segment. Returns the new
    /// segment's index and size so the caller can emit `SharedHeapAddSeg`.
    pub fn add_segment(&mut self) -> Result<(u32, u32)> {
        let index = self.segments.len();
        let size = self.default_segment_size;
        self.segments.push(SegmentSlot { size, mapped: None });
        self.ensure_mapped(index)?;
        tracing::info!(index, size, "added shared heap segment");
        Ok((index as u32, size))
    }

    /// Server: learn about a segment the client created. The mapping is
    /// attached on first use.
    pub fn register_segment(&mut self, size: u32) {
        self.segments.push(SegmentSlot { size, mapped: None });
        tracing::debug!(index = self.segments.len() - 1, size, "registered shared heap segment");
    }

    /// Client: allocate a chunk run, without waiting or growing. `None`
    /// means no segment currently has a large enough free run.
    pub fn try_allocate(&mut self, nbytes: u32) -> Option<(AllocId, AllocRun)> {
        let chunks = self.chunks_for(nbytes);
        for index in 0..self.segments.len() {
            let first_chunk = {
                // A segment that fails to map is skipped, not fatal here.
                let Ok(segment) = self.ensure_mapped(index) else {
                    continue;
                };
                match segment.find_free_run(chunks) {
                    Some(first) => {
                        segment.mark_run(first, chunks, true);
                        first
                    }
                    None => continue,
                }
            };
            let id = self.next_id;
            self.next_id += 1;
            let run = AllocRun {
                segment: index as u32,
                first_chunk,
                chunk_count: chunks,
            };
            self.allocs.insert(id, run);
            return Some((id, run));
        }
        None
    }

    /// Client: allocate, waiting up to `wait` for in-flight deallocations
    /// to free chunks. Growth is the caller's decision (it has to emit the
    /// AddSeg command), so this does not add segments.
    pub fn allocate_waiting(&mut self, nbytes: u32, wait: Duration) -> Option<(AllocId, AllocRun)> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(found) = self.try_allocate(nbytes) {
                return Some(found);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Client: forget an allocation when emitting its Dealloc command. The
    /// bitmap bits stay set until the server processes the command, which
    /// guarantees no reuse while reads may still be in flight.
    pub fn release(&mut self, id: AllocId) -> Option<AllocRun> {
        self.allocs.remove(&id)
    }

    /// Server: bind an id to its run (SharedHeapAlloc).
    pub fn apply_alloc(&mut self, id: AllocId, run: AllocRun) {
        self.allocs.insert(id, run);
    }

    /// Server: free an allocation (SharedHeapDealloc). Clears the shared
    /// bitmap, returning the chunks to the allocator.
    pub fn apply_dealloc(&mut self, id: AllocId) -> Result<()> {
        let run = self
            .allocs
            .remove(&id)
            .ok_or_else(|| BridgeError::protocol(format!("dealloc of unknown heap id {id}")))?;
        let segment = self.ensure_mapped(run.segment as usize)?;
        segment.mark_run(run.first_chunk, run.chunk_count, false);
        Ok(())
    }

    pub fn run_of(&self, id: AllocId) -> Option<AllocRun> {
        self.allocs.get(&id).copied()
    }

    /// Base pointer and byte length of an allocation in this process.
    pub fn buf(&mut self, id: AllocId) -> Result<(*mut u8, usize)> {
        let run = self
            .run_of(id)
            .ok_or_else(|| BridgeError::protocol(format!("unknown heap id {id}")))?;
        let run_bytes = run.chunk_count as usize * self.chunk_size as usize;
        let segment = self.ensure_mapped(run.segment as usize)?;
        Ok((segment.run_ptr(run.first_chunk, run_bytes), run_bytes))
    }

    /// Copy `bytes` into an allocation at `offset`.
    pub fn write(&mut self, id: AllocId, offset: usize, bytes: &[u8]) -> Result<()> {
        let (ptr, len) = self.buf(id)?;
        if offset + bytes.len() > len {
            return Err(BridgeError::protocol(format!(
                "heap write out of bounds: {}+{} > {len}",
                offset,
                bytes.len()
            )));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.add(offset), bytes.len());
        }
        Ok(())
    }

    /// Copy `len` bytes out of an allocation at `offset`.
    pub fn read(&mut self, id: AllocId, offset: usize, len: usize) -> Result<Vec<u8>> {
        let (ptr, total) = self.buf(id)?;
        if offset + len > total {
            return Err(BridgeError::protocol(format!(
                "heap read out of bounds: {offset}+{len} > {total}"
            )));
        }
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.add(offset), out.as_mut_ptr(), len);
        }
        Ok(out)
    }

    /// Free chunks in the first mapped segment (diagnostics/tests).
    pub fn free_chunks(&mut self, segment: u32) -> Result<u32> {
        Ok(self.ensure_mapped(segment as usize)?.free_chunks())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    const CHUNK: u32 = 4096;
    const SEGMENT: u32 = 64 * CHUNK;

    fn test_guid() -> SessionGuid {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        SessionGuid::parse(&format!("{:016x}-{:016x}", std::process::id() as u64 + 7, n)).unwrap()
    }

    fn heap_pair() -> (SharedHeap, SharedHeap) {
        let guid = test_guid();
        let client = SharedHeap::create(guid, CHUNK, SEGMENT).unwrap();
        let server = SharedHeap::open(guid, CHUNK, SEGMENT);
        (client, server)
    }

    #[test]
    fn ten_kib_takes_three_chunks() {
        let (mut client, _server) = heap_pair();
        let (id, run) = client.try_allocate(10 << 10).unwrap();
        assert_eq!(id, 1);
        assert_eq!(run.chunk_count, 3);
        assert_eq!(run.segment, 0);
    }

    #[test]
    fn ids_are_monotonic_and_never_reused() {
        let (mut client, _server) = heap_pair();
        let (a, _) = client.try_allocate(1).unwrap();
        let (b, _) = client.try_allocate(1).unwrap();
        client.release(a);
        let (c, _) = client.try_allocate(1).unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn bytes_cross_the_mappings() {
        let (mut client, mut server) = heap_pair();
        let (id, run) = client.try_allocate(8192).unwrap();
        client.write(id, 100, b"geometry payload").unwrap();

        server.apply_alloc(id, run);
        let bytes = server.read(id, 100, 16).unwrap();
        assert_eq!(&bytes, b"geometry payload");
    }

    #[test]
    fn dealloc_returns_chunks_to_bitmap() {
        let (mut client, mut server) = heap_pair();
        let before = client.free_chunks(0).unwrap();
        let (id, run) = client.try_allocate(10 << 10).unwrap();
        server.apply_alloc(id, run);
        assert_eq!(client.free_chunks(0).unwrap(), before - 3);

        client.release(id);
        server.apply_dealloc(id).unwrap();
        assert_eq!(client.free_chunks(0).unwrap(), before);
    }

    #[test]
    fn allocation_waits_for_server_dealloc() {
        let (mut client, mut server) = heap_pair();
        // Exhaust the segment.
        let (id, run) = client.try_allocate(SEGMENT).unwrap();
        server.apply_alloc(id, run);
        assert!(client.try_allocate(CHUNK).is_none());

        client.release(id);
        server.apply_dealloc(id).unwrap();
        assert!(client.try_allocate(CHUNK).is_some());
    }

    #[test]
    fn growth_adds_segment_visible_after_registration() {
        let (mut client, mut server) = heap_pair();
        let (_, _) = client.try_allocate(SEGMENT).unwrap();
        assert!(client.try_allocate(CHUNK).is_none());

        let (index, size) = client.add_segment().unwrap();
        assert_eq!(index, 1);
        assert_eq!(size, SEGMENT);
        let (id, run) = client.try_allocate(CHUNK).unwrap();
        assert_eq!(run.segment, 1);

        // Server learns about the segment (AddSeg command) and can read it.
        server.register_segment(size);
        server.apply_alloc(id, run);
        client.write(id, 0, b"grown").unwrap();
        assert_eq!(server.read(id, 0, 5).unwrap(), b"grown");
    }

    #[test]
    fn unknown_ids_are_protocol_errors() {
        let (_client, mut server) = heap_pair();
        assert!(server.apply_dealloc(42).is_err());
        assert!(server.buf(42).is_err());
    }

    #[test]
    fn out_of_bounds_access_rejected() {
        let (mut client, _server) = heap_pair();
        let (id, _) = client.try_allocate(CHUNK).unwrap();
        assert!(client.write(id, CHUNK as usize - 2, b"overflow").is_err());
        assert!(client.read(id, 0, CHUNK as usize + 1).is_err());
    }

    #[test]
    fn fragmented_segment_finds_contiguous_run() {
        let (mut client, mut server) = heap_pair();
        let mut held = Vec::new();
        for _ in 0..8 {
            held.push(client.try_allocate(CHUNK).unwrap());
        }
        // Free every other allocation; singles dominate the free space.
        for (i, (id, run)) in held.iter().enumerate() {
            server.apply_alloc(*id, *run);
            if i % 2 == 0 {
                client.release(*id);
                server.apply_dealloc(*id).unwrap();
            }
        }
        // A 3-chunk run must come from the untouched tail, not the holes.
        let (_, run) = client.try_allocate(3 * CHUNK).unwrap();
        assert!(run.first_chunk >= 8);
    }
}
