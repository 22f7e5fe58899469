//! Byte-offset access into a bridge arena.
//!
//! Every shared structure lives at a fixed offset inside a named mapping,
//! and the two processes map that object at different base addresses, so
//! nothing stored in shared memory is ever a pointer; all access goes
//! through offset arithmetic here. The accessor carries the arena's
//! object name so a corrupted offset in, say, the device channel names
//! the device channel when it trips.
//!
//! Two access modes mirror the arena lifecycle: `init_at` hands the
//! creator a mutable view for one-time setup of a zeroed mapping, and
//! `shared` hands either side an immutable view whose interior mutability
//! (atomics) carries all later cross-process traffic.

use core::mem::{align_of, size_of};

/// A view of one mapped bridge arena, addressed by byte offset.
#[derive(Clone, Copy)]
pub struct Arena<'a> {
    base: *mut u8,
    len: usize,
    name: &'a str,
}

impl<'a> Arena<'a> {
    /// # Safety
    ///
    /// `base` must be valid for `len` bytes for the lifetime `'a` and come
    /// from a mapping (page alignment is assumed for the structures placed
    /// at 64-byte offsets).
    pub(crate) unsafe fn new(base: *mut u8, len: usize, name: &'a str) -> Self {
        assert!(!base.is_null(), "arena {name} mapped at a null base");
        Self { base, len, name }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.name
    }

    /// Pointer to `len` bytes at `offset`. The whole range must lie inside
    /// the arena, not just its first byte; a queue or heap run that would
    /// poke past the mapping is a corrupted offset, and the panic names
    /// the arena it happened in.
    pub fn bytes(&self, offset: usize, len: usize) -> *mut u8 {
        let end = offset.checked_add(len).unwrap_or(usize::MAX);
        assert!(
            end <= self.len,
            "range {offset}+{len} escapes arena {} ({} bytes)",
            self.name,
            self.len
        );
        unsafe { self.base.add(offset) }
    }

    fn check_layout<T>(&self, offset: usize) {
        assert!(
            offset % align_of::<T>() == 0,
            "offset {offset} in arena {} is misaligned for {}",
            self.name,
            std::any::type_name::<T>()
        );
    }

    /// Shared structure at `offset`. Range and alignment are checked; the
    /// caller vouches for the type.
    ///
    /// # Safety
    ///
    /// The bytes at `offset` must hold a valid `T` placed there by this
    /// process's `init_at` or by the peer following the same layout.
    pub unsafe fn shared<T>(&self, offset: usize) -> &'a T {
        self.check_layout::<T>(offset);
        unsafe { &*(self.bytes(offset, size_of::<T>()) as *const T) }
    }

    /// Mutable structure view for one-time initialization by the arena's
    /// creator.
    ///
    /// # Safety
    ///
    /// The mapping must be freshly created (zeroed) and not yet visible to
    /// the peer; no other view of this offset may exist during the call.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn init_at<T>(&self, offset: usize) -> &'a mut T {
        self.check_layout::<T>(offset);
        unsafe { &mut *(self.bytes(offset, size_of::<T>()) as *mut T) }
    }
}

/// Anonymous shared mapping standing in for a named arena in unit tests,
/// where both ring endpoints live in one process.
#[cfg(test)]
pub(crate) use test_arena::AnonArena;

#[cfg(test)]
mod test_arena {
    use super::Arena;

    pub(crate) struct AnonArena {
        base: *mut u8,
        len: usize,
        #[cfg(windows)]
        mapping: windows_sys::Win32::Foundation::HANDLE,
    }

    impl AnonArena {
        #[cfg(unix)]
        pub(crate) fn new(len: usize) -> Self {
            let base = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            assert!(base != libc::MAP_FAILED, "anonymous test mapping failed");
            Self {
                base: base as *mut u8,
                len,
            }
        }

        #[cfg(windows)]
        pub(crate) fn new(len: usize) -> Self {
            use windows_sys::Win32::Foundation::INVALID_HANDLE_VALUE;
            use windows_sys::Win32::System::Memory::{
                CreateFileMappingW, MapViewOfFile, FILE_MAP_ALL_ACCESS, PAGE_READWRITE,
            };
            let mapping = unsafe {
                CreateFileMappingW(
                    INVALID_HANDLE_VALUE,
                    std::ptr::null(),
                    PAGE_READWRITE,
                    (len as u64 >> 32) as u32,
                    len as u32,
                    std::ptr::null(),
                )
            };
            assert!(!mapping.is_null(), "anonymous test mapping failed");
            let view = unsafe { MapViewOfFile(mapping, FILE_MAP_ALL_ACCESS, 0, 0, len) };
            assert!(!view.Value.is_null(), "anonymous test view failed");
            Self {
                base: view.Value as *mut u8,
                len,
                mapping,
            }
        }

        pub(crate) fn arena(&self) -> Arena<'_> {
            self.arena_named("test")
        }

        pub(crate) fn arena_named<'a>(&'a self, name: &'a str) -> Arena<'a> {
            unsafe { Arena::new(self.base, self.len, name) }
        }
    }

    impl Drop for AnonArena {
        fn drop(&mut self) {
            #[cfg(unix)]
            unsafe {
                libc::munmap(self.base as *mut libc::c_void, self.len);
            }
            #[cfg(windows)]
            unsafe {
                use windows_sys::Win32::Foundation::CloseHandle;
                use windows_sys::Win32::System::Memory::{
                    UnmapViewOfFile, MEMORY_MAPPED_VIEW_ADDRESS,
                };
                UnmapViewOfFile(MEMORY_MAPPED_VIEW_ADDRESS {
                    Value: self.base as *mut _,
                });
                CloseHandle(self.mapping);
            }
        }
    }
}
