//! Named shared mappings (windows).
//!
//! Uses pagefile-backed named file mappings (`CreateFileMappingW` with
//! `INVALID_HANDLE_VALUE`), which is the native way for two processes of
//! different bitness to share a region by name.

use std::ffi::OsStr;
use std::io;
use std::os::windows::ffi::OsStrExt;

use windows_sys::Win32::Foundation::{CloseHandle, GetLastError, HANDLE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::System::Memory::{
    CreateFileMappingW, MapViewOfFile, OpenFileMappingW, UnmapViewOfFile, FILE_MAP_ALL_ACCESS,
    MEMORY_MAPPED_VIEW_ADDRESS, PAGE_READWRITE,
};

use crate::arena::Arena;

const ERROR_ALREADY_EXISTS: u32 = 183;

fn wide(name: &str) -> Vec<u16> {
    OsStr::new(name).encode_wide().chain(std::iter::once(0)).collect()
}

/// A named pagefile-backed shared mapping.
pub struct ShmFile {
    ptr: *mut u8,
    len: usize,
    name: String,
    mapping: HANDLE,
}

impl ShmFile {
    /// Create the named mapping. Fails if a live mapping of that name
    /// already exists (stale names from a crashed session vanish with the
    /// last handle, so this is a real conflict).
    pub fn create(name: &str, size: usize) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "size must be > 0"));
        }
        let name_w = wide(name);
        let mapping = unsafe {
            CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                std::ptr::null(),
                PAGE_READWRITE,
                (size as u64 >> 32) as u32,
                size as u32,
                name_w.as_ptr(),
            )
        };
        if mapping.is_null() {
            return Err(io::Error::last_os_error());
        }
        if unsafe { GetLastError() } == ERROR_ALREADY_EXISTS {
            unsafe { CloseHandle(mapping) };
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("shared mapping {name} already exists"),
            ));
        }
        let ptr = unsafe { MapViewOfFile(mapping, FILE_MAP_ALL_ACCESS, 0, 0, size) };
        if ptr.Value.is_null() {
            let err = io::Error::last_os_error();
            unsafe { CloseHandle(mapping) };
            return Err(err);
        }
        tracing::debug!(name, size, "created shared mapping");
        Ok(Self {
            ptr: ptr.Value as *mut u8,
            len: size,
            name: name.to_string(),
            mapping,
        })
    }

    /// Attach to a mapping created by the peer. Both sides derive `size`
    /// from the same configuration; Windows cannot report a mapping
    /// object's size, so the view maps exactly `size` bytes.
    pub fn open(name: &str, size: usize) -> io::Result<Self> {
        let name_w = wide(name);
        let mapping = unsafe { OpenFileMappingW(FILE_MAP_ALL_ACCESS, 0, name_w.as_ptr()) };
        if mapping.is_null() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("shared mapping {name} not found"),
            ));
        }
        let ptr = unsafe { MapViewOfFile(mapping, FILE_MAP_ALL_ACCESS, 0, 0, size) };
        if ptr.Value.is_null() {
            let err = io::Error::last_os_error();
            unsafe { CloseHandle(mapping) };
            return Err(err);
        }
        tracing::debug!(name, size, "attached shared mapping");
        Ok(Self {
            ptr: ptr.Value as *mut u8,
            len: size,
            name: name.to_string(),
            mapping,
        })
    }

    /// Offset-addressed view of the mapping, tagged with its object name
    /// for diagnostics.
    #[inline]
    pub fn arena(&self) -> Arena<'_> {
        unsafe { Arena::new(self.ptr, self.len, &self.name) }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for ShmFile {
    fn drop(&mut self) {
        unsafe {
            UnmapViewOfFile(MEMORY_MAPPED_VIEW_ADDRESS {
                Value: self.ptr as *mut _,
            });
            CloseHandle(self.mapping);
        }
    }
}

unsafe impl Send for ShmFile {}
unsafe impl Sync for ShmFile {}
