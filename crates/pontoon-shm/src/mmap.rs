//! Named shared mappings (unix).
//!
//! A "named mapping" is a file under the shared-memory directory mapped
//! with `MAP_SHARED`; both processes resolve the same name to the same
//! path, which is how the name survives the 32/64-bit process boundary.
//! The creator owns the file and unlinks it on drop.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

use crate::arena::Arena;

/// Directory the mapping files live in. `/dev/shm` where available keeps
/// them memory-backed; elsewhere the temp dir works the same way.
fn shm_dir() -> PathBuf {
    let dev_shm = PathBuf::from("/dev/shm");
    if dev_shm.is_dir() {
        dev_shm
    } else {
        std::env::temp_dir()
    }
}

/// A named, file-backed shared mapping.
pub struct ShmFile {
    ptr: *mut u8,
    len: usize,
    name: String,
    path: PathBuf,
    owns_file: bool,
    _file: File,
}

impl ShmFile {
    /// Create the named mapping, truncating any stale file with that name.
    pub fn create(name: &str, size: usize) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "size must be > 0"));
        }
        let path = shm_dir().join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| {
                io::Error::new(
                    e.kind(),
                    format!("failed to create shared mapping at {}: {e}", path.display()),
                )
            })?;
        file.set_len(size as u64)?;
        let ptr = map(&file, size)?;
        tracing::debug!(name, size, "created shared mapping");
        Ok(Self {
            ptr,
            len: size,
            name: name.to_string(),
            path,
            owns_file: true,
            _file: file,
        })
    }

    /// Attach to a mapping created by the peer. Both sides derive `size`
    /// from the same configuration; the backing file must be at least that
    /// large.
    pub fn open(name: &str, size: usize) -> io::Result<Self> {
        let path = shm_dir().join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                io::Error::new(
                    e.kind(),
                    format!("failed to open shared mapping at {}: {e}", path.display()),
                )
            })?;
        let actual = file.metadata()?.len() as usize;
        if actual < size || size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("shared mapping {name} is {actual} bytes, expected {size}"),
            ));
        }
        let ptr = map(&file, size)?;
        tracing::debug!(name, size, "attached shared mapping");
        Ok(Self {
            ptr,
            len: size,
            name: name.to_string(),
            path,
            owns_file: false,
            _file: file,
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

fn map(file: &File, size: usize) -> io::Result<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(ptr as *mut u8)
}

impl Drop for ShmFile {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
        if self.owns_file {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

// The mapping stays valid for the lifetime of ShmFile; concurrent access is
// governed by the atomics stored inside it.
unsafe impl Send for ShmFile {}
unsafe impl Sync for ShmFile {}
