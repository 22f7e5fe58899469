//! Named counting semaphores shared across the process boundary.
//!
//! Two are in play per session: the data-queue back-pressure semaphore
//! (one per channel) and the present semaphore bounding the client's
//! frame-ahead count. Both are created by the client and opened by the
//! server through the session-scoped name.

use std::io;
use std::time::Duration;

#[cfg(unix)]
use unix as sys;
#[cfg(windows)]
use windows as sys;

/// A named counting semaphore.
///
/// `wait` with `Duration::ZERO` blocks without a deadline; that is what
/// the infinite-retries focus mode maps timeouts to.
pub struct NamedSemaphore {
    inner: sys::Sem,
    name: String,
}

impl NamedSemaphore {
    /// Create the semaphore with the given initial count. `max` bounds the
    /// count where the platform supports it.
    pub fn create(name: &str, initial: u32, max: u32) -> io::Result<Self> {
        let inner = sys::Sem::create(name, initial, max)?;
        tracing::debug!(name, initial, max, "created named semaphore");
        Ok(Self {
            inner,
            name: name.to_string(),
        })
    }

    /// Open a semaphore created by the peer.
    pub fn open(name: &str) -> io::Result<Self> {
        let inner = sys::Sem::open(name)?;
        Ok(Self {
            inner,
            name: name.to_string(),
        })
    }

    /// Wait for one count. Returns `Ok(true)` when acquired, `Ok(false)` on
    /// timeout. `Duration::ZERO` waits forever.
    pub fn wait(&self, timeout: Duration) -> io::Result<bool> {
        self.inner.wait(timeout)
    }

    /// Release `count` counts.
    pub fn release(&self, count: u32) -> io::Result<()> {
        self.inner.release(count)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(unix)]
mod unix {
    use std::ffi::CString;
    use std::io;
    use std::time::Duration;

    pub struct Sem {
        sem: *mut libc::sem_t,
        name: CString,
        owner: bool,
    }

    // POSIX named semaphore names are a single path component.
    fn sem_name(name: &str) -> CString {
        CString::new(format!("/{name}")).expect("semaphore name contains NUL")
    }

    impl Sem {
        pub fn create(name: &str, initial: u32, _max: u32) -> io::Result<Self> {
            // POSIX has no max-count cap; the creator's release discipline
            // provides the bound.
            let c_name = sem_name(name);
            // Drop any stale semaphore from a previous crashed session.
            unsafe { libc::sem_unlink(c_name.as_ptr()) };
            let sem = unsafe {
                libc::sem_open(
                    c_name.as_ptr(),
                    libc::O_CREAT | libc::O_EXCL,
                    0o600,
                    initial,
                )
            };
            if sem == libc::SEM_FAILED {
                return Err(io::Error::last_os_error());
            }
            Ok(Self {
                sem,
                name: c_name,
                owner: true,
            })
        }

        pub fn open(name: &str) -> io::Result<Self> {
            let c_name = sem_name(name);
            let sem = unsafe { libc::sem_open(c_name.as_ptr(), 0) };
            if sem == libc::SEM_FAILED {
                return Err(io::Error::last_os_error());
            }
            Ok(Self {
                sem,
                name: c_name,
                owner: false,
            })
        }

        pub fn wait(&self, timeout: Duration) -> io::Result<bool> {
            if timeout.is_zero() {
                loop {
                    let rc = unsafe { libc::sem_wait(self.sem) };
                    if rc == 0 {
                        return Ok(true);
                    }
                    let err = io::Error::last_os_error();
                    if err.kind() != io::ErrorKind::Interrupted {
                        return Err(err);
                    }
                }
            }

            let mut now = libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            };
            if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } != 0 {
                return Err(io::Error::last_os_error());
            }
            let mut deadline = now;
            deadline.tv_sec += timeout.as_secs() as libc::time_t;
            deadline.tv_nsec += timeout.subsec_nanos() as libc::c_long;
            if deadline.tv_nsec >= 1_000_000_000 {
                deadline.tv_sec += 1;
                deadline.tv_nsec -= 1_000_000_000;
            }

            loop {
                let rc = unsafe { libc::sem_timedwait(self.sem, &deadline) };
                if rc == 0 {
                    return Ok(true);
                }
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::ETIMEDOUT) => return Ok(false),
                    Some(libc::EINTR) => continue,
                    _ => return Err(err),
                }
            }
        }

        pub fn release(&self, count: u32) -> io::Result<()> {
            for _ in 0..count {
                if unsafe { libc::sem_post(self.sem) } != 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        }
    }

    impl Drop for Sem {
        fn drop(&mut self) {
            unsafe {
                libc::sem_close(self.sem);
                if self.owner {
                    libc::sem_unlink(self.name.as_ptr());
                }
            }
        }
    }

    unsafe impl Send for Sem {}
    unsafe impl Sync for Sem {}
}

#[cfg(windows)]
mod windows {
    use std::ffi::OsStr;
    use std::io;
    use std::os::windows::ffi::OsStrExt;
    use std::time::Duration;

    use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT};
    use windows_sys::Win32::System::Threading::{
        CreateSemaphoreW, OpenSemaphoreW, ReleaseSemaphore, WaitForSingleObject, INFINITE,
        SEMAPHORE_ALL_ACCESS,
    };

    pub struct Sem {
        handle: HANDLE,
    }

    fn wide(name: &str) -> Vec<u16> {
        OsStr::new(name).encode_wide().chain(std::iter::once(0)).collect()
    }

    impl Sem {
        pub fn create(name: &str, initial: u32, max: u32) -> io::Result<Self> {
            let name_w = wide(name);
            let handle = unsafe {
                CreateSemaphoreW(
                    std::ptr::null(),
                    initial as i32,
                    max.max(1) as i32,
                    name_w.as_ptr(),
                )
            };
            if handle.is_null() {
                return Err(io::Error::last_os_error());
            }
            Ok(Self { handle })
        }

        pub fn open(name: &str) -> io::Result<Self> {
            let name_w = wide(name);
            let handle = unsafe { OpenSemaphoreW(SEMAPHORE_ALL_ACCESS, 0, name_w.as_ptr()) };
            if handle.is_null() {
                return Err(io::Error::last_os_error());
            }
            Ok(Self { handle })
        }

        pub fn wait(&self, timeout: Duration) -> io::Result<bool> {
            let millis = if timeout.is_zero() {
                INFINITE
            } else {
                timeout.as_millis().min(u128::from(INFINITE - 1)) as u32
            };
            match unsafe { WaitForSingleObject(self.handle, millis) } {
                WAIT_OBJECT_0 => Ok(true),
                WAIT_TIMEOUT => Ok(false),
                _ => Err(io::Error::last_os_error()),
            }
        }

        pub fn release(&self, count: u32) -> io::Result<()> {
            let ok = unsafe {
                ReleaseSemaphore(self.handle, count as i32, std::ptr::null_mut())
            };
            if ok == 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }
    }

    impl Drop for Sem {
        fn drop(&mut self) {
            unsafe { CloseHandle(self.handle) };
        }
    }

    unsafe impl Send for Sem {}
    unsafe impl Sync for Sem {}
}
