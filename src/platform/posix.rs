// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 kvbridge contributors
//
// POSIX shared memory syscall wrappers: shm_open, ftruncate, mmap,
// munmap, shm_unlink.

use std::ffi::CString;
use std::io;
use std::ptr;

use crate::shm_name;

/// Open mode flags for [`PlatformShm::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmMode {
    /// Create exclusively — fail if the object already exists.
    Create,
    /// Open existing — fail if it does not exist.
    Open,
    /// Create if missing, open if it already exists.
    CreateOrOpen,
}

/// A mapped POSIX shared memory object.
///
/// Lifetime of the kernel object is explicit: `Drop` only unmaps, and the
/// backing name persists until some process calls [`PlatformShm::unlink_by_name`].
/// The protocol layers above decide who unlinks what and when.
pub struct PlatformShm {
    mem: *mut u8,
    size: usize,
    name: String, // POSIX name (with leading '/')
    created: bool,
}

// Safety: the region is process-shared by design; all synchronization is
// done by the semaphores the channel embeds in it.
unsafe impl Send for PlatformShm {}
unsafe impl Sync for PlatformShm {}

impl PlatformShm {
    /// Acquire a named shared memory object of exactly `size` bytes.
    ///
    /// In `Create` and `CreateOrOpen`-as-creator the object is truncated to
    /// `size`. In `Open` the object is mapped at `size`; pass the size from
    /// [`PlatformShm::stat_size`] (or a protocol constant) and the call fails
    /// if the kernel object is smaller.
    pub fn acquire(name: &str, size: usize, mode: ShmMode) -> io::Result<Self> {
        if name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "name is empty"));
        }
        if size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "size is 0"));
        }

        let posix_name = shm_name::posix_object_name(name);
        let c_name = CString::new(posix_name.as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let perms: libc::mode_t = 0o666;

        // For CreateOrOpen: try exclusive create first so we only call
        // ftruncate when we actually own the new object. On macOS, calling
        // ftruncate on an already-sized shm object can zero its contents
        // before returning EINVAL.
        let (fd, created) = match mode {
            ShmMode::Create => {
                let f = unsafe {
                    libc::shm_open(
                        c_name.as_ptr(),
                        libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                        perms as libc::c_uint,
                    )
                };
                if f == -1 {
                    return Err(io::Error::last_os_error());
                }
                (f, true)
            }
            ShmMode::Open => {
                let f =
                    unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, perms as libc::c_uint) };
                if f == -1 {
                    return Err(io::Error::last_os_error());
                }
                (f, false)
            }
            ShmMode::CreateOrOpen => {
                let f = unsafe {
                    libc::shm_open(
                        c_name.as_ptr(),
                        libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                        perms as libc::c_uint,
                    )
                };
                if f != -1 {
                    (f, true)
                } else {
                    let e = io::Error::last_os_error();
                    if e.raw_os_error() != Some(libc::EEXIST) {
                        return Err(e);
                    }
                    let f2 = unsafe {
                        libc::shm_open(c_name.as_ptr(), libc::O_RDWR, perms as libc::c_uint)
                    };
                    if f2 == -1 {
                        return Err(io::Error::last_os_error());
                    }
                    (f2, false)
                }
            }
        };

        unsafe { libc::fchmod(fd, perms) };

        if created {
            let ret = unsafe { libc::ftruncate(fd, size as libc::off_t) };
            if ret != 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                Self::unlink_by_name(name);
                return Err(err);
            }
        } else {
            // Opening an existing object: the kernel object must be at least
            // as large as the mapping we are about to make.
            let actual = Self::fd_size(fd)?;
            if actual < size {
                unsafe { libc::close(fd) };
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("shm object {posix_name} is {actual} bytes, need {size}"),
                ));
            }
        }

        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };

        if mem == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            mem: mem as *mut u8,
            size,
            name: posix_name,
            created,
        })
    }

    /// Size of an existing named object, without mapping it.
    pub fn stat_size(name: &str) -> io::Result<usize> {
        let posix_name = shm_name::posix_object_name(name);
        let c_name = CString::new(posix_name.as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }
        let size = Self::fd_size(fd);
        unsafe { libc::close(fd) };
        size
    }

    fn fd_size(fd: i32) -> io::Result<usize> {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut st) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(st.st_size as usize)
    }

    /// Pointer to the start of the mapped region.
    pub fn as_ptr(&self) -> *const u8 {
        self.mem
    }

    /// Mutable pointer to the start of the mapped region.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.mem
    }

    /// Mapped size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// POSIX name (with leading '/').
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this handle created the kernel object.
    pub fn is_creator(&self) -> bool {
        self.created
    }

    /// Remove the backing kernel object. The mapping stays valid until drop.
    pub fn unlink(&self) {
        if let Ok(c_name) = CString::new(self.name.as_bytes()) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }

    /// Unlink a named shm object without an open handle. ENOENT is not an
    /// error here; stale-name sweeps rely on that.
    pub fn unlink_by_name(name: &str) {
        let posix_name = shm_name::posix_object_name(name);
        if let Ok(c_name) = CString::new(posix_name.as_bytes()) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }
}

impl Drop for PlatformShm {
    fn drop(&mut self) {
        if self.mem.is_null() {
            return;
        }
        unsafe { libc::munmap(self.mem as *mut libc::c_void, self.size) };
    }
}
