// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 kvbridge contributors
//
// Named shared memory segments.
// Delegates to platform::PlatformShm.

use crate::error::Result;
use crate::platform::PlatformShm;

/// A named, mapped shared memory segment.
///
/// Dropping a segment unmaps it and nothing else; the kernel object lives
/// until someone unlinks it. The channel and bulk layers own those decisions.
pub struct ShmSegment {
    inner: PlatformShm,
}

impl ShmSegment {
    /// Create a new segment of exactly `size` bytes. Fails if the name
    /// already exists.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let inner = PlatformShm::acquire(name, size, crate::platform::posix::ShmMode::Create)?;
        Ok(Self { inner })
    }

    /// Open an existing segment and map exactly `size` bytes of it.
    pub fn open(name: &str, size: usize) -> Result<Self> {
        let inner = PlatformShm::acquire(name, size, crate::platform::posix::ShmMode::Open)?;
        Ok(Self { inner })
    }

    /// Create if missing, open if present; maps `size` bytes either way.
    pub fn create_or_open(name: &str, size: usize) -> Result<Self> {
        let inner =
            PlatformShm::acquire(name, size, crate::platform::posix::ShmMode::CreateOrOpen)?;
        Ok(Self { inner })
    }

    /// Size of an existing named segment without mapping it.
    pub fn stat_size(name: &str) -> Result<usize> {
        Ok(PlatformShm::stat_size(name)?)
    }

    /// Whether this handle created the kernel object (as opposed to opening
    /// a pre-existing one).
    pub fn is_creator(&self) -> bool {
        self.inner.is_creator()
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.inner.as_ptr()
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.inner.as_mut_ptr()
    }

    pub fn size(&self) -> usize {
        self.inner.size()
    }

    /// The POSIX name used to open the segment.
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// The mapped bytes as a slice.
    ///
    /// # Safety
    /// The caller must ensure no other process writes the same range for the
    /// lifetime of the borrow; the channel's semaphores provide exactly that.
    pub unsafe fn bytes(&self) -> &[u8] {
        std::slice::from_raw_parts(self.inner.as_ptr(), self.inner.size())
    }

    /// The mapped bytes as a mutable slice.
    ///
    /// # Safety
    /// Same exclusivity requirement as [`ShmSegment::bytes`].
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn bytes_mut(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.inner.as_mut_ptr(), self.inner.size())
    }

    /// Remove the backing kernel object; the mapping stays usable until drop.
    pub fn unlink(&self) {
        self.inner.unlink();
    }

    /// Remove a named segment without an open handle. Missing names are
    /// silently ignored.
    pub fn unlink_by_name(name: &str) {
        PlatformShm::unlink_by_name(name);
    }
}

impl std::fmt::Debug for ShmSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmSegment")
            .field("name", &self.inner.name())
            .field("size", &self.inner.size())
            .finish()
    }
}

impl ShmSegment {
    /// True if a kernel object by this name currently exists.
    pub fn exists(name: &str) -> bool {
        Self::stat_size(name).is_ok()
    }
}
