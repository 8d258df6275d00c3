// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 kvbridge contributors
//
// Process-shared counting semaphores embedded in shared memory.
// POSIX `sem_t` initialised with pshared=1; one per protocol gate,
// all living inside the channel segment's header.

use std::io;

use crate::error::{IpcError, Result};

/// A view over a process-shared `sem_t` stored inside a mapped segment.
///
/// The semaphore does not own its storage: the channel owns the segment and
/// decides when to [`init`](ShmSemaphore::init_at) and
/// [`destroy`](ShmSemaphore::destroy). Copies of the view in other processes
/// attach with [`from_ptr`](ShmSemaphore::from_ptr).
pub struct ShmSemaphore {
    sem: *mut libc::sem_t,
}

unsafe impl Send for ShmSemaphore {}
unsafe impl Sync for ShmSemaphore {}

impl ShmSemaphore {
    /// Initialise a semaphore at `ptr` with the given count.
    ///
    /// # Safety
    /// `ptr` must point into a mapped, process-shared region with space and
    /// alignment for a `sem_t`, and must not be initialised twice without an
    /// intervening [`destroy`](ShmSemaphore::destroy).
    pub unsafe fn init_at(ptr: *mut libc::sem_t, value: u32) -> Result<Self> {
        if libc::sem_init(ptr, 1, value) != 0 {
            return Err(IpcError::last_os_error());
        }
        Ok(Self { sem: ptr })
    }

    /// Attach to a semaphore some process already initialised at `ptr`.
    ///
    /// # Safety
    /// `ptr` must point to a live, initialised process-shared `sem_t`.
    pub unsafe fn from_ptr(ptr: *mut libc::sem_t) -> Self {
        Self { sem: ptr }
    }

    /// Increment the count, waking one waiter if any.
    pub fn post(&self) -> Result<()> {
        if unsafe { libc::sem_post(self.sem) } != 0 {
            return Err(IpcError::last_os_error());
        }
        Ok(())
    }

    /// Decrement the count, blocking until it is positive.
    /// Signal interruptions are retried transparently.
    pub fn wait(&self) -> Result<()> {
        loop {
            if unsafe { libc::sem_wait(self.sem) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(IpcError::System(err));
        }
    }

    /// Decrement the count if it is positive. Returns `false` when the
    /// semaphore is currently zero.
    pub fn try_wait(&self) -> Result<bool> {
        if unsafe { libc::sem_trywait(self.sem) } == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(false),
            _ => Err(IpcError::System(err)),
        }
    }

    /// Decrement the count, waiting at most `timeout_ms`.
    /// Returns `Ok(false)` on timeout.
    #[cfg(target_os = "linux")]
    pub fn wait_timeout(&self, timeout_ms: u64) -> Result<bool> {
        let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
        unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
        let ns_total = ts.tv_nsec as u64 + (timeout_ms % 1000) * 1_000_000;
        ts.tv_sec +=
            (timeout_ms / 1000) as libc::time_t + (ns_total / 1_000_000_000) as libc::time_t;
        ts.tv_nsec = (ns_total % 1_000_000_000) as libc::c_long;
        loop {
            if unsafe { libc::sem_timedwait(self.sem, &ts) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ETIMEDOUT) => return Ok(false),
                _ => return Err(IpcError::System(err)),
            }
        }
    }

    /// `sem_timedwait` is Linux-only; elsewhere, emulate with try_wait and
    /// adaptive backoff (spin, yield, then sleep).
    #[cfg(not(target_os = "linux"))]
    pub fn wait_timeout(&self, timeout_ms: u64) -> Result<bool> {
        let deadline = std::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
        let mut k = 0u32;
        loop {
            if self.try_wait()? {
                return Ok(true);
            }
            if std::time::Instant::now() >= deadline {
                return Ok(false);
            }
            backoff(&mut k);
        }
    }

    /// Destroy the semaphore. Only the segment owner calls this, after all
    /// other processes have stopped using it.
    pub fn destroy(&self) {
        unsafe { libc::sem_destroy(self.sem) };
    }
}

/// Adaptive backoff: busy spin, then pause hint, then yield, then 1ms sleep.
pub(crate) fn backoff(k: &mut u32) {
    if *k < 4 {
        // busy spin
    } else if *k < 16 {
        std::hint::spin_loop();
    } else if *k < 32 {
        std::thread::yield_now();
    } else {
        std::thread::sleep(std::time::Duration::from_millis(1));
        return;
    }
    *k += 1;
}
