// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 kvbridge contributors
//
// The shared-memory message channel between one worker and its clients.
//
// One segment carries a single request arena and a small pool of response
// slots. Three semaphores serialize the arena (writer mutex, ready count,
// drained gate); each response slot has a free/ready pair so a client can
// lease a slot for its reply while the request writer mutex is still held.
//
// Layout of the segment:
//
//   ChannelHeader { magic, writer, ready, drained, worker_ready, slot sems }
//   request_arena:   [u8; ARENA_SIZE]
//   response_slots:  [[u8; SLOT_SIZE]; RESPONSE_SLOTS]

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crate::error::{IpcError, Result};
use crate::msg::{MsgHeader, HEADER_SIZE, NO_RESPONSE_SLOT};
use crate::sem::{backoff, ShmSemaphore};
use crate::shm::ShmSegment;

/// Number of response slots per channel.
pub const RESPONSE_SLOTS: usize = 4;

/// Capacity of the request arena (header + entity).
pub const ARENA_SIZE: usize = 64 * 1024;

/// Capacity of one response slot (header + entity).
pub const SLOT_SIZE: usize = 8 * 1024;

/// Stored into `magic` once the creator has initialised every semaphore.
const CHANNEL_MAGIC: u32 = 0x4b56_4348; // "KVCH"

/// How long an opener waits for the creator to finish initialisation.
const INIT_WAIT_MS: u64 = 5_000;

#[repr(C)]
struct SlotSems {
    free: libc::sem_t,
    ready: libc::sem_t,
}

#[repr(C)]
struct ChannelHeader {
    magic: AtomicU32,
    request_writer: libc::sem_t,
    request_ready: libc::sem_t,
    request_drained: libc::sem_t,
    worker_ready: libc::sem_t,
    slots: [SlotSems; RESPONSE_SLOTS],
}

const ARENA_OFFSET: usize = std::mem::size_of::<ChannelHeader>();
const SLOTS_OFFSET: usize = ARENA_OFFSET + ARENA_SIZE;

/// Total segment size.
pub const fn channel_size() -> usize {
    std::mem::size_of::<ChannelHeader>() + ARENA_SIZE + RESPONSE_SLOTS * SLOT_SIZE
}

/// The message channel over one worker's shared segment.
///
/// Clients use [`client_send`](MsgChannel::client_send) /
/// [`client_recv`](MsgChannel::client_recv) /
/// [`release_slot`](MsgChannel::release_slot); the worker uses
/// [`worker_recv_request`](MsgChannel::worker_recv_request) /
/// [`worker_send_response`](MsgChannel::worker_send_response).
///
/// Dropping a handle unmaps the segment. The kernel objects are destroyed
/// only by an explicit [`destroy`](MsgChannel::destroy) from the side that
/// owns the channel's lifetime (the worker on clean exit, the manager when
/// reaping a dead worker).
pub struct MsgChannel {
    shm: ShmSegment,
}

unsafe impl Send for MsgChannel {}
unsafe impl Sync for MsgChannel {}

impl MsgChannel {
    /// Create the channel segment and initialise its semaphores.
    /// Fails if the name already exists; sweep stale names first with
    /// [`remove_storage`](MsgChannel::remove_storage).
    pub fn create(name: &str) -> Result<Self> {
        let shm = ShmSegment::create(name, channel_size())?;
        let ch = Self { shm };
        unsafe {
            let hdr = ch.header();
            ShmSemaphore::init_at(&mut (*hdr).request_writer, 1)?;
            ShmSemaphore::init_at(&mut (*hdr).request_ready, 0)?;
            ShmSemaphore::init_at(&mut (*hdr).request_drained, 1)?;
            ShmSemaphore::init_at(&mut (*hdr).worker_ready, 0)?;
            for k in 0..RESPONSE_SLOTS {
                ShmSemaphore::init_at(&mut (*hdr).slots[k].free, 1)?;
                ShmSemaphore::init_at(&mut (*hdr).slots[k].ready, 0)?;
            }
            (*hdr).magic.store(CHANNEL_MAGIC, Ordering::Release);
        }
        Ok(ch)
    }

    /// Open an existing channel, waiting briefly for the creator to finish
    /// initialisation if we raced it.
    pub fn open(name: &str) -> Result<Self> {
        let shm = ShmSegment::open(name, channel_size())?;
        let ch = Self { shm };
        let deadline = Instant::now() + Duration::from_millis(INIT_WAIT_MS);
        let mut k = 0u32;
        loop {
            let magic = unsafe { (*ch.header()).magic.load(Ordering::Acquire) };
            if magic == CHANNEL_MAGIC {
                return Ok(ch);
            }
            if Instant::now() >= deadline {
                return Err(IpcError::ChannelClosed);
            }
            backoff(&mut k);
        }
    }

    /// The POSIX name backing this channel.
    pub fn name(&self) -> &str {
        self.shm.name()
    }

    /// Destroy the channel: tear down the semaphores and unlink the segment.
    /// Callers must know that no other process is blocked inside it.
    pub fn destroy(&self) {
        unsafe {
            let hdr = self.header();
            ShmSemaphore::from_ptr(&mut (*hdr).request_writer).destroy();
            ShmSemaphore::from_ptr(&mut (*hdr).request_ready).destroy();
            ShmSemaphore::from_ptr(&mut (*hdr).request_drained).destroy();
            ShmSemaphore::from_ptr(&mut (*hdr).worker_ready).destroy();
            for k in 0..RESPONSE_SLOTS {
                ShmSemaphore::from_ptr(&mut (*hdr).slots[k].free).destroy();
                ShmSemaphore::from_ptr(&mut (*hdr).slots[k].ready).destroy();
            }
            (*hdr).magic.store(0, Ordering::Release);
        }
        self.shm.unlink();
    }

    /// Remove the backing segment by name (stale-channel sweep).
    pub fn remove_storage(name: &str) {
        ShmSegment::unlink_by_name(name);
    }

    // --- accessors -----------------------------------------------------

    fn header(&self) -> *mut ChannelHeader {
        self.shm.as_mut_ptr() as *mut ChannelHeader
    }

    fn request_writer(&self) -> ShmSemaphore {
        unsafe { ShmSemaphore::from_ptr(&mut (*self.header()).request_writer) }
    }

    fn request_ready(&self) -> ShmSemaphore {
        unsafe { ShmSemaphore::from_ptr(&mut (*self.header()).request_ready) }
    }

    fn request_drained(&self) -> ShmSemaphore {
        unsafe { ShmSemaphore::from_ptr(&mut (*self.header()).request_drained) }
    }

    fn worker_ready(&self) -> ShmSemaphore {
        unsafe { ShmSemaphore::from_ptr(&mut (*self.header()).worker_ready) }
    }

    fn slot_free(&self, k: usize) -> ShmSemaphore {
        unsafe { ShmSemaphore::from_ptr(&mut (*self.header()).slots[k].free) }
    }

    fn slot_ready(&self, k: usize) -> ShmSemaphore {
        unsafe { ShmSemaphore::from_ptr(&mut (*self.header()).slots[k].ready) }
    }

    /// The request arena. Exclusive access is guaranteed by the semaphore
    /// protocol, not the borrow checker.
    #[allow(clippy::mut_from_ref)]
    fn arena(&self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(self.shm.as_mut_ptr().add(ARENA_OFFSET), ARENA_SIZE)
        }
    }

    #[allow(clippy::mut_from_ref)]
    fn slot(&self, k: usize) -> &mut [u8] {
        debug_assert!(k < RESPONSE_SLOTS);
        unsafe {
            std::slice::from_raw_parts_mut(
                self.shm.as_mut_ptr().add(SLOTS_OFFSET + k * SLOT_SIZE),
                SLOT_SIZE,
            )
        }
    }

    // --- client side ---------------------------------------------------

    /// Send a request. The entity is written directly into the arena by
    /// `write_entity`, which receives exactly `header.ety_size` bytes.
    ///
    /// With `want_response` the leased slot id is returned and `header.rps_id`
    /// carries it to the worker; the caller must later `client_recv` and
    /// `release_slot` it. Without, no slot is leased and `rps_id` is the
    /// no-response sentinel.
    ///
    /// Oversized requests fail with `BufferOverflow` before any semaphore is
    /// touched, so the writer mutex is never left held.
    pub fn client_send<F>(
        &self,
        header: &mut MsgHeader,
        write_entity: F,
        want_response: bool,
    ) -> Result<Option<usize>>
    where
        F: FnOnce(&mut [u8]),
    {
        let ety = header.ety_size as usize;
        let requested = HEADER_SIZE + ety;
        if requested > ARENA_SIZE {
            return Err(IpcError::BufferOverflow {
                requested,
                capacity: ARENA_SIZE,
            });
        }

        self.request_writer().wait()?;
        let result = self.send_locked(header, write_entity, want_response, ety);
        // Release the writer mutex even when the locked section failed.
        let released = self.request_writer().post();
        let slot = result?;
        released?;
        Ok(slot)
    }

    fn send_locked<F>(
        &self,
        header: &mut MsgHeader,
        write_entity: F,
        want_response: bool,
        ety: usize,
    ) -> Result<Option<usize>>
    where
        F: FnOnce(&mut [u8]),
    {
        // The worker must have copied the previous request out of the arena.
        self.request_drained().wait()?;

        // Lease the response slot while still holding the writer mutex so
        // the header can carry the slot id.
        let slot = if want_response {
            Some(self.lease_slot()?)
        } else {
            None
        };
        header.rps_id = slot.map(|k| k as u32).unwrap_or(NO_RESPONSE_SLOT);

        let arena = self.arena();
        header.encode(&mut arena[..HEADER_SIZE]);
        write_entity(&mut arena[HEADER_SIZE..HEADER_SIZE + ety]);

        self.request_ready().post()?;
        Ok(slot)
    }

    /// Scan the slot pool with try_wait until one is free. Unfair under
    /// saturation; callers are few and contention is moderate.
    fn lease_slot(&self) -> Result<usize> {
        let mut j = 0u32;
        loop {
            for k in 0..RESPONSE_SLOTS {
                if self.slot_free(k).try_wait()? {
                    return Ok(k);
                }
            }
            backoff(&mut j);
        }
    }

    /// Receive the response for a previously leased slot. Does not free the
    /// slot: large-payload readers may take their time before
    /// [`release_slot`](MsgChannel::release_slot) admits the next writer.
    pub fn client_recv(&self, slot: usize) -> Result<(MsgHeader, Vec<u8>)> {
        self.slot_ready(slot).wait()?;
        let bytes = self.slot(slot);
        let header = MsgHeader::decode(&bytes[..HEADER_SIZE])?;
        let ety = header.ety_size as usize;
        if HEADER_SIZE + ety > SLOT_SIZE {
            return Err(IpcError::protocol(format!(
                "response entity of {ety} bytes exceeds slot capacity"
            )));
        }
        let entity = bytes[HEADER_SIZE..HEADER_SIZE + ety].to_vec();
        Ok((header, entity))
    }

    /// Return a leased slot to the free pool.
    pub fn release_slot(&self, slot: usize) -> Result<()> {
        self.slot_free(slot).post()
    }

    // --- worker side ---------------------------------------------------

    /// Block for the next request, copy it out of the arena, and re-admit
    /// the next writer.
    pub fn worker_recv_request(&self) -> Result<(MsgHeader, Vec<u8>)> {
        self.request_ready().wait()?;
        let msg = self.copy_request();
        self.request_drained().post()?;
        msg
    }

    /// Like [`worker_recv_request`](MsgChannel::worker_recv_request) with a
    /// bounded wait; `None` on timeout. The manager's control loop uses this
    /// to interleave liveness sweeps.
    pub fn worker_recv_request_timeout(&self, ms: u64) -> Result<Option<(MsgHeader, Vec<u8>)>> {
        if !self.request_ready().wait_timeout(ms)? {
            return Ok(None);
        }
        let msg = self.copy_request();
        self.request_drained().post()?;
        msg.map(Some)
    }

    fn copy_request(&self) -> Result<(MsgHeader, Vec<u8>)> {
        let arena = self.arena();
        let header = MsgHeader::decode(&arena[..HEADER_SIZE])?;
        let ety = header.ety_size as usize;
        if HEADER_SIZE + ety > ARENA_SIZE {
            return Err(IpcError::protocol(format!(
                "request entity of {ety} bytes exceeds arena capacity"
            )));
        }
        Ok((header, arena[HEADER_SIZE..HEADER_SIZE + ety].to_vec()))
    }

    /// Write a response into `slot` and signal its lessee.
    pub fn worker_send_response<F>(
        &self,
        slot: usize,
        header: &MsgHeader,
        write_entity: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut [u8]),
    {
        if slot >= RESPONSE_SLOTS {
            return Err(IpcError::protocol(format!("response slot {slot} out of range")));
        }
        let ety = header.ety_size as usize;
        if HEADER_SIZE + ety > SLOT_SIZE {
            return Err(IpcError::protocol(format!(
                "response entity of {ety} bytes exceeds slot capacity"
            )));
        }
        let bytes = self.slot(slot);
        header.encode(&mut bytes[..HEADER_SIZE]);
        write_entity(&mut bytes[HEADER_SIZE..HEADER_SIZE + ety]);
        self.slot_ready(slot).post()
    }

    // --- startup handshake ---------------------------------------------

    /// Posted once by the worker after it has opened the channel and built
    /// its state.
    pub fn post_worker_ready(&self) -> Result<()> {
        self.worker_ready().post()
    }

    /// Wait for the worker's startup signal, at most `ms` milliseconds.
    pub fn wait_worker_ready(&self, ms: u64) -> Result<bool> {
        self.worker_ready().wait_timeout(ms)
    }
}
