// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 kvbridge contributors
//
// Bulk side-channel: per-cursor shared memory segments carrying scan
// batches too large for a response slot. The worker creates and fills a
// segment per batch; the client maps it on receipt and unlinks it when the
// cursor closes.

use crate::error::Result;
use crate::shm::ShmSegment;
use crate::shm_name;

/// Fixed size of forward-scan batch segments. Range-query segments are
/// sized to the exact batch instead.
pub const READ_BATCH_SIZE: usize = 16 * 1024;

/// Worker-side view: a freshly created segment to serialize one batch into.
pub struct BulkWriter {
    shm: ShmSegment,
}

impl BulkWriter {
    /// Create (or recreate) the segment at exactly `size` bytes.
    ///
    /// Any stale object by the same name — left over from a crashed client
    /// or an earlier batch — is unlinked first.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        ShmSegment::unlink_by_name(name);
        let shm = ShmSegment::create(name, size)?;
        Ok(Self { shm })
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { self.shm.bytes_mut() }
    }

    /// Copy a fully serialized batch into the segment.
    pub fn write(&mut self, batch: &[u8]) {
        debug_assert!(batch.len() <= self.shm.size());
        self.as_mut_slice()[..batch.len()].copy_from_slice(batch);
    }
}

// Dropping the writer unmaps; the object stays for the client to map.

/// Client-side view: a received batch mapped for consumption.
pub struct BulkReader {
    shm: ShmSegment,
    len: usize,
}

impl BulkReader {
    /// Map `len` bytes of the named segment the worker just produced.
    pub fn open(name: &str, len: usize) -> Result<Self> {
        let shm = ShmSegment::open(name, len)?;
        Ok(Self { shm, len })
    }

    pub fn as_slice(&self) -> &[u8] {
        &(unsafe { self.shm.bytes() })[..self.len]
    }
}

/// Remove a bulk segment by name. Missing names are ignored, so close paths
/// on both sides may call this unconditionally.
pub fn unlink(name: &str) {
    ShmSegment::unlink_by_name(name);
}

/// Best-effort startup sweep: remove batch segments this worker may have
/// left behind for cursors the previous incarnation never closed.
///
/// POSIX gives no portable way to enumerate shm names, so the sweep walks
/// /dev/shm where it exists and matches this worker's deterministic names.
pub fn sweep_worker_segments(worker_id: &str) {
    let Ok(entries) = std::fs::read_dir("/dev/shm") else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if segment_belongs_to_worker(name, worker_id) {
            ShmSegment::unlink_by_name(name);
        }
    }
}

/// Exact-boundary match against `<prefix><pid>_<worker_id>_<cursor_id>`.
/// The worker id must match whole, never as a prefix of a longer id, or a
/// sweep for worker `w0` would unlink worker `w01`'s live segments.
fn segment_belongs_to_worker(name: &str, worker_id: &str) -> bool {
    ["KVReadBatch", "KVRangeQuery"].iter().any(|prefix| {
        let Some(tail) = name.strip_prefix(prefix) else {
            return false;
        };
        let Some((pid, rest)) = tail.split_once('_') else {
            return false;
        };
        let Some((wid, cursor)) = rest.rsplit_once('_') else {
            return false;
        };
        wid == worker_id && all_digits(pid) && all_digits(cursor)
    })
}

fn all_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Convenience constructors mirroring the deterministic names.
pub fn read_batch_segment(client_pid: u32, worker_id: &str, cursor_id: u64) -> String {
    shm_name::read_batch_name(client_pid, worker_id, cursor_id)
}

pub fn range_query_segment(client_pid: u32, worker_id: &str, cursor_id: u64) -> String {
    shm_name::range_query_name(client_pid, worker_id, cursor_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_segment_matching() {
        assert!(segment_belongs_to_worker("KVReadBatch1234_w0_7", "w0"));
        assert!(segment_belongs_to_worker("KVRangeQuery99_w0_12", "w0"));
        assert!(!segment_belongs_to_worker("KVReadBatch1234_w1_7", "w0"));
        assert!(!segment_belongs_to_worker("KVChannelw0", "w0"));
    }

    #[test]
    fn prefix_worker_ids_do_not_cross_match() {
        // A sweep for w0 must never touch w01's live segments, or vice
        // versa, even though one id is a string prefix of the other.
        let for_w01 = "KVReadBatch1234_w01_7";
        assert!(segment_belongs_to_worker(for_w01, "w01"));
        assert!(!segment_belongs_to_worker(for_w01, "w0"));
        assert!(!segment_belongs_to_worker("KVReadBatch1234_w0_17", "w01"));
        // Numeric ids have the same hazard.
        assert!(!segment_belongs_to_worker("KVRangeQuery5_12_3", "1"));
        assert!(segment_belongs_to_worker("KVRangeQuery5_12_3", "12"));
    }

    #[test]
    fn malformed_names_never_match() {
        assert!(!segment_belongs_to_worker("KVReadBatch_w0_1", "w0")); // no pid
        assert!(!segment_belongs_to_worker("KVReadBatch12_w0_", "w0")); // no cursor
        assert!(!segment_belongs_to_worker("KVReadBatch12w07", "w0")); // no delimiters
    }
}
