// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 kvbridge contributors
//
// Client-side request API. One KvClient per backend session; every method
// is a full request/response round-trip over the worker's channel, except
// the fire-and-forget paths (load, clear-range).

use std::sync::atomic::{AtomicU64, Ordering};

use crate::bulk::{self, BulkReader};
use crate::channel::MsgChannel;
use crate::engine::decode_batch;
use crate::error::{IpcError, Result};
use crate::msg::{
    put_entity_len, BatchReply, CursorRef, EngineOptions, MsgHeader, Op, OpenArgs, RangeArgs,
    Status,
};
use crate::shm_name;

/// Cursor ids are allocated process-wide: cursors are keyed by
/// (client_pid, cursor_id) on the worker, and several clients can live in
/// one process.
static CURSOR_ALLOC: AtomicU64 = AtomicU64::new(1);

fn next_cursor_id() -> u64 {
    CURSOR_ALLOC.fetch_add(1, Ordering::Relaxed)
}

/// A connection from one backend process to one worker.
pub struct KvClient {
    channel: MsgChannel,
    worker_id: String,
    db_id: u32,
    rel_id: u32,
    pid: u32,
}

impl KvClient {
    /// Open the worker's channel. Fails if the worker (or manager) has not
    /// created it yet.
    pub fn connect(worker_id: &str, db_id: u32, rel_id: u32) -> Result<Self> {
        let channel = MsgChannel::open(&shm_name::channel_name(worker_id))?;
        Ok(Self {
            channel,
            worker_id: worker_id.to_string(),
            db_id,
            rel_id,
            pid: std::process::id(),
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    // --- round-trip plumbing -------------------------------------------

    fn request<F>(&self, op: Op, ety_len: usize, write: F) -> Result<(MsgHeader, Vec<u8>)>
    where
        F: FnOnce(&mut [u8]),
    {
        let mut header = MsgHeader::request(op, self.db_id, self.rel_id, ety_len as u64);
        let slot = self
            .channel
            .client_send(&mut header, write, true)?
            .ok_or_else(|| IpcError::protocol("request expected a response slot"))?;
        let msg = self.channel.client_recv(slot);
        // Free the slot whether or not the receive parsed cleanly.
        let released = self.channel.release_slot(slot);
        let msg = msg?;
        released?;
        Ok(msg)
    }

    fn notify<F>(&self, op: Op, ety_len: usize, write: F) -> Result<()>
    where
        F: FnOnce(&mut [u8]),
    {
        let mut header = MsgHeader::request(op, self.db_id, self.rel_id, ety_len as u64);
        self.channel.client_send(&mut header, write, false)?;
        Ok(())
    }

    // --- operations ----------------------------------------------------

    /// Open the engine at `path`, or bump its reference count if this worker
    /// already holds it open. Returns `false` when the engine refuses.
    pub fn open(&self, path: &str, options: &EngineOptions, column_flag: u8, attr_count: i32) -> Result<bool> {
        let args = OpenArgs {
            options: *options,
            column_flag,
            attr_count,
            path: path.to_string(),
        };
        let mut entity = Vec::with_capacity(args.encoded_len());
        args.encode(&mut entity);
        let (header, _) = self.request(Op::Open, entity.len(), |buf| {
            buf.copy_from_slice(&entity)
        })?;
        Ok(header.status == Status::Success)
    }

    /// Drop one reference to the engine. The worker keeps the handle open;
    /// only termination closes it.
    pub fn close(&self) -> Result<()> {
        let (header, _) = self.request(Op::Close, 0, |_| {})?;
        if header.status != Status::Success {
            return Err(IpcError::Engine("close rejected".to_string()));
        }
        Ok(())
    }

    pub fn count(&self) -> Result<u64> {
        let (header, body) = self.request(Op::Count, 0, |_| {})?;
        if header.status != Status::Success {
            return Err(IpcError::Engine("count on a closed engine".to_string()));
        }
        crate::msg::decode_u64(&body)
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        let ety = put_entity_len(key, value);
        let (header, _) = self.request(Op::Put, ety, |buf| write_put(buf, key, value))?;
        Ok(header.status == Status::Success)
    }

    /// Fire-and-forget put for bulk loading; no response, failures are only
    /// visible in the worker's log.
    pub fn load(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let ety = put_entity_len(key, value);
        self.notify(Op::Load, ety, |buf| write_put(buf, key, value))
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let (header, body) = self.request(Op::Get, key.len(), |buf| buf.copy_from_slice(key))?;
        Ok(match header.status {
            Status::Success => Some(body),
            _ => None,
        })
    }

    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        let (header, _) = self.request(Op::Del, key.len(), |buf| buf.copy_from_slice(key))?;
        Ok(header.status == Status::Success)
    }

    /// Begin a forward scan over the whole relation.
    pub fn scan(&self) -> ScanCursor<'_> {
        let cursor = CursorRef {
            pid: self.pid,
            cursor_id: next_cursor_id(),
        };
        let segment = shm_name::read_batch_name(cursor.pid, &self.worker_id, cursor.cursor_id);
        ScanCursor {
            client: self,
            cursor,
            segment,
            exhausted: false,
            closed: false,
        }
    }

    /// Begin a range query over `[start, limit)` with a soft batch byte cap.
    pub fn range(
        &self,
        start: &[u8],
        limit: &[u8],
        batch_capacity: u64,
        attrs: Vec<i32>,
    ) -> RangeScan<'_> {
        let cursor = CursorRef {
            pid: self.pid,
            cursor_id: next_cursor_id(),
        };
        let segment = shm_name::range_query_name(cursor.pid, &self.worker_id, cursor.cursor_id);
        RangeScan {
            client: self,
            cursor,
            segment,
            first: Some(RangeArgs {
                cursor,
                start: start.to_vec(),
                limit: limit.to_vec(),
                batch_capacity,
                attrs,
            }),
            exhausted: false,
            closed: false,
        }
    }

    /// Ask the worker to shut down and tear its channel down.
    pub fn terminate(&self) -> Result<()> {
        let (header, _) = self.request(Op::Terminate, 0, |_| {})?;
        if header.status != Status::Success {
            return Err(IpcError::Engine("terminate rejected".to_string()));
        }
        Ok(())
    }
}

fn write_put(buf: &mut [u8], key: &[u8], value: &[u8]) {
    buf[..8].copy_from_slice(&(key.len() as u64).to_le_bytes());
    buf[8..8 + key.len()].copy_from_slice(key);
    buf[8 + key.len()..].copy_from_slice(value);
}

// ---------------------------------------------------------------------------
// Forward scan
// ---------------------------------------------------------------------------

/// A forward scan. Batches arrive through the cursor's bulk segment; the
/// iterator state itself lives in the worker, keyed by (pid, cursor_id).
pub struct ScanCursor<'a> {
    client: &'a KvClient,
    cursor: CursorRef,
    segment: String,
    exhausted: bool,
    closed: bool,
}

impl ScanCursor<'_> {
    pub fn cursor_id(&self) -> u64 {
        self.cursor.cursor_id
    }

    /// Fetch the next batch. `None` once the scan is exhausted; exhaustion
    /// closes the worker-side cursor and unlinks the segment.
    pub fn next_batch(&mut self) -> Result<Option<Vec<(Vec<u8>, Vec<u8>)>>> {
        if self.closed {
            return Ok(None);
        }
        if self.exhausted {
            self.close()?;
            return Ok(None);
        }

        let mut entity = Vec::new();
        self.cursor.encode(&mut entity);
        let (header, body) =
            self.client
                .request(Op::ReadBatch, entity.len(), |buf| buf.copy_from_slice(&entity))?;
        if header.status != Status::Success {
            return Err(IpcError::Engine("read batch failed".to_string()));
        }
        let reply = BatchReply::decode(&body)?;

        let pairs = if reply.size > 0 {
            let reader = BulkReader::open(&self.segment, reply.size as usize)?;
            decode_batch(reader.as_slice())
        } else {
            Vec::new()
        };

        if !reply.next {
            self.exhausted = true;
        }
        if pairs.is_empty() && self.exhausted {
            self.close()?;
            return Ok(None);
        }
        Ok(Some(pairs))
    }

    /// Collect every remaining pair.
    pub fn collect_all(&mut self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut all = Vec::new();
        while let Some(batch) = self.next_batch()? {
            all.extend(batch);
        }
        Ok(all)
    }

    /// Close the worker-side cursor and unlink the bulk segment. Closing an
    /// already-closed (or never-started) cursor succeeds.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut entity = Vec::new();
        self.cursor.encode(&mut entity);
        let (header, _) =
            self.client
                .request(Op::DelCursor, entity.len(), |buf| buf.copy_from_slice(&entity))?;
        bulk::unlink(&self.segment);
        if header.status != Status::Success {
            return Err(IpcError::Engine("cursor close rejected".to_string()));
        }
        Ok(())
    }
}

impl Drop for ScanCursor<'_> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

// ---------------------------------------------------------------------------
// Range query
// ---------------------------------------------------------------------------

/// A range query session. The first request carries the bounds; subsequent
/// requests carry only the cursor reference.
pub struct RangeScan<'a> {
    client: &'a KvClient,
    cursor: CursorRef,
    segment: String,
    first: Option<RangeArgs>,
    exhausted: bool,
    closed: bool,
}

impl RangeScan<'_> {
    pub fn cursor_id(&self) -> u64 {
        self.cursor.cursor_id
    }

    /// Fetch the next batch; `None` once the range is exhausted.
    pub fn next_batch(&mut self) -> Result<Option<Vec<(Vec<u8>, Vec<u8>)>>> {
        if self.closed {
            return Ok(None);
        }
        if self.exhausted {
            self.close()?;
            return Ok(None);
        }

        let mut entity = Vec::new();
        match self.first.take() {
            Some(args) => args.encode(&mut entity),
            None => self.cursor.encode(&mut entity),
        }
        let (header, body) =
            self.client
                .request(Op::RangeQuery, entity.len(), |buf| buf.copy_from_slice(&entity))?;
        if header.status != Status::Success {
            return Err(IpcError::Engine("range query failed".to_string()));
        }
        let reply = BatchReply::decode(&body)?;

        let pairs = if reply.size > 0 {
            let reader = BulkReader::open(&self.segment, reply.size as usize)?;
            decode_batch(reader.as_slice())
        } else {
            Vec::new()
        };

        if !reply.next {
            self.exhausted = true;
        }
        if pairs.is_empty() && self.exhausted {
            self.close()?;
            return Ok(None);
        }
        Ok(Some(pairs))
    }

    /// Collect every remaining pair.
    pub fn collect_all(&mut self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut all = Vec::new();
        while let Some(batch) = self.next_batch()? {
            all.extend(batch);
        }
        Ok(all)
    }

    /// Clear the worker-side session and unlink the segment. Clearing is
    /// fire-and-forget on the wire.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut entity = Vec::new();
        self.cursor.encode(&mut entity);
        self.client
            .notify(Op::ClearRangeQuery, entity.len(), |buf| buf.copy_from_slice(&entity))?;
        bulk::unlink(&self.segment);
        Ok(())
    }
}

impl Drop for RangeScan<'_> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
