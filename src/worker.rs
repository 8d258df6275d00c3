// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 kvbridge contributors
//
// The worker: one process per (database, worker-id), hosting one engine
// handle and serving requests from many client backends over the channel.
// All state is owned by the dispatch loop; nothing here needs locking.

use std::collections::HashMap;

use crate::bulk::{self, BulkWriter, READ_BATCH_SIZE};
use crate::channel::{MsgChannel, RESPONSE_SLOTS};
use crate::engine::{EngineCursor, KvEngine, RangeState};
use crate::error::{IpcError, Result};
use crate::msg::{
    BatchReply, CursorRef, MsgHeader, OpenArgs, Op, RangeArgs, Status, CURSOR_REF_SIZE,
    NO_RESPONSE_SLOT,
};
use crate::shm_name;

struct RangeSession {
    spec: crate::engine::RangeSpec,
    state: RangeState,
}

/// The per-worker dispatch loop and its owned state.
///
/// Engine handle lifecycle: `Closed → Open(ref=1) → Open(ref=n) → Closed`.
/// `Close` requests decrement the reference count but never close the
/// handle; closure happens only at worker termination, so the handle stays
/// warm across reference-zero transitions within the worker's lifetime.
pub struct Worker<E: KvEngine> {
    worker_id: String,
    channel: MsgChannel,
    engine: Option<E>,
    ref_count: u32,
    cursors: HashMap<CursorRef, E::Cursor>,
    ranges: HashMap<CursorRef, RangeSession>,
}

impl<E: KvEngine> Worker<E> {
    /// Attach to the channel for `worker_id`, creating it if the manager has
    /// not pre-created it (standalone and in-process test setups).
    pub fn start(worker_id: &str) -> Result<Self> {
        let name = shm_name::channel_name(worker_id);
        let channel = match MsgChannel::open(&name) {
            Ok(ch) => ch,
            Err(IpcError::System(_)) => MsgChannel::create(&name)?,
            Err(e) => return Err(e),
        };
        bulk::sweep_worker_segments(worker_id);
        Ok(Self {
            worker_id: worker_id.to_string(),
            channel,
            engine: None,
            ref_count: 0,
            cursors: HashMap::new(),
            ranges: HashMap::new(),
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Serve requests until a `Terminate` arrives or the channel fails.
    /// Tears the channel down on both exits; engine errors never end the
    /// loop, they become `Failure` responses.
    pub fn run(&mut self) -> Result<()> {
        self.channel.post_worker_ready()?;
        tracing::info!(worker_id = %self.worker_id, "worker ready");

        loop {
            let (header, body) = match self.channel.worker_recv_request() {
                Ok(msg) => msg,
                Err(IpcError::Protocol(m)) => {
                    tracing::warn!(worker_id = %self.worker_id, "dropping malformed request: {m}");
                    continue;
                }
                Err(e) => {
                    tracing::error!(worker_id = %self.worker_id, error = %e, "channel receive failed");
                    self.teardown();
                    return Err(e);
                }
            };

            match self.dispatch(&header, &body) {
                Ok(true) => {}
                Ok(false) => break,
                Err(IpcError::Protocol(m)) => {
                    tracing::warn!(worker_id = %self.worker_id, op = ?header.op, "protocol violation: {m}");
                }
                Err(e) => {
                    tracing::error!(worker_id = %self.worker_id, error = %e, "dispatch failed");
                    self.teardown();
                    return Err(e);
                }
            }
        }

        self.teardown();
        Ok(())
    }

    /// Handle one request. Returns `Ok(false)` when the loop should stop.
    fn dispatch(&mut self, header: &MsgHeader, body: &[u8]) -> Result<bool> {
        let slot = match header.rps_id {
            NO_RESPONSE_SLOT => None,
            k if (k as usize) < RESPONSE_SLOTS => Some(k as usize),
            k => return Err(IpcError::protocol(format!("response slot {k} out of range"))),
        };

        match header.op {
            Op::Open => self.handle_open(header, slot, body)?,
            Op::Close => {
                self.ref_count = self.ref_count.saturating_sub(1);
                self.respond_status(header, slot, Status::Success)?;
            }
            Op::Count => match &self.engine {
                Some(engine) => {
                    let mut entity = Vec::new();
                    crate::msg::encode_u64(&mut entity, engine.count());
                    self.respond_entity(header, slot, Status::Success, &entity)?;
                }
                None => self.respond_status(header, slot, Status::Failure)?,
            },
            Op::Put => {
                let status = self.apply_put(body)?;
                self.respond_status(header, slot, status)?;
            }
            Op::Load => {
                // Fire-and-forget bulk load path: failures are only logged.
                if self.apply_put(body)? != Status::Success {
                    tracing::warn!(worker_id = %self.worker_id, "load request failed");
                }
            }
            Op::Get => self.handle_get(header, slot, body)?,
            Op::Del => {
                let key = decode_key(body);
                let status = match &mut self.engine {
                    Some(engine) => {
                        if engine.delete(key) {
                            Status::Success
                        } else {
                            Status::Failure
                        }
                    }
                    None => Status::Failure,
                };
                self.respond_status(header, slot, status)?;
            }
            Op::ReadBatch => self.handle_read_batch(header, slot, body)?,
            Op::DelCursor => {
                let cursor = CursorRef::decode(body)?;
                // Absent cursors are fine: closing twice must succeed.
                self.cursors.remove(&cursor);
                self.respond_status(header, slot, Status::Success)?;
            }
            Op::RangeQuery => self.handle_range_query(header, slot, body)?,
            Op::ClearRangeQuery => {
                let cursor = CursorRef::decode_prefix(body)?;
                self.ranges.remove(&cursor);
                bulk::unlink(&shm_name::range_query_name(
                    cursor.pid,
                    &self.worker_id,
                    cursor.cursor_id,
                ));
            }
            Op::Terminate => {
                tracing::info!(worker_id = %self.worker_id, "terminate requested");
                self.respond_status(header, slot, Status::Success)?;
                return Ok(false);
            }
            Op::Dummy | Op::Launch => {
                self.respond_status(header, slot, Status::Exception)?;
                return Err(IpcError::protocol(format!(
                    "op {:?} is not served by workers",
                    header.op
                )));
            }
        }
        Ok(true)
    }

    fn handle_open(&mut self, header: &MsgHeader, slot: Option<usize>, body: &[u8]) -> Result<()> {
        let args = OpenArgs::decode(body)?;
        if self.engine.is_none() {
            match E::open(&args.path, &args.options, args.column_flag, args.attr_count) {
                Ok(engine) => {
                    tracing::info!(worker_id = %self.worker_id, path = %args.path, "engine opened");
                    self.engine = Some(engine);
                }
                Err(e) => {
                    tracing::warn!(worker_id = %self.worker_id, path = %args.path, "engine open failed: {e}");
                    return self.respond_status(header, slot, Status::Failure);
                }
            }
        }
        self.ref_count += 1;
        self.respond_status(header, slot, Status::Success)
    }

    fn apply_put(&mut self, body: &[u8]) -> Result<Status> {
        let (key, value) = crate::msg::decode_put(body)?;
        Ok(match &mut self.engine {
            Some(engine) => {
                if engine.put(key, value) {
                    Status::Success
                } else {
                    Status::Failure
                }
            }
            None => Status::Failure,
        })
    }

    fn handle_get(&mut self, header: &MsgHeader, slot: Option<usize>, body: &[u8]) -> Result<()> {
        let key = decode_key(body);
        match self.engine.as_ref().and_then(|e| e.get(key)) {
            Some(value) => {
                if crate::msg::HEADER_SIZE + value.len() > crate::channel::SLOT_SIZE {
                    tracing::warn!(
                        worker_id = %self.worker_id,
                        value_len = value.len(),
                        "value exceeds response slot, reporting failure"
                    );
                    return self.respond_status(header, slot, Status::Failure);
                }
                self.respond_entity(header, slot, Status::Success, &value)
            }
            None => self.respond_status(header, slot, Status::Failure),
        }
    }

    fn handle_read_batch(
        &mut self,
        header: &MsgHeader,
        slot: Option<usize>,
        body: &[u8],
    ) -> Result<()> {
        let cursor = CursorRef::decode(body)?;
        let Some(engine) = self.engine.as_ref() else {
            return self.respond_status(header, slot, Status::Failure);
        };
        let iter = self
            .cursors
            .entry(cursor)
            .or_insert_with(|| engine.cursor());

        let name = shm_name::read_batch_name(cursor.pid, &self.worker_id, cursor.cursor_id);
        let mut writer = BulkWriter::create(&name, READ_BATCH_SIZE)?;
        let (next, size) = iter.batch_read(writer.as_mut_slice());
        drop(writer);

        let reply = BatchReply {
            next,
            size: size as u64,
        };
        let mut entity = Vec::new();
        reply.encode(&mut entity);
        self.respond_entity(header, slot, Status::Success, &entity)
    }

    fn handle_range_query(
        &mut self,
        header: &MsgHeader,
        slot: Option<usize>,
        body: &[u8],
    ) -> Result<()> {
        let cursor = CursorRef::decode_prefix(body)?;
        if body.len() > CURSOR_REF_SIZE {
            // First call for this cursor: the full range payload is present.
            // Bounds are copied out of the arena — the arena is recycled the
            // moment the drain gate was posted.
            let args = RangeArgs::decode(body)?;
            self.ranges.insert(
                cursor,
                RangeSession {
                    spec: args.into(),
                    state: RangeState::new(),
                },
            );
        }

        let Some(engine) = self.engine.as_ref() else {
            return self.respond_status(header, slot, Status::Failure);
        };
        let Some(session) = self.ranges.get_mut(&cursor) else {
            tracing::warn!(worker_id = %self.worker_id, ?cursor, "range query without an open session");
            return self.respond_status(header, slot, Status::Failure);
        };

        // Drive the engine until it produces data or runs dry.
        let (mut next, mut batch) = engine.range_read(&session.spec, &mut session.state);
        while next && batch.is_empty() {
            let (n, b) = engine.range_read(&session.spec, &mut session.state);
            next = n;
            batch = b;
        }

        if !batch.is_empty() {
            let name = shm_name::range_query_name(cursor.pid, &self.worker_id, cursor.cursor_id);
            let mut writer = BulkWriter::create(&name, batch.len())?;
            writer.write(&batch);
        }

        let reply = BatchReply {
            next,
            size: batch.len() as u64,
        };
        let mut entity = Vec::new();
        reply.encode(&mut entity);
        self.respond_entity(header, slot, Status::Success, &entity)
    }

    fn respond_status(&self, header: &MsgHeader, slot: Option<usize>, status: Status) -> Result<()> {
        self.respond_entity(header, slot, status, &[])
    }

    fn respond_entity(
        &self,
        header: &MsgHeader,
        slot: Option<usize>,
        status: Status,
        entity: &[u8],
    ) -> Result<()> {
        let Some(slot) = slot else {
            return Ok(());
        };
        let rsp = MsgHeader::response(header, status, entity.len() as u64);
        self.channel
            .worker_send_response(slot, &rsp, |buf| buf.copy_from_slice(entity))
    }

    /// Reclaim everything this worker owns: leaked cursors and range
    /// sessions (and their segments), the engine handle, and the channel.
    fn teardown(&mut self) {
        for (cursor, _) in self.cursors.drain() {
            bulk::unlink(&shm_name::read_batch_name(
                cursor.pid,
                &self.worker_id,
                cursor.cursor_id,
            ));
        }
        for (cursor, _) in self.ranges.drain() {
            bulk::unlink(&shm_name::range_query_name(
                cursor.pid,
                &self.worker_id,
                cursor.cursor_id,
            ));
        }
        self.engine = None;
        self.ref_count = 0;
        self.channel.destroy();
        tracing::info!(worker_id = %self.worker_id, "worker shut down");
    }
}

/// Get/Del entities are the raw key bytes; the length is the entity length.
fn decode_key(body: &[u8]) -> &[u8] {
    body
}
