// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 kvbridge contributors
//
// Wire format: the fixed message header and the per-op entity codecs.
// Raw binary, little-endian, length-prefixed at the header — no framing
// beyond that. This IPC never leaves the host.

use crate::error::{IpcError, Result};

/// Exact byte size of the packed wire header.
pub const HEADER_SIZE: usize = 28;

/// Value of `rps_id` for fire-and-forget requests that lease no slot.
pub const NO_RESPONSE_SLOT: u32 = u32::MAX;

// ---------------------------------------------------------------------------
// Operation and status codes
// ---------------------------------------------------------------------------

/// Operation code carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Op {
    Dummy = 0,
    Open,
    Close,
    Count,
    Put,
    Get,
    Del,
    Load,
    ReadBatch,
    DelCursor,
    RangeQuery,
    ClearRangeQuery,
    Launch,
    Terminate,
}

impl Op {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => Op::Dummy,
            1 => Op::Open,
            2 => Op::Close,
            3 => Op::Count,
            4 => Op::Put,
            5 => Op::Get,
            6 => Op::Del,
            7 => Op::Load,
            8 => Op::ReadBatch,
            9 => Op::DelCursor,
            10 => Op::RangeQuery,
            11 => Op::ClearRangeQuery,
            12 => Op::Launch,
            13 => Op::Terminate,
            _ => return None,
        })
    }

}

/// Status code carried in the header of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
    Dummy = 0,
    Success,
    Failure,
    Exception,
}

impl Status {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => Status::Dummy,
            1 => Status::Success,
            2 => Status::Failure,
            3 => Status::Exception,
            _ => return None,
        })
    }
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// The fixed-size message header.
///
/// Encoded packed, field by field, little-endian:
/// `op:u32 | db_id:u32 | rel_id:u32 | status:u32 | rps_id:u32 | ety_size:u64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    pub op: Op,
    pub db_id: u32,
    pub rel_id: u32,
    pub status: Status,
    /// Response slot index leased by the requester; `NO_RESPONSE_SLOT` when
    /// no response is expected. Valid only on request→response paths.
    pub rps_id: u32,
    /// Exact byte length of the entity that follows the header.
    pub ety_size: u64,
}

impl MsgHeader {
    /// A request header with no status and no slot assigned yet.
    pub fn request(op: Op, db_id: u32, rel_id: u32, ety_size: u64) -> Self {
        Self {
            op,
            db_id,
            rel_id,
            status: Status::Dummy,
            rps_id: NO_RESPONSE_SLOT,
            ety_size,
        }
    }

    /// A response header echoing the request's addressing.
    pub fn response(req: &MsgHeader, status: Status, ety_size: u64) -> Self {
        Self {
            op: req.op,
            db_id: req.db_id,
            rel_id: req.rel_id,
            status,
            rps_id: req.rps_id,
            ety_size,
        }
    }

    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&(self.op as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&self.db_id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.rel_id.to_le_bytes());
        buf[12..16].copy_from_slice(&(self.status as u32).to_le_bytes());
        buf[16..20].copy_from_slice(&self.rps_id.to_le_bytes());
        buf[20..28].copy_from_slice(&self.ety_size.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(IpcError::protocol("short header"));
        }
        let op_raw = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let op = Op::from_u32(op_raw)
            .ok_or_else(|| IpcError::protocol(format!("unknown op code {op_raw}")))?;
        let status_raw = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        let status = Status::from_u32(status_raw)
            .ok_or_else(|| IpcError::protocol(format!("unknown status code {status_raw}")))?;
        Ok(Self {
            op,
            db_id: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            rel_id: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            status,
            rps_id: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            ety_size: u64::from_le_bytes(buf[20..28].try_into().unwrap()),
        })
    }
}

// ---------------------------------------------------------------------------
// Entity reader — bounds-checked cursor over a received entity
// ---------------------------------------------------------------------------

struct EntityReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> EntityReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&e| e <= self.buf.len())
            .ok_or_else(|| IpcError::protocol("entity shorter than its layout"))?;
        let s = &self.buf[self.pos..end];
        self.pos = end;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn rest(&mut self) -> &'a [u8] {
        let s = &self.buf[self.pos..];
        self.pos = self.buf.len();
        s
    }

    fn finish(&self) -> Result<()> {
        if self.pos != self.buf.len() {
            return Err(IpcError::protocol("entity longer than its layout"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Open
// ---------------------------------------------------------------------------

/// Fixed-size engine configuration, passed through the wire unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    pub create_if_missing: bool,
    pub compression: bool,
    pub write_buffer_bytes: u64,
    pub max_open_files: i32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            compression: false,
            write_buffer_bytes: 4 * 1024 * 1024,
            max_open_files: 64,
        }
    }
}

pub const ENGINE_OPTIONS_SIZE: usize = 14;

impl EngineOptions {
    fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.create_if_missing as u8);
        out.push(self.compression as u8);
        out.extend_from_slice(&self.write_buffer_bytes.to_le_bytes());
        out.extend_from_slice(&self.max_open_files.to_le_bytes());
    }

    fn decode(r: &mut EntityReader<'_>) -> Result<Self> {
        Ok(Self {
            create_if_missing: r.u8()? != 0,
            compression: r.u8()? != 0,
            write_buffer_bytes: r.u64()?,
            max_open_files: r.i32()?,
        })
    }
}

/// `Open` entity: options block, column layout selector, engine path.
///
/// The column block is always present; row-store encodes flag 0 / count 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenArgs {
    pub options: EngineOptions,
    /// 0 = row store, 1 = column store.
    pub column_flag: u8,
    /// Number of columns in column-store mode; 0 otherwise.
    pub attr_count: i32,
    pub path: String,
}

impl OpenArgs {
    pub fn encoded_len(&self) -> usize {
        ENGINE_OPTIONS_SIZE + 1 + 4 + self.path.len()
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        self.options.encode(out);
        out.push(self.column_flag);
        out.extend_from_slice(&self.attr_count.to_le_bytes());
        out.extend_from_slice(self.path.as_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = EntityReader::new(buf);
        let options = EngineOptions::decode(&mut r)?;
        let column_flag = r.u8()?;
        let attr_count = r.i32()?;
        let path = std::str::from_utf8(r.rest())
            .map_err(|_| IpcError::protocol("open path is not utf-8"))?
            .to_string();
        Ok(Self {
            options,
            column_flag,
            attr_count,
            path,
        })
    }
}

// ---------------------------------------------------------------------------
// Put / Load
// ---------------------------------------------------------------------------

/// Entity length of a `Put`/`Load` request for `key` and `value`.
pub fn put_entity_len(key: &[u8], value: &[u8]) -> usize {
    8 + key.len() + value.len()
}

/// `key_len(u64) || key || value`; the value length is implied by `ety_size`.
pub fn encode_put(out: &mut Vec<u8>, key: &[u8], value: &[u8]) {
    out.extend_from_slice(&(key.len() as u64).to_le_bytes());
    out.extend_from_slice(key);
    out.extend_from_slice(value);
}

pub fn decode_put(buf: &[u8]) -> Result<(&[u8], &[u8])> {
    let mut r = EntityReader::new(buf);
    let key_len = r.u64()? as usize;
    let key = r.take(key_len)?;
    let value = r.rest();
    Ok((key, value))
}

// ---------------------------------------------------------------------------
// Cursor addressing
// ---------------------------------------------------------------------------

/// Identifies a scan cursor owned by one client process on one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CursorRef {
    pub pid: u32,
    /// Monotonically increasing id allocated by the client.
    pub cursor_id: u64,
}

pub const CURSOR_REF_SIZE: usize = 12;

impl CursorRef {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.pid.to_le_bytes());
        out.extend_from_slice(&self.cursor_id.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = EntityReader::new(buf);
        let v = Self::decode_from(&mut r)?;
        r.finish()?;
        Ok(v)
    }

    /// Decode just the leading cursor reference, leaving the rest unread.
    /// `RangeQuery` entities start with one.
    pub fn decode_prefix(buf: &[u8]) -> Result<Self> {
        let mut r = EntityReader::new(buf);
        Self::decode_from(&mut r)
    }

    fn decode_from(r: &mut EntityReader<'_>) -> Result<Self> {
        Ok(Self {
            pid: r.u32()?,
            cursor_id: r.u64()?,
        })
    }
}

// ---------------------------------------------------------------------------
// RangeQuery
// ---------------------------------------------------------------------------

/// `RangeQuery` entity, present in full only on the first call for a cursor;
/// subsequent calls carry just the `CursorRef`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeArgs {
    pub cursor: CursorRef,
    pub start: Vec<u8>,
    pub limit: Vec<u8>,
    /// Soft cap on bytes per returned batch.
    pub batch_capacity: u64,
    pub attrs: Vec<i32>,
}

impl RangeArgs {
    pub fn encoded_len(&self) -> usize {
        CURSOR_REF_SIZE + 8 + self.start.len() + 8 + self.limit.len() + 8 + 4 + 4 * self.attrs.len()
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        self.cursor.encode(out);
        out.extend_from_slice(&(self.start.len() as u64).to_le_bytes());
        out.extend_from_slice(&self.start);
        out.extend_from_slice(&(self.limit.len() as u64).to_le_bytes());
        out.extend_from_slice(&self.limit);
        out.extend_from_slice(&self.batch_capacity.to_le_bytes());
        out.extend_from_slice(&(self.attrs.len() as i32).to_le_bytes());
        for a in &self.attrs {
            out.extend_from_slice(&a.to_le_bytes());
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = EntityReader::new(buf);
        let cursor = CursorRef::decode_from(&mut r)?;
        let start_len = r.u64()? as usize;
        let start = r.take(start_len)?.to_vec();
        let limit_len = r.u64()? as usize;
        let limit = r.take(limit_len)?.to_vec();
        let batch_capacity = r.u64()?;
        let attr_count = r.i32()?;
        if attr_count < 0 {
            return Err(IpcError::protocol("negative attr count"));
        }
        let mut attrs = Vec::with_capacity(attr_count as usize);
        for _ in 0..attr_count {
            attrs.push(r.i32()?);
        }
        r.finish()?;
        Ok(Self {
            cursor,
            start,
            limit,
            batch_capacity,
            attrs,
        })
    }
}

// ---------------------------------------------------------------------------
// Replies
// ---------------------------------------------------------------------------

/// `ReadBatch` / `RangeQuery` response: has-more flag plus the byte size of
/// the batch waiting in the bulk segment (0 = no segment was written).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchReply {
    pub next: bool,
    pub size: u64,
}

pub const BATCH_REPLY_SIZE: usize = 9;

impl BatchReply {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.next as u8);
        out.extend_from_slice(&self.size.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = EntityReader::new(buf);
        let next = r.u8()? != 0;
        let size = r.u64()?;
        r.finish()?;
        Ok(Self { next, size })
    }
}

/// `Count` response entity.
pub fn encode_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn decode_u64(buf: &[u8]) -> Result<u64> {
    let mut r = EntityReader::new(buf);
    let v = r.u64()?;
    r.finish()?;
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let h = MsgHeader {
            op: Op::RangeQuery,
            db_id: 7,
            rel_id: 16384,
            status: Status::Success,
            rps_id: 3,
            ety_size: 0xdead_beef,
        };
        let mut buf = [0u8; HEADER_SIZE];
        h.encode(&mut buf);
        assert_eq!(MsgHeader::decode(&buf).unwrap(), h);
    }

    #[test]
    fn header_rejects_unknown_op() {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&999u32.to_le_bytes());
        assert!(MsgHeader::decode(&buf).is_err());
    }

    #[test]
    fn open_round_trip() {
        let args = OpenArgs {
            options: EngineOptions {
                create_if_missing: true,
                compression: true,
                write_buffer_bytes: 1 << 20,
                max_open_files: 128,
            },
            column_flag: 1,
            attr_count: 5,
            path: "/data/t".to_string(),
        };
        let mut buf = Vec::new();
        args.encode(&mut buf);
        assert_eq!(buf.len(), args.encoded_len());
        assert_eq!(OpenArgs::decode(&buf).unwrap(), args);
    }

    #[test]
    fn put_round_trip() {
        let mut buf = Vec::new();
        encode_put(&mut buf, b"key", b"value bytes");
        assert_eq!(buf.len(), put_entity_len(b"key", b"value bytes"));
        let (k, v) = decode_put(&buf).unwrap();
        assert_eq!(k, b"key");
        assert_eq!(v, b"value bytes");
    }

    #[test]
    fn put_empty_value() {
        let mut buf = Vec::new();
        encode_put(&mut buf, b"k", b"");
        let (k, v) = decode_put(&buf).unwrap();
        assert_eq!(k, b"k");
        assert!(v.is_empty());
    }

    #[test]
    fn cursor_ref_round_trip() {
        let c = CursorRef {
            pid: 4242,
            cursor_id: u64::MAX - 1,
        };
        let mut buf = Vec::new();
        c.encode(&mut buf);
        assert_eq!(buf.len(), CURSOR_REF_SIZE);
        assert_eq!(CursorRef::decode(&buf).unwrap(), c);
    }

    #[test]
    fn cursor_ref_rejects_trailing_bytes() {
        let mut buf = Vec::new();
        CursorRef {
            pid: 1,
            cursor_id: 2,
        }
        .encode(&mut buf);
        buf.push(0);
        assert!(CursorRef::decode(&buf).is_err());
        // ...but the prefix decoder tolerates them by design.
        assert!(CursorRef::decode_prefix(&buf).is_ok());
    }

    #[test]
    fn range_args_round_trip() {
        let args = RangeArgs {
            cursor: CursorRef {
                pid: 9,
                cursor_id: 3,
            },
            start: b"k1".to_vec(),
            limit: b"k5".to_vec(),
            batch_capacity: 4096,
            attrs: vec![1, 2, 4],
        };
        let mut buf = Vec::new();
        args.encode(&mut buf);
        assert_eq!(buf.len(), args.encoded_len());
        assert_eq!(RangeArgs::decode(&buf).unwrap(), args);
    }

    #[test]
    fn range_args_empty_bounds() {
        let args = RangeArgs {
            cursor: CursorRef {
                pid: 1,
                cursor_id: 1,
            },
            start: Vec::new(),
            limit: Vec::new(),
            batch_capacity: 0,
            attrs: Vec::new(),
        };
        let mut buf = Vec::new();
        args.encode(&mut buf);
        assert_eq!(RangeArgs::decode(&buf).unwrap(), args);
    }

    #[test]
    fn batch_reply_round_trip() {
        for reply in [
            BatchReply {
                next: true,
                size: 16384,
            },
            BatchReply {
                next: false,
                size: 0,
            },
        ] {
            let mut buf = Vec::new();
            reply.encode(&mut buf);
            assert_eq!(buf.len(), BATCH_REPLY_SIZE);
            assert_eq!(BatchReply::decode(&buf).unwrap(), reply);
        }
    }

    #[test]
    fn truncated_entities_are_rejected() {
        let mut buf = Vec::new();
        encode_put(&mut buf, b"longish-key", b"v");
        assert!(decode_put(&buf[..8]).is_err());

        let args = RangeArgs {
            cursor: CursorRef {
                pid: 1,
                cursor_id: 1,
            },
            start: b"a".to_vec(),
            limit: b"z".to_vec(),
            batch_capacity: 64,
            attrs: vec![7],
        };
        let mut buf = Vec::new();
        args.encode(&mut buf);
        assert!(RangeArgs::decode(&buf[..buf.len() - 1]).is_err());
    }
}
