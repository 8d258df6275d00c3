// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 kvbridge contributors
//
// The storage engine seam. The worker drives engines only through these
// traits; iterator state stays inside the worker process because native
// engine iterators cannot cross a process boundary.
//
// Batches travel as a flat run of length-prefixed pairs:
//   key_len(u64) || key || val_len(u64) || val, repeated.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, RwLock};

use crate::msg::{EngineOptions, RangeArgs};

/// An opened key-value engine instance, owned by one worker.
pub trait KvEngine: Sized + Send {
    type Cursor: EngineCursor;

    /// Open (or create) the engine at `path`. `column_flag`/`attr_count`
    /// select the row-store or column-store layout.
    fn open(
        path: &str,
        opts: &EngineOptions,
        column_flag: u8,
        attr_count: i32,
    ) -> std::result::Result<Self, String>;

    fn count(&self) -> u64;

    fn put(&mut self, key: &[u8], value: &[u8]) -> bool;

    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    fn delete(&mut self, key: &[u8]) -> bool;

    /// A forward-scan cursor positioned before the first key.
    fn cursor(&self) -> Self::Cursor;

    /// Produce the next range batch. Returns the has-more flag and the
    /// serialized batch (empty when the range is exhausted).
    fn range_read(&self, spec: &RangeSpec, state: &mut RangeState) -> (bool, Vec<u8>);
}

/// A forward-scan iterator held in the worker on behalf of one client cursor.
pub trait EngineCursor: Send {
    /// Serialize pairs into `buf` from the current position. Returns
    /// (has_more, bytes_written). A pair that does not fit `buf` whole is
    /// left for the next batch; pairs larger than the whole buffer are not
    /// supported by the forward-scan path.
    fn batch_read(&mut self, buf: &mut [u8]) -> (bool, usize);
}

// ---------------------------------------------------------------------------
// Range queries
// ---------------------------------------------------------------------------

/// Bounds and shape of a range query; copied out of the request on the
/// first call for a cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeSpec {
    /// Inclusive lower bound.
    pub start: Vec<u8>,
    /// Exclusive upper bound; empty = unbounded.
    pub limit: Vec<u8>,
    /// Soft cap on bytes per batch; 0 = uncapped. A batch always carries at
    /// least one pair.
    pub batch_capacity: u64,
    /// Column projection for column-store engines; ignored by row stores.
    pub attrs: Vec<i32>,
}

impl From<RangeArgs> for RangeSpec {
    fn from(args: RangeArgs) -> Self {
        Self {
            start: args.start,
            limit: args.limit,
            batch_capacity: args.batch_capacity,
            attrs: args.attrs,
        }
    }
}

/// Mutable read position of an in-progress range query.
#[derive(Debug, Default)]
pub struct RangeState {
    resume: Option<Vec<u8>>,
    done: bool,
}

impl RangeState {
    pub fn new() -> Self {
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Batch serialization
// ---------------------------------------------------------------------------

pub fn pair_encoded_len(key: &[u8], value: &[u8]) -> usize {
    16 + key.len() + value.len()
}

pub fn encode_pair(out: &mut Vec<u8>, key: &[u8], value: &[u8]) {
    out.extend_from_slice(&(key.len() as u64).to_le_bytes());
    out.extend_from_slice(key);
    out.extend_from_slice(&(value.len() as u64).to_le_bytes());
    out.extend_from_slice(value);
}

fn write_pair_into(buf: &mut [u8], key: &[u8], value: &[u8]) {
    let (klen, rest) = buf.split_at_mut(8);
    klen.copy_from_slice(&(key.len() as u64).to_le_bytes());
    let (kbuf, rest) = rest.split_at_mut(key.len());
    kbuf.copy_from_slice(key);
    let (vlen, rest) = rest.split_at_mut(8);
    vlen.copy_from_slice(&(value.len() as u64).to_le_bytes());
    rest[..value.len()].copy_from_slice(value);
}

/// Decodes a serialized batch pair by pair. Stops at the first malformed
/// length prefix.
pub struct BatchReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BatchReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take_len(&mut self) -> Option<usize> {
        let end = self.pos.checked_add(8)?;
        if end > self.buf.len() {
            return None;
        }
        let len = u64::from_le_bytes(self.buf[self.pos..end].try_into().unwrap()) as usize;
        self.pos = end;
        Some(len)
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        if end > self.buf.len() {
            return None;
        }
        let s = &self.buf[self.pos..end];
        self.pos = end;
        Some(s)
    }
}

impl<'a> Iterator for BatchReader<'a> {
    type Item = (&'a [u8], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos == self.buf.len() {
            return None;
        }
        let klen = self.take_len()?;
        let key = self.take(klen)?;
        let vlen = self.take_len()?;
        let value = self.take(vlen)?;
        Some((key, value))
    }
}

/// Decode a whole batch into owned pairs.
pub fn decode_batch(buf: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
    BatchReader::new(buf)
        .map(|(k, v)| (k.to_vec(), v.to_vec()))
        .collect()
}

// ---------------------------------------------------------------------------
// MemEngine — ordered in-memory engine
// ---------------------------------------------------------------------------

/// An ordered in-memory engine. Backs the worker binary and the test suite;
/// production deployments plug a persistent engine into the same traits.
pub struct MemEngine {
    path: String,
    data: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl KvEngine for MemEngine {
    type Cursor = MemCursor;

    fn open(
        path: &str,
        _opts: &EngineOptions,
        column_flag: u8,
        attr_count: i32,
    ) -> std::result::Result<Self, String> {
        if path.is_empty() {
            return Err("engine path is empty".to_string());
        }
        if column_flag != 0 && attr_count <= 0 {
            return Err(format!(
                "column store needs a positive attr count, got {attr_count}"
            ));
        }
        Ok(Self {
            path: path.to_string(),
            data: Arc::new(RwLock::new(BTreeMap::new())),
        })
    }

    fn count(&self) -> u64 {
        self.data.read().unwrap().len() as u64
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> bool {
        if key.is_empty() {
            return false;
        }
        self.data
            .write()
            .unwrap()
            .insert(key.to_vec(), value.to_vec());
        true
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.data.read().unwrap().get(key).cloned()
    }

    fn delete(&mut self, key: &[u8]) -> bool {
        self.data.write().unwrap().remove(key).is_some()
    }

    fn cursor(&self) -> MemCursor {
        MemCursor {
            data: Arc::clone(&self.data),
            resume: None,
        }
    }

    fn range_read(&self, spec: &RangeSpec, state: &mut RangeState) -> (bool, Vec<u8>) {
        if state.done {
            return (false, Vec::new());
        }
        let cap = if spec.batch_capacity == 0 {
            usize::MAX
        } else {
            spec.batch_capacity as usize
        };

        let map = self.data.read().unwrap();
        let lower = match &state.resume {
            Some(k) => Bound::Excluded(k.clone()),
            None => Bound::Included(spec.start.clone()),
        };
        let upper = if spec.limit.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(spec.limit.clone())
        };

        let mut out = Vec::new();
        let mut last: Option<Vec<u8>> = None;
        let mut has_more = false;
        for (k, v) in map.range::<Vec<u8>, _>((lower, upper)) {
            if !out.is_empty() && out.len() + pair_encoded_len(k, v) > cap {
                has_more = true;
                break;
            }
            encode_pair(&mut out, k, v);
            last = Some(k.clone());
        }
        drop(map);

        if let Some(k) = last {
            state.resume = Some(k);
        }
        if !has_more {
            state.done = true;
        }
        (has_more, out)
    }
}

impl MemEngine {
    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Resume-after-key cursor over a [`MemEngine`].
pub struct MemCursor {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
    resume: Option<Vec<u8>>,
}

impl EngineCursor for MemCursor {
    fn batch_read(&mut self, buf: &mut [u8]) -> (bool, usize) {
        let mut written = 0usize;
        let mut last: Option<Vec<u8>> = None;
        let mut has_more = false;
        {
            let map = self.data.read().unwrap();
            let iter: Box<dyn Iterator<Item = (&Vec<u8>, &Vec<u8>)>> = match &self.resume {
                None => Box::new(map.iter()),
                Some(k) => {
                    Box::new(map.range::<Vec<u8>, _>((Bound::Excluded(k.clone()), Bound::Unbounded)))
                }
            };
            for (k, v) in iter {
                let need = pair_encoded_len(k, v);
                if written + need > buf.len() {
                    has_more = true;
                    break;
                }
                write_pair_into(&mut buf[written..], k, v);
                written += need;
                last = Some(k.clone());
            }
        }
        if let Some(k) = last {
            self.resume = Some(k);
        }
        (has_more, written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with(pairs: &[(&str, &str)]) -> MemEngine {
        let mut e = MemEngine::open("/data/t", &EngineOptions::default(), 0, 0).unwrap();
        for (k, v) in pairs {
            assert!(e.put(k.as_bytes(), v.as_bytes()));
        }
        e
    }

    #[test]
    fn put_get_delete_count() {
        let mut e = engine_with(&[("a", "1")]);
        assert_eq!(e.count(), 1);
        assert_eq!(e.get(b"a"), Some(b"1".to_vec()));
        assert!(e.delete(b"a"));
        assert!(!e.delete(b"a"));
        assert_eq!(e.get(b"a"), None);
        assert_eq!(e.count(), 0);
    }

    #[test]
    fn empty_key_is_rejected() {
        let mut e = engine_with(&[]);
        assert!(!e.put(b"", b"v"));
    }

    #[test]
    fn column_store_needs_attrs() {
        assert!(MemEngine::open("/data/t", &EngineOptions::default(), 1, 0).is_err());
        assert!(MemEngine::open("/data/t", &EngineOptions::default(), 1, 3).is_ok());
    }

    #[test]
    fn cursor_resumes_across_batches() {
        let e = engine_with(&[("a", "1"), ("b", "2"), ("c", "3"), ("d", "4")]);
        let mut cur = e.cursor();
        // A buffer that fits two pairs per batch (each pair is 16 + 1 + 1).
        let mut buf = [0u8; 36];
        let mut seen = Vec::new();
        loop {
            let (more, n) = cur.batch_read(&mut buf);
            seen.extend(decode_batch(&buf[..n]));
            if !more {
                break;
            }
        }
        let keys: Vec<_> = seen.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
    }

    #[test]
    fn batch_read_reports_exact_sizes() {
        let e = engine_with(&[("k", "vv")]);
        let mut cur = e.cursor();
        let mut buf = [0u8; 64];
        let (more, n) = cur.batch_read(&mut buf);
        assert!(!more);
        assert_eq!(n, pair_encoded_len(b"k", b"vv"));
        // Exhausted cursor keeps returning empty batches.
        let (more, n) = cur.batch_read(&mut buf);
        assert!(!more);
        assert_eq!(n, 0);
    }

    #[test]
    fn range_read_respects_bounds_and_capacity() {
        let e = engine_with(&[("k1", "a"), ("k2", "b"), ("k3", "c"), ("k4", "d"), ("k5", "e")]);
        let spec = RangeSpec {
            start: b"k1".to_vec(),
            limit: b"k5".to_vec(),
            batch_capacity: 2 * pair_encoded_len(b"k1", b"a") as u64,
            attrs: Vec::new(),
        };
        let mut state = RangeState::new();
        let mut seen = Vec::new();
        let mut rounds = 0;
        loop {
            let (more, batch) = e.range_read(&spec, &mut state);
            seen.extend(decode_batch(&batch));
            rounds += 1;
            if !more {
                break;
            }
        }
        assert_eq!(rounds, 2);
        let keys: Vec<_> = seen.iter().map(|(k, _)| String::from_utf8_lossy(k).to_string()).collect();
        assert_eq!(keys, vec!["k1", "k2", "k3", "k4"]);
        // Exhausted state stays exhausted.
        let (more, batch) = e.range_read(&spec, &mut state);
        assert!(!more);
        assert!(batch.is_empty());
    }

    #[test]
    fn range_read_unbounded_limit() {
        let e = engine_with(&[("a", "1"), ("b", "2")]);
        let spec = RangeSpec {
            start: Vec::new(),
            limit: Vec::new(),
            batch_capacity: 0,
            attrs: Vec::new(),
        };
        let mut state = RangeState::new();
        let (more, batch) = e.range_read(&spec, &mut state);
        assert!(!more);
        assert_eq!(decode_batch(&batch).len(), 2);
    }

    #[test]
    fn batch_reader_stops_on_garbage() {
        let mut buf = Vec::new();
        encode_pair(&mut buf, b"k", b"v");
        buf.extend_from_slice(&[0xff; 3]); // trailing garbage
        let pairs: Vec<_> = BatchReader::new(&buf).collect();
        assert_eq!(pairs.len(), 1);
    }
}
