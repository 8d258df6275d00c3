// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 kvbridge contributors
//
// Shared-memory bridge between database backends and an embedded key-value
// engine hosted in a dedicated worker process. Backends send requests
// through a single-arena channel with leased response slots; scan batches
// too large for a slot travel through per-cursor bulk segments.

pub mod shm_name;

mod platform;

pub mod error;
pub use error::{IpcError, Result};

mod shm;
pub use shm::ShmSegment;

mod sem;
pub use sem::ShmSemaphore;

pub mod msg;
pub use msg::{EngineOptions, MsgHeader, Op, Status};

pub mod channel;
pub use channel::MsgChannel;

pub mod bulk;

pub mod engine;
pub use engine::{KvEngine, MemEngine};

pub mod worker;
pub use worker::Worker;

pub mod client;
pub use client::KvClient;

pub mod manager;
pub use manager::WorkerManager;
