// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 kvbridge contributors
//
// Error kinds shared by the IPC fabric, the worker, and the client.

use std::io;

/// Errors that can occur in the shared-memory fabric and its users.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// A shared-memory or semaphore syscall failed.
    #[error("ipc system error: {0}")]
    System(#[from] io::Error),

    /// A blocking wait was interrupted by a signal. Waits retry this
    /// transparently; it only escapes through non-retrying paths.
    #[error("interrupted by signal")]
    Interrupted,

    /// The peer sent something the protocol does not allow (unknown op,
    /// size mismatch, malformed entity).
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The storage engine reported a failure; carried as a `Failure`
    /// status on the wire.
    #[error("engine error: {0}")]
    Engine(String),

    /// The request would not fit into the request arena.
    #[error("request of {requested} bytes exceeds arena capacity of {capacity} bytes")]
    BufferOverflow { requested: usize, capacity: usize },

    /// The peer terminated or the channel was torn down underneath us.
    #[error("channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, IpcError>;

impl IpcError {
    /// Shorthand for the common "syscall failed, grab errno" case.
    pub(crate) fn last_os_error() -> Self {
        IpcError::System(io::Error::last_os_error())
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        IpcError::Protocol(msg.into())
    }
}
