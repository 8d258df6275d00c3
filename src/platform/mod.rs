// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 kvbridge contributors
//
// Platform backends. The channel protocol is built on POSIX named shared
// memory and process-shared semaphores; there is no other backend.

#[cfg(unix)]
pub mod posix;

#[cfg(unix)]
pub use posix::PlatformShm;
