// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 kvbridge contributors
//
// Worker process entry point.
//
// Usage:
//   kv_worker <worker_id>
//
// Attaches to the channel the manager created for <worker_id> (creating it
// when started standalone), serves requests until Terminate, then tears the
// channel down. Log level comes from RUST_LOG (default info).

use kvbridge::engine::MemEngine;
use kvbridge::worker::Worker;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let Some(worker_id) = args.next() else {
        eprintln!("usage: kv_worker <worker_id>");
        std::process::exit(2);
    };

    let mut worker = match Worker::<MemEngine>::start(&worker_id) {
        Ok(w) => w,
        Err(e) => {
            tracing::error!(worker_id = %worker_id, error = %e, "worker failed to start");
            std::process::exit(1);
        }
    };

    if let Err(e) = worker.run() {
        tracing::error!(worker_id = %worker_id, error = %e, "worker exited on channel failure");
        std::process::exit(1);
    }
}
