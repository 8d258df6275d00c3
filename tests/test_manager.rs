// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 kvbridge contributors
//
// Manager tests: real worker processes spawned from the kv_worker binary.

use std::sync::atomic::{AtomicUsize, Ordering};

use kvbridge::msg::EngineOptions;
use kvbridge::{KvClient, ShmSegment, WorkerManager};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_worker_id(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}m{}x{n}", std::process::id())
}

fn worker_exe() -> &'static str {
    env!("CARGO_BIN_EXE_kv_worker")
}

#[test]
fn launch_serve_terminate() {
    let id = unique_worker_id("basic");
    let mut manager = WorkerManager::new(worker_exe());

    manager.launch(&id, 1).expect("launch");
    assert!(manager.is_running(&id));

    let client = KvClient::connect(&id, 1, 100).expect("connect");
    assert!(client
        .open("/data/launched", &EngineOptions::default(), 0, 0)
        .expect("open"));
    assert!(client.put(b"k", b"v").expect("put"));
    assert_eq!(client.get(b"k").expect("get"), Some(b"v".to_vec()));
    client.close().expect("close");
    drop(client);

    manager.terminate(&id, 1).expect("terminate");
    assert!(!manager.is_running(&id));
    assert_eq!(manager.worker_count(), 0);

    // The channel must be gone once the worker is down.
    let name = kvbridge::shm_name::channel_name(&id);
    assert!(!ShmSegment::exists(&name));
}

#[test]
fn launch_is_idempotent() {
    let id = unique_worker_id("idem");
    let mut manager = WorkerManager::new(worker_exe());

    manager.launch(&id, 1).expect("launch");
    manager.launch(&id, 1).expect("relaunch is a no-op");
    assert_eq!(manager.worker_count(), 1);

    manager.terminate(&id, 1).expect("terminate");
}

#[test]
fn terminate_unknown_worker_is_a_no_op() {
    let id = unique_worker_id("unknown");
    let mut manager = WorkerManager::new(worker_exe());
    manager.terminate(&id, 1).expect("terminate unknown");
}

#[test]
fn terminate_checks_database() {
    let id = unique_worker_id("wrongdb");
    let mut manager = WorkerManager::new(worker_exe());

    manager.launch(&id, 1).expect("launch");
    assert!(manager.terminate(&id, 2).is_err());
    assert!(manager.is_running(&id));
    manager.terminate(&id, 1).expect("terminate");
}

#[test]
fn reap_removes_dead_workers() {
    let id = unique_worker_id("reap");
    let mut manager = WorkerManager::new(worker_exe());

    manager.launch(&id, 1).expect("launch");
    assert_eq!(manager.reap(), 0);

    // A client kills the worker the polite way, behind the manager's back.
    let client = KvClient::connect(&id, 1, 100).expect("connect");
    client.terminate().expect("terminate");
    drop(client);

    // Give the process a moment to exit, then the sweep must notice.
    std::thread::sleep(std::time::Duration::from_millis(300));
    assert_eq!(manager.reap(), 1);
    assert_eq!(manager.worker_count(), 0);
}

#[test]
fn launch_failure_reports_error() {
    let id = unique_worker_id("badexe");
    let mut manager = WorkerManager::new("/nonexistent/kv_worker");
    assert!(manager.launch(&id, 1).is_err());
    assert_eq!(manager.worker_count(), 0);
}

#[test]
fn control_loop_serves_launch_and_terminate() {
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    let id = unique_worker_id("ctl");
    let running = Arc::new(AtomicBool::new(true));

    let loop_running = Arc::clone(&running);
    let handle = std::thread::spawn(move || {
        let mut manager = WorkerManager::new(worker_exe());
        manager.run_control_loop(&loop_running)
    });

    // The control channel appears once the loop is up.
    let deadline = Instant::now() + Duration::from_secs(5);
    let launched = loop {
        match kvbridge::manager::request_launch(&id, 1) {
            Ok(ok) => break ok,
            Err(_) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(10))
            }
            Err(e) => panic!("control channel never came up: {e}"),
        }
    };
    assert!(launched);

    let client = KvClient::connect(&id, 1, 100).expect("connect");
    assert!(client
        .open("/data/ctl", &EngineOptions::default(), 0, 0)
        .expect("open"));
    assert!(client.put(b"k", b"v").expect("put"));
    client.close().expect("close");
    drop(client);

    assert!(kvbridge::manager::request_terminate(&id, 1).expect("terminate"));
    let name = kvbridge::shm_name::channel_name(&id);
    assert!(!ShmSegment::exists(&name));

    running.store(false, Ordering::Release);
    handle.join().unwrap().expect("control loop");
}
