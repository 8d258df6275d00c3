// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 kvbridge contributors
//
// Tests for process-shared semaphores embedded in a shared memory segment.

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use kvbridge::{ShmSegment, ShmSemaphore};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_sem_{}_{n}", std::process::id())
}

/// A semaphore living in its own throwaway segment.
struct SemFixture {
    shm: ShmSegment,
    sem: ShmSemaphore,
}

impl SemFixture {
    fn new(name: &str, value: u32) -> Self {
        ShmSegment::unlink_by_name(name);
        let shm = ShmSegment::create(name, std::mem::size_of::<libc::sem_t>()).expect("create shm");
        let sem = unsafe { ShmSemaphore::init_at(shm.as_mut_ptr() as *mut libc::sem_t, value) }
            .expect("init sem");
        Self { shm, sem }
    }
}

impl Drop for SemFixture {
    fn drop(&mut self) {
        self.sem.destroy();
        self.shm.unlink();
    }
}

#[test]
fn init_with_count() {
    let name = unique_name("init_count");
    let f = SemFixture::new(&name, 5);
    for _ in 0..5 {
        assert!(f.sem.try_wait().expect("try_wait"));
    }
    assert!(!f.sem.try_wait().expect("try_wait empty"));
}

#[test]
fn wait_post() {
    let name = unique_name("wait_post");
    let f = SemFixture::new(&name, 1);
    f.sem.wait().expect("wait");
    f.sem.post().expect("post");
    f.sem.wait().expect("wait again");
}

#[test]
fn wait_timeout_expires() {
    let name = unique_name("timeout");
    let f = SemFixture::new(&name, 0);

    let start = Instant::now();
    let got = f.sem.wait_timeout(50).expect("wait_timeout");
    let elapsed = start.elapsed();

    assert!(!got, "should time out");
    assert!(
        elapsed.as_millis() >= 40,
        "should have waited ~50ms, got {}ms",
        elapsed.as_millis()
    );
}

#[test]
fn wait_timeout_succeeds_when_posted() {
    let name = unique_name("timeout_ok");
    let f = SemFixture::new(&name, 1);
    assert!(f.sem.wait_timeout(100).expect("wait_timeout"));
}

#[test]
fn post_wakes_blocked_waiter() {
    let name = unique_name("wake");
    let f = SemFixture::new(&name, 0);

    // A second view over the same sem_t, as another process would attach.
    let shm2 = ShmSegment::open(&name, std::mem::size_of::<libc::sem_t>()).expect("open");
    let sem2 = unsafe { ShmSemaphore::from_ptr(shm2.as_mut_ptr() as *mut libc::sem_t) };

    let waiter = thread::spawn(move || {
        sem2.wait().expect("wait");
        drop(shm2);
    });

    thread::sleep(Duration::from_millis(50));
    f.sem.post().expect("post");
    waiter.join().unwrap();
}

#[test]
fn producer_consumer() {
    let name = unique_name("prod_cons");
    let f = Arc::new(SemFixture::new(&name, 0));
    let produced = Arc::new(AtomicI32::new(0));
    let consumed = Arc::new(AtomicI32::new(0));
    let count = 10;

    let fp = Arc::clone(&f);
    let prod = Arc::clone(&produced);
    let producer = thread::spawn(move || {
        for _ in 0..count {
            prod.fetch_add(1, Ordering::Relaxed);
            fp.sem.post().expect("post");
            thread::sleep(Duration::from_millis(1));
        }
    });

    let fc = Arc::clone(&f);
    let cons = Arc::clone(&consumed);
    let consumer = thread::spawn(move || {
        for _ in 0..count {
            fc.sem.wait().expect("wait");
            cons.fetch_add(1, Ordering::Relaxed);
        }
    });

    producer.join().unwrap();
    consumer.join().unwrap();

    assert_eq!(produced.load(Ordering::Relaxed), count);
    assert_eq!(consumed.load(Ordering::Relaxed), count);
}

#[test]
fn counting_accumulates_posts() {
    let name = unique_name("counting");
    let f = SemFixture::new(&name, 0);
    for _ in 0..100 {
        f.sem.post().expect("post");
    }
    let mut taken = 0;
    while f.sem.try_wait().expect("try_wait") {
        taken += 1;
    }
    assert_eq!(taken, 100);
}

#[test]
fn concurrent_posts_are_not_lost() {
    let name = unique_name("concurrent_post");
    let f = Arc::new(SemFixture::new(&name, 0));
    let threads = 5;
    let posts_per_thread = 10;

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let f = Arc::clone(&f);
            thread::spawn(move || {
                for _ in 0..posts_per_thread {
                    f.sem.post().expect("post");
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let mut taken = 0;
    while f.sem.try_wait().expect("try_wait") {
        taken += 1;
    }
    assert_eq!(taken, threads * posts_per_thread);
}
