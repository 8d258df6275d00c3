// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 kvbridge contributors
//
// Worker lifecycle: spawn, liveness, graceful shutdown, and the control
// loop serving Launch/Terminate requests from backends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::channel::MsgChannel;
use crate::error::{IpcError, Result};
use crate::msg::{MsgHeader, Op, Status};
use crate::shm_name;

/// How long `launch` waits for a spawned worker to post readiness.
const SPAWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Grace period between SIGTERM and SIGKILL during forced shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Process primitives
// ---------------------------------------------------------------------------

/// Handle to a spawned worker process.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub pid: u32,
}

impl ProcessHandle {
    pub fn valid(&self) -> bool {
        self.pid > 0
    }

    pub fn is_alive(&self) -> bool {
        self.valid() && try_reap(self).is_none()
    }
}

/// Result of a [`wait_for_exit`] call. All-default means the process was
/// still running when the wait gave up.
#[derive(Debug, Default, Clone, Copy)]
pub struct WaitResult {
    pub exited: bool,
    pub exit_code: i32,
    pub signaled: bool,
    pub signal: i32,
}

impl WaitResult {
    pub fn gone(&self) -> bool {
        self.exited || self.signaled
    }
}

/// Spawn `executable` with `args` via posix_spawn, inheriting this
/// process's environment.
pub fn spawn(executable: &str, args: &[&str]) -> Result<ProcessHandle> {
    use std::ffi::CString;

    extern "C" {
        static mut environ: *mut *mut libc::c_char;
    }

    fn cstr(s: &str) -> Result<CString> {
        CString::new(s).map_err(|e| {
            IpcError::System(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
        })
    }

    // argv[0] is the executable itself; the vector of CStrings owns the
    // bytes the raw pointer array (null-terminated) points into.
    let argv: Vec<CString> = std::iter::once(Ok(cstr(executable)?))
        .chain(args.iter().map(|a| cstr(a)))
        .collect::<Result<Vec<_>>>()?;
    let mut argv_ptrs: Vec<*mut libc::c_char> = argv
        .iter()
        .map(|s| s.as_ptr() as *mut libc::c_char)
        .chain(std::iter::once(std::ptr::null_mut()))
        .collect();

    let mut pid: libc::pid_t = -1;
    let rc = unsafe {
        libc::posix_spawn(
            &mut pid,
            argv[0].as_ptr(),
            std::ptr::null(),
            std::ptr::null(),
            argv_ptrs.as_mut_ptr(),
            environ,
        )
    };
    if rc != 0 {
        return Err(IpcError::System(std::io::Error::from_raw_os_error(rc)));
    }
    Ok(ProcessHandle { pid: pid as u32 })
}

/// One non-blocking reap attempt. `Some` when the process is gone (with the
/// decoded exit status when it was our child), `None` while it still runs.
/// Collecting the child here keeps zombies from reading as alive.
fn try_reap(h: &ProcessHandle) -> Option<WaitResult> {
    let mut status: libc::c_int = 0;
    match unsafe { libc::waitpid(h.pid as libc::pid_t, &mut status, libc::WNOHANG) } {
        0 => None,
        ret if ret == h.pid as libc::pid_t => Some(decode_status(status)),
        _ => {
            // Not our child, or collected earlier; probe with signal 0.
            let probe = unsafe { libc::kill(h.pid as libc::pid_t, 0) };
            let alive =
                probe == 0 || std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH);
            if alive {
                None
            } else {
                Some(WaitResult {
                    exited: true,
                    ..WaitResult::default()
                })
            }
        }
    }
}

fn decode_status(status: libc::c_int) -> WaitResult {
    let exited = libc::WIFEXITED(status);
    let signaled = libc::WIFSIGNALED(status);
    WaitResult {
        exited,
        exit_code: if exited { libc::WEXITSTATUS(status) } else { 0 },
        signaled,
        signal: if signaled { libc::WTERMSIG(status) } else { 0 },
    }
}

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Wait up to `timeout` for the process to go away.
pub fn wait_for_exit(h: &ProcessHandle, timeout: Duration) -> WaitResult {
    if !h.valid() {
        return WaitResult::default();
    }
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(r) = try_reap(h) {
            return r;
        }
        if Instant::now() >= deadline {
            return WaitResult::default();
        }
        std::thread::sleep(EXIT_POLL_INTERVAL);
    }
}

/// Graceful shutdown: SIGTERM, wait `grace`, then SIGKILL stragglers.
pub fn shutdown(h: &ProcessHandle, grace: Duration) -> WaitResult {
    if !h.valid() {
        return WaitResult::default();
    }
    unsafe { libc::kill(h.pid as libc::pid_t, libc::SIGTERM) };
    let r = wait_for_exit(h, grace);
    if r.gone() {
        return r;
    }
    unsafe { libc::kill(h.pid as libc::pid_t, libc::SIGKILL) };
    wait_for_exit(h, Duration::from_secs(1))
}

// ---------------------------------------------------------------------------
// WorkerManager
// ---------------------------------------------------------------------------

struct WorkerEntry {
    proc: ProcessHandle,
    channel: MsgChannel,
    db_id: u32,
}

/// Launches workers on demand, terminates them, and reaps the dead.
pub struct WorkerManager {
    worker_exe: String,
    workers: HashMap<String, WorkerEntry>,
}

impl WorkerManager {
    pub fn new(worker_exe: &str) -> Self {
        Self {
            worker_exe: worker_exe.to_string(),
            workers: HashMap::new(),
        }
    }

    /// Spawn the worker for `worker_id` and wait for its readiness signal.
    /// Launching an already-running worker is a no-op.
    pub fn launch(&mut self, worker_id: &str, db_id: u32) -> Result<()> {
        if let Some(entry) = self.workers.get(worker_id) {
            if entry.proc.is_alive() {
                return Ok(());
            }
            self.remove(worker_id);
        }

        // The manager owns channel creation so the worker and the first
        // clients can both just open it.
        let name = shm_name::channel_name(worker_id);
        MsgChannel::remove_storage(&name);
        let channel = MsgChannel::create(&name)?;

        let proc = spawn(&self.worker_exe, &[worker_id])?;
        tracing::info!(worker_id, pid = proc.pid, "worker spawned");

        if !channel.wait_worker_ready(SPAWN_TIMEOUT.as_millis() as u64)? {
            tracing::error!(worker_id, pid = proc.pid, "worker never became ready");
            shutdown(&proc, Duration::ZERO);
            channel.destroy();
            return Err(IpcError::ChannelClosed);
        }

        self.workers.insert(
            worker_id.to_string(),
            WorkerEntry {
                proc,
                channel,
                db_id,
            },
        );
        Ok(())
    }

    /// Stop a worker: Terminate over its channel, then signal escalation if
    /// it does not exit in time.
    pub fn terminate(&mut self, worker_id: &str, db_id: u32) -> Result<()> {
        let Some(entry) = self.workers.get(worker_id) else {
            return Ok(());
        };
        if entry.db_id != db_id {
            return Err(IpcError::protocol(format!(
                "terminate for worker {worker_id} addressed the wrong database"
            )));
        }

        if entry.proc.is_alive() {
            // Fire-and-forget: a wedged worker would never answer, and the
            // exit wait below covers the healthy case.
            let mut header = MsgHeader::request(Op::Terminate, db_id, 0, 0);
            let _ = entry.channel.client_send(&mut header, |_| {}, false);

            if !wait_for_exit(&entry.proc, SHUTDOWN_GRACE).gone() {
                tracing::warn!(worker_id, pid = entry.proc.pid, "worker ignored terminate, escalating");
                shutdown(&entry.proc, SHUTDOWN_GRACE);
            }
        }
        self.remove(worker_id);
        Ok(())
    }

    /// Sweep registered workers whose process has died; their channels are
    /// torn down so clients fail fast instead of blocking forever.
    pub fn reap(&mut self) -> usize {
        let dead: Vec<String> = self
            .workers
            .iter()
            .filter(|(_, e)| !e.proc.is_alive())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &dead {
            tracing::warn!(worker_id = %id, "reaping dead worker");
            self.remove(id);
        }
        dead.len()
    }

    fn remove(&mut self, worker_id: &str) {
        if let Some(entry) = self.workers.remove(worker_id) {
            // A cleanly exiting worker destroys its own channel; this is the
            // backstop for the ones that died.
            entry.channel.destroy();
        }
        MsgChannel::remove_storage(&shm_name::channel_name(worker_id));
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn is_running(&self, worker_id: &str) -> bool {
        self.workers
            .get(worker_id)
            .map(|e| e.proc.is_alive())
            .unwrap_or(false)
    }

    /// Serve Launch/Terminate control requests until `running` clears.
    /// The entity of both ops is the worker id; `db_id` rides the header.
    /// Liveness sweeps run on every receive timeout.
    pub fn run_control_loop(&mut self, running: &AtomicBool) -> Result<()> {
        let name = shm_name::manager_channel_name();
        MsgChannel::remove_storage(&name);
        let control = MsgChannel::create(&name)?;
        tracing::info!("manager control loop started");

        while running.load(Ordering::Acquire) {
            let Some((header, body)) = control.worker_recv_request_timeout(500)? else {
                self.reap();
                continue;
            };

            let Ok(worker_id) = std::str::from_utf8(&body) else {
                tracing::warn!("control request with non-utf8 worker id");
                continue;
            };

            let status = match header.op {
                Op::Launch => match self.launch(worker_id, header.db_id) {
                    Ok(()) => Status::Success,
                    Err(e) => {
                        tracing::warn!(worker_id, error = %e, "launch failed");
                        Status::Failure
                    }
                },
                Op::Terminate => match self.terminate(worker_id, header.db_id) {
                    Ok(()) => Status::Success,
                    Err(e) => {
                        tracing::warn!(worker_id, error = %e, "terminate failed");
                        Status::Failure
                    }
                },
                op => {
                    tracing::warn!(?op, "unexpected op on the control channel");
                    Status::Exception
                }
            };

            if (header.rps_id as usize) < crate::channel::RESPONSE_SLOTS {
                let rsp = MsgHeader::response(&header, status, 0);
                control.worker_send_response(header.rps_id as usize, &rsp, |_| {})?;
            }
        }

        // Stop every remaining worker before the control channel goes away.
        let ids: Vec<(String, u32)> = self
            .workers
            .iter()
            .map(|(id, e)| (id.clone(), e.db_id))
            .collect();
        for (id, db_id) in ids {
            let _ = self.terminate(&id, db_id);
        }
        control.destroy();
        tracing::info!("manager control loop stopped");
        Ok(())
    }
}

/// Client-side helper: ask the manager to launch a worker.
pub fn request_launch(worker_id: &str, db_id: u32) -> Result<bool> {
    control_request(Op::Launch, worker_id, db_id)
}

/// Client-side helper: ask the manager to terminate a worker.
pub fn request_terminate(worker_id: &str, db_id: u32) -> Result<bool> {
    control_request(Op::Terminate, worker_id, db_id)
}

fn control_request(op: Op, worker_id: &str, db_id: u32) -> Result<bool> {
    let control = MsgChannel::open(&shm_name::manager_channel_name())?;
    let mut header = MsgHeader::request(op, db_id, 0, worker_id.len() as u64);
    let slot = control
        .client_send(&mut header, |buf| buf.copy_from_slice(worker_id.as_bytes()), true)?
        .ok_or_else(|| IpcError::protocol("control request expected a response slot"))?;
    let result = control.client_recv(slot);
    let released = control.release_slot(slot);
    let (rsp, _) = result?;
    released?;
    Ok(rsp.status == Status::Success)
}
