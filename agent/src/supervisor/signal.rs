//! SIGTERM teardown of subordinate workers
//!
//! The handler runs in signal context, so everything it touches is pre-armed:
//! a fixed table of atomic pids and a static message. It kills every tracked
//! worker, restores the default disposition and re-raises the signal.

use crate::errors::{AgentError, Result};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

/// Number of subordinate pids the handler can track.
pub const MAX_TRACKED_WORKERS: usize = 63;

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_SLOT: AtomicI32 = AtomicI32::new(0);

static WORKER_PIDS: [AtomicI32; MAX_TRACKED_WORKERS] = [EMPTY_SLOT; MAX_TRACKED_WORKERS];
static INSTALLED: AtomicBool = AtomicBool::new(false);

const KILL_MESSAGE: &[u8] = b"tp-agent: got SIGTERM, killing all worker processes\n";

#[cfg(unix)]
extern "C" fn handle_sigterm(sig: libc::c_int) {
    for slot in WORKER_PIDS.iter() {
        let pid = slot.load(Ordering::SeqCst);
        if pid > 0 {
            unsafe {
                libc::kill(pid, libc::SIGKILL);
            }
        }
    }
    unsafe {
        libc::write(
            libc::STDERR_FILENO,
            KILL_MESSAGE.as_ptr() as *const libc::c_void,
            KILL_MESSAGE.len(),
        );
        libc::signal(sig, libc::SIG_DFL);
        libc::raise(sig);
    }
}

/// Install the SIGTERM handler once per process.
pub fn install_sigterm_handler() -> Result<()> {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    #[cfg(unix)]
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handle_sigterm as extern "C" fn(libc::c_int) as libc::sighandler_t;
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_flags = 0;
        if libc::sigaction(libc::SIGTERM, &action, std::ptr::null_mut()) != 0 {
            INSTALLED.store(false, Ordering::SeqCst);
            return Err(AgentError::Io(std::io::Error::last_os_error()));
        }
    }

    Ok(())
}

/// Track `pid` so a SIGTERM kills it.
pub fn register_pid(pid: u32) -> Result<()> {
    let pid = i32::try_from(pid)
        .map_err(|_| AgentError::WorkerSpawn(format!("pid {} out of range", pid)))?;
    for slot in WORKER_PIDS.iter() {
        if slot
            .compare_exchange(0, pid, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return Ok(());
        }
    }
    Err(AgentError::WorkerSpawn(format!(
        "cannot track more than {} worker processes",
        MAX_TRACKED_WORKERS
    )))
}

/// Stop tracking `pid`.
pub fn unregister_pid(pid: u32) {
    let Ok(pid) = i32::try_from(pid) else {
        return;
    };
    for slot in WORKER_PIDS.iter() {
        let _ = slot.compare_exchange(pid, 0, Ordering::SeqCst, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracked_pids() -> Vec<u32> {
        WORKER_PIDS
            .iter()
            .map(|slot| slot.load(Ordering::SeqCst))
            .filter(|pid| *pid > 0)
            .map(|pid| pid as u32)
            .collect()
    }

    #[test]
    fn test_register_and_unregister() {
        // pids above pid_max so a stray signal cannot hit a real process
        let pids = [4_194_305u32, 4_194_306];
        for pid in pids {
            register_pid(pid).unwrap();
        }
        let tracked = tracked_pids();
        assert!(pids.iter().all(|p| tracked.contains(p)));

        for pid in pids {
            unregister_pid(pid);
        }
        let tracked = tracked_pids();
        assert!(pids.iter().all(|p| !tracked.contains(p)));
    }

    #[test]
    fn test_install_is_idempotent() {
        install_sigterm_handler().unwrap();
        install_sigterm_handler().unwrap();
    }
}
