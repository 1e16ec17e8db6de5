//! Subordinate process supervision
//!
//! Shards are mutually dependent, so the policy is blunt: the first time any
//! subordinate is seen dead, every survivor is terminated and the coordinator
//! exits (1 if some worker failed with a non-zero code, else 0).

pub mod signal;

use crate::errors::{AgentError, Result};
use parking_lot::Mutex;
use std::process::{Child, ExitStatus};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How a subordinate process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    Code(i32),
    /// Killed by a signal (terminate/kill), not counted as a failure
    Signal(i32),
}

impl ProcessExit {
    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(sig) = status.signal() {
                return ProcessExit::Signal(sig);
            }
        }
        ProcessExit::Code(status.code().unwrap_or(-1))
    }

    pub fn is_abnormal(&self) -> bool {
        matches!(self, ProcessExit::Code(code) if *code != 0)
    }
}

/// OS handle of one subordinate, owned by the supervisor.
pub trait ProcessHandle: Send {
    fn rank(&self) -> usize;
    fn pid(&self) -> u32;
    /// Poll liveness, recording the exit status once the process is gone.
    fn is_alive(&mut self) -> bool;
    /// Recorded exit status, if the process has exited.
    fn exit(&self) -> Option<ProcessExit>;
    /// Ask the process to stop (SIGTERM). Non-blocking.
    fn terminate(&mut self) -> Result<()>;
    /// Force the process to stop (SIGKILL). Non-blocking.
    fn kill(&mut self) -> Result<()>;
    /// Wait up to `timeout` for the process to exit.
    fn join(&mut self, timeout: Duration) -> Result<Option<ProcessExit>>;
    /// Release the handle, killing the process if it is still running.
    fn close(&mut self);
}

/// Processes shared between the coordinator and its watchdog.
pub type SharedHandles = Arc<Mutex<Vec<Box<dyn ProcessHandle>>>>;

/// Invoked with the fleet exit code when the watchdog gives up.
pub type FailureAction = Arc<dyn Fn(i32) + Send + Sync>;

/// Default failure action: exit the coordinator process.
pub fn exit_process() -> FailureAction {
    Arc::new(|code| std::process::exit(code))
}

/// A subordinate launched with `std::process`.
pub struct ChildProcess {
    rank: usize,
    pid: u32,
    child: Child,
    exit: Option<ProcessExit>,
    closed: bool,
}

impl ChildProcess {
    pub fn new(rank: usize, child: Child) -> Self {
        Self {
            rank,
            pid: child.id(),
            child,
            exit: None,
            closed: false,
        }
    }

    fn poll(&mut self) -> Option<ProcessExit> {
        if self.exit.is_none() {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    self.exit = Some(ProcessExit::from_status(status));
                    signal::unregister_pid(self.pid);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(rank = self.rank, pid = self.pid, error = %e, "Failed to poll worker");
                    self.exit = Some(ProcessExit::Code(-1));
                }
            }
        }
        self.exit
    }
}

impl ProcessHandle for ChildProcess {
    fn rank(&self) -> usize {
        self.rank
    }

    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_alive(&mut self) -> bool {
        self.poll().is_none()
    }

    fn exit(&self) -> Option<ProcessExit> {
        self.exit
    }

    fn terminate(&mut self) -> Result<()> {
        if !self.is_alive() {
            return Ok(());
        }
        #[cfg(unix)]
        {
            let pid = i32::try_from(self.pid)
                .map_err(|_| AgentError::WorkerSpawn(format!("pid {} out of range", self.pid)))?;
            if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
                return Err(AgentError::Io(std::io::Error::last_os_error()));
            }
            Ok(())
        }
        #[cfg(not(unix))]
        {
            self.kill()
        }
    }

    fn kill(&mut self) -> Result<()> {
        if !self.is_alive() {
            return Ok(());
        }
        match self.child.kill() {
            Ok(()) => Ok(()),
            // raced with a natural exit
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn join(&mut self, timeout: Duration) -> Result<Option<ProcessExit>> {
        let start = Instant::now();
        loop {
            if let Some(exit) = self.poll() {
                return Ok(Some(exit));
            }
            if start.elapsed() >= timeout {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        if self.is_alive() {
            let _ = self.kill();
            if let Ok(status) = self.child.wait() {
                self.exit = Some(ProcessExit::from_status(status));
            }
        }
        signal::unregister_pid(self.pid);
        self.child.stdin.take();
        self.closed = true;
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        self.close();
    }
}

/// One liveness check over the fleet.
///
/// Returns `None` while every process is alive. Otherwise terminates the
/// survivors, closes the dead, logs non-zero exits and returns the exit code
/// the coordinator should leave with.
pub fn check_fleet_alive(handles: &mut [Box<dyn ProcessHandle>]) -> Option<i32> {
    let dead: Vec<usize> = handles
        .iter_mut()
        .filter_map(|h| (!h.is_alive()).then(|| h.rank()))
        .collect();
    if dead.is_empty() {
        return None;
    }
    warn!(ranks = ?dead, "Worker processes stopped");

    let mut failed = Vec::new();
    for handle in handles.iter_mut() {
        if handle.is_alive() {
            if let Err(e) = handle.terminate() {
                warn!(rank = handle.rank(), error = %e, "Failed to terminate worker");
            }
        } else {
            if let Some(exit) = handle.exit().filter(ProcessExit::is_abnormal) {
                failed.push((handle.rank(), exit));
            }
            handle.close();
        }
    }
    for (rank, exit) in &failed {
        error!(rank, exit = ?exit, "TP process failed");
    }
    Some(if failed.is_empty() { 0 } else { 1 })
}

/// Background liveness poller.
pub struct Watchdog {
    stop: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Start polling `handles` every `interval`.
    pub fn start(handles: SharedHandles, interval: Duration, on_failure: FailureAction) -> Result<Self> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let thread = std::thread::Builder::new()
            .name("tp-watchdog".into())
            .spawn(move || loop {
                let verdict = check_fleet_alive(&mut handles.lock());
                if let Some(code) = verdict {
                    error!(exit_code = code, "Worker fleet lost a member, shutting down");
                    on_failure(code);
                    break;
                }
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        info!(interval_ms = interval.as_millis() as u64, "Watchdog started");
        Ok(Self {
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Signal the poller to stop and join it. Idempotent.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Watchdog thread panicked");
            }
            debug!("Watchdog stopped");
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};
    use std::sync::atomic::{AtomicI32, Ordering};

    /// Scripted handle for exercising the fleet decision.
    struct FakeProcess {
        rank: usize,
        exit: Option<ProcessExit>,
        terminated: Arc<AtomicI32>,
        closed: bool,
    }

    impl FakeProcess {
        fn boxed(rank: usize, exit: Option<ProcessExit>, terminated: &Arc<AtomicI32>) -> Box<dyn ProcessHandle> {
            Box::new(Self {
                rank,
                exit,
                terminated: Arc::clone(terminated),
                closed: false,
            })
        }
    }

    impl ProcessHandle for FakeProcess {
        fn rank(&self) -> usize {
            self.rank
        }
        fn pid(&self) -> u32 {
            0
        }
        fn is_alive(&mut self) -> bool {
            self.exit.is_none()
        }
        fn exit(&self) -> Option<ProcessExit> {
            self.exit
        }
        fn terminate(&mut self) -> Result<()> {
            self.terminated.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn kill(&mut self) -> Result<()> {
            self.terminate()
        }
        fn join(&mut self, _timeout: Duration) -> Result<Option<ProcessExit>> {
            Ok(self.exit)
        }
        fn close(&mut self) {
            self.closed = true;
        }
    }

    #[test]
    fn test_exit_classification() {
        assert!(ProcessExit::Code(1).is_abnormal());
        assert!(!ProcessExit::Code(0).is_abnormal());
        assert!(!ProcessExit::Signal(9).is_abnormal());
    }

    #[test]
    fn test_all_alive_is_none() {
        let terminated = Arc::new(AtomicI32::new(0));
        let mut handles = vec![
            FakeProcess::boxed(1, None, &terminated),
            FakeProcess::boxed(2, None, &terminated),
        ];
        assert_eq!(check_fleet_alive(&mut handles), None);
        assert_eq!(terminated.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_abnormal_exit_fails_fleet() {
        let terminated = Arc::new(AtomicI32::new(0));
        let mut handles = vec![
            FakeProcess::boxed(1, Some(ProcessExit::Code(3)), &terminated),
            FakeProcess::boxed(2, None, &terminated),
            FakeProcess::boxed(3, None, &terminated),
        ];
        assert_eq!(check_fleet_alive(&mut handles), Some(1));
        assert_eq!(terminated.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_killed_worker_exits_zero() {
        let terminated = Arc::new(AtomicI32::new(0));
        let mut handles = vec![
            FakeProcess::boxed(1, Some(ProcessExit::Signal(9)), &terminated),
            FakeProcess::boxed(2, None, &terminated),
        ];
        assert_eq!(check_fleet_alive(&mut handles), Some(0));
        assert_eq!(terminated.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_child_process_lifecycle() {
        let child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .spawn()
            .unwrap();
        let mut handle = ChildProcess::new(1, child);
        assert!(handle.is_alive());
        handle.terminate().unwrap();
        let exit = handle.join(Duration::from_secs(5)).unwrap();
        assert_eq!(exit, Some(ProcessExit::Signal(libc::SIGTERM)));
        assert!(!handle.is_alive());
        handle.close();
        handle.close();
    }

    #[test]
    fn test_child_process_exit_code() {
        let child = Command::new("sh").args(["-c", "exit 4"]).spawn().unwrap();
        let mut handle = ChildProcess::new(1, child);
        assert_eq!(
            handle.join(Duration::from_secs(5)).unwrap(),
            Some(ProcessExit::Code(4))
        );
    }

    #[test]
    fn test_watchdog_fires_on_death() {
        let terminated = Arc::new(AtomicI32::new(0));
        let handles: SharedHandles = Arc::new(Mutex::new(vec![
            FakeProcess::boxed(1, None, &terminated),
            FakeProcess::boxed(2, Some(ProcessExit::Code(1)), &terminated),
        ]));
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let on_failure: FailureAction = Arc::new(move |code| {
            let _ = tx.lock().send(code);
        });

        let mut watchdog = Watchdog::start(handles, Duration::from_millis(10), on_failure).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
        watchdog.stop();
        assert!(!watchdog.is_running());
    }

    #[test]
    fn test_watchdog_stops_quietly() {
        let terminated = Arc::new(AtomicI32::new(0));
        let handles: SharedHandles =
            Arc::new(Mutex::new(vec![FakeProcess::boxed(1, None, &terminated)]));
        let fired = Arc::new(AtomicI32::new(0));
        let fired_hook = Arc::clone(&fired);
        let on_failure: FailureAction = Arc::new(move |_| {
            fired_hook.fetch_add(1, Ordering::SeqCst);
        });

        let mut watchdog = Watchdog::start(handles, Duration::from_millis(10), on_failure).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        watchdog.stop();
        watchdog.stop();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
