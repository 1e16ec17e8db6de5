//! Cross-process cyclic barrier with abort
//!
//! Rank 0 owns a [`BarrierHost`]; it is bound before any subordinate is spawned
//! so its address can be handed out at spawn time. Each subordinate connects a
//! [`BarrierMember`]. Every `wait` carries a generation number and the host
//! releases generation `g` only after every member has arrived at `g`.

use super::process_group::{deadline, expired};
use super::wire::{read_object, write_object};
use crate::errors::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

const RETRY_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum BarrierFrame {
    Join { rank: usize },
    Arrive { generation: u64 },
    Release { generation: u64 },
    Abort,
}

/// Rank 0 side of the barrier.
pub struct BarrierHost {
    listener: Option<TcpListener>,
    addr: SocketAddr,
    parties: usize,
    /// Member streams indexed by rank - 1
    members: Vec<TcpStream>,
    generation: u64,
    aborted: AtomicBool,
}

impl BarrierHost {
    /// Allocate a barrier for `parties` participants (rank 0 included).
    pub fn bind(parties: usize) -> Result<Self> {
        if parties == 0 {
            return Err(AgentError::Config("barrier needs at least one party".into()));
        }
        let listener = TcpListener::bind(("127.0.0.1", 0))?;
        let addr = listener.local_addr()?;
        debug!(%addr, parties, "Barrier bound");
        Ok(Self {
            listener: Some(listener),
            addr,
            parties,
            members: Vec::new(),
            generation: 0,
            aborted: AtomicBool::new(false),
        })
    }

    /// Handle passed to subordinates so they can connect.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Accept every subordinate's connection. Must complete before the first `wait`.
    pub fn accept_members(&mut self, timeout: Duration) -> Result<()> {
        self.accept_members_until(timeout, &|| false)
    }

    /// Like [`BarrierHost::accept_members`], giving up early once `cancelled` returns true.
    pub fn accept_members_until(&mut self, timeout: Duration, cancelled: &dyn Fn() -> bool) -> Result<()> {
        let peers = self.parties - 1;
        let listener = match self.listener.take() {
            Some(listener) => listener,
            None => return Ok(()),
        };
        let mut slots: Vec<Option<TcpStream>> = (0..peers).map(|_| None).collect();
        let mut joined = 0usize;
        let deadline = deadline(timeout);

        listener.set_nonblocking(true)?;
        while joined < peers {
            if self.is_aborted() {
                return Err(AgentError::BarrierAborted);
            }
            match listener.accept() {
                Ok((mut stream, _)) => {
                    stream.set_nonblocking(false)?;
                    stream.set_nodelay(true)?;
                    match read_object(&mut stream) {
                        Ok(BarrierFrame::Join { rank }) if (1..self.parties).contains(&rank) => {
                            if slots[rank - 1].is_some() {
                                warn!(rank, "Duplicate barrier join ignored");
                                continue;
                            }
                            slots[rank - 1] = Some(stream);
                            joined += 1;
                        }
                        other => {
                            warn!(frame = ?other.ok(), "Unexpected barrier join");
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if cancelled() {
                        return Err(AgentError::Group(
                            "Barrier setup cancelled: a subordinate exited".into(),
                        ));
                    }
                    if expired(deadline) {
                        return Err(AgentError::Group(format!(
                            "Timed out waiting for {} of {} barrier members",
                            peers - joined,
                            peers
                        )));
                    }
                    std::thread::sleep(RETRY_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.members = slots.into_iter().flatten().collect();
        info!(parties = self.parties, "Barrier members connected");
        Ok(())
    }

    /// Block until every member arrives, then release them all.
    pub fn wait(&mut self) -> Result<()> {
        if self.is_aborted() {
            return Err(AgentError::BarrierAborted);
        }
        if self.members.len() + 1 != self.parties {
            return Err(AgentError::InvalidState(format!(
                "barrier has {} of {} members",
                self.members.len() + 1,
                self.parties
            )));
        }

        let generation = self.generation + 1;
        for (i, stream) in self.members.iter_mut().enumerate() {
            let frame = read_object(stream);
            if self.aborted.load(Ordering::SeqCst) {
                return Err(AgentError::BarrierAborted);
            }
            match frame {
                Ok(BarrierFrame::Arrive { generation: g }) if g == generation => {}
                Ok(other) => {
                    return Err(AgentError::Group(format!(
                        "rank {} sent {:?} at barrier generation {}",
                        i + 1,
                        other,
                        generation
                    )))
                }
                Err(e) => {
                    return Err(AgentError::Group(format!(
                        "rank {} lost at barrier generation {}: {}",
                        i + 1,
                        generation,
                        e
                    )))
                }
            }
        }
        for (i, stream) in self.members.iter_mut().enumerate() {
            write_object(stream, &BarrierFrame::Release { generation }).map_err(|e| {
                AgentError::Group(format!("release of rank {} failed: {}", i + 1, e))
            })?;
        }
        self.generation = generation;
        Ok(())
    }

    /// Abort the barrier: members blocked in or arriving at `wait` observe
    /// [`AgentError::BarrierAborted`]. Idempotent.
    pub fn abort(&self) {
        if self.aborted.swap(true, Ordering::SeqCst) {
            return;
        }
        for stream in &self.members {
            let mut writer = stream;
            let _ = write_object(&mut writer, &BarrierFrame::Abort);
            let _ = stream.shutdown(Shutdown::Both);
        }
        debug!(members = self.members.len(), "Barrier aborted");
    }
}

impl Drop for BarrierHost {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Subordinate side of the barrier.
pub struct BarrierMember {
    rank: usize,
    stream: TcpStream,
    generation: u64,
}

impl BarrierMember {
    /// Connect to the host at `addr`, retrying until `timeout` elapses.
    pub fn connect(addr: SocketAddr, rank: usize, timeout: Duration) -> Result<Self> {
        let deadline = deadline(timeout);
        let mut stream = loop {
            match TcpStream::connect(addr) {
                Ok(stream) => break stream,
                Err(e) => {
                    if expired(deadline) {
                        return Err(AgentError::Group(format!(
                            "rank {} could not reach barrier {}: {}",
                            rank, addr, e
                        )));
                    }
                    std::thread::sleep(RETRY_INTERVAL);
                }
            }
        };
        stream.set_nodelay(true)?;
        write_object(&mut stream, &BarrierFrame::Join { rank })?;
        Ok(Self {
            rank,
            stream,
            generation: 0,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Arrive at the next generation and block until released or aborted.
    ///
    /// A lost connection to the host counts as an abort.
    pub fn wait(&mut self) -> Result<()> {
        let generation = self.generation + 1;
        if write_object(&mut self.stream, &BarrierFrame::Arrive { generation }).is_err() {
            return Err(AgentError::BarrierAborted);
        }
        match read_object(&mut self.stream) {
            Ok(BarrierFrame::Release { generation: g }) if g == generation => {
                self.generation = generation;
                Ok(())
            }
            Ok(BarrierFrame::Abort) | Err(_) => Err(AgentError::BarrierAborted),
            Ok(other) => Err(AgentError::Group(format!(
                "rank {} got {:?} at barrier generation {}",
                self.rank, other, generation
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const TIMEOUT: Duration = Duration::from_secs(10);

    #[test]
    fn test_single_party_barrier_never_blocks() {
        let mut host = BarrierHost::bind(1).unwrap();
        host.accept_members(TIMEOUT).unwrap();
        host.wait().unwrap();
        host.wait().unwrap();
        assert_eq!(host.generation(), 2);
    }

    #[test]
    fn test_generations_advance_together() {
        let mut host = BarrierHost::bind(3).unwrap();
        let addr = host.addr();
        let members: Vec<_> = (1..3)
            .map(|rank| {
                thread::spawn(move || {
                    let mut member = BarrierMember::connect(addr, rank, TIMEOUT).unwrap();
                    for _ in 0..3 {
                        member.wait().unwrap();
                    }
                    member.generation()
                })
            })
            .collect();

        host.accept_members(TIMEOUT).unwrap();
        for _ in 0..3 {
            host.wait().unwrap();
        }
        for m in members {
            assert_eq!(m.join().unwrap(), 3);
        }
    }

    #[test]
    fn test_abort_releases_waiting_member() {
        let mut host = BarrierHost::bind(2).unwrap();
        let addr = host.addr();
        let member = thread::spawn(move || {
            let mut member = BarrierMember::connect(addr, 1, TIMEOUT).unwrap();
            member.wait()
        });
        host.accept_members(TIMEOUT).unwrap();
        host.abort();
        host.abort();

        let result = member.join().unwrap();
        assert!(matches!(result, Err(AgentError::BarrierAborted)));
        assert!(matches!(host.wait(), Err(AgentError::BarrierAborted)));
    }

    #[test]
    fn test_host_drop_aborts_member() {
        let mut host = BarrierHost::bind(2).unwrap();
        let addr = host.addr();
        let member = thread::spawn(move || {
            let mut member = BarrierMember::connect(addr, 1, TIMEOUT).unwrap();
            member.wait()
        });
        host.accept_members(TIMEOUT).unwrap();
        drop(host);
        assert!(member.join().unwrap().unwrap_err().is_abort());
    }

    #[test]
    fn test_accept_times_out() {
        let mut host = BarrierHost::bind(2).unwrap();
        let err = host.accept_members(Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, AgentError::Group(_)));
    }
}
